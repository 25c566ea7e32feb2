//! TX bounce FIFO.
//!
//! The device can only transmit out of a registered page list, so every
//! packet is copied into this FIFO before its descriptors are written.  The
//! FIFO is a bump allocator over the flat TX page-list region: allocations
//! advance `head` and must be released in the order they were made, which
//! holds because the device completes packets in submission order.
//!
//! An allocation that does not fit before the end of the region wraps,
//! coming back as two iovecs (tail remainder + start of the region).
//! Headers are the exception: a caller that cannot tolerate a split asks
//! [`pad_for`](TxFifo::pad_for) how many bytes would land in the tail and
//! folds that padding into its request, so the real payload starts at
//! offset 0.
//!
//! After each allocation `head` is advanced to the next cache-line
//! boundary; the alignment padding is charged to the last iovec and comes
//! back to `available` when that allocation is freed.
//!
//! # Concurrency
//!
//! `head` belongs to the producer (the ring's transmit path, serialized by
//! the ring's producer lock).  `available` is atomic because the completion
//! path frees bytes concurrently.

use alloc::sync::Arc;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicI32, Ordering};

use gvnic_lib::cache_line_align;
use gvnic_mm::dma::DmaRegion;

/// One fragment of a FIFO allocation.
///
/// `offset` is a byte offset into the registered segment, which is exactly
/// what TX descriptors carry as their segment address.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct FifoIovec {
    pub offset: u32,
    pub len: u32,
    /// Alignment padding charged to this fragment, returned on free.
    pub padding: u32,
}

pub struct TxFifo {
    region: Arc<DmaRegion>,
    size: u32,
    /// Next free offset.  Producer-only; see module docs.
    head: UnsafeCell<u32>,
    /// Free bytes.  Decremented by the producer, incremented by the
    /// completion path.
    available: AtomicI32,
}

// SAFETY: `head` is only touched under the owning ring's producer lock;
// `available` is atomic; the region is plain DMA memory.
unsafe impl Send for TxFifo {}
unsafe impl Sync for TxFifo {}

impl TxFifo {
    /// Build a FIFO over the flat region of a TX page list.
    pub fn new(region: Arc<DmaRegion>) -> Self {
        let size = region.len() as u32;
        Self {
            region,
            size,
            head: UnsafeCell::new(0),
            available: AtomicI32::new(size as i32),
        }
    }

    #[inline]
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Free bytes right now.
    #[inline]
    pub fn available(&self) -> u32 {
        self.available.load(Ordering::Acquire).max(0) as u32
    }

    #[inline]
    fn head_value(&self) -> u32 {
        // SAFETY: producer context; see module docs.
        unsafe { *self.head.get() }
    }

    /// Padding needed so that a `bytes`-long allocation does not straddle
    /// the wrap: zero if it fits in the tail, otherwise the whole tail.
    ///
    /// Producer context only.
    pub fn pad_for(&self, bytes: u32) -> u32 {
        let head = self.head_value();
        if head + bytes <= self.size {
            0
        } else {
            self.size - head
        }
    }

    /// Whether `bytes` can be allocated.  Deliberately strict: a request
    /// equal to the free space is refused, keeping the FIFO from ever
    /// running completely dry.
    #[inline]
    pub fn can_alloc(&self, bytes: u32) -> bool {
        self.available.load(Ordering::Acquire) > bytes as i32
    }

    /// Allocate `bytes`, filling up to two of the caller's iovecs.
    /// Returns the fragment count (0 for an empty request).
    ///
    /// The caller must have checked [`can_alloc`](Self::can_alloc); the
    /// check happens before the alignment padding is known, which is fine
    /// because head and the region bounds are both cache-line aligned:
    /// when the data fits, so does its padding.
    ///
    /// Producer context only.
    pub fn alloc(&self, bytes: u32, iov: &mut [FifoIovec]) -> usize {
        debug_assert!(iov.len() >= 2);
        if bytes == 0 {
            return 0;
        }
        debug_assert!(self.can_alloc(bytes));

        let mut head = self.head_value();
        let mut nfrags = 1;

        iov[0] = FifoIovec {
            offset: head,
            len: bytes,
            padding: 0,
        };
        head += bytes;

        if head > self.size {
            // Did not fit in the tail; split and continue from the start.
            let overflow = head - self.size;
            iov[0].len -= overflow;
            iov[1] = FifoIovec {
                offset: 0,
                len: overflow,
                padding: 0,
            };
            nfrags = 2;
            head = overflow;
        }

        let aligned_head = cache_line_align(head);
        let padding = aligned_head - head;
        iov[nfrags - 1].padding = padding;
        self.available
            .fetch_sub((bytes + padding) as i32, Ordering::AcqRel);
        head = aligned_head;
        if head == self.size {
            head = 0;
        }

        // SAFETY: producer context; see module docs.
        unsafe { *self.head.get() = head };

        nfrags
    }

    /// Return bytes to the FIFO.  Callable from the completion path.
    #[inline]
    pub fn free(&self, bytes: u32) {
        self.available.fetch_add(bytes as i32, Ordering::AcqRel);
    }

    /// Copy packet bytes into the region at an allocated fragment.
    #[inline]
    pub fn write(&self, offset: u32, src: &[u8]) {
        self.region.write_bytes_at(offset as usize, src);
    }

    /// Bus address of the start of the region (the registered segment).
    #[inline]
    pub fn region(&self) -> &Arc<DmaRegion> {
        &self.region
    }
}
