//! Packet buffer: the single currency between drivers and the stack.
//!
//! Three backings share one interface:
//!
//! * **Pooled** — a slot of the global [`PacketPool`]; the fast path for
//!   ordinary frames in both directions.
//! * **Oversized** — heap-backed, for TX packets that exceed a pool slot
//!   (GSO super-frames hand the driver up to 64 KiB in one buffer).
//! * **Frag** — a window into a refcounted DMA page still owned by an RX
//!   ring.  Zero-copy receive: the ring flips to the other half of the page
//!   and the stack drops the `Arc` when done.
//!
//! # Layout
//!
//! ```text
//! |<-- headroom -->|<-- payload (head..tail) -->|<-- tailroom -->|
//! 0            head                          tail           capacity
//! ```
//!
//! `PacketBuf` is move-only; dropping it returns the backing to wherever it
//! came from (pool slot, heap, page refcount).
//!
//! Offload metadata rides along with the bytes: the stack fills the TX
//! fields (partial checksum, GSO) before handing the packet to a driver; a
//! driver fills the RX fields (checksum, hash, ethertype) before pushing the
//! packet up.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use gvnic_mm::dma::DmaRegion;

use super::pool::{BUF_SIZE, PACKET_POOL, PacketPool};
use super::types::{NetError, RxChecksum, RxHashType};

/// Reserved headroom in pooled TX buffers (bytes).
///
/// Covers Ethernet (14) + IPv4 (20) + largest TCP header (60) with slack.
pub const HEADROOM: u16 = 128;

// =============================================================================
// Backing storage
// =============================================================================

enum PacketBufInner {
    /// A slot of the global pool.
    Pooled { pool: &'static PacketPool, slot: u16 },
    /// Heap storage for frames larger than a pool slot.
    Oversized { data: Vec<u8> },
    /// Borrowed window of an RX DMA page.  Holding the `Arc` keeps the page
    /// alive past ring teardown and is what the ring's flip heuristic
    /// counts.
    Frag {
        page: Arc<DmaRegion>,
        offset: u32,
        window: u16,
        truesize: u32,
    },
}

// =============================================================================
// PacketBuf
// =============================================================================

pub struct PacketBuf {
    inner: PacketBufInner,
    /// Start of the active data region within the backing.
    head: u16,
    /// End of the active data region (exclusive).
    tail: u16,
    l2_offset: u16,
    l3_offset: u16,
    l4_offset: u16,
    /// Ethertype, filled by the RX decode.
    protocol: u16,
    /// TX: device should insert an L4 checksum.
    needs_csum: bool,
    /// TX: checksum field position within the L4 header, in bytes.
    csum_offset: u16,
    /// TX: GSO segment payload size; 0 means not GSO.
    gso_size: u16,
    /// TX: GSO over IPv6 rather than IPv4.
    gso_ipv6: bool,
    rx_csum: RxChecksum,
    rx_hash: Option<(u32, RxHashType)>,
}

impl Drop for PacketBuf {
    fn drop(&mut self) {
        if let PacketBufInner::Pooled { pool, slot } = &self.inner {
            pool.release(*slot);
        }
        // Oversized: Vec drops.  Frag: the Arc drops, releasing the page
        // reference the RX ring counts.
    }
}

impl fmt::Debug for PacketBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            PacketBufInner::Pooled { slot, .. } => write!(f, "PacketBuf::Pooled(slot={slot})")?,
            PacketBufInner::Oversized { data } => {
                write!(f, "PacketBuf::Oversized(cap={})", data.len())?
            }
            PacketBufInner::Frag {
                offset, window, ..
            } => write!(f, "PacketBuf::Frag(offset={offset}, window={window})")?,
        }
        write!(
            f,
            " {{ head={}, tail={}, len={} }}",
            self.head,
            self.tail,
            self.len()
        )
    }
}

fn base_fields(inner: PacketBufInner, head: u16, tail: u16) -> PacketBuf {
    PacketBuf {
        inner,
        head,
        tail,
        l2_offset: 0,
        l3_offset: 0,
        l4_offset: 0,
        protocol: 0,
        needs_csum: false,
        csum_offset: 0,
        gso_size: 0,
        gso_ipv6: false,
        rx_csum: RxChecksum::None,
        rx_hash: None,
    }
}

// =============================================================================
// Constructors
// =============================================================================

impl PacketBuf {
    /// Allocate an empty pooled buffer with [`HEADROOM`] reserved.
    ///
    /// TX path: push headers backward with [`push_header`](Self::push_header),
    /// append payload with [`append`](Self::append).  `None` when the pool
    /// is exhausted.
    pub fn alloc() -> Option<Self> {
        let slot = PACKET_POOL.alloc()?;
        Some(base_fields(
            PacketBufInner::Pooled {
                pool: &PACKET_POOL,
                slot,
            },
            HEADROOM,
            HEADROOM,
        ))
    }

    /// Allocate a pooled buffer holding a copy of `data`, starting at offset
    /// zero so layer offsets equal wire positions.
    ///
    /// RX copy path.  `None` if the pool is exhausted or the frame does not
    /// fit a slot.
    pub fn from_raw_copy(data: &[u8]) -> Option<Self> {
        if data.len() > BUF_SIZE {
            return None;
        }
        let slot = PACKET_POOL.alloc()?;
        // SAFETY: the slot is exclusively ours after alloc().
        unsafe {
            core::ptr::copy_nonoverlapping(data.as_ptr(), PACKET_POOL.slot_data(slot), data.len());
        }
        Some(base_fields(
            PacketBufInner::Pooled {
                pool: &PACKET_POOL,
                slot,
            },
            0,
            data.len() as u16,
        ))
    }

    /// Heap-allocated buffer for frames larger than a pool slot.
    pub fn oversized(capacity: usize) -> Self {
        let capacity = capacity.min(u16::MAX as usize);
        base_fields(
            PacketBufInner::Oversized {
                data: alloc::vec![0u8; capacity],
            },
            0,
            0,
        )
    }

    /// Wrap `len` bytes of a DMA page starting at `offset`, without copying.
    ///
    /// The RX zero-copy path.  `truesize` is the memory actually consumed
    /// (half a page for a flipped buffer), which the stack uses for
    /// accounting.  Holding the returned buffer holds a page reference.
    pub fn from_page_frag(page: Arc<DmaRegion>, offset: usize, len: usize, truesize: usize) -> Self {
        debug_assert!(offset + len <= page.len());
        base_fields(
            PacketBufInner::Frag {
                page,
                offset: offset as u32,
                window: len as u16,
                truesize: truesize as u32,
            },
            0,
            len as u16,
        )
    }
}

// =============================================================================
// Buffer access
// =============================================================================

impl PacketBuf {
    /// Total capacity of the backing buffer (the frag window for `Frag`).
    #[inline]
    pub fn capacity(&self) -> usize {
        match &self.inner {
            PacketBufInner::Pooled { .. } => BUF_SIZE,
            PacketBufInner::Oversized { data } => data.len(),
            PacketBufInner::Frag { window, .. } => *window as usize,
        }
    }

    /// Memory consumed by this buffer, for socket accounting.
    #[inline]
    pub fn truesize(&self) -> usize {
        match &self.inner {
            PacketBufInner::Pooled { .. } => BUF_SIZE,
            PacketBufInner::Oversized { data } => data.len(),
            PacketBufInner::Frag { truesize, .. } => *truesize as usize,
        }
    }

    /// `true` when backed by an RX page fragment rather than a copy.
    #[inline]
    pub fn is_frag(&self) -> bool {
        matches!(self.inner, PacketBufInner::Frag { .. })
    }

    #[inline]
    fn data(&self) -> &[u8] {
        match &self.inner {
            PacketBufInner::Pooled { pool, slot } => {
                // SAFETY: we own the slot; move-only semantics exclude
                // aliased mutation.
                unsafe { core::slice::from_raw_parts(pool.slot_data(*slot), BUF_SIZE) }
            }
            PacketBufInner::Oversized { data } => data.as_slice(),
            PacketBufInner::Frag {
                page,
                offset,
                window,
                ..
            } => {
                // SAFETY: the window was in-bounds at construction, the Arc
                // keeps the page alive, and the ring never writes this half
                // of the page while our reference exists.
                unsafe {
                    core::slice::from_raw_parts(
                        page.as_mut_ptr::<u8>().add(*offset as usize),
                        *window as usize,
                    )
                }
            }
        }
    }

    #[inline]
    fn data_mut(&mut self) -> &mut [u8] {
        match &mut self.inner {
            PacketBufInner::Pooled { pool, slot } => {
                // SAFETY: we own the slot and hold `&mut self`.
                unsafe { core::slice::from_raw_parts_mut(pool.slot_data(*slot), BUF_SIZE) }
            }
            PacketBufInner::Oversized { data } => data.as_mut_slice(),
            PacketBufInner::Frag {
                page,
                offset,
                window,
                ..
            } => {
                // SAFETY: as in `data()`, plus `&mut self` excludes other
                // host-side references through this buffer.
                unsafe {
                    core::slice::from_raw_parts_mut(
                        page.as_mut_ptr::<u8>().add(*offset as usize),
                        *window as usize,
                    )
                }
            }
        }
    }
}

// =============================================================================
// Header push/pull and payload access
// =============================================================================

impl PacketBuf {
    /// Active payload bytes (`tail - head`).
    #[inline]
    pub fn len(&self) -> usize {
        (self.tail - self.head) as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    /// Active data region.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.data()[self.head as usize..self.tail as usize]
    }

    /// Mutable active data region.
    #[inline]
    pub fn payload_mut(&mut self) -> &mut [u8] {
        let h = self.head as usize;
        let t = self.tail as usize;
        &mut self.data_mut()[h..t]
    }

    /// Extend `head` backward by `len`, exposing the new header bytes.
    pub fn push_header(&mut self, len: usize) -> Result<&mut [u8], NetError> {
        let len16 = len as u16;
        if self.head < len16 {
            return Err(NetError::NoBufferSpace);
        }
        self.head -= len16;
        let h = self.head as usize;
        Ok(&mut self.data_mut()[h..h + len])
    }

    /// Consume `len` bytes from the front of the active region.
    pub fn pull_header(&mut self, len: usize) -> Result<&[u8], NetError> {
        if len > self.len() {
            return Err(NetError::InvalidArgument);
        }
        let old_head = self.head as usize;
        self.head += len as u16;
        Ok(&self.data()[old_head..old_head + len])
    }

    /// Append bytes at the tail.  Fragments are immutable windows and refuse.
    pub fn append(&mut self, src: &[u8]) -> Result<(), NetError> {
        if self.is_frag() {
            return Err(NetError::NoBufferSpace);
        }
        let new_tail = self.tail as usize + src.len();
        if new_tail > self.capacity() {
            return Err(NetError::NoBufferSpace);
        }
        let t = self.tail as usize;
        self.data_mut()[t..new_tail].copy_from_slice(src);
        self.tail = new_tail as u16;
        Ok(())
    }

    #[inline]
    pub fn head(&self) -> u16 {
        self.head
    }

    #[inline]
    pub fn tail(&self) -> u16 {
        self.tail
    }
}

// =============================================================================
// Layer offsets and offload metadata
// =============================================================================

impl PacketBuf {
    /// Record the L2 (Ethernet) header offset within the backing buffer.
    #[inline]
    pub fn set_l2(&mut self, offset: u16) {
        self.l2_offset = offset;
    }

    /// Record the L3 (IP) header offset.
    #[inline]
    pub fn set_l3(&mut self, offset: u16) {
        self.l3_offset = offset;
    }

    /// Record the L4 (transport) header offset.
    #[inline]
    pub fn set_l4(&mut self, offset: u16) {
        self.l4_offset = offset;
    }

    #[inline]
    pub fn l2_offset(&self) -> u16 {
        self.l2_offset
    }

    #[inline]
    pub fn l3_offset(&self) -> u16 {
        self.l3_offset
    }

    #[inline]
    pub fn l4_offset(&self) -> u16 {
        self.l4_offset
    }

    #[inline]
    pub fn set_protocol(&mut self, ethertype: u16) {
        self.protocol = ethertype;
    }

    #[inline]
    pub fn protocol(&self) -> u16 {
        self.protocol
    }

    /// TX: ask the device to insert an L4 checksum at `csum_offset` bytes
    /// into the L4 header.  `l4_offset` must already be set.
    #[inline]
    pub fn set_csum_partial(&mut self, csum_offset: u16) {
        self.needs_csum = true;
        self.csum_offset = csum_offset;
    }

    #[inline]
    pub fn needs_csum(&self) -> bool {
        self.needs_csum
    }

    #[inline]
    pub fn csum_offset(&self) -> u16 {
        self.csum_offset
    }

    /// TX: mark as GSO with the given segment size.
    #[inline]
    pub fn set_gso(&mut self, mss: u16, ipv6: bool) {
        self.gso_size = mss;
        self.gso_ipv6 = ipv6;
    }

    /// GSO segment size; 0 when the packet is not GSO.
    #[inline]
    pub fn gso_size(&self) -> u16 {
        self.gso_size
    }

    #[inline]
    pub fn is_gso(&self) -> bool {
        self.gso_size != 0
    }

    #[inline]
    pub fn gso_ipv6(&self) -> bool {
        self.gso_ipv6
    }

    /// RX: checksum state reported by the device.
    #[inline]
    pub fn set_rx_csum(&mut self, csum: RxChecksum) {
        self.rx_csum = csum;
    }

    #[inline]
    pub fn rx_csum(&self) -> RxChecksum {
        self.rx_csum
    }

    /// RX: flow hash reported by the device.
    #[inline]
    pub fn set_rx_hash(&mut self, hash: u32, kind: RxHashType) {
        self.rx_hash = Some((hash, kind));
    }

    #[inline]
    pub fn rx_hash(&self) -> Option<(u32, RxHashType)> {
        self.rx_hash
    }
}
