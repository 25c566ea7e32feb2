//! Queue page lists: the DMA regions the device is allowed to touch.
//!
//! The device never follows host pointers in descriptors; it resolves
//! offsets into a pre-registered page list.  TX and RX use the pages
//! differently, so the backing differs:
//!
//! * **TX** page lists back a bounce FIFO that needs one flat virtual
//!   range, so the whole list is a single contiguous allocation and "pages"
//!   are 4 KiB windows of it.
//! * **RX** page lists are per-page refcounted allocations: the stack may
//!   hold half a page (a flipped buffer) long after the ring is gone, and
//!   the `Arc` keeps exactly that page alive.
//!
//! Ids are allocated from a bitmap split into a TX range followed by an RX
//! range; an id's range tells the device-side code which direction the
//! list serves.

use alloc::sync::Arc;
use alloc::vec::Vec;

use gvnic_abi::PAGE_SIZE;
use gvnic_abi::addr::BusAddr;
use gvnic_mm::dma::DmaRegion;

use super::GveError;

/// One registered (or registrable) list of DMA pages.
pub struct QueuePageList {
    id: u32,
    num_entries: u32,
    backing: QplBacking,
}

enum QplBacking {
    /// TX: one flat region; entry `i` is bytes `[i * 4096, (i+1) * 4096)`.
    Contiguous(Arc<DmaRegion>),
    /// RX: individually refcounted pages.
    Pages(Vec<Arc<DmaRegion>>),
}

impl QueuePageList {
    /// Allocate a TX page list of `pages` contiguous pages.
    pub fn new_tx(id: u32, pages: u32) -> Result<Self, GveError> {
        let region =
            DmaRegion::zeroed(pages as usize * PAGE_SIZE).ok_or(GveError::OutOfMemory)?;
        Ok(Self {
            id,
            num_entries: pages,
            backing: QplBacking::Contiguous(Arc::new(region)),
        })
    }

    /// Allocate an RX page list of `pages` independent pages.
    pub fn new_rx(id: u32, pages: u32) -> Result<Self, GveError> {
        let mut list = Vec::new();
        list.try_reserve_exact(pages as usize)
            .map_err(|_| GveError::OutOfMemory)?;
        for _ in 0..pages {
            list.push(Arc::new(DmaRegion::page().ok_or(GveError::OutOfMemory)?));
        }
        Ok(Self {
            id,
            num_entries: pages,
            backing: QplBacking::Pages(list),
        })
    }

    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[inline]
    pub fn num_entries(&self) -> u32 {
        self.num_entries
    }

    /// Bus address of entry `i`, as registered with the device.
    pub fn page_bus(&self, i: u32) -> BusAddr {
        debug_assert!(i < self.num_entries);
        match &self.backing {
            QplBacking::Contiguous(region) => region.bus_addr_at(i as usize * PAGE_SIZE),
            QplBacking::Pages(pages) => pages[i as usize].bus_addr(),
        }
    }

    /// The flat region backing a TX list; `None` for RX lists.
    pub fn fifo_region(&self) -> Option<Arc<DmaRegion>> {
        match &self.backing {
            QplBacking::Contiguous(region) => Some(Arc::clone(region)),
            QplBacking::Pages(_) => None,
        }
    }

    /// The per-page backing of an RX list; `None` for TX lists.
    pub fn rx_pages(&self) -> Option<&[Arc<DmaRegion>]> {
        match &self.backing {
            QplBacking::Contiguous(_) => None,
            QplBacking::Pages(pages) => Some(pages),
        }
    }
}

// =============================================================================
// Id allocation
// =============================================================================

/// Bitmap of assigned page-list ids.
///
/// Ids `[0, num_tx)` are TX lists, `[num_tx, total)` RX lists.  Setting a
/// bit hands ownership of that id to a ring until `unassign` clears it.
pub struct QplMap {
    bits: Vec<u64>,
    num_tx: u32,
    total: u32,
}

impl QplMap {
    pub fn new(num_tx: u32, num_rx: u32) -> Self {
        let total = num_tx + num_rx;
        let words = (total as usize).div_ceil(64);
        Self {
            bits: alloc::vec![0u64; words.max(1)],
            num_tx,
            total,
        }
    }

    #[inline]
    fn is_set(&self, id: u32) -> bool {
        self.bits[(id / 64) as usize] & (1u64 << (id % 64)) != 0
    }

    #[inline]
    fn set(&mut self, id: u32) {
        self.bits[(id / 64) as usize] |= 1u64 << (id % 64);
    }

    fn first_zero_in(&self, lo: u32, hi: u32) -> Option<u32> {
        (lo..hi).find(|&id| !self.is_set(id))
    }

    /// Claim the next free TX id.  `None` when every TX list is assigned.
    pub fn assign_tx(&mut self) -> Option<u32> {
        let id = self.first_zero_in(0, self.num_tx)?;
        self.set(id);
        Some(id)
    }

    /// Claim the next free RX id.  `None` when every RX list is assigned.
    pub fn assign_rx(&mut self) -> Option<u32> {
        let id = self.first_zero_in(self.num_tx, self.total)?;
        self.set(id);
        Some(id)
    }

    /// Return an id to the pool.
    pub fn unassign(&mut self, id: u32) {
        debug_assert!(id < self.total);
        self.bits[(id / 64) as usize] &= !(1u64 << (id % 64));
    }

    /// Whether `id` is currently assigned.
    pub fn is_assigned(&self, id: u32) -> bool {
        id < self.total && self.is_set(id)
    }
}
