//! Notification blocks: the binding between MSI-X vectors and rings.
//!
//! Every data vector owns one block.  The device writes each block's IRQ
//! doorbell index into a DMA-shared record array (stride = one cache line,
//! which is also the `irq_db_stride` reported in
//! CONFIGURE_DEVICE_RESOURCES); the host side of a block carries the NAPI
//! context and *indices* of at most one TX and one RX ring — indices, not
//! pointers, so blocks never own rings and teardown order stays trivial.
//!
//! Block layout convention: TX rings map to blocks `[0, n/2)`, RX rings to
//! `[n/2, n)`, where `n` is the block count.

use alloc::string::String;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, Ordering, fence};

use gvnic_abi::addr::BusAddr;
use gvnic_lib::L1_CACHE_BYTES;
use gvnic_mm::dma::DmaRegion;

use super::GveError;
use crate::net::napi::NapiContext;

/// Vectors a functioning device needs: management plus at least one TX and
/// one RX block.
pub const MIN_MSIX: u32 = 3;

/// Stride of one device-shared block record; the `irq_db_stride` the device
/// is told at resource configuration.
pub const NTFY_BLOCK_STRIDE: usize = L1_CACHE_BYTES;

/// Sentinel for "no ring attached".
pub const NTFY_RING_NONE: u32 = u32::MAX;

/// Poll budget per block per scheduling round.
pub const NAPI_BUDGET: u32 = 64;

/// Block index serving TX queue `queue_idx`.
#[inline]
pub const fn tx_ntfy_idx(queue_idx: u32) -> u32 {
    queue_idx
}

/// Block index serving RX queue `queue_idx`.
#[inline]
pub const fn rx_ntfy_idx(num_blocks: u32, queue_idx: u32) -> u32 {
    num_blocks / 2 + queue_idx
}

/// The DMA array of device-written block records.
///
/// Each record's first field is the big-endian IRQ doorbell index for that
/// block; the device fills it during CONFIGURE_DEVICE_RESOURCES.
pub struct NtfyBlockArray {
    mem: DmaRegion,
    num_blocks: u32,
}

impl NtfyBlockArray {
    pub fn alloc(num_blocks: u32) -> Result<Self, GveError> {
        let mem = DmaRegion::zeroed(num_blocks as usize * NTFY_BLOCK_STRIDE)
            .ok_or(GveError::OutOfMemory)?;
        Ok(Self { mem, num_blocks })
    }

    #[inline]
    pub fn bus_addr(&self) -> BusAddr {
        self.mem.bus_addr()
    }

    #[inline]
    pub fn num_blocks(&self) -> u32 {
        self.num_blocks
    }

    /// IRQ doorbell index the device assigned to block `id`.
    ///
    /// The device writes this field asynchronously; the read is volatile
    /// with acquire ordering.
    pub fn irq_db_index(&self, id: u32) -> u32 {
        debug_assert!(id < self.num_blocks);
        let raw = self.mem.read_at::<u32>(id as usize * NTFY_BLOCK_STRIDE);
        fence(Ordering::Acquire);
        u32::from_be(raw)
    }
}

/// Host-side per-vector coordination record.
pub struct NotifyBlock {
    id: u32,
    name: String,
    napi: NapiContext,
    /// Index of the attached TX ring, or [`NTFY_RING_NONE`].
    tx: AtomicU32,
    /// Index of the attached RX ring, or [`NTFY_RING_NONE`].
    rx: AtomicU32,
    /// Shared record array holding this block's device-written doorbell
    /// index.
    shared: Arc<NtfyBlockArray>,
}

impl NotifyBlock {
    pub fn new(id: u32, name: String, shared: Arc<NtfyBlockArray>) -> Self {
        Self {
            id,
            name,
            napi: NapiContext::new(NAPI_BUDGET),
            tx: AtomicU32::new(NTFY_RING_NONE),
            rx: AtomicU32::new(NTFY_RING_NONE),
            shared,
        }
    }

    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn napi(&self) -> &NapiContext {
        &self.napi
    }

    /// IRQ doorbell cell for this block.
    #[inline]
    pub fn irq_db_index(&self) -> u32 {
        self.shared.irq_db_index(self.id)
    }

    pub fn set_tx(&self, ring_idx: u32) {
        self.tx.store(ring_idx, Ordering::Release);
    }

    pub fn clear_tx(&self) {
        self.tx.store(NTFY_RING_NONE, Ordering::Release);
    }

    pub fn tx_ring(&self) -> Option<u32> {
        match self.tx.load(Ordering::Acquire) {
            NTFY_RING_NONE => None,
            idx => Some(idx),
        }
    }

    pub fn set_rx(&self, ring_idx: u32) {
        self.rx.store(ring_idx, Ordering::Release);
    }

    pub fn clear_rx(&self) {
        self.rx.store(NTFY_RING_NONE, Ordering::Release);
    }

    pub fn rx_ring(&self) -> Option<u32> {
        match self.rx.load(Ordering::Acquire) {
            NTFY_RING_NONE => None,
            idx => Some(idx),
        }
    }

    /// `true` if any ring is attached.
    pub fn has_ring(&self) -> bool {
        self.tx_ring().is_some() || self.rx_ring().is_some()
    }
}
