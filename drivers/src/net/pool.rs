//! Fixed packet-buffer pool with lock-free alloc/release.
//!
//! The RX copy path and small TX frames draw from this pool on every packet,
//! often from interrupt context, so allocation must be O(1) and must not
//! take a lock.  Slots are threaded on an intrusive freelist popped and
//! pushed with a version-tagged CAS (the tag defeats ABA when a slot is
//! freed and immediately re-allocated between a competitor's load and CAS).
//!
//! Backing storage is a static array in BSS; nothing is allocated at run
//! time and exhaustion is an explicit `None`, which the driver reports as a
//! counted drop rather than an error.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicUsize, Ordering};

/// Size of each buffer slot in bytes.
///
/// Large enough for a max-size Ethernet frame plus [`HEADROOM`]
/// (`crate::net::packetbuf::HEADROOM`) for prepended headers.
pub const BUF_SIZE: usize = 2048;

/// Number of pre-allocated slots.
pub const POOL_SIZE: usize = 256;

/// End-of-freelist sentinel.
const FREELIST_EMPTY: u16 = u16::MAX;

// =============================================================================
// Backing storage
// =============================================================================

#[repr(C, align(64))]
struct PoolStorage {
    slots: UnsafeCell<[[u8; BUF_SIZE]; POOL_SIZE]>,
}

// SAFETY: a slot is reachable either from the freelist or from exactly one
// live PacketBuf (move-only), never both, so no two parties mutate the same
// slot concurrently.
unsafe impl Sync for PoolStorage {}

static POOL_STORAGE: PoolStorage = PoolStorage {
    slots: UnsafeCell::new([[0u8; BUF_SIZE]; POOL_SIZE]),
};

// =============================================================================
// Pool
// =============================================================================

/// Lock-free packet-buffer pool.
///
/// `head` packs `(version << 16) | slot_index`; the version increments on
/// every successful pop/push.
pub struct PacketPool {
    head: AtomicU32,
    next: [AtomicU16; POOL_SIZE],
    free_count: AtomicUsize,
    initialized: AtomicBool,
}

// SAFETY: all shared state is atomic.
unsafe impl Send for PacketPool {}
unsafe impl Sync for PacketPool {}

/// The global pool.  [`PacketPool::init`] must run before networking starts.
pub static PACKET_POOL: PacketPool = PacketPool {
    head: AtomicU32::new(FREELIST_EMPTY as u32),
    next: [const { AtomicU16::new(0) }; POOL_SIZE],
    free_count: AtomicUsize::new(0),
    initialized: AtomicBool::new(false),
};

impl PacketPool {
    /// Build the freelist.  Idempotent; the first caller wins.
    pub fn init(&self) {
        if self.initialized.swap(true, Ordering::AcqRel) {
            return;
        }

        for i in 0..POOL_SIZE {
            let next = if i + 1 < POOL_SIZE {
                (i + 1) as u16
            } else {
                FREELIST_EMPTY
            };
            self.next[i].store(next, Ordering::Relaxed);
        }

        // Release publishes the chain built above together with the head.
        self.head.store(0, Ordering::Release);
        self.free_count.store(POOL_SIZE, Ordering::Release);
    }

    /// Pop a free slot, or `None` when exhausted.
    pub fn alloc(&self) -> Option<u16> {
        loop {
            let old = self.head.load(Ordering::Acquire);
            let idx = (old & 0xFFFF) as u16;
            if idx == FREELIST_EMPTY {
                return None;
            }
            let version = old >> 16;
            let next_idx = self.next[idx as usize].load(Ordering::Relaxed);
            let new = (version.wrapping_add(1) << 16) | (next_idx as u32);
            if self
                .head
                .compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                self.free_count.fetch_sub(1, Ordering::Relaxed);
                return Some(idx);
            }
            core::hint::spin_loop();
        }
    }

    /// Push a slot back.  Called from `PacketBuf::drop`; the slot must not
    /// be touched afterwards.
    pub fn release(&self, slot: u16) {
        debug_assert!((slot as usize) < POOL_SIZE);
        loop {
            let old = self.head.load(Ordering::Acquire);
            let old_idx = (old & 0xFFFF) as u16;
            let version = old >> 16;
            self.next[slot as usize].store(old_idx, Ordering::Relaxed);
            let new = (version.wrapping_add(1) << 16) | (slot as u32);
            if self
                .head
                .compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                self.free_count.fetch_add(1, Ordering::Relaxed);
                return;
            }
            core::hint::spin_loop();
        }
    }

    /// Free slots right now (diagnostic; racy by nature).
    #[inline]
    pub fn available(&self) -> usize {
        self.free_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Raw pointer to the first byte of `slot`, valid for [`BUF_SIZE`]
    /// bytes.  The caller must own the slot.
    #[inline]
    pub(crate) fn slot_data(&self, slot: u16) -> *mut u8 {
        debug_assert!((slot as usize) < POOL_SIZE);
        // SAFETY: in-bounds; exclusivity comes from slot ownership.
        unsafe { (POOL_STORAGE.slots.get() as *mut u8).add(slot as usize * BUF_SIZE) }
    }
}
