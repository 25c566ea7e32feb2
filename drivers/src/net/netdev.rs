//! Network device abstraction: `NetDevice` trait, device registry, and
//! stable device handles.
//!
//! Drivers move bytes; the stack understands protocols.  Only
//! [`PacketBuf`] crosses the boundary: downward through
//! [`NetDevice::start_xmit`], upward through the sink registered in
//! [`ingress`](super::ingress).
//!
//! # Concurrency model
//!
//! The registry lock serializes registration, unregistration, and
//! enumeration; the data plane never takes it.  [`DeviceHandle`] stores a
//! stable raw pointer to the device's heap allocation and forwards calls
//! directly:
//!
//! * `start_xmit()` — callers may target the same queue concurrently; the
//!   driver serializes per queue internally (each TX ring owns a producer
//!   lock).
//! * Control operations (`open`/`stop`/`set_channels`/…) are serialized by
//!   the driver's own lifecycle lock.
//!
//! All trait methods take `&self`; drivers use interior mutability.

extern crate alloc;

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt;

use bitflags::bitflags;
use gvnic_abi::net::UserChannels;
use gvnic_lib::IrqMutex;

use super::packetbuf::PacketBuf;
use super::types::{DevIndex, MacAddr, NetError};

// =============================================================================
// NetDevice trait
// =============================================================================

/// A multiqueue network device.
///
/// The five primitive operations (`start_xmit`, `open`, `stop`,
/// `get_stats`, `change_mtu`) plus the channel-configuration surface and a
/// user-triggered reset.
pub trait NetDevice: Send + Sync {
    /// Queue one packet on TX queue `queue`.  The packet is consumed.
    ///
    /// `more_coming` hints that the caller will immediately submit another
    /// packet, letting the driver defer its doorbell.  Returns
    /// `Err(Busy)` when the queue is out of resources; the caller should
    /// back off until a completion, then retry.
    fn start_xmit(&self, queue: u16, pkt: PacketBuf, more_coming: bool) -> Result<(), NetError>;

    /// Bring the interface up: allocate rings, hand buffers to the device,
    /// mark the link up.
    fn open(&self) -> Result<(), NetError>;

    /// Bring the interface down, releasing everything `open` built.
    fn stop(&self) -> Result<(), NetError>;

    /// Aggregate traffic counters.
    fn get_stats(&self) -> NetDeviceStats;

    /// Change the MTU.  Bounded by the device's advertised range.
    fn change_mtu(&self, mtu: u16) -> Result<(), NetError>;

    /// Current MTU.
    fn mtu(&self) -> u16;

    /// Hardware MAC address.
    fn mac(&self) -> MacAddr;

    /// Capability flags.
    fn features(&self) -> NetDeviceFeatures;

    /// Current and maximum queue counts.
    fn channels(&self) -> UserChannels;

    /// Reconfigure queue counts.  May bounce the link if the interface is
    /// up.
    fn set_channels(&self, channels: UserChannels) -> Result<(), NetError>;

    /// User-requested device reset (the `ethtool --reset` analog).
    fn trigger_reset(&self);
}

// =============================================================================
// NetDeviceStats
// =============================================================================

/// Read-only snapshot of aggregate device statistics.
///
/// Counters are monotonically increasing and survive link bounces; a full
/// device reset zeroes them.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NetDeviceStats {
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_dropped: u64,
    pub tx_dropped: u64,
}

impl NetDeviceStats {
    pub const fn new() -> Self {
        Self {
            rx_packets: 0,
            tx_packets: 0,
            rx_bytes: 0,
            tx_bytes: 0,
            rx_dropped: 0,
            tx_dropped: 0,
        }
    }
}

impl fmt::Display for NetDeviceStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rx: {} pkts/{} bytes, tx: {} pkts/{} bytes, drop: {}/{}",
            self.rx_packets,
            self.rx_bytes,
            self.tx_packets,
            self.tx_bytes,
            self.rx_dropped,
            self.tx_dropped
        )
    }
}

// =============================================================================
// NetDeviceFeatures
// =============================================================================

bitflags! {
    /// Capability flags a driver advertises after probing its device.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct NetDeviceFeatures: u32 {
        /// Device inserts TX L4 checksums.
        const CHECKSUM_TX = 1 << 0;
        /// Device reports RX checksums; the stack may skip verification.
        const CHECKSUM_RX = 1 << 1;
        /// TCP segmentation offload.
        const TSO         = 1 << 2;
        /// TSO over IPv6.
        const TSO6        = 1 << 3;
        /// Device supplies an RX flow hash.
        const RX_HASH     = 1 << 4;
        /// Scatter-gather transmit.
        const SG          = 1 << 5;
    }
}

impl Default for NetDeviceFeatures {
    fn default() -> Self {
        Self::empty()
    }
}

// =============================================================================
// DeviceHandle
// =============================================================================

/// Stable reference to a registered device for data-plane use.
///
/// Obtained once from [`NetDeviceRegistry::register`] and held for the
/// device's registered lifetime; bypasses the registry lock entirely.
///
/// # Safety
///
/// The raw pointer stays valid while the device remains registered.
/// Unregistering a device whose handle is still in use is undefined
/// behavior; the owner must quiesce the data plane first.
pub struct DeviceHandle {
    /// Points into the registry's `Box<dyn NetDevice>` allocation.
    dev: *const (dyn NetDevice + Send + Sync),
    index: DevIndex,
}

// SAFETY: the pointee is `Send + Sync` and outlives the handle per the
// registration contract.
unsafe impl Send for DeviceHandle {}
unsafe impl Sync for DeviceHandle {}

impl DeviceHandle {
    #[inline]
    pub fn index(&self) -> DevIndex {
        self.index
    }

    /// Transmit on `queue`.  Per-queue serialization happens inside the
    /// driver, so concurrent callers are safe.
    pub fn start_xmit(
        &self,
        queue: u16,
        pkt: PacketBuf,
        more_coming: bool,
    ) -> Result<(), NetError> {
        // SAFETY: valid for the registered lifetime; `&self` method.
        let dev = unsafe { &*self.dev };
        dev.start_xmit(queue, pkt, more_coming)
    }

    pub fn open(&self) -> Result<(), NetError> {
        // SAFETY: as above.
        let dev = unsafe { &*self.dev };
        dev.open()
    }

    pub fn stop(&self) -> Result<(), NetError> {
        // SAFETY: as above.
        let dev = unsafe { &*self.dev };
        dev.stop()
    }

    pub fn stats(&self) -> NetDeviceStats {
        // SAFETY: as above.
        let dev = unsafe { &*self.dev };
        dev.get_stats()
    }

    pub fn mac(&self) -> MacAddr {
        // SAFETY: as above.
        let dev = unsafe { &*self.dev };
        dev.mac()
    }

    pub fn mtu(&self) -> u16 {
        // SAFETY: as above.
        let dev = unsafe { &*self.dev };
        dev.mtu()
    }

    pub fn change_mtu(&self, mtu: u16) -> Result<(), NetError> {
        // SAFETY: as above.
        let dev = unsafe { &*self.dev };
        dev.change_mtu(mtu)
    }

    pub fn features(&self) -> NetDeviceFeatures {
        // SAFETY: as above.
        let dev = unsafe { &*self.dev };
        dev.features()
    }

    pub fn channels(&self) -> UserChannels {
        // SAFETY: as above.
        let dev = unsafe { &*self.dev };
        dev.channels()
    }

    pub fn set_channels(&self, channels: UserChannels) -> Result<(), NetError> {
        // SAFETY: as above.
        let dev = unsafe { &*self.dev };
        dev.set_channels(channels)
    }

    pub fn trigger_reset(&self) {
        // SAFETY: as above.
        let dev = unsafe { &*self.dev };
        dev.trigger_reset()
    }
}

impl fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceHandle({})", self.index)
    }
}

// =============================================================================
// NetDeviceRegistry
// =============================================================================

/// Maximum simultaneously registered devices.
const MAX_DEVICES: usize = 32;

/// Control-plane storage for registered network devices.
///
/// # Invariants
///
/// * Each device occupies one slot; the `Box` heap allocation is stable, so
///   raw pointers in handles survive registry mutation of other slots.
/// * Handles become dangling only at [`unregister`](Self::unregister), which
///   the owner must precede with a data-plane quiesce.
pub struct NetDeviceRegistry {
    inner: IrqMutex<RegistryInner>,
}

struct RegistryInner {
    slots: [Option<Box<dyn NetDevice + Send + Sync>>; MAX_DEVICES],
    count: usize,
}

/// The global device registry.
pub static DEVICE_REGISTRY: NetDeviceRegistry = NetDeviceRegistry::new();

impl NetDeviceRegistry {
    pub const fn new() -> Self {
        Self {
            inner: IrqMutex::new(RegistryInner {
                slots: [const { None }; MAX_DEVICES],
                count: 0,
            }),
        }
    }

    /// Register a device, returning a stable handle, or `None` when all
    /// slots are taken.
    pub fn register(&self, dev: Box<dyn NetDevice + Send + Sync>) -> Option<DeviceHandle> {
        let mut inner = self.inner.lock();
        for (i, slot) in inner.slots.iter_mut().enumerate() {
            if slot.is_none() {
                // Capture the raw pointer before the Box moves into the
                // slot; moving the Box does not move the pointee.
                let dev_ptr: *const (dyn NetDevice + Send + Sync) = &*dev;
                *slot = Some(dev);
                inner.count += 1;
                return Some(DeviceHandle {
                    dev: dev_ptr,
                    index: DevIndex(i),
                });
            }
        }
        None
    }

    /// Drop a registered device.  The caller must have stopped it and
    /// drained all data-plane users of its handles.
    pub fn unregister(&self, index: DevIndex) -> bool {
        let mut inner = self.inner.lock();
        let idx = index.0;
        if idx >= MAX_DEVICES {
            return false;
        }
        if inner.slots[idx].take().is_some() {
            inner.count -= 1;
            true
        } else {
            false
        }
    }

    /// `(index, mac)` of every registered device.
    pub fn enumerate(&self) -> Vec<(DevIndex, MacAddr)> {
        let inner = self.inner.lock();
        let mut result = Vec::new();
        for (i, slot) in inner.slots.iter().enumerate() {
            if let Some(dev) = slot {
                result.push((DevIndex(i), dev.mac()));
            }
        }
        result
    }

    #[inline]
    pub fn device_count(&self) -> usize {
        self.inner.lock().count
    }
}
