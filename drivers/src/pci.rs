//! PCI driver boundary.
//!
//! Bus enumeration, BAR mapping, and MSI-X programming live in the
//! platform's PCI core, not here.  By the time a driver's `probe` runs, the
//! device's BARs are mapped, bus mastering is on, its MSI-X vectors are
//! allocated, and DMA is configured for 64-bit addressing.  What crosses
//! this boundary is a [`PciDeviceInfo`]: identity, mapped windows, and the
//! vector budget.
//!
//! Drivers register a [`PciDriver`] record once at init; the PCI core calls
//! [`pci_probe_device`] for each discovered function.

use alloc::vec::Vec;

use gvnic_lib::{IrqMutex, klog_debug, klog_info};
use gvnic_mm::mmio::MmioRegion;

/// Number of BARs a PCI function can expose.
pub const PCI_NUM_BARS: usize = 6;

/// Everything the bus layer hands a driver about one PCI function.
#[derive(Clone, Copy)]
pub struct PciDeviceInfo {
    pub vendor_id: u16,
    pub device_id: u16,
    pub bus: u8,
    pub device: u8,
    pub function: u8,
    /// Mapped BAR windows; unmapped BARs are [`MmioRegion::empty`].
    pub bars: [MmioRegion; PCI_NUM_BARS],
    /// MSI-X vectors allocated for this function.
    pub msix_vectors: u32,
}

impl PciDeviceInfo {
    /// Packed bus/device/function identity, used as an opaque token toward
    /// the platform (IRQ binding, function-level reset).
    #[inline]
    pub fn bdf(&self) -> u32 {
        ((self.bus as u32) << 16) | ((self.device as u32) << 8) | (self.function as u32)
    }
}

/// A registered PCI driver.
pub struct PciDriver {
    pub name: &'static str,
    /// `true` if this driver wants the device.
    pub match_fn: fn(&PciDeviceInfo) -> bool,
    /// Claim the device.  Returns a nonnegative driver-private handle on
    /// success, negative on failure.
    pub probe: fn(&PciDeviceInfo) -> i32,
}

static DRIVERS: IrqMutex<Vec<&'static PciDriver>> = IrqMutex::new(Vec::new());

/// Register a driver.  Returns 0, or -1 if the same record was registered
/// twice.
pub fn pci_register_driver(driver: &'static PciDriver) -> i32 {
    let mut drivers = DRIVERS.lock();
    if drivers
        .iter()
        .any(|d| core::ptr::eq(*d as *const _, driver as *const _))
    {
        return -1;
    }
    klog_debug!("pci: registered driver {}", driver.name);
    drivers.push(driver);
    0
}

/// Offer a discovered function to every registered driver in order.
///
/// Returns the probe handle of the first driver that matched and probed
/// successfully, or -1 if none claimed the device.
pub fn pci_probe_device(info: &PciDeviceInfo) -> i32 {
    // Snapshot under the lock; probe runs without it so a probe may
    // register further drivers.
    let candidates: Vec<&'static PciDriver> = DRIVERS.lock().iter().copied().collect();

    for driver in candidates {
        if !(driver.match_fn)(info) {
            continue;
        }
        klog_info!(
            "pci: {} probing {:04x}:{:04x} at {:02x}:{:02x}.{}",
            driver.name,
            info.vendor_id,
            info.device_id,
            info.bus,
            info.device,
            info.function
        );
        let handle = (driver.probe)(info);
        if handle >= 0 {
            return handle;
        }
        klog_info!("pci: {} probe failed ({})", driver.name, handle);
    }
    -1
}
