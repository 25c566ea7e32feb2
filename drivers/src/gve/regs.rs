//! gVNIC register window (BAR0) and doorbell array (BAR2).
//!
//! Every register is big-endian on the wire.  The window is 32 bytes of
//! fixed configuration registers; the doorbell BAR is a dense array of
//! 32-bit cells indexed by values the device publishes through queue
//! resources and notification blocks.

use gvnic_mm::mmio::MmioRegion;

/// BAR holding the register window.
pub const REGISTER_BAR: usize = 0;
/// BAR holding the doorbell array.
pub const DOORBELL_BAR: usize = 2;

/// Size of the fixed register window.
pub const REG_WINDOW_END: usize = 0x20;

pub const REG_DEVICE_STATUS: usize = 0x00;
pub const REG_DRIVER_STATUS: usize = 0x04;
pub const REG_MAX_TX_QUEUES: usize = 0x08;
pub const REG_MAX_RX_QUEUES: usize = 0x0C;
pub const REG_ADMINQ_PFN: usize = 0x10;
pub const REG_ADMINQ_DOORBELL: usize = 0x14;
pub const REG_ADMINQ_EVENT_COUNTER: usize = 0x18;
/// One-byte sink for the driver version string, written a byte at a time.
pub const REG_DRIVER_VERSION: usize = REG_WINDOW_END - 1;

/// Device status bit: the device is asking the driver to reset it.
pub const DEVICE_STATUS_RESET_REQUESTED: u32 = 1 << 1;

/// The BAR0 register window.
#[derive(Clone, Copy)]
pub struct GveRegisters {
    mmio: MmioRegion,
}

impl GveRegisters {
    pub fn new(mmio: MmioRegion) -> Self {
        Self { mmio }
    }

    #[inline]
    fn read32(&self, offset: usize) -> u32 {
        u32::from_be(self.mmio.read::<u32>(offset))
    }

    #[inline]
    fn write32(&self, offset: usize, value: u32) {
        self.mmio.write::<u32>(offset, value.to_be());
    }

    /// Device status register.
    #[inline]
    pub fn device_status(&self) -> u32 {
        self.read32(REG_DEVICE_STATUS)
    }

    /// `true` when the device is requesting a reset.
    #[inline]
    pub fn reset_requested(&self) -> bool {
        self.device_status() & DEVICE_STATUS_RESET_REQUESTED != 0
    }

    #[inline]
    pub fn max_tx_queues(&self) -> u32 {
        self.read32(REG_MAX_TX_QUEUES)
    }

    #[inline]
    pub fn max_rx_queues(&self) -> u32 {
        self.read32(REG_MAX_RX_QUEUES)
    }

    /// Point the device at the admin queue page.  `pfn` of zero detaches
    /// the queue.
    ///
    /// The register takes the 32-bit page frame number in wire order,
    /// delivered as a single 64-bit store; the adjacent doorbell register
    /// is rewritten by every subsequent submit, so the wide store is safe.
    #[inline]
    pub fn write_adminq_pfn(&self, pfn: u64) {
        debug_assert!(pfn <= u32::MAX as u64, "admin page beyond the device's reach");
        self.mmio
            .write::<u64>(REG_ADMINQ_PFN, (pfn as u32).to_be() as u64);
    }

    /// Publish the admin producer count.
    #[inline]
    pub fn write_adminq_doorbell(&self, prod: u32) {
        self.write32(REG_ADMINQ_DOORBELL, prod);
    }

    /// Count of admin commands the device has completed.
    #[inline]
    pub fn adminq_event_counter(&self) -> u32 {
        self.read32(REG_ADMINQ_EVENT_COUNTER)
    }

    /// Write the driver version string, one byte at a time, newline
    /// terminated.  The device logs it for support purposes.
    pub fn write_driver_version(&self, version: &str) {
        for byte in version.bytes() {
            self.mmio.write::<u8>(REG_DRIVER_VERSION, byte);
        }
        self.mmio.write::<u8>(REG_DRIVER_VERSION, b'\n');
    }
}

/// The BAR2 doorbell array: 32-bit big-endian cells.
///
/// Cell meaning depends on who told us the index: a TX queue's cell takes
/// its producer index, an RX queue's cell takes its fill count, a
/// notification block's cell takes IRQ control bits.
#[derive(Clone, Copy)]
pub struct DoorbellArray {
    mmio: MmioRegion,
}

impl DoorbellArray {
    pub fn new(mmio: MmioRegion) -> Self {
        Self { mmio }
    }

    /// Write `value` to doorbell cell `index`.
    #[inline]
    pub fn write(&self, index: u32, value: u32) {
        self.mmio
            .write::<u32>(index as usize * 4, value.to_be());
    }
}
