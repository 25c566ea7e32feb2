//! Admin queue: the device's control channel.
//!
//! One DMA page holds a ring of 64-byte command slots.  The host copies a
//! command into the next slot, bumps its producer count, writes the count to
//! the admin doorbell register, and polls the admin event counter until the
//! device has executed everything up to that count.  The device writes a
//! status into the slot as it completes each command.
//!
//! The whole submit-and-wait cycle runs under one exclusive lock (the
//! driver keeps the queue inside an `IrqMutex`); nothing else may touch the
//! ring or the doorbell while a command is in flight.  A command the device
//! never answers leaves the queue unusable: `execute` reports
//! `NotRecoverable` and the caller escalates to the reset path.

use alloc::vec::Vec;

use gvnic_abi::PAGE_SIZE;
use gvnic_abi::addr::BusAddr;
use gvnic_lib::kernel_services::platform;
use gvnic_lib::{klog_error, klog_info};
use gvnic_mm::dma::DmaRegion;

use super::GveError;
use super::desc::{RxDataSlot, RxDesc, TxPktDesc};
use super::qpl::QueuePageList;
use super::regs::GveRegisters;
use crate::net::types::MacAddr;

// =============================================================================
// Opcodes and status codes
// =============================================================================

pub const OPCODE_DESCRIBE_DEVICE: u32 = 0x1;
pub const OPCODE_CONFIGURE_DEVICE_RESOURCES: u32 = 0x2;
pub const OPCODE_REGISTER_PAGE_LIST: u32 = 0x3;
pub const OPCODE_UNREGISTER_PAGE_LIST: u32 = 0x4;
pub const OPCODE_CREATE_TX_QUEUE: u32 = 0x5;
pub const OPCODE_CREATE_RX_QUEUE: u32 = 0x6;
pub const OPCODE_DESTROY_TX_QUEUE: u32 = 0x7;
pub const OPCODE_DESTROY_RX_QUEUE: u32 = 0x8;
pub const OPCODE_DECONFIGURE_DEVICE_RESOURCES: u32 = 0x9;

pub const STATUS_UNSET: u32 = 0x0;
pub const STATUS_PASSED: u32 = 0x1;
pub const STATUS_ABORTED: u32 = 0xFFFF_FFF0;
pub const STATUS_ALREADY_EXISTS: u32 = 0xFFFF_FFF1;
pub const STATUS_CANCELLED: u32 = 0xFFFF_FFF2;
pub const STATUS_DATALOSS: u32 = 0xFFFF_FFF3;
pub const STATUS_DEADLINE_EXCEEDED: u32 = 0xFFFF_FFF4;
pub const STATUS_FAILED_PRECONDITION: u32 = 0xFFFF_FFF5;
pub const STATUS_INTERNAL: u32 = 0xFFFF_FFF6;
pub const STATUS_INVALID_ARGUMENT: u32 = 0xFFFF_FFF7;
pub const STATUS_NOT_FOUND: u32 = 0xFFFF_FFF8;
pub const STATUS_OUT_OF_RANGE: u32 = 0xFFFF_FFF9;
pub const STATUS_PERMISSION_DENIED: u32 = 0xFFFF_FFFA;
pub const STATUS_UNAUTHENTICATED: u32 = 0xFFFF_FFFB;
pub const STATUS_RESOURCE_EXHAUSTED: u32 = 0xFFFF_FFFC;
pub const STATUS_UNAVAILABLE: u32 = 0xFFFF_FFFD;
pub const STATUS_UNIMPLEMENTED: u32 = 0xFFFF_FFFE;
pub const STATUS_UNKNOWN: u32 = 0xFFFF_FFFF;

/// Event-counter polls before declaring the queue dead (20 ms apart).
pub const MAX_EVENT_COUNTER_CHECKS: u32 = 100;
/// Poll interval while waiting on the event counter.
pub const EVENT_COUNTER_POLL_MS: u32 = 20;

pub const DEVICE_DESCRIPTOR_VERSION: u32 = 1;

/// Hard caps on pages per queue page list, regardless of what the device
/// advertises.
pub const TX_QPL_MAX_PAGES: u32 = 512;
pub const RX_QPL_MAX_PAGES: u32 = 1024;

// =============================================================================
// Command slot
// =============================================================================

pub const COMMAND_SIZE: usize = 64;
const PAYLOAD_SIZE: usize = COMMAND_SIZE - 8;

/// One 64-byte admin command slot: opcode, device-written status, and an
/// opcode-specific payload, all big-endian.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct AdminqCommand {
    pub opcode_be: u32,
    pub status_be: u32,
    pub payload: [u8; PAYLOAD_SIZE],
}

const _: () = assert!(core::mem::size_of::<AdminqCommand>() == COMMAND_SIZE);

impl AdminqCommand {
    pub fn new(opcode: u32) -> Self {
        Self {
            opcode_be: opcode.to_be(),
            status_be: 0,
            payload: [0; PAYLOAD_SIZE],
        }
    }

    #[inline]
    pub fn status(&self) -> u32 {
        u32::from_be(self.status_be)
    }
}

#[inline]
fn put_be16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
}

#[inline]
fn put_be32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}

#[inline]
fn put_be64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_be_bytes());
}

#[inline]
fn get_be16(buf: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([buf[offset], buf[offset + 1]])
}

#[inline]
fn get_be64(buf: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_be_bytes(bytes)
}

// =============================================================================
// Device descriptor
// =============================================================================

/// Parsed DESCRIBE_DEVICE response, host byte order, with the driver-side
/// page caps already applied.
#[derive(Clone, Copy, Debug, Default)]
pub struct DeviceDescriptor {
    pub max_registered_pages: u64,
    pub tx_queue_entries: u16,
    pub rx_queue_entries: u16,
    pub default_num_queues: u16,
    pub mtu: u16,
    pub counters: u16,
    pub tx_pages_per_qpl: u16,
    pub rx_pages_per_qpl: u16,
    pub mac: MacAddr,
}

fn parse_device_descriptor(bytes: &[u8]) -> DeviceDescriptor {
    let mut mac = [0u8; 6];
    mac.copy_from_slice(&bytes[24..30]);
    DeviceDescriptor {
        max_registered_pages: get_be64(bytes, 0),
        tx_queue_entries: get_be16(bytes, 10),
        rx_queue_entries: get_be16(bytes, 12),
        default_num_queues: get_be16(bytes, 14),
        mtu: get_be16(bytes, 16),
        counters: get_be16(bytes, 18),
        tx_pages_per_qpl: get_be16(bytes, 20),
        rx_pages_per_qpl: get_be16(bytes, 22),
        mac: MacAddr::from_bytes(mac),
    }
}

// =============================================================================
// Queue creation parameter bundles
// =============================================================================

/// Everything CREATE_TX_QUEUE tells the device about one TX queue.
pub struct CreateTxQueue {
    pub queue_id: u32,
    pub queue_resources_addr: BusAddr,
    pub tx_ring_addr: BusAddr,
    pub queue_page_list_id: u32,
    pub ntfy_id: u32,
}

/// Everything CREATE_RX_QUEUE tells the device about one RX queue.
pub struct CreateRxQueue {
    pub queue_id: u32,
    pub ntfy_id: u32,
    pub queue_resources_addr: BusAddr,
    pub rx_desc_ring_addr: BusAddr,
    pub rx_data_ring_addr: BusAddr,
    pub queue_page_list_id: u32,
}

// =============================================================================
// The queue
// =============================================================================

/// Host-side admin queue state.
///
/// Owns the command ring page.  `prod` counts commands ever submitted; the
/// device's event counter converges on it.
pub struct AdminQueue {
    mem: DmaRegion,
    mask: u32,
    prod: u32,
}

impl AdminQueue {
    /// Allocate the ring and attach it to the device via the PFN register.
    pub fn alloc(regs: &GveRegisters) -> Result<AdminQueue, GveError> {
        let mem = DmaRegion::page().ok_or(GveError::OutOfMemory)?;
        let mask = (PAGE_SIZE / COMMAND_SIZE) as u32 - 1;
        regs.write_adminq_pfn(mem.bus_addr().pfn());
        Ok(AdminQueue { mem, mask, prod: 0 })
    }

    /// Detach the queue from the device.  The ring memory is freed on drop.
    pub fn release(self, regs: &GveRegisters) {
        regs.write_adminq_pfn(0);
    }

    /// Commands submitted so far.
    #[inline]
    pub fn produced(&self) -> u32 {
        self.prod
    }

    fn kick_and_wait(&self, regs: &GveRegisters) -> Result<(), GveError> {
        regs.write_adminq_doorbell(self.prod);

        for _ in 0..MAX_EVENT_COUNTER_CHECKS {
            if regs.adminq_event_counter() == self.prod {
                return Ok(());
            }
            platform::sleep_ms(EVENT_COUNTER_POLL_MS);
        }
        Err(GveError::Timeout)
    }

    /// Submit one command and wait for the device to execute it.
    ///
    /// On success the slot (now carrying the device's status) is copied
    /// back into `cmd` and the status translated.  A timeout means the
    /// queue is wedged and returns `NotRecoverable`.
    pub fn execute(
        &mut self,
        regs: &GveRegisters,
        cmd: &mut AdminqCommand,
    ) -> Result<(), GveError> {
        let idx = (self.prod & self.mask) as usize * COMMAND_SIZE;
        self.prod = self.prod.wrapping_add(1);
        self.mem.write_at::<AdminqCommand>(idx, *cmd);

        match self.kick_and_wait(regs) {
            Ok(()) => {}
            Err(GveError::Timeout) => {
                klog_error!("gve: admin command timed out, admin queue needs reset");
                return Err(GveError::NotRecoverable);
            }
            Err(e) => return Err(e),
        }

        *cmd = self.mem.read_at::<AdminqCommand>(idx);
        parse_status(cmd.status())
    }

    // -- Typed commands -------------------------------------------------------

    /// DESCRIBE_DEVICE: fetch the device's capabilities.
    pub fn describe_device(&mut self, regs: &GveRegisters) -> Result<DeviceDescriptor, GveError> {
        let buffer = DmaRegion::page().ok_or(GveError::OutOfMemory)?;

        let mut cmd = AdminqCommand::new(OPCODE_DESCRIBE_DEVICE);
        put_be64(&mut cmd.payload, 0, buffer.bus_addr().as_u64());
        put_be32(&mut cmd.payload, 8, DEVICE_DESCRIPTOR_VERSION);
        put_be32(&mut cmd.payload, 12, PAGE_SIZE as u32);
        self.execute(regs, &mut cmd)?;

        let mut bytes = [0u8; 40];
        buffer.read_bytes_at(0, &mut bytes);
        let mut desc = parse_device_descriptor(&bytes);

        // Ring sanity: each ring must span at least one page, or the
        // device descriptor is nonsense.
        let tx_ring_bytes = desc.tx_queue_entries as usize * core::mem::size_of::<TxPktDesc>();
        if tx_ring_bytes < PAGE_SIZE {
            klog_error!("gve: tx ring entries {} too low", desc.tx_queue_entries);
            return Err(GveError::Invalid);
        }
        let rx_desc_bytes = desc.rx_queue_entries as usize * core::mem::size_of::<RxDesc>();
        let rx_data_bytes = desc.rx_queue_entries as usize * core::mem::size_of::<RxDataSlot>();
        if rx_desc_bytes < PAGE_SIZE || rx_data_bytes < PAGE_SIZE {
            klog_error!("gve: rx ring entries {} too low", desc.rx_queue_entries);
            return Err(GveError::Invalid);
        }
        if desc.mtu < super::MIN_MTU {
            klog_error!("gve: device mtu {} below minimum", desc.mtu);
            return Err(GveError::Invalid);
        }

        if desc.tx_pages_per_qpl as u32 > TX_QPL_MAX_PAGES {
            klog_info!(
                "gve: capping tx pages per qpl {} to {}",
                desc.tx_pages_per_qpl,
                TX_QPL_MAX_PAGES
            );
            desc.tx_pages_per_qpl = TX_QPL_MAX_PAGES as u16;
        }
        if desc.rx_pages_per_qpl as u32 > RX_QPL_MAX_PAGES {
            klog_info!(
                "gve: capping rx pages per qpl {} to {}",
                desc.rx_pages_per_qpl,
                RX_QPL_MAX_PAGES
            );
            desc.rx_pages_per_qpl = RX_QPL_MAX_PAGES as u16;
        }

        Ok(desc)
    }

    /// CONFIGURE_DEVICE_RESOURCES: tell the device where the counter array
    /// and the notification-block array live.
    #[allow(clippy::too_many_arguments)]
    pub fn configure_device_resources(
        &mut self,
        regs: &GveRegisters,
        counter_array: BusAddr,
        num_counters: u32,
        irq_db_addr: BusAddr,
        num_irq_dbs: u32,
        irq_db_stride: u32,
        ntfy_blk_msix_base_idx: u32,
    ) -> Result<(), GveError> {
        let mut cmd = AdminqCommand::new(OPCODE_CONFIGURE_DEVICE_RESOURCES);
        put_be64(&mut cmd.payload, 0, counter_array.as_u64());
        put_be64(&mut cmd.payload, 8, irq_db_addr.as_u64());
        put_be32(&mut cmd.payload, 16, num_counters);
        put_be32(&mut cmd.payload, 20, num_irq_dbs);
        put_be32(&mut cmd.payload, 24, irq_db_stride);
        put_be32(&mut cmd.payload, 28, ntfy_blk_msix_base_idx);
        self.execute(regs, &mut cmd)
    }

    /// DECONFIGURE_DEVICE_RESOURCES: the device must stop touching them.
    pub fn deconfigure_device_resources(&mut self, regs: &GveRegisters) -> Result<(), GveError> {
        let mut cmd = AdminqCommand::new(OPCODE_DECONFIGURE_DEVICE_RESOURCES);
        self.execute(regs, &mut cmd)
    }

    /// REGISTER_PAGE_LIST: grant the device DMA access to a QPL's pages.
    pub fn register_page_list(
        &mut self,
        regs: &GveRegisters,
        qpl: &QueuePageList,
    ) -> Result<(), GveError> {
        let num_entries = qpl.num_entries();
        let list_bytes = num_entries as usize * core::mem::size_of::<u64>();
        let list = DmaRegion::zeroed(list_bytes).ok_or(GveError::OutOfMemory)?;

        let addrs: Vec<u64> = (0..num_entries)
            .map(|i| qpl.page_bus(i).as_u64().to_be())
            .collect();
        for (i, addr) in addrs.iter().enumerate() {
            list.write_at::<u64>(i * 8, *addr);
        }

        let mut cmd = AdminqCommand::new(OPCODE_REGISTER_PAGE_LIST);
        put_be32(&mut cmd.payload, 0, qpl.id());
        put_be32(&mut cmd.payload, 4, num_entries);
        put_be64(&mut cmd.payload, 8, list.bus_addr().as_u64());
        self.execute(regs, &mut cmd)
    }

    /// UNREGISTER_PAGE_LIST: revoke DMA access to a QPL.
    pub fn unregister_page_list(
        &mut self,
        regs: &GveRegisters,
        page_list_id: u32,
    ) -> Result<(), GveError> {
        let mut cmd = AdminqCommand::new(OPCODE_UNREGISTER_PAGE_LIST);
        put_be32(&mut cmd.payload, 0, page_list_id);
        self.execute(regs, &mut cmd)
    }

    pub fn create_tx_queue(
        &mut self,
        regs: &GveRegisters,
        params: &CreateTxQueue,
    ) -> Result<(), GveError> {
        let mut cmd = AdminqCommand::new(OPCODE_CREATE_TX_QUEUE);
        put_be32(&mut cmd.payload, 0, params.queue_id);
        put_be64(&mut cmd.payload, 8, params.queue_resources_addr.as_u64());
        put_be64(&mut cmd.payload, 16, params.tx_ring_addr.as_u64());
        put_be32(&mut cmd.payload, 24, params.queue_page_list_id);
        put_be32(&mut cmd.payload, 28, params.ntfy_id);
        self.execute(regs, &mut cmd)
    }

    pub fn create_rx_queue(
        &mut self,
        regs: &GveRegisters,
        params: &CreateRxQueue,
    ) -> Result<(), GveError> {
        let mut cmd = AdminqCommand::new(OPCODE_CREATE_RX_QUEUE);
        put_be32(&mut cmd.payload, 0, params.queue_id);
        put_be32(&mut cmd.payload, 4, params.queue_id);
        put_be32(&mut cmd.payload, 12, params.ntfy_id);
        put_be64(&mut cmd.payload, 16, params.queue_resources_addr.as_u64());
        put_be64(&mut cmd.payload, 24, params.rx_desc_ring_addr.as_u64());
        put_be64(&mut cmd.payload, 32, params.rx_data_ring_addr.as_u64());
        put_be32(&mut cmd.payload, 40, params.queue_page_list_id);
        self.execute(regs, &mut cmd)
    }

    pub fn destroy_tx_queue(&mut self, regs: &GveRegisters, queue_id: u32) -> Result<(), GveError> {
        let mut cmd = AdminqCommand::new(OPCODE_DESTROY_TX_QUEUE);
        put_be32(&mut cmd.payload, 0, queue_id);
        self.execute(regs, &mut cmd)
    }

    pub fn destroy_rx_queue(&mut self, regs: &GveRegisters, queue_id: u32) -> Result<(), GveError> {
        let mut cmd = AdminqCommand::new(OPCODE_DESTROY_RX_QUEUE);
        put_be32(&mut cmd.payload, 0, queue_id);
        self.execute(regs, &mut cmd)
    }
}

/// Map a device status code onto the driver's error classification.
pub fn parse_status(status: u32) -> Result<(), GveError> {
    if status != STATUS_PASSED && status != STATUS_UNSET {
        klog_error!("gve: admin command failed with status {:#x}", status);
    }

    match status {
        STATUS_PASSED => Ok(()),
        STATUS_UNSET => {
            // The device advanced the event counter without writing a
            // status; protocol violation.
            klog_error!("gve: admin status unset after completion");
            Err(GveError::Invalid)
        }
        STATUS_ABORTED
        | STATUS_CANCELLED
        | STATUS_DATALOSS
        | STATUS_FAILED_PRECONDITION
        | STATUS_UNAVAILABLE => Err(GveError::Transient),
        STATUS_ALREADY_EXISTS
        | STATUS_INTERNAL
        | STATUS_INVALID_ARGUMENT
        | STATUS_NOT_FOUND
        | STATUS_OUT_OF_RANGE
        | STATUS_UNKNOWN => Err(GveError::Invalid),
        STATUS_DEADLINE_EXCEEDED => Err(GveError::Timeout),
        STATUS_PERMISSION_DENIED | STATUS_UNAUTHENTICATED => Err(GveError::AccessDenied),
        STATUS_RESOURCE_EXHAUSTED => Err(GveError::OutOfMemory),
        STATUS_UNIMPLEMENTED => Err(GveError::Unsupported),
        _ => {
            klog_error!("gve: unknown admin status code {:#x}", status);
            Err(GveError::Invalid)
        }
    }
}

/// Encode a device descriptor into its 40-byte wire form.  The software
/// device model uses this; the driver itself only parses.
pub fn encode_device_descriptor(desc: &DeviceDescriptor, out: &mut [u8]) {
    put_be64(out, 0, desc.max_registered_pages);
    put_be16(out, 10, desc.tx_queue_entries);
    put_be16(out, 12, desc.rx_queue_entries);
    put_be16(out, 14, desc.default_num_queues);
    put_be16(out, 16, desc.mtu);
    put_be16(out, 18, desc.counters);
    put_be16(out, 20, desc.tx_pages_per_qpl);
    put_be16(out, 22, desc.rx_pages_per_qpl);
    out[24..30].copy_from_slice(desc.mac.as_bytes());
}
