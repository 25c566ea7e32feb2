//! Software gVNIC device model and test environment plumbing.
//!
//! [`FakeDevice`] owns the "hardware": a register window, a doorbell array,
//! and the device-side behavior — an admin-queue executor, TX completion
//! counters, and RX descriptor injection.  It operates on the very DMA
//! memory the driver allocated, resolved through the bus addresses the
//! driver handed over.
//!
//! The test platform table implements a real (if simple) DMA mapping:
//! every `bus_addr_of` call hands out a fresh window in a compact synthetic
//! bus space and records the translation, keeping page frame numbers
//! within the 32 bits the admin PFN register can carry regardless of where
//! the host allocator put the memory.  The device model translates back
//! through the same table.
//!
//! The admin executor runs from the platform `sleep_ms` hook, which the
//! driver calls between event-counter polls; a stalled device simply stops
//! executing and the driver observes a timeout.
//!
//! Because the platform/service hook tables are process-wide, tests that
//! use the model serialize through [`setup`], which returns a [`TestEnv`]
//! guard holding a global lock and cleaning up every probed device on drop.

use alloc::vec::Vec;

use gvnic_lib::IrqMutex;
use gvnic_lib::kernel_services::platform::{PlatformServices, register_platform_services};
use gvnic_mm::dma::DmaRegion;
use gvnic_mm::mmio::MmioRegion;

use crate::gve::adminq::{
    self, AdminqCommand, DeviceDescriptor, OPCODE_CONFIGURE_DEVICE_RESOURCES,
    OPCODE_CREATE_RX_QUEUE, OPCODE_CREATE_TX_QUEUE, OPCODE_DECONFIGURE_DEVICE_RESOURCES,
    OPCODE_DESCRIBE_DEVICE, OPCODE_DESTROY_RX_QUEUE, OPCODE_DESTROY_TX_QUEUE,
    OPCODE_REGISTER_PAGE_LIST, OPCODE_UNREGISTER_PAGE_LIST, STATUS_PASSED,
};
use crate::gve::desc::next_seqno;
use crate::gve::driver::{gve_probe, gve_remove};
use crate::gve::regs::{
    DEVICE_STATUS_RESET_REQUESTED, REG_ADMINQ_DOORBELL, REG_ADMINQ_EVENT_COUNTER, REG_ADMINQ_PFN,
    REG_DEVICE_STATUS, REG_MAX_RX_QUEUES, REG_MAX_TX_QUEUES,
};
use crate::net::ingress;
use crate::net::packetbuf::PacketBuf;
use crate::net::types::{DevIndex, MacAddr};
use crate::pci::{PCI_NUM_BARS, PciDeviceInfo};

const PAGE_SIZE: usize = 4096;
const REG_MEM_SIZE: usize = 64;
const DB_MEM_SIZE: usize = 4096;

// =============================================================================
// Synthetic bus address space
// =============================================================================

/// Size of one bus window.  Must exceed the largest single DMA region the
/// driver allocates (a maximal TX page list is 2 MiB).
const BUS_WINDOW: u64 = 4 << 20;

static BUS_REGIONS: IrqMutex<Vec<(u64, usize)>> = IrqMutex::new(Vec::new());
static NEXT_BUS: core::sync::atomic::AtomicU64 = core::sync::atomic::AtomicU64::new(BUS_WINDOW);

/// Map a freshly allocated host region into the synthetic bus space.
fn bus_map(ptr: *const u8) -> u64 {
    let bus = NEXT_BUS.fetch_add(BUS_WINDOW, core::sync::atomic::Ordering::Relaxed);
    BUS_REGIONS.lock().push((bus, ptr as usize));
    bus
}

/// Resolve a synthetic bus address back to its host pointer.
fn bus_to_host(addr: u64) -> *mut u8 {
    let regions = BUS_REGIONS.lock();
    for (bus, host) in regions.iter() {
        if addr >= *bus && addr < *bus + BUS_WINDOW {
            return (*host + (addr - *bus) as usize) as *mut u8;
        }
    }
    panic!("bus address {addr:#x} was never mapped");
}

// =============================================================================
// Device specification
// =============================================================================

/// Capabilities the fake device advertises.
#[derive(Clone, Copy)]
pub struct FakeDeviceSpec {
    pub descriptor: DeviceDescriptor,
    pub msix_vectors: u32,
    pub max_tx_queues: u32,
    pub max_rx_queues: u32,
}

impl Default for FakeDeviceSpec {
    fn default() -> Self {
        Self {
            descriptor: DeviceDescriptor {
                max_registered_pages: 4096,
                tx_queue_entries: 256,
                rx_queue_entries: 512,
                default_num_queues: 1,
                mtu: 1460,
                counters: 64,
                tx_pages_per_qpl: 128,
                rx_pages_per_qpl: 128,
                mac: MacAddr::from_bytes([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]),
            },
            msix_vectors: 4,
            max_tx_queues: 16,
            max_rx_queues: 16,
        }
    }
}

impl FakeDeviceSpec {
    /// A spec with few RX slots, so slot-reuse paths wrap quickly.
    pub fn small_rx() -> Self {
        let mut spec = Self::default();
        spec.descriptor.rx_pages_per_qpl = 64;
        spec
    }

    /// A spec with a single-page TX FIFO, so FIFO exhaustion is reachable
    /// with a couple of packets.
    pub fn tiny_tx_fifo() -> Self {
        let mut spec = Self::default();
        spec.descriptor.tx_pages_per_qpl = 1;
        spec
    }
}

// =============================================================================
// Device-side queue records
// =============================================================================

struct FakeTxQueue {
    id: u32,
    db_index: u32,
    counter_index: u32,
}

struct FakeRxQueue {
    id: u32,
    desc_ring: u64,
    data_ring: u64,
    qpl_id: u32,
    db_index: u32,
    /// Sequence stamp for the next descriptor this device writes.
    seq: u8,
    /// Device-side fill position (wraps at the slot count).
    fill_pos: u32,
    slots: u32,
}

// =============================================================================
// FakeDevice
// =============================================================================

pub struct FakeDevice {
    spec: FakeDeviceSpec,
    /// Register window backing; page-aligned so the driver's volatile
    /// 32/64-bit accesses are well-formed.
    reg_mem: DmaRegion,
    db_mem: DmaRegion,
    /// Admin commands executed so far.
    aq_events: u32,
    /// When set, the admin executor stops responding.
    pub stall_adminq: bool,
    /// Fail the next command with this opcode using the given status.
    pub fail_opcode: Option<(u32, u32)>,
    counter_array: u64,
    /// Admin-queue page the executor is currently attached to; a PFN
    /// change (including detach) resets the executor's progress, the way a
    /// real device restarts its admin state machine.
    last_pfn: u64,
    registered_qpls: Vec<(u32, Vec<u64>)>,
    tx_queues: Vec<FakeTxQueue>,
    rx_queues: Vec<FakeRxQueue>,
    /// IRQ doorbell index written into each notification-block record.
    pub irq_db_indices: Vec<u32>,
    next_db_index: u32,
}

impl FakeDevice {
    pub fn new(spec: FakeDeviceSpec) -> Self {
        let mut dev = Self {
            spec,
            reg_mem: DmaRegion::zeroed(REG_MEM_SIZE).expect("register window"),
            db_mem: DmaRegion::zeroed(DB_MEM_SIZE).expect("doorbell window"),
            aq_events: 0,
            stall_adminq: false,
            fail_opcode: None,
            counter_array: 0,
            last_pfn: 0,
            registered_qpls: Vec::new(),
            tx_queues: Vec::new(),
            rx_queues: Vec::new(),
            irq_db_indices: Vec::new(),
            next_db_index: 0,
        };
        dev.reg_write_be32(REG_MAX_TX_QUEUES, spec.max_tx_queues);
        dev.reg_write_be32(REG_MAX_RX_QUEUES, spec.max_rx_queues);
        dev
    }

    /// The PCI identity the bus layer would hand the driver.
    pub fn pci_info(&mut self) -> PciDeviceInfo {
        let mut bars = [MmioRegion::empty(); PCI_NUM_BARS];
        // SAFETY: the fake device outlives every probed driver instance in
        // a test (TestEnv tears drivers down before dropping the device).
        bars[0] =
            unsafe { MmioRegion::from_raw(self.reg_mem.as_mut_ptr::<u8>(), REG_MEM_SIZE) };
        bars[2] = unsafe { MmioRegion::from_raw(self.db_mem.as_mut_ptr::<u8>(), DB_MEM_SIZE) };
        PciDeviceInfo {
            vendor_id: 0x1AE0,
            device_id: 0x0042,
            bus: 0,
            device: 4,
            function: 0,
            bars,
            msix_vectors: self.spec.msix_vectors,
        }
    }

    // -- Register window, device side -----------------------------------------

    fn reg_read_be32(&self, offset: usize) -> u32 {
        u32::from_be(self.reg_mem.read_at::<u32>(offset))
    }

    fn reg_write_be32(&mut self, offset: usize, value: u32) {
        self.reg_mem.write_at::<u32>(offset, value.to_be());
    }

    /// Current value of doorbell cell `index`, host order.
    pub fn doorbell(&self, index: u32) -> u32 {
        u32::from_be(self.db_mem.read_at::<u32>(index as usize * 4))
    }

    /// Flag a device-requested reset in the status register.
    pub fn request_reset(&mut self) {
        let status = self.reg_read_be32(REG_DEVICE_STATUS);
        self.reg_write_be32(REG_DEVICE_STATUS, status | DEVICE_STATUS_RESET_REQUESTED);
    }

    pub fn clear_reset_request(&mut self) {
        let status = self.reg_read_be32(REG_DEVICE_STATUS);
        self.reg_write_be32(REG_DEVICE_STATUS, status & !DEVICE_STATUS_RESET_REQUESTED);
    }

    // -- Admin executor --------------------------------------------------------

    /// Execute pending admin commands and publish the event counter.  The
    /// platform sleep hook calls this between driver polls.
    pub fn step(&mut self) {
        if self.stall_adminq {
            return;
        }
        let pfn = self.reg_read_be32(REG_ADMINQ_PFN) as u64;
        if pfn != self.last_pfn {
            // A new (or detached) admin queue starts from zero.
            self.last_pfn = pfn;
            self.aq_events = 0;
            self.reg_write_be32(REG_ADMINQ_EVENT_COUNTER, 0);
        }
        if pfn == 0 {
            return;
        }
        let ring = bus_to_host(pfn * PAGE_SIZE as u64);
        let prod = self.reg_read_be32(REG_ADMINQ_DOORBELL);

        while self.aq_events != prod {
            let slot = (self.aq_events & 63) as usize;
            // SAFETY: the ring page is the driver's live admin DmaRegion;
            // identity bus mapping makes `ring` its host address.
            unsafe {
                let cmd_ptr = ring.add(slot * 64) as *mut AdminqCommand;
                let mut cmd = core::ptr::read_volatile(cmd_ptr);
                let status = self.execute(&cmd);
                cmd.status_be = status.to_be();
                core::ptr::write_volatile(cmd_ptr, cmd);
            }
            self.aq_events = self.aq_events.wrapping_add(1);
        }
        let events = self.aq_events;
        self.reg_write_be32(REG_ADMINQ_EVENT_COUNTER, events);
    }

    fn execute(&mut self, cmd: &AdminqCommand) -> u32 {
        let opcode = u32::from_be(cmd.opcode_be);
        if let Some((fail_op, status)) = self.fail_opcode {
            if fail_op == opcode {
                self.fail_opcode = None;
                return status;
            }
        }
        let p = &cmd.payload;

        match opcode {
            OPCODE_DESCRIBE_DEVICE => {
                let addr = get_be64(p, 0);
                let mut bytes = [0u8; 40];
                adminq::encode_device_descriptor(&self.spec.descriptor, &mut bytes);
                // SAFETY: the descriptor buffer is the driver's live side
                // page, resolved through the bus map.
                unsafe {
                    core::ptr::copy_nonoverlapping(bytes.as_ptr(), bus_to_host(addr), 40);
                }
            }
            OPCODE_CONFIGURE_DEVICE_RESOURCES => {
                self.counter_array = get_be64(p, 0);
                let irq_db_addr = get_be64(p, 8);
                let num_irq_dbs = get_be32(p, 20);
                let stride = get_be32(p, 24) as usize;
                self.irq_db_indices.clear();
                for i in 0..num_irq_dbs {
                    let db_index = self.alloc_db_index();
                    self.irq_db_indices.push(db_index);
                    // SAFETY: the block-record array is the driver's live
                    // DMA region, resolved through the bus map.
                    unsafe {
                        let slot =
                            bus_to_host(irq_db_addr).add(i as usize * stride) as *mut u32;
                        core::ptr::write_volatile(slot, db_index.to_be());
                    }
                }
            }
            OPCODE_DECONFIGURE_DEVICE_RESOURCES => {
                self.counter_array = 0;
                self.irq_db_indices.clear();
            }
            OPCODE_REGISTER_PAGE_LIST => {
                let id = get_be32(p, 0);
                let num = get_be32(p, 4) as usize;
                let list = get_be64(p, 8);
                let mut buses = Vec::with_capacity(num);
                for i in 0..num {
                    // SAFETY: the address list is the driver's live side
                    // buffer, resolved through the bus map.
                    let raw = unsafe {
                        core::ptr::read_volatile(bus_to_host(list).add(i * 8) as *const u64)
                    };
                    buses.push(u64::from_be(raw));
                }
                self.registered_qpls.retain(|(qid, _)| *qid != id);
                self.registered_qpls.push((id, buses));
            }
            OPCODE_UNREGISTER_PAGE_LIST => {
                let id = get_be32(p, 0);
                self.registered_qpls.retain(|(qid, _)| *qid != id);
            }
            OPCODE_CREATE_TX_QUEUE => {
                let id = get_be32(p, 0);
                let q_res = get_be64(p, 8);
                // Re-creating an existing queue id replaces its record.
                self.tx_queues.retain(|q| q.id != id);
                let db_index = self.alloc_db_index();
                let counter_index = self.tx_queues.len() as u32;
                write_q_resources(q_res, db_index, counter_index);
                self.tx_queues.push(FakeTxQueue {
                    id,
                    db_index,
                    counter_index,
                });
            }
            OPCODE_CREATE_RX_QUEUE => {
                let id = get_be32(p, 0);
                self.rx_queues.retain(|q| q.id != id);
                let q_res = get_be64(p, 16);
                let desc_ring = get_be64(p, 24);
                let data_ring = get_be64(p, 32);
                let qpl_id = get_be32(p, 40);
                let slots = self
                    .registered_qpls
                    .iter()
                    .find(|(qid, _)| *qid == qpl_id)
                    .map(|(_, buses)| buses.len() as u32)
                    .unwrap_or(self.spec.descriptor.rx_pages_per_qpl as u32);
                let db_index = self.alloc_db_index();
                write_q_resources(q_res, db_index, 0);
                self.rx_queues.push(FakeRxQueue {
                    id,
                    desc_ring,
                    data_ring,
                    qpl_id,
                    db_index,
                    seq: 1,
                    fill_pos: 0,
                    slots,
                });
            }
            OPCODE_DESTROY_TX_QUEUE => {
                let id = get_be32(p, 0);
                self.tx_queues.retain(|q| q.id != id);
            }
            OPCODE_DESTROY_RX_QUEUE => {
                let id = get_be32(p, 0);
                self.rx_queues.retain(|q| q.id != id);
            }
            _ => return adminq::STATUS_UNIMPLEMENTED,
        }
        STATUS_PASSED
    }

    fn alloc_db_index(&mut self) -> u32 {
        let idx = self.next_db_index;
        self.next_db_index += 1;
        idx
    }

    /// Function-level reset: forget all driver-visible state.
    pub fn bus_level_reset(&mut self) {
        self.aq_events = 0;
        self.last_pfn = 0;
        self.counter_array = 0;
        self.registered_qpls.clear();
        self.tx_queues.clear();
        self.rx_queues.clear();
        self.irq_db_indices.clear();
        self.reg_write_be32(REG_ADMINQ_EVENT_COUNTER, 0);
        self.clear_reset_request();
    }

    /// Number of TX queues the device currently has created.
    pub fn tx_queue_count(&self) -> usize {
        self.tx_queues.len()
    }

    /// Number of RX queues the device currently has created.
    pub fn rx_queue_count(&self) -> usize {
        self.rx_queues.len()
    }

    // -- TX completion ---------------------------------------------------------

    /// Doorbell value (producer index) the driver last wrote for TX queue
    /// `q`.
    pub fn tx_doorbell(&self, q: usize) -> u32 {
        self.doorbell(self.tx_queues[q].db_index)
    }

    /// RX doorbell (fill count) the driver last wrote for RX queue `q`.
    pub fn rx_doorbell(&self, q: usize) -> u32 {
        self.doorbell(self.rx_queues[q].db_index)
    }

    /// Complete every descriptor the driver has published on TX queue `q`.
    pub fn complete_tx(&mut self, q: usize) {
        let req = self.tx_doorbell(q);
        self.complete_tx_upto(q, req);
    }

    /// Publish `done` as the event counter for TX queue `q`.
    pub fn complete_tx_upto(&mut self, q: usize, done: u32) {
        let queue = &self.tx_queues[q];
        debug_assert!(self.counter_array != 0);
        // SAFETY: the counter array is the driver's live DMA region,
        // resolved through the bus map.
        unsafe {
            let cell = bus_to_host(self.counter_array)
                .add(queue.counter_index as usize * 4) as *mut u32;
            core::ptr::write_volatile(cell, done.to_be());
        }
    }

    /// Device-assigned queue resources of TX queue `q` (diagnostic).
    pub fn tx_queue_db_index(&self, q: usize) -> u32 {
        self.tx_queues[q].db_index
    }

    // -- RX injection ----------------------------------------------------------

    /// Deliver `frame` into RX queue `q` with protocol `flags`, advancing
    /// the device-side fill position and sequence number.
    pub fn rx_inject(&mut self, q: usize, frame: &[u8], flags: u16, csum: u16, rss_hash: u32) {
        let seq = self.rx_queues[q].seq;
        self.rx_write_descriptor(q, frame, flags, csum, rss_hash, seq);
        let queue = &mut self.rx_queues[q];
        queue.seq = next_seqno(queue.seq);
        queue.fill_pos = queue.fill_pos.wrapping_add(1);
    }

    /// Write a descriptor with an explicit (possibly stale) sequence
    /// number, advancing only the fill position.
    pub fn rx_inject_with_seq(&mut self, q: usize, frame: &[u8], flags: u16, seq: u8) {
        self.rx_write_descriptor(q, frame, flags, 0, 0, seq);
        let queue = &mut self.rx_queues[q];
        queue.fill_pos = queue.fill_pos.wrapping_add(1);
    }

    fn rx_write_descriptor(
        &mut self,
        q: usize,
        frame: &[u8],
        flags: u16,
        csum: u16,
        rss_hash: u32,
        seq: u8,
    ) {
        let queue = &self.rx_queues[q];
        let idx = queue.fill_pos & (queue.slots - 1);

        // Find where this slot points in the page list.
        // SAFETY: the data ring is the driver's live DMA region.
        let qpl_offset = unsafe {
            u64::from_be(core::ptr::read_volatile(
                bus_to_host(queue.data_ring).add(idx as usize * 8) as *const u64,
            ))
        } as usize;
        let page_idx = qpl_offset / PAGE_SIZE;
        let within = qpl_offset % PAGE_SIZE;
        let buses = &self
            .registered_qpls
            .iter()
            .find(|(qid, _)| *qid == queue.qpl_id)
            .expect("rx inject into unregistered qpl")
            .1;
        let page = bus_to_host(buses[page_idx]);

        // SAFETY: the page belongs to the driver's registered RX list and
        // the slot's half-page is device-owned until the descriptor lands.
        unsafe {
            // Two bytes of alignment pad, then the frame.
            core::ptr::write_bytes(page.add(within), 0, 2);
            core::ptr::copy_nonoverlapping(frame.as_ptr(), page.add(within + 2), frame.len());
        }

        let desc = bus_to_host(queue.desc_ring).wrapping_add(idx as usize * 64);
        // SAFETY: the descriptor ring is the driver's live DMA region; the
        // flags_seq word is written last, matching device ordering.
        unsafe {
            core::ptr::write_bytes(desc, 0, 64);
            core::ptr::write_volatile(desc.add(48) as *mut u32, rss_hash.to_be());
            core::ptr::write_volatile(desc.add(58) as *mut u16, csum.to_be());
            core::ptr::write_volatile(
                desc.add(60) as *mut u16,
                ((frame.len() + 2) as u16).to_be(),
            );
            core::sync::atomic::fence(core::sync::atomic::Ordering::Release);
            core::ptr::write_volatile(desc.add(62) as *mut u16, (flags | seq as u16).to_be());
        }
    }
}

fn get_be32(buf: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_be_bytes(bytes)
}

fn get_be64(buf: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_be_bytes(bytes)
}

fn write_q_resources(q_res: u64, db_index: u32, counter_index: u32) {
    // SAFETY: queue resources are the driver's live DMA region, resolved
    // through the bus map.
    unsafe {
        let base = bus_to_host(q_res);
        core::ptr::write_volatile(base as *mut u32, db_index.to_be());
        core::ptr::write_volatile(base.add(4) as *mut u32, counter_index.to_be());
    }
}

// =============================================================================
// Global test environment
// =============================================================================

static SERIAL: IrqMutex<()> = IrqMutex::new(());
static FIXTURE: IrqMutex<Option<FakeDevice>> = IrqMutex::new(None);
static RX_COLLECTED: IrqMutex<Vec<PacketBuf>> = IrqMutex::new(Vec::new());

fn fx_irq_save() -> u64 {
    0
}

fn fx_irq_restore(_flags: u64) {}

fn fx_cpu_relax() {
    core::hint::spin_loop();
}

/// The driver sleeps while polling the admin event counter; each "sleep"
/// gives the fake device a turn.
fn fx_sleep_ms(_ms: u32) {
    if let Some(dev) = FIXTURE.lock().as_mut() {
        dev.step();
    }
}

fn fx_uptime_ms() -> u64 {
    0
}

fn fx_bus_addr_of(ptr: *const u8) -> u64 {
    bus_map(ptr)
}

fn fx_bus_reset(_bdf: u32) -> i32 {
    if let Some(dev) = FIXTURE.lock().as_mut() {
        dev.bus_level_reset();
    }
    0
}

static TEST_PLATFORM: PlatformServices = PlatformServices {
    irq_save: fx_irq_save,
    irq_restore: fx_irq_restore,
    cpu_relax: fx_cpu_relax,
    sleep_ms: fx_sleep_ms,
    uptime_ms: fx_uptime_ms,
    bus_addr_of: fx_bus_addr_of,
    bus_reset: fx_bus_reset,
};

/// Sink that stashes every received packet for inspection.
fn collect_rx(_dev: DevIndex, pkt: PacketBuf) {
    RX_COLLECTED.lock().push(pkt);
}

/// Run `f` against the installed fake device, if any.  Usable from hook
/// functions that cannot hold a `TestEnv` reference.
pub fn with_fake_device<R>(f: impl FnOnce(&mut FakeDevice) -> R) -> Option<R> {
    let mut fixture = FIXTURE.lock();
    fixture.as_mut().map(f)
}

/// Serialized test environment around one [`FakeDevice`].
///
/// Dropping it removes every device probed through it, drops the fake
/// device, and clears the global hooks.
pub struct TestEnv {
    probes: Vec<usize>,
    /// Held for the whole test; released after the `Drop` body runs.
    _serial: gvnic_lib::IrqMutexGuard<'static, ()>,
}

/// Install the test platform table and a fresh fake device, serializing
/// against every other model-driven test.
pub fn setup(spec: FakeDeviceSpec) -> TestEnv {
    let serial = SERIAL.lock();

    register_platform_services(&TEST_PLATFORM);
    ingress::register_rx_sink(collect_rx);
    RX_COLLECTED.lock().clear();
    crate::gve::driver::test_hooks::clear_post_ack();

    *FIXTURE.lock() = Some(FakeDevice::new(spec));
    TestEnv {
        probes: Vec::new(),
        _serial: serial,
    }
}

impl TestEnv {
    /// Probe the fake device, tracking the result for teardown.
    pub fn probe(&mut self) -> Result<usize, crate::gve::GveError> {
        let info = self.device(|dev| dev.pci_info());
        let id = gve_probe(&info)?;
        self.probes.push(id);
        Ok(id)
    }

    /// Run `f` against the fake device.  Must not be called re-entrantly
    /// from driver code paths (the admin executor runs from the sleep
    /// hook, which takes the same lock).
    pub fn device<R>(&self, f: impl FnOnce(&mut FakeDevice) -> R) -> R {
        with_fake_device(f).expect("no fake device installed")
    }

    /// Packets the collector sink has received so far.
    pub fn take_rx_packets(&self) -> Vec<PacketBuf> {
        core::mem::take(&mut *RX_COLLECTED.lock())
    }
}

impl Drop for TestEnv {
    fn drop(&mut self) {
        for id in self.probes.drain(..) {
            gve_remove(id);
        }
        RX_COLLECTED.lock().clear();
        ingress::clear_rx_sink();
        crate::gve::driver::test_hooks::clear_post_ack();
        *FIXTURE.lock() = None;
        // `_serial` drops after this body, releasing the global lock.
    }
}
