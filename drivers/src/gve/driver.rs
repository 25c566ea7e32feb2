//! Device lifecycle: probe, open/close, the reset state machine, and the
//! netdev-facing surface.
//!
//! # States
//!
//! A probed device idles with its admin queue attached and device resources
//! (counter array, notification records) configured, but no rings.  `open`
//! builds page lists and rings, registers and creates them with the device,
//! enables NAPI, and raises the link.  `close` walks the same steps
//! backward.
//!
//! # Resets
//!
//! Three severities:
//!
//! * **user reset** — orderly: destroy queues, unregister page lists,
//!   deconfigure, then rebuild the admin channel and reopen.  Teardown
//!   failures fall back to an admin-queue reset; failures after the admin
//!   channel has been rebuilt escalate straight to a PCI reset.
//! * **admin-queue reset** — the admin channel stopped answering: drop and
//!   reattach the admin queue, reconfigure resources, re-create the
//!   still-allocated rings.  Failure escalates to a PCI reset.
//! * **PCI reset** — requested by the device (status bit) or reached by
//!   escalation: full teardown, function-level reset through the platform
//!   hook, and a from-scratch reinit.
//!
//! The service task is the only place resets run; it serializes against
//! open/close/adjust through the per-device lifecycle lock.  Any admin
//! failure on the open path schedules an admin-queue reset rather than
//! unwinding by hand.

use alloc::boxed::Box;
use alloc::format;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering, fence};

use bitflags::bitflags;
use gvnic_abi::net::UserChannels;
use gvnic_lib::kernel_services::{driver_runtime, platform};
use gvnic_lib::{IrqMutex, IrqRwLock, OnceLock, klog_debug, klog_error, klog_info, klog_warn};

use super::adminq::{AdminQueue, CreateRxQueue, CreateTxQueue, DeviceDescriptor};
use super::desc::{IRQ_ACK, IRQ_EVENT, IRQ_MASK};
use super::notify::{
    MIN_MSIX, NAPI_BUDGET, NTFY_BLOCK_STRIDE, NotifyBlock, NtfyBlockArray, rx_ntfy_idx,
    tx_ntfy_idx,
};
use super::qpl::{QplMap, QueuePageList};
use super::regs::{DOORBELL_BAR, DoorbellArray, GveRegisters, REGISTER_BAR};
use super::rx::RxRing;
use super::stats::{RxQueueStats, StatsReport, TxQueueStats};
use super::tx::{CounterArray, TxRing};
use super::{GveError, MIN_MTU};
use crate::net::netdev::{
    DEVICE_REGISTRY, NetDevice, NetDeviceFeatures, NetDeviceStats,
};
use crate::net::packetbuf::PacketBuf;
use crate::net::pool::PACKET_POOL;
use crate::net::types::{DevIndex, MacAddr, NetError};
use crate::pci::{PciDeviceInfo, PciDriver, pci_register_driver};

pub const PCI_VENDOR_ID_GOOGLE: u16 = 0x1AE0;
pub const PCI_DEV_ID_GVNIC: u16 = 0x0042;

/// Version string written byte-wise into the register window at probe.
pub const DRIVER_VERSION: &str = "0.1.0";

/// Packets at or below this many bytes are copied out of RX buffers rather
/// than handed up as page fragments.
pub const DEFAULT_RX_COPYBREAK: u32 = 256;

/// Driver-side ceilings on queue counts, applied over whatever the device's
/// max-queue registers advertise.
pub const MAX_NUM_TX_QUEUES: u32 = 1024;
pub const MAX_NUM_RX_QUEUES: u32 = 1024;

bitflags! {
    /// Work requested of the service task.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ServiceFlags: u32 {
        const DO_AQ_RESET       = 1 << 1;
        const DO_PCI_RESET      = 1 << 2;
        const RESET_IN_PROGRESS = 1 << 3;
        const PROBE_IN_PROGRESS = 1 << 4;
        /// The link was up when the reset was requested; restore it after.
        const DEVICE_WAS_UP     = 1 << 5;
    }
}

bitflags! {
    /// What the driver currently has set up with the device.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct StateFlags: u32 {
        const ADMIN_QUEUE_OK        = 1 << 1;
        const DEVICE_RESOURCES_OK   = 1 << 2;
        const DEVICE_RINGS_OK       = 1 << 3;
        const NAPI_ENABLED          = 1 << 4;
    }
}

/// Max and current queue count for one direction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueConfig {
    pub max_queues: u32,
    pub num_queues: u32,
}

/// Lifecycle-mutable configuration, guarded by `GvePriv::cfg`.
struct GveConfig {
    /// Parsed DESCRIBE_DEVICE response.
    desc: DeviceDescriptor,
    mtu: u16,
    tx_cfg: QueueConfig,
    rx_cfg: QueueConfig,
    num_ntfy_blks: u32,
    mgmt_msix_idx: u32,
    ntfy_blk_msix_base_idx: u32,
    rx_copybreak: u32,
    num_registered_pages: u64,
}

/// Device-shared resources, guarded by `GvePriv::res`.
///
/// The admin queue lives here too: holding the lock across a whole
/// submit-and-wait cycle is exactly the exclusivity the channel requires.
struct GveResources {
    adminq: Option<AdminQueue>,
    counters: Option<Arc<CounterArray>>,
    ntfy_shared: Option<Arc<NtfyBlockArray>>,
    qpls: Vec<QueuePageList>,
    qpl_map: QplMap,
}

/// Per-device driver state.
///
/// Lock order, outermost first: `lifecycle` → `cfg` → `res`.  The ring and
/// block arrays sit behind reader/writer locks so the datapath can clone an
/// `Arc` without touching the lifecycle side.
pub struct GvePriv {
    regs: GveRegisters,
    db: DoorbellArray,
    bdf: u32,
    num_msix: u32,
    lifecycle: IrqMutex<()>,
    cfg: IrqMutex<GveConfig>,
    res: IrqMutex<GveResources>,
    tx: IrqRwLock<Vec<Arc<TxRing>>>,
    rx: IrqRwLock<Vec<Arc<RxRing>>>,
    blocks: IrqRwLock<Vec<Arc<NotifyBlock>>>,
    service_flags: AtomicU32,
    state_flags: AtomicU32,
    link_up: AtomicBool,
    features: NetDeviceFeatures,
    /// Slot in the probed-device table; doubles as the service token.
    priv_id: OnceLock<usize>,
    /// Index in the net device registry.
    dev_index: OnceLock<DevIndex>,
}

// =============================================================================
// Probed-device table
// =============================================================================

static PROBED: IrqMutex<Vec<Option<Arc<GvePriv>>>> = IrqMutex::new(Vec::new());

/// Look up a probed device by the id `gve_probe` returned.
pub fn probed_device(id: usize) -> Option<Arc<GvePriv>> {
    PROBED.lock().get(id).and_then(|slot| slot.clone())
}

/// Token handed to `napi_kick`: probed-device id in the high bits, block id
/// in the low 16.
#[inline]
pub fn napi_token(priv_id: usize, block_id: u32) -> usize {
    (priv_id << 16) | block_id as usize
}

/// Split a napi token back into `(priv_id, block_id)`.
#[inline]
pub fn napi_token_parts(token: usize) -> (usize, u32) {
    (token >> 16, (token & 0xFFFF) as u32)
}

// =============================================================================
// Flag plumbing
// =============================================================================

impl GvePriv {
    #[inline]
    fn set_service(&self, f: ServiceFlags) {
        self.service_flags.fetch_or(f.bits(), Ordering::SeqCst);
    }

    #[inline]
    fn clear_service(&self, f: ServiceFlags) {
        self.service_flags.fetch_and(!f.bits(), Ordering::SeqCst);
    }

    #[inline]
    fn test_service(&self, f: ServiceFlags) -> bool {
        self.service_flags.load(Ordering::SeqCst) & f.bits() != 0
    }

    #[inline]
    fn set_state(&self, f: StateFlags) {
        self.state_flags.fetch_or(f.bits(), Ordering::SeqCst);
    }

    #[inline]
    fn clear_state(&self, f: StateFlags) {
        self.state_flags.fetch_and(!f.bits(), Ordering::SeqCst);
    }

    #[inline]
    fn test_state(&self, f: StateFlags) -> bool {
        self.state_flags.load(Ordering::SeqCst) & f.bits() != 0
    }

    /// Snapshot of the service-task flags (diagnostic).
    pub fn service_flags(&self) -> ServiceFlags {
        ServiceFlags::from_bits_truncate(self.service_flags.load(Ordering::SeqCst))
    }

    /// Snapshot of the device-state flags (diagnostic).
    pub fn state_flags(&self) -> StateFlags {
        StateFlags::from_bits_truncate(self.state_flags.load(Ordering::SeqCst))
    }

    #[inline]
    pub fn is_up(&self) -> bool {
        self.link_up.load(Ordering::Acquire)
    }

    #[inline]
    fn id(&self) -> usize {
        self.priv_id.get().copied().unwrap_or(0)
    }

    #[inline]
    fn dev(&self) -> DevIndex {
        self.dev_index.get().copied().unwrap_or(DevIndex(0))
    }

    /// Current queue configuration `(tx, rx)`.
    pub fn queue_config(&self) -> (QueueConfig, QueueConfig) {
        let cfg = self.cfg.lock();
        (cfg.tx_cfg, cfg.rx_cfg)
    }

    /// TX ring `q`, while the interface is up.
    pub fn tx_ring(&self, q: usize) -> Option<Arc<TxRing>> {
        self.tx.read().get(q).cloned()
    }

    /// RX ring `q`, while the interface is up.
    pub fn rx_ring(&self, q: usize) -> Option<Arc<RxRing>> {
        self.rx.read().get(q).cloned()
    }

    /// Notification block `id`, while device resources exist.
    pub fn notify_block(&self, id: u32) -> Option<Arc<NotifyBlock>> {
        self.block(id)
    }

    /// The device's doorbell window.
    pub fn doorbell_array(&self) -> &DoorbellArray {
        &self.db
    }

    /// Parsed device descriptor from the last DESCRIBE_DEVICE.
    pub fn device_descriptor(&self) -> DeviceDescriptor {
        self.cfg.lock().desc
    }

    pub fn num_ntfy_blks(&self) -> u32 {
        self.cfg.lock().num_ntfy_blks
    }

    /// MSI-X vector the embedder must bind to [`gve_mgmt_intr`].
    pub fn mgmt_msix_idx(&self) -> u32 {
        self.cfg.lock().mgmt_msix_idx
    }
}

// =============================================================================
// Admin plumbing
// =============================================================================

impl GvePriv {
    fn alloc_adminq(&self) -> Result<(), GveError> {
        let aq = AdminQueue::alloc(&self.regs)?;
        self.res.lock().adminq = Some(aq);
        self.set_state(StateFlags::ADMIN_QUEUE_OK);
        Ok(())
    }

    fn free_adminq(&self) {
        if let Some(aq) = self.res.lock().adminq.take() {
            aq.release(&self.regs);
        }
        self.clear_state(StateFlags::ADMIN_QUEUE_OK);
    }

    /// Run one admin operation under the resources lock.
    fn with_adminq<R>(
        &self,
        f: impl FnOnce(&mut AdminQueue, &GveRegisters) -> Result<R, GveError>,
    ) -> Result<R, GveError> {
        let mut res = self.res.lock();
        let aq = res.adminq.as_mut().ok_or(GveError::NotRecoverable)?;
        f(aq, &self.regs)
    }

    fn configure_device_resources_cmd(&self) -> Result<(), GveError> {
        let base_idx = self.cfg.lock().ntfy_blk_msix_base_idx;
        let res = &mut *self.res.lock();
        let aq = res.adminq.as_mut().ok_or(GveError::NotRecoverable)?;
        let counters = res.counters.as_ref().ok_or(GveError::NotRecoverable)?;
        let shared = res.ntfy_shared.as_ref().ok_or(GveError::NotRecoverable)?;
        aq.configure_device_resources(
            &self.regs,
            counters.bus_addr(),
            counters.count(),
            shared.bus_addr(),
            shared.num_blocks(),
            NTFY_BLOCK_STRIDE as u32,
            base_idx,
        )
    }
}

// =============================================================================
// Init / device resources
// =============================================================================

impl GvePriv {
    /// Bring the control plane up: admin queue, device description, device
    /// resources.  Leaves the device in the probed-but-down state.
    fn init_priv(&self) -> Result<(), GveError> {
        self.alloc_adminq()?;
        match self.init_priv_inner() {
            Ok(()) => Ok(()),
            Err(e) => {
                self.free_adminq();
                Err(e)
            }
        }
    }

    fn init_priv_inner(&self) -> Result<(), GveError> {
        let desc = self.with_adminq(|aq, regs| aq.describe_device(regs))?;

        let num_ntfy_blks = self.num_msix - 1;
        {
            let mut cfg = self.cfg.lock();
            cfg.desc = desc;
            cfg.mtu = desc.mtu;
            cfg.rx_copybreak = DEFAULT_RX_COPYBREAK;
            cfg.num_registered_pages = 0;
            // One block per data vector; the last vector is management.
            cfg.num_ntfy_blks = num_ntfy_blks;
            cfg.mgmt_msix_idx = self.num_msix - 1;
            cfg.ntfy_blk_msix_base_idx = 0;
            // Blocks split between the directions: TX takes the low half,
            // RX the high half plus any odd block.
            cfg.tx_cfg.max_queues = cfg.tx_cfg.max_queues.min(num_ntfy_blks / 2);
            cfg.rx_cfg.max_queues = cfg
                .rx_cfg
                .max_queues
                .min(num_ntfy_blks / 2 + num_ntfy_blks % 2);
            cfg.tx_cfg.num_queues = (desc.default_num_queues as u32).min(cfg.tx_cfg.max_queues);
            cfg.rx_cfg.num_queues = (desc.default_num_queues as u32).min(cfg.rx_cfg.max_queues);
            klog_info!(
                "gve: mac {} mtu {} tx queues {}/{} rx queues {}/{}",
                desc.mac,
                desc.mtu,
                cfg.tx_cfg.num_queues,
                cfg.tx_cfg.max_queues,
                cfg.rx_cfg.num_queues,
                cfg.rx_cfg.max_queues
            );
        }

        self.setup_device_resources()
    }

    fn setup_device_resources(&self) -> Result<(), GveError> {
        let (num_counters, num_blocks) = {
            let cfg = self.cfg.lock();
            (cfg.desc.counters as u32, cfg.num_ntfy_blks)
        };

        let counters = Arc::new(CounterArray::alloc(num_counters)?);
        let shared = Arc::new(NtfyBlockArray::alloc(num_blocks)?);

        let mut blocks = Vec::with_capacity(num_blocks as usize);
        for i in 0..num_blocks {
            blocks.push(Arc::new(NotifyBlock::new(
                i,
                format!("gvnic-ntfy-block.{i}"),
                Arc::clone(&shared),
            )));
        }

        {
            let mut res = self.res.lock();
            res.counters = Some(counters);
            res.ntfy_shared = Some(shared);
        }
        *self.blocks.write() = blocks;

        if let Err(e) = self.configure_device_resources_cmd() {
            klog_error!("gve: could not set up device resources: {e}");
            self.blocks.write().clear();
            let mut res = self.res.lock();
            res.counters = None;
            res.ntfy_shared = None;
            return Err(e);
        }

        self.set_state(StateFlags::DEVICE_RESOURCES_OK);
        Ok(())
    }

    fn teardown_device_resources(&self) {
        if self.test_state(StateFlags::DEVICE_RESOURCES_OK) {
            if let Err(e) = self.with_adminq(|aq, regs| aq.deconfigure_device_resources(regs)) {
                klog_warn!("gve: device resources not released: {e}");
            }
        }
        self.blocks.write().clear();
        let mut res = self.res.lock();
        res.counters = None;
        res.ntfy_shared = None;
        drop(res);
        self.clear_state(StateFlags::DEVICE_RESOURCES_OK);
    }
}

// =============================================================================
// Page lists and rings
// =============================================================================

impl GvePriv {
    fn alloc_qpls(&self) -> Result<(), GveError> {
        let (num_tx, num_rx, tx_pages, rx_pages, max_pages, mut registered) = {
            let cfg = self.cfg.lock();
            (
                cfg.tx_cfg.num_queues,
                cfg.rx_cfg.num_queues,
                cfg.desc.tx_pages_per_qpl as u32,
                cfg.desc.rx_pages_per_qpl as u32,
                cfg.desc.max_registered_pages,
                cfg.num_registered_pages,
            )
        };

        let mut qpls = Vec::new();
        for id in 0..num_tx {
            if registered + tx_pages as u64 > max_pages {
                return Err(GveError::Invalid);
            }
            qpls.push(QueuePageList::new_tx(id, tx_pages)?);
            registered += tx_pages as u64;
        }
        for i in 0..num_rx {
            if registered + rx_pages as u64 > max_pages {
                return Err(GveError::Invalid);
            }
            qpls.push(QueuePageList::new_rx(num_tx + i, rx_pages)?);
            registered += rx_pages as u64;
        }

        self.cfg.lock().num_registered_pages = registered;
        let mut res = self.res.lock();
        res.qpls = qpls;
        res.qpl_map = QplMap::new(num_tx, num_rx);
        Ok(())
    }

    fn free_qpls(&self) {
        let mut res = self.res.lock();
        res.qpls.clear();
        res.qpl_map = QplMap::new(0, 0);
        drop(res);
        self.cfg.lock().num_registered_pages = 0;
    }

    fn alloc_rings(&self) -> Result<(), GveError> {
        let (tx_n, rx_n, tx_desc_cnt, rx_desc_cnt, copybreak, max_mtu, num_blocks) = {
            let cfg = self.cfg.lock();
            (
                cfg.tx_cfg.num_queues,
                cfg.rx_cfg.num_queues,
                cfg.desc.tx_queue_entries as u32,
                cfg.desc.rx_queue_entries as u32,
                cfg.rx_copybreak,
                cfg.desc.mtu,
                cfg.num_ntfy_blks,
            )
        };
        let counters = self
            .res
            .lock()
            .counters
            .clone()
            .ok_or(GveError::NotRecoverable)?;
        let blocks = self.blocks.read().clone();

        let build = || -> Result<(Vec<Arc<TxRing>>, Vec<Arc<RxRing>>), GveError> {
            let mut tx_rings = Vec::new();
            let mut rx_rings = Vec::new();
            for q in 0..tx_n {
                let ring = {
                    let res = &mut *self.res.lock();
                    let qpl_id = res.qpl_map.assign_tx().ok_or(GveError::OutOfMemory)?;
                    let qpl = res
                        .qpls
                        .iter()
                        .find(|qpl| qpl.id() == qpl_id)
                        .ok_or(GveError::Invalid)?;
                    TxRing::alloc(q, tx_desc_cnt, qpl, Arc::clone(&counters), tx_ntfy_idx(q))?
                };
                if let Some(block) = blocks.get(ring.ntfy_id() as usize) {
                    block.set_tx(q);
                }
                tx_rings.push(Arc::new(ring));
            }
            for q in 0..rx_n {
                let ring = {
                    let res = &mut *self.res.lock();
                    let qpl_id = res.qpl_map.assign_rx().ok_or(GveError::OutOfMemory)?;
                    let qpl = res
                        .qpls
                        .iter()
                        .find(|qpl| qpl.id() == qpl_id)
                        .ok_or(GveError::Invalid)?;
                    RxRing::alloc(
                        q,
                        rx_desc_cnt,
                        qpl,
                        rx_ntfy_idx(num_blocks, q),
                        copybreak,
                        max_mtu,
                    )?
                };
                if let Some(block) = blocks.get(ring.ntfy_id() as usize) {
                    block.set_rx(q);
                }
                rx_rings.push(Arc::new(ring));
            }
            Ok((tx_rings, rx_rings))
        };

        let (tx_rings, rx_rings) = match build() {
            Ok(rings) => rings,
            Err(e) => {
                // Detach anything the partial build attached; the page-list
                // map is rebuilt wholesale by the caller's unwind.
                for block in blocks.iter() {
                    block.clear_tx();
                    block.clear_rx();
                }
                klog_error!("gve: ring allocation failed: {e}");
                return Err(e);
            }
        };

        *self.tx.write() = tx_rings;
        *self.rx.write() = rx_rings;
        Ok(())
    }

    fn free_rings(&self) {
        let blocks = self.blocks.read().clone();

        let tx_rings: Vec<Arc<TxRing>> = core::mem::take(&mut *self.tx.write());
        for ring in &tx_rings {
            if let Some(block) = blocks.get(ring.ntfy_id() as usize) {
                block.clear_tx();
            }
            ring.drain();
            self.res.lock().qpl_map.unassign(ring.qpl_id());
            klog_debug!("gve: freed tx queue {}", ring.q_num());
        }

        let rx_rings: Vec<Arc<RxRing>> = core::mem::take(&mut *self.rx.write());
        for ring in &rx_rings {
            if let Some(block) = blocks.get(ring.ntfy_id() as usize) {
                block.clear_rx();
            }
            self.res.lock().qpl_map.unassign(ring.qpl_id());
            klog_debug!("gve: freed rx queue {}", ring.q_num());
        }
    }

    fn register_qpls(&self) -> Result<(), GveError> {
        let res = &mut *self.res.lock();
        let aq = res.adminq.as_mut().ok_or(GveError::NotRecoverable)?;
        for qpl in &res.qpls {
            if let Err(e) = aq.register_page_list(&self.regs, qpl) {
                klog_error!("gve: failed to register page list {}: {e}", qpl.id());
                return Err(e);
            }
        }
        Ok(())
    }

    fn unregister_qpls(&self) -> Result<(), GveError> {
        let res = &mut *self.res.lock();
        let aq = res.adminq.as_mut().ok_or(GveError::NotRecoverable)?;
        for qpl in &res.qpls {
            aq.unregister_page_list(&self.regs, qpl.id())?;
        }
        Ok(())
    }

    fn create_rings(&self) -> Result<(), GveError> {
        let tx_rings = self.tx.read().clone();
        for ring in &tx_rings {
            let params = CreateTxQueue {
                queue_id: ring.q_num(),
                queue_resources_addr: ring.q_resources_bus(),
                tx_ring_addr: ring.desc_bus(),
                queue_page_list_id: ring.qpl_id(),
                ntfy_id: ring.ntfy_id(),
            };
            self.with_adminq(|aq, regs| aq.create_tx_queue(regs, &params))?;
            klog_debug!("gve: created tx queue {}", ring.q_num());
        }

        let rx_rings = self.rx.read().clone();
        for ring in &rx_rings {
            let params = CreateRxQueue {
                queue_id: ring.q_num(),
                ntfy_id: ring.ntfy_id(),
                queue_resources_addr: ring.q_resources_bus(),
                rx_desc_ring_addr: ring.desc_bus(),
                rx_data_ring_addr: ring.data_bus(),
                queue_page_list_id: ring.qpl_id(),
            };
            self.with_adminq(|aq, regs| aq.create_rx_queue(regs, &params))?;
            // The data ring was prefilled at allocation; the doorbell hands
            // those buffers to the device.
            ring.write_doorbell(&self.db);
            klog_debug!("gve: created rx queue {}", ring.q_num());
        }
        Ok(())
    }

    fn destroy_rings(&self) -> Result<(), GveError> {
        let tx_rings = self.tx.read().clone();
        for ring in &tx_rings {
            self.with_adminq(|aq, regs| aq.destroy_tx_queue(regs, ring.q_num()))?;
            klog_debug!("gve: destroyed tx queue {}", ring.q_num());
        }
        let rx_rings = self.rx.read().clone();
        for ring in &rx_rings {
            self.with_adminq(|aq, regs| aq.destroy_rx_queue(regs, ring.q_num()))?;
            klog_debug!("gve: destroyed rx queue {}", ring.q_num());
        }
        Ok(())
    }
}

// =============================================================================
// NAPI / quiesce
// =============================================================================

impl GvePriv {
    fn turnup(&self) {
        for block in self.blocks.read().iter() {
            if block.has_ring() {
                block.napi().enable();
            }
        }
        self.set_state(StateFlags::NAPI_ENABLED);
    }

    fn napi_disable_all(&self) {
        for block in self.blocks.read().iter() {
            block.napi().disable();
        }
        self.clear_state(StateFlags::NAPI_ENABLED);
    }

    /// Quiesce the datapath: no new polls, then drain both directions.
    fn turndown(&self) {
        self.napi_disable_all();

        for ring in self.tx.read().iter() {
            ring.drain();
        }
        for ring in self.rx.read().iter() {
            ring.drain(&self.db, self.features, self.dev());
        }
    }
}

// =============================================================================
// Open / close / adjust
// =============================================================================

impl GvePriv {
    /// Bring the interface up.  Caller holds the lifecycle lock.
    fn open_locked(&self) -> Result<(), GveError> {
        self.alloc_qpls()?;
        if let Err(e) = self.alloc_rings() {
            self.free_rings();
            self.free_qpls();
            return Err(e);
        }

        if let Err(e) = self.register_qpls() {
            self.schedule_aq_reset();
            return Err(e);
        }
        if let Err(e) = self.create_rings() {
            self.schedule_aq_reset();
            return Err(e);
        }

        self.turnup();
        self.set_state(StateFlags::DEVICE_RINGS_OK);
        self.link_up.store(true, Ordering::Release);
        klog_info!("gve: link up");
        Ok(())
    }

    /// Bring the interface down.  Caller holds the lifecycle lock.
    fn close_locked(&self) {
        self.link_up.store(false, Ordering::Release);
        klog_info!("gve: link down");
        self.napi_disable_all();

        if self.test_state(StateFlags::DEVICE_RINGS_OK) {
            if self.destroy_rings().is_err() {
                self.schedule_aq_reset();
            }
            if self.unregister_qpls().is_err() {
                self.schedule_aq_reset();
            }
        }

        self.free_rings();
        self.free_qpls();
        self.clear_state(StateFlags::DEVICE_RINGS_OK);
    }

    /// Bring the interface up (idempotent).
    pub fn open(&self) -> Result<(), GveError> {
        let _guard = self.lifecycle.lock();
        if self.is_up() {
            return Ok(());
        }
        self.open_locked()
    }

    /// Bring the interface down (idempotent).
    pub fn close(&self) {
        let _guard = self.lifecycle.lock();
        if self.is_up() || self.test_state(StateFlags::DEVICE_RINGS_OK) {
            self.close_locked();
        }
    }

    /// Change queue counts; bounces the link when up.
    pub fn adjust_queues(
        &self,
        new_tx: QueueConfig,
        new_rx: QueueConfig,
    ) -> Result<(), GveError> {
        let _guard = self.lifecycle.lock();

        if self.is_up() {
            self.close_locked();
            {
                let mut cfg = self.cfg.lock();
                cfg.tx_cfg = new_tx;
                cfg.rx_cfg = new_rx;
            }
            return self.open_locked();
        }

        let mut cfg = self.cfg.lock();
        cfg.tx_cfg = new_tx;
        cfg.rx_cfg = new_rx;
        Ok(())
    }
}

// =============================================================================
// Reset state machine
// =============================================================================

impl GvePriv {
    pub fn schedule_aq_reset(&self) {
        if self.is_up() {
            self.set_service(ServiceFlags::DEVICE_WAS_UP);
        }
        self.set_service(ServiceFlags::DO_AQ_RESET);
        driver_runtime::service_kick(self.id());
    }

    pub fn schedule_pci_reset(&self) {
        if self.is_up() {
            self.set_service(ServiceFlags::DEVICE_WAS_UP);
        }
        self.set_service(ServiceFlags::DO_PCI_RESET);
        driver_runtime::service_kick(self.id());
    }

    /// The management-interrupt / deferred-work entry point.
    pub fn service_task(&self) {
        self.handle_status(self.regs.device_status());
        self.handle_reset();
    }

    fn handle_status(&self, status: u32) {
        if status & super::regs::DEVICE_STATUS_RESET_REQUESTED != 0 {
            klog_info!("gve: device requested reset");
            if self.is_up() {
                self.set_service(ServiceFlags::DEVICE_WAS_UP);
            }
            self.set_service(ServiceFlags::DO_PCI_RESET);
        }
    }

    fn handle_reset(&self) {
        // Resets wait until probe has finished; probe schedules one service
        // pass at its end to catch anything requested meanwhile.
        if self.test_service(ServiceFlags::PROBE_IN_PROGRESS) {
            return;
        }

        if self.test_service(ServiceFlags::DO_PCI_RESET) {
            // A PCI reset rebuilds everything an AQ reset would.
            self.clear_service(ServiceFlags::DO_AQ_RESET);
            let _guard = self.lifecycle.lock();
            self.set_service(ServiceFlags::RESET_IN_PROGRESS);
            self.reset_pci();
            self.clear_service(ServiceFlags::RESET_IN_PROGRESS);
        }

        if self.test_service(ServiceFlags::DO_AQ_RESET) {
            let _guard = self.lifecycle.lock();
            self.set_service(ServiceFlags::RESET_IN_PROGRESS);
            self.reset_aq();
            self.clear_service(ServiceFlags::RESET_IN_PROGRESS);
        }
    }

    /// Rebuild the admin channel in place; rings stay allocated and are
    /// re-created with the device.  Lifecycle lock held.
    fn reset_aq(&self) {
        klog_info!("gve: performing admin queue reset");
        self.clear_service(ServiceFlags::DO_AQ_RESET);
        let was_up = self.test_service(ServiceFlags::DEVICE_WAS_UP) || self.is_up();

        if self.is_up() {
            self.link_up.store(false, Ordering::Release);
            self.turndown();
        }

        self.free_adminq();

        let rebuild = || -> Result<(), GveError> {
            self.alloc_adminq()?;
            self.configure_device_resources_cmd()?;
            if was_up {
                self.register_qpls()?;
                self.create_rings()?;
                self.turnup();
                self.link_up.store(true, Ordering::Release);
                klog_info!("gve: link up");
            }
            Ok(())
        };

        match rebuild() {
            Ok(()) => {
                self.clear_service(ServiceFlags::DEVICE_WAS_UP);
            }
            Err(e) => {
                klog_error!("gve: admin queue reset failed ({e}), trying pci reset");
                if was_up {
                    self.set_service(ServiceFlags::DEVICE_WAS_UP);
                }
                self.set_service(ServiceFlags::DO_PCI_RESET);
                driver_runtime::service_kick(self.id());
            }
        }
    }

    /// Full teardown and reinit through the bus-level reset.  Lifecycle
    /// lock held.
    fn reset_pci(&self) {
        klog_info!("gve: performing pci reset");
        self.clear_service(ServiceFlags::DO_PCI_RESET);
        let was_up = self.test_service(ServiceFlags::DEVICE_WAS_UP) || self.is_up();
        self.clear_service(ServiceFlags::DEVICE_WAS_UP);

        if self.is_up() {
            self.link_up.store(false, Ordering::Release);
            self.turndown();
        }

        self.free_rings();
        self.free_qpls();
        self.teardown_device_resources();
        self.free_adminq();

        platform::bus_reset(self.bdf);

        {
            let mut cfg = self.cfg.lock();
            cfg.tx_cfg.max_queues = self.regs.max_tx_queues().min(MAX_NUM_TX_QUEUES);
            cfg.rx_cfg.max_queues = self.regs.max_rx_queues().min(MAX_NUM_RX_QUEUES);
        }

        let rebuild = || -> Result<(), GveError> {
            self.init_priv()?;
            if was_up {
                self.open_locked()?;
            }
            Ok(())
        };

        if let Err(e) = rebuild() {
            klog_error!("gve: pci reset failed ({e}), all queues disabled");
        }
    }

    /// Orderly user-requested reset.
    ///
    /// Escalation is two-target: a failure while tearing the queues down
    /// falls back to an admin-queue reset, but once the admin queue has
    /// been rebuilt an admin-queue reset would only repeat the same steps,
    /// so failures from there escalate straight to a PCI reset.
    pub fn user_reset(&self) {
        let _guard = self.lifecycle.lock();
        self.set_service(ServiceFlags::RESET_IN_PROGRESS);
        klog_info!("gve: performing user requested reset");

        let was_up = self.is_up();
        if was_up {
            self.link_up.store(false, Ordering::Release);
            self.turndown();
        }

        let teardown = || -> Result<(), GveError> {
            self.destroy_rings()?;
            self.unregister_qpls()?;
            Ok(())
        };
        if let Err(e) = teardown() {
            klog_error!("gve: user reset failed ({e}), trying admin queue reset");
            if was_up {
                self.set_service(ServiceFlags::DEVICE_WAS_UP);
            }
            self.set_service(ServiceFlags::DO_AQ_RESET);
            driver_runtime::service_kick(self.id());
            self.clear_service(ServiceFlags::RESET_IN_PROGRESS);
            return;
        }

        if let Err(e) = self.with_adminq(|aq, regs| aq.deconfigure_device_resources(regs)) {
            klog_warn!("gve: device resources not released: {e}");
        }
        self.free_adminq();

        let rebuild = || -> Result<(), GveError> {
            self.alloc_adminq()?;
            self.configure_device_resources_cmd()?;
            if was_up {
                self.register_qpls()?;
                self.create_rings()?;
                self.turnup();
                self.link_up.store(true, Ordering::Release);
                klog_info!("gve: link up");
            }
            Ok(())
        };
        if let Err(e) = rebuild() {
            klog_error!("gve: user reset failed ({e}), trying pci reset");
            if was_up {
                self.set_service(ServiceFlags::DEVICE_WAS_UP);
            }
            self.set_service(ServiceFlags::DO_PCI_RESET);
            driver_runtime::service_kick(self.id());
        }

        self.clear_service(ServiceFlags::RESET_IN_PROGRESS);
    }
}

// =============================================================================
// Interrupts and polling
// =============================================================================

impl GvePriv {
    fn block(&self, block_id: u32) -> Option<Arc<NotifyBlock>> {
        self.blocks.read().get(block_id as usize).cloned()
    }

    /// Data-interrupt entry: schedule the block's poll.
    pub fn data_irq(&self, block_id: u32) {
        if let Some(block) = self.block(block_id) {
            if block.napi().schedule() {
                driver_runtime::napi_kick(napi_token(self.id(), block_id));
            }
        }
    }

    /// Management-interrupt entry: wake the service task.
    pub fn mgmt_irq(&self) {
        driver_runtime::service_kick(self.id());
    }

    /// Scheduled-poll entry: claim the block and poll until it reports no
    /// more work.
    pub fn napi_poll_entry(&self, block_id: u32) {
        let Some(block) = self.block(block_id) else {
            return;
        };
        if !block.napi().begin_poll() {
            return;
        }
        loop {
            if self.block_poll(&block, NAPI_BUDGET as i32) == 0 {
                break;
            }
        }
    }

    /// One budgeted poll pass over a block's rings.
    ///
    /// Returns the consumed budget when the block should be polled again
    /// immediately, or 0 once it has completed and rearmed its interrupt.
    pub fn block_poll(&self, block: &NotifyBlock, budget: i32) -> i32 {
        let feat = self.features;
        let dev = self.dev();
        let link = self.is_up();

        let tx_ring = block
            .tx_ring()
            .and_then(|i| self.tx.read().get(i as usize).cloned());
        let rx_ring = block
            .rx_ring()
            .and_then(|i| self.rx.read().get(i as usize).cloned());

        let mut reschedule = false;
        if let Some(tx) = &tx_ring {
            reschedule |= tx.poll(budget, link);
        }
        if let Some(rx) = &rx_ring {
            reschedule |= rx.poll(&self.db, budget, feat, dev);
            if rx.take_needs_reset() {
                self.schedule_aq_reset();
            }
        }

        if reschedule {
            return budget;
        }

        block.napi().complete();
        let irq_db = block.irq_db_index();
        self.db.write(irq_db, IRQ_ACK | IRQ_EVENT);

        #[cfg(any(test, feature = "itests"))]
        test_hooks::run_post_ack();

        // Order the unmask against the re-check: work the device published
        // while we completed must not be missed.
        fence(Ordering::Acquire);

        let mut rework = false;
        if let Some(tx) = &tx_ring {
            rework |= tx.poll(-1, link);
        }
        if let Some(rx) = &rx_ring {
            rework |= rx.poll(&self.db, -1, feat, dev);
        }
        if rework && block.napi().schedule() {
            // Keep the vector masked so the rescheduled poll is the one
            // that picks the work up; the next ACK re-enables it.
            self.db.write(irq_db, IRQ_MASK);
        }

        0
    }
}

/// Interception point between IRQ-ack and the work re-check.
///
/// Only the test builds (`cfg(test)` / the `itests` feature) invoke the
/// hook; production polls never read it.  It exists so a test can emulate
/// the device publishing a descriptor in exactly that window.
pub mod test_hooks {
    use core::sync::atomic::{AtomicPtr, Ordering};

    static POST_ACK: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());

    /// Install a hook that runs after the IRQ-ack doorbell write and before
    /// the completion re-check.
    pub fn set_post_ack(hook: fn()) {
        POST_ACK.store(hook as *mut (), Ordering::Release);
    }

    pub fn clear_post_ack() {
        POST_ACK.store(core::ptr::null_mut(), Ordering::Release);
    }

    pub fn run_post_ack() {
        let ptr = POST_ACK.load(Ordering::Acquire);
        if !ptr.is_null() {
            // SAFETY: only `set_post_ack` stores here.
            let hook: fn() = unsafe { core::mem::transmute(ptr) };
            hook();
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

impl GvePriv {
    /// Aggregate plus per-queue counters.
    pub fn stats_report(&self) -> StatsReport {
        let mut report = StatsReport::default();

        for ring in self.rx.read().iter() {
            report.main.rx_packets += ring.rpackets();
            report.main.rx_bytes += ring.rbytes();
            report.main.rx_dropped += ring.rx_dropped();
            report.rx.push(RxQueueStats {
                desc_cnt: ring.cnt(),
                desc_fill_cnt: ring.fill_cnt(),
            });
        }
        for ring in self.tx.read().iter() {
            report.main.tx_packets += ring.pkt_done_count();
            report.main.tx_bytes += ring.bytes_done_count();
            report.tx.push(TxQueueStats {
                req: ring.req(),
                done: ring.done(),
                wake: ring.wake_count(),
                stop: ring.stop_count(),
                event_counter: ring.load_event_counter(),
            });
        }
        report
    }
}

// =============================================================================
// Netdev surface
// =============================================================================

/// The `NetDevice` the driver registers with the stack.
pub struct GveNic {
    inner: Arc<GvePriv>,
}

impl GveNic {
    pub fn new(inner: Arc<GvePriv>) -> Self {
        Self { inner }
    }
}

impl NetDevice for GveNic {
    fn start_xmit(&self, queue: u16, pkt: PacketBuf, more_coming: bool) -> Result<(), NetError> {
        let ring = self
            .inner
            .tx
            .read()
            .get(queue as usize)
            .cloned()
            .ok_or(NetError::InvalidArgument)?;
        ring.transmit(&self.inner.db, self.inner.is_up(), pkt, more_coming)
    }

    fn open(&self) -> Result<(), NetError> {
        self.inner.open().map_err(|e| {
            klog_error!("gve: open failed: {e}");
            NetError::NotReady
        })
    }

    fn stop(&self) -> Result<(), NetError> {
        self.inner.close();
        Ok(())
    }

    fn get_stats(&self) -> NetDeviceStats {
        self.inner.stats_report().main
    }

    fn change_mtu(&self, mtu: u16) -> Result<(), NetError> {
        let mut cfg = self.inner.cfg.lock();
        if mtu < MIN_MTU || mtu > cfg.desc.mtu {
            return Err(NetError::InvalidArgument);
        }
        cfg.mtu = mtu;
        Ok(())
    }

    fn mtu(&self) -> u16 {
        self.inner.cfg.lock().mtu
    }

    fn mac(&self) -> MacAddr {
        self.inner.cfg.lock().desc.mac
    }

    fn features(&self) -> NetDeviceFeatures {
        self.inner.features
    }

    fn channels(&self) -> UserChannels {
        let (tx, rx) = self.inner.queue_config();
        UserChannels {
            max_tx: tx.max_queues,
            max_rx: rx.max_queues,
            tx_count: tx.num_queues,
            rx_count: rx.num_queues,
        }
    }

    fn set_channels(&self, channels: UserChannels) -> Result<(), NetError> {
        let (tx, rx) = self.inner.queue_config();
        if channels.tx_count == 0
            || channels.rx_count == 0
            || channels.tx_count > tx.max_queues
            || channels.rx_count > rx.max_queues
        {
            return Err(NetError::InvalidArgument);
        }
        let new_tx = QueueConfig {
            max_queues: tx.max_queues,
            num_queues: channels.tx_count,
        };
        let new_rx = QueueConfig {
            max_queues: rx.max_queues,
            num_queues: channels.rx_count,
        };
        self.inner
            .adjust_queues(new_tx, new_rx)
            .map_err(|_| NetError::NotReady)
    }

    fn trigger_reset(&self) {
        self.inner.user_reset();
    }
}

// =============================================================================
// Probe and driver registration
// =============================================================================

fn gve_match(info: &PciDeviceInfo) -> bool {
    info.vendor_id == PCI_VENDOR_ID_GOOGLE && info.device_id == PCI_DEV_ID_GVNIC
}

/// Probe one gVNIC function.  On success the device is registered with the
/// netdev registry and its probed-device id is returned.
pub fn gve_probe(info: &PciDeviceInfo) -> Result<usize, GveError> {
    let reg_bar = info.bars[REGISTER_BAR];
    let db_bar = info.bars[DOORBELL_BAR];
    if !reg_bar.is_mapped() || !db_bar.is_mapped() {
        klog_error!("gve: missing register or doorbell bar");
        return Err(GveError::Invalid);
    }
    if info.msix_vectors < MIN_MSIX {
        klog_error!(
            "gve: need at least {MIN_MSIX} msix vectors, have {}",
            info.msix_vectors
        );
        return Err(GveError::Invalid);
    }

    let regs = GveRegisters::new(reg_bar);
    let db = DoorbellArray::new(db_bar);

    regs.write_driver_version(DRIVER_VERSION);

    let max_tx_queues = regs.max_tx_queues().min(MAX_NUM_TX_QUEUES);
    let max_rx_queues = regs.max_rx_queues().min(MAX_NUM_RX_QUEUES);

    let gve = Arc::new(GvePriv {
        regs,
        db,
        bdf: info.bdf(),
        num_msix: info.msix_vectors,
        lifecycle: IrqMutex::new(()),
        cfg: IrqMutex::new(GveConfig {
            desc: DeviceDescriptor::default(),
            mtu: 0,
            tx_cfg: QueueConfig {
                max_queues: max_tx_queues,
                num_queues: 0,
            },
            rx_cfg: QueueConfig {
                max_queues: max_rx_queues,
                num_queues: 0,
            },
            num_ntfy_blks: 0,
            mgmt_msix_idx: 0,
            ntfy_blk_msix_base_idx: 0,
            rx_copybreak: DEFAULT_RX_COPYBREAK,
            num_registered_pages: 0,
        }),
        res: IrqMutex::new(GveResources {
            adminq: None,
            counters: None,
            ntfy_shared: None,
            qpls: Vec::new(),
            qpl_map: QplMap::new(0, 0),
        }),
        tx: IrqRwLock::new(Vec::new()),
        rx: IrqRwLock::new(Vec::new()),
        blocks: IrqRwLock::new(Vec::new()),
        service_flags: AtomicU32::new(ServiceFlags::PROBE_IN_PROGRESS.bits()),
        state_flags: AtomicU32::new(0),
        link_up: AtomicBool::new(false),
        features: NetDeviceFeatures::CHECKSUM_TX
            | NetDeviceFeatures::CHECKSUM_RX
            | NetDeviceFeatures::TSO
            | NetDeviceFeatures::TSO6
            | NetDeviceFeatures::RX_HASH
            | NetDeviceFeatures::SG,
        priv_id: OnceLock::new(),
        dev_index: OnceLock::new(),
    });

    gve.init_priv()?;

    PACKET_POOL.init();

    let handle = DEVICE_REGISTRY
        .register(Box::new(GveNic::new(Arc::clone(&gve))))
        .ok_or(GveError::OutOfMemory)?;
    gve.dev_index.call_once(|| handle.index());

    let id = {
        let mut probed = PROBED.lock();
        probed.push(Some(Arc::clone(&gve)));
        probed.len() - 1
    };
    gve.priv_id.call_once(|| id);

    klog_info!("gve: version {DRIVER_VERSION} probed as {}", gve.dev());
    gve.clear_service(ServiceFlags::PROBE_IN_PROGRESS);
    // Catch any reset the device requested while probe was running.
    driver_runtime::service_kick(id);

    Ok(id)
}

/// Remove a probed device: close if needed, release device resources,
/// detach the admin queue, and unregister from the netdev registry.
pub fn gve_remove(id: usize) {
    let Some(gve) = probed_device(id) else {
        return;
    };

    {
        let _guard = gve.lifecycle.lock();
        if gve.is_up() || gve.test_state(StateFlags::DEVICE_RINGS_OK) {
            gve.close_locked();
        }
    }
    gve.teardown_device_resources();
    gve.free_adminq();

    if let Some(dev) = gve.dev_index.get() {
        DEVICE_REGISTRY.unregister(*dev);
    }
    if let Some(slot) = PROBED.lock().get_mut(id) {
        *slot = None;
    }
}

fn gve_probe_entry(info: &PciDeviceInfo) -> i32 {
    match gve_probe(info) {
        Ok(id) => id as i32,
        Err(e) => {
            klog_error!("gve: probe failed: {e}");
            -1
        }
    }
}

static GVE_DRIVER: PciDriver = PciDriver {
    name: "gvnic",
    match_fn: gve_match,
    probe: gve_probe_entry,
};

/// Register the gVNIC driver with the PCI core.
pub fn gve_register_driver() {
    if pci_register_driver(&GVE_DRIVER) != 0 {
        klog_info!("gve: driver registration failed");
    }
}

// -- Deferred-work dispatch ---------------------------------------------------

/// Run the service task for the probed device `id` (the embedder calls this
/// from the context its `service_kick` hook scheduled).
pub fn gve_service_task(id: usize) {
    if let Some(gve) = probed_device(id) {
        gve.service_task();
    }
}

/// Run a scheduled poll (the embedder calls this from the context its
/// `napi_kick` hook scheduled).
pub fn gve_napi_poll(token: usize) {
    let (id, block_id) = napi_token_parts(token);
    if let Some(gve) = probed_device(id) {
        gve.napi_poll_entry(block_id);
    }
}

/// Data-vector interrupt handler body for block `block_id`.
pub fn gve_data_intr(id: usize, block_id: u32) {
    if let Some(gve) = probed_device(id) {
        gve.data_irq(block_id);
    }
}

/// Management-vector interrupt handler body.
pub fn gve_mgmt_intr(id: usize) {
    if let Some(gve) = probed_device(id) {
        gve.mgmt_irq();
    }
}
