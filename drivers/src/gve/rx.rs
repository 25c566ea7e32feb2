//! RX ring: prefill, sequence-gated consumption, page recycling, refill.
//!
//! The device owns the descriptor ring memory and writes a completion
//! descriptor per packet; ownership is signalled by a 3-bit sequence number
//! in each descriptor.  A descriptor belongs to the host exactly when its
//! sequence equals the ring's expected value; consuming it advances the
//! expectation through 1..=7 (0 marks never-written memory, so it is
//! skipped).  There is no consumer index shared with the device — the
//! sequence is the whole protocol.
//!
//! Buffers are halves of QPL pages.  Small packets are copied out and the
//! slot reused as-is.  Larger packets are handed up zero-copy as page
//! fragments when the page's other half is free (refcount says the stack
//! returned it); the slot then flips to the other half.  When the stack
//! still holds the other half, the packet is copied instead.
//!
//! All consumer state is owned by the block's poll (single consumer via the
//! NAPI context); the device writes descriptor memory but never reads it.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering, fence};

use gvnic_abi::PAGE_SIZE;
use gvnic_abi::addr::BusAddr;
use gvnic_lib::{IrqMutex, klog_debug, klog_error};
use gvnic_mm::dma::DmaRegion;

use super::GveError;
use super::desc::{
    QRES_DB_INDEX, QRES_SIZE, RX_PAD, RxDataSlot, RxDesc, next_seqno, rss_hash_type, rss_valid,
    rx_seqno,
};
use super::qpl::QueuePageList;
use super::regs::DoorbellArray;
use crate::net::netdev::NetDeviceFeatures;
use crate::net::packetbuf::PacketBuf;
use crate::net::types::{DevIndex, RxChecksum};
use crate::net::{ETH_HEADER_LEN, ingress};

/// Half a page: the buffer granule for page flipping.
const HALF_PAGE: usize = PAGE_SIZE / 2;

/// Per-slot page tracking.
struct RxSlotPageInfo {
    page: Arc<DmaRegion>,
    /// Which half of the page the device fills next: 0 or `HALF_PAGE`.
    page_offset: u32,
}

/// Consumer-side state, touched only by the owning block's poll.
struct RxConsumer {
    /// Expected sequence number of the next host-owned descriptor.
    seqno: u8,
    page_info: Vec<RxSlotPageInfo>,
}

pub struct RxRing {
    q_num: u32,
    /// Slot-count mask; slot count equals the page list's entry count.
    mask: u32,
    ntfy_id: u32,
    qpl_id: u32,
    /// Device-written completion descriptors (`desc_cnt` entries).
    desc: DmaRegion,
    /// Device-read fill slots, parallel to the page info table.
    data: DmaRegion,
    q_resources: DmaRegion,
    consumer: IrqMutex<RxConsumer>,
    /// Descriptors consumed.  Written only by the poll.
    cnt: AtomicU32,
    /// Buffers handed to the device.  Written only by the poll (and init).
    fill_cnt: AtomicU32,
    copybreak: u32,
    max_mtu: u16,
    needs_reset: AtomicBool,
    rpackets: AtomicU64,
    rbytes: AtomicU64,
    rx_dropped: AtomicU64,
    rx_copied_pkt: AtomicU64,
    rx_copybreak_pkt: AtomicU64,
    rx_frag_pkt: AtomicU64,
}

impl RxRing {
    /// Allocate the ring over an assigned RX page list: one page per slot,
    /// descriptor ring sized separately (`desc_cnt`), every slot prefilled
    /// and offered to the device (`fill_cnt` starts at the slot count; the
    /// doorbell write happens at queue creation).
    pub fn alloc(
        q_num: u32,
        desc_cnt: u32,
        qpl: &QueuePageList,
        ntfy_id: u32,
        copybreak: u32,
        max_mtu: u16,
    ) -> Result<RxRing, GveError> {
        let pages = qpl.rx_pages().ok_or(GveError::Invalid)?;
        let slots = qpl.num_entries();
        debug_assert!(slots.is_power_of_two());
        debug_assert!(desc_cnt.is_power_of_two());

        let desc = DmaRegion::zeroed(desc_cnt as usize * core::mem::size_of::<RxDesc>())
            .ok_or(GveError::OutOfMemory)?;
        let data = DmaRegion::zeroed(slots as usize * core::mem::size_of::<RxDataSlot>())
            .ok_or(GveError::OutOfMemory)?;
        let q_resources = DmaRegion::zeroed(QRES_SIZE).ok_or(GveError::OutOfMemory)?;

        let mut page_info = Vec::new();
        page_info
            .try_reserve_exact(slots as usize)
            .map_err(|_| GveError::OutOfMemory)?;
        for (i, page) in pages.iter().enumerate() {
            page_info.push(RxSlotPageInfo {
                page: Arc::clone(page),
                page_offset: 0,
            });
            let slot = RxDataSlot {
                qpl_offset_be: ((i * PAGE_SIZE) as u64).to_be(),
            };
            data.write_at(i * core::mem::size_of::<RxDataSlot>(), slot);
        }

        // Data-ring slots must be visible before the device learns of the
        // ring (queue creation, first doorbell).
        fence(Ordering::Release);

        klog_debug!("gve: rx[{q_num}] ring allocated, {slots} slots");
        Ok(RxRing {
            q_num,
            mask: slots - 1,
            ntfy_id,
            qpl_id: qpl.id(),
            desc,
            data,
            q_resources,
            consumer: IrqMutex::new(RxConsumer {
                seqno: 1,
                page_info,
            }),
            cnt: AtomicU32::new(0),
            fill_cnt: AtomicU32::new(slots),
            copybreak,
            max_mtu,
            needs_reset: AtomicBool::new(false),
            rpackets: AtomicU64::new(0),
            rbytes: AtomicU64::new(0),
            rx_dropped: AtomicU64::new(0),
            rx_copied_pkt: AtomicU64::new(0),
            rx_copybreak_pkt: AtomicU64::new(0),
            rx_frag_pkt: AtomicU64::new(0),
        })
    }

    // -- Accessors -------------------------------------------------------------

    #[inline]
    pub fn q_num(&self) -> u32 {
        self.q_num
    }

    #[inline]
    pub fn ntfy_id(&self) -> u32 {
        self.ntfy_id
    }

    #[inline]
    pub fn qpl_id(&self) -> u32 {
        self.qpl_id
    }

    #[inline]
    pub fn cnt(&self) -> u32 {
        self.cnt.load(Ordering::Acquire)
    }

    #[inline]
    pub fn fill_cnt(&self) -> u32 {
        self.fill_cnt.load(Ordering::Acquire)
    }

    #[inline]
    pub fn rpackets(&self) -> u64 {
        self.rpackets.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn rbytes(&self) -> u64 {
        self.rbytes.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn rx_dropped(&self) -> u64 {
        self.rx_dropped.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn rx_copied(&self) -> u64 {
        self.rx_copied_pkt.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn rx_frags(&self) -> u64 {
        self.rx_frag_pkt.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn desc_bus(&self) -> BusAddr {
        self.desc.bus_addr()
    }

    #[inline]
    pub fn data_bus(&self) -> BusAddr {
        self.data.bus_addr()
    }

    #[inline]
    pub fn q_resources_bus(&self) -> BusAddr {
        self.q_resources.bus_addr()
    }

    #[inline]
    pub fn db_index(&self) -> u32 {
        u32::from_be(self.q_resources.read_at::<u32>(QRES_DB_INDEX))
    }

    /// Expected sequence number of the next descriptor (diagnostic).
    pub fn expected_seqno(&self) -> u8 {
        self.consumer.lock().seqno
    }

    /// Host-order QPL offset currently in data slot `i` (diagnostic).
    pub fn data_slot_offset(&self, i: u32) -> u64 {
        u64::from_be(
            self.data
                .read_at::<RxDataSlot>((i & self.mask) as usize * core::mem::size_of::<RxDataSlot>())
                .qpl_offset_be,
        )
    }

    /// The device asked for the impossible (page refcount out of range);
    /// reported once to the caller, who schedules a reset.
    pub fn take_needs_reset(&self) -> bool {
        self.needs_reset.swap(false, Ordering::AcqRel)
    }

    /// Publish the current fill count to the device.
    pub fn write_doorbell(&self, db: &DoorbellArray) {
        db.write(self.db_index(), self.fill_cnt.load(Ordering::Acquire));
    }

    // -- Consumption -----------------------------------------------------------

    fn read_desc(&self, idx: u32) -> RxDesc {
        self.desc
            .read_at::<RxDesc>((idx & self.mask) as usize * core::mem::size_of::<RxDesc>())
    }

    /// Host-order flags of the descriptor at the consumer position.
    fn peek_flags(&self) -> u16 {
        let idx = self.cnt.load(Ordering::Relaxed) & self.mask;
        let desc = self.read_desc(idx);
        u16::from_be(desc.flags_seq_be)
    }

    /// Whether the next descriptor already belongs to the host.
    pub fn work_pending(&self) -> bool {
        let seqno = self.consumer.lock().seqno;
        // Synchronize with the device's descriptor publication.
        fence(Ordering::SeqCst);
        rx_seqno(self.peek_flags()) == seqno
    }

    /// Consume host-owned descriptors up to `budget`.  Returns whether more
    /// work remains.  Poll context only.
    pub fn clean_done(
        &self,
        db: &DoorbellArray,
        budget: u32,
        feat: NetDeviceFeatures,
        dev: DevIndex,
    ) -> bool {
        let mut state = self.consumer.lock();
        let mut cnt = self.cnt.load(Ordering::Relaxed);
        let mut work_done = 0u32;
        let mut packets = 0u64;
        let mut bytes = 0u64;

        while work_done < budget {
            let idx = cnt & self.mask;
            let flags = u16::from_be(self.read_desc(idx).flags_seq_be);
            if rx_seqno(flags) != state.seqno {
                break;
            }
            // The sequence match transfers ownership; the rest of the
            // descriptor must be read no earlier.
            fence(Ordering::Acquire);
            let desc = self.read_desc(idx);

            match self.receive_one(&mut state, idx, &desc, flags, feat, dev) {
                Some(len) => {
                    bytes += len as u64;
                    packets += 1;
                }
                None => {
                    self.rx_dropped.fetch_add(1, Ordering::Relaxed);
                }
            }

            cnt = cnt.wrapping_add(1);
            state.seqno = next_seqno(state.seqno);
            work_done += 1;
        }

        if work_done == 0 {
            return false;
        }

        self.rpackets.fetch_add(packets, Ordering::Relaxed);
        self.rbytes.fetch_add(bytes, Ordering::Relaxed);
        self.cnt.store(cnt, Ordering::Release);
        // Every consumed slot is immediately reusable: the buffer was
        // either copied out or flipped to the page's other half.
        self.fill_cnt.fetch_add(work_done, Ordering::Release);

        // Slot updates must be visible before the device sees the new fill
        // count.
        fence(Ordering::Release);
        self.write_doorbell(db);

        rx_seqno(self.peek_flags()) == state.seqno
    }

    /// Handle one descriptor.  Returns the delivered payload length, or
    /// `None` if the packet was dropped.
    fn receive_one(
        &self,
        state: &mut RxConsumer,
        idx: u32,
        desc: &RxDesc,
        flags: u16,
        feat: NetDeviceFeatures,
        dev: DevIndex,
    ) -> Option<u16> {
        let len = u16::from_be(desc.len_be).saturating_sub(RX_PAD as u16);
        let info = &mut state.page_info[idx as usize];
        let payload_offset = info.page_offset as usize + RX_PAD;

        let mut pkt = if (len as u32) <= self.copybreak {
            self.rx_copybreak_pkt.fetch_add(1, Ordering::Relaxed);
            self.copy_packet(info, payload_offset, len)?
        } else if !self.can_flip() {
            self.copy_packet(info, payload_offset, len)?
        } else {
            match Arc::strong_count(&info.page) {
                1 => {
                    // Sole owner: hand the fragment up and flip the slot to
                    // the other half of the page.
                    let pkt = PacketBuf::from_page_frag(
                        Arc::clone(&info.page),
                        payload_offset,
                        len as usize,
                        HALF_PAGE,
                    );
                    self.flip_slot(info, idx);
                    self.rx_frag_pkt.fetch_add(1, Ordering::Relaxed);
                    pkt
                }
                2 => {
                    // The stack still holds the other half; copying is the
                    // only way to return the buffer to the device.
                    self.copy_packet(info, payload_offset, len)?
                }
                refs => {
                    klog_error!("gve: rx[{}] page refcount {} out of range", self.q_num, refs);
                    self.needs_reset.store(true, Ordering::Release);
                    return None;
                }
            }
        };

        decode_ethernet(&mut pkt);

        let csum = u16::from_be(desc.csum_be);
        if feat.contains(NetDeviceFeatures::CHECKSUM_RX) && csum != 0 {
            pkt.set_rx_csum(RxChecksum::Complete(csum));
        } else {
            pkt.set_rx_csum(RxChecksum::None);
        }

        if feat.contains(NetDeviceFeatures::RX_HASH) && rss_valid(flags) {
            pkt.set_rx_hash(u32::from_be(desc.rss_hash_be), rss_hash_type(flags));
        }

        if ingress::deliver_rx(dev, pkt) {
            Some(len)
        } else {
            None
        }
    }

    /// Page flipping requires every possible packet to fit half a page.
    #[inline]
    fn can_flip(&self) -> bool {
        self.max_mtu as usize + RX_PAD + ETH_HEADER_LEN <= HALF_PAGE
    }

    fn copy_packet(
        &self,
        info: &RxSlotPageInfo,
        payload_offset: usize,
        len: u16,
    ) -> Option<PacketBuf> {
        // SAFETY: the sequence gate plus acquire fence guarantee the device
        // finished writing this buffer, and the span is within the page.
        let src = unsafe {
            core::slice::from_raw_parts(
                info.page.as_mut_ptr::<u8>().add(payload_offset),
                len as usize,
            )
        };
        let pkt = PacketBuf::from_raw_copy(src);
        if pkt.is_some() {
            self.rx_copied_pkt.fetch_add(1, Ordering::Relaxed);
        }
        pkt
    }

    /// Point the slot at the other half of its page, in both the host
    /// tracking and the device-visible data ring.
    fn flip_slot(&self, info: &mut RxSlotPageInfo, idx: u32) {
        info.page_offset ^= HALF_PAGE as u32;
        let offset = idx as usize * core::mem::size_of::<RxDataSlot>();
        let raw = u64::from_be(self.data.read_at::<RxDataSlot>(offset).qpl_offset_be);
        let flipped = raw ^ HALF_PAGE as u64;
        self.data.write_at(
            offset,
            RxDataSlot {
                qpl_offset_be: flipped.to_be(),
            },
        );
    }

    /// Budgeted poll.  0 means unlimited, negative peeks only.  Returns
    /// whether more work remains.
    pub fn poll(&self, db: &DoorbellArray, budget: i32, feat: NetDeviceFeatures, dev: DevIndex) -> bool {
        if budget < 0 {
            return self.work_pending();
        }
        let budget = if budget == 0 { u32::MAX } else { budget as u32 };
        self.clean_done(db, budget, feat, dev)
    }

    /// Drain everything consumable during teardown, without a doorbell
    /// target change mattering (the queue is about to be destroyed).
    pub fn drain(&self, db: &DoorbellArray, feat: NetDeviceFeatures, dev: DevIndex) {
        self.clean_done(db, u32::MAX, feat, dev);
    }
}

/// Fill in what the stack expects from a freshly received frame: layer
/// offsets and the ethertype.
fn decode_ethernet(pkt: &mut PacketBuf) {
    let head = pkt.head();
    let payload = pkt.payload();
    if payload.len() < ETH_HEADER_LEN {
        return;
    }
    let ethertype = u16::from_be_bytes([payload[12], payload[13]]);
    pkt.set_l2(head);
    pkt.set_l3(head + ETH_HEADER_LEN as u16);
    pkt.set_protocol(ethertype);
}
