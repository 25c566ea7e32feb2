//! TX ring: admission, descriptor emission, doorbell, reclaim.
//!
//! A packet becomes one packet descriptor plus zero or more segment
//! descriptors.  The header segment is the linear packet for ordinary
//! frames, or the protocol headers (through the TCP header) for GSO frames;
//! the payload follows in up to two FIFO fragments.  All bytes are copied
//! into the ring's bounce [`TxFifo`] before descriptors are published,
//! because the device can only read out of its registered segment.
//!
//! Completion is counter-based: the device bumps this queue's cell in the
//! shared counter array once per consumed descriptor.  The poll side reads
//! the counter, reclaims packets up to its budget, and returns FIFO bytes.
//!
//! # Concurrency
//!
//! The transmit path is the producer; it is serialized per ring by
//! `producer` and owns `req`, the FIFO head, and the metadata slot it is
//! filling.  The poll side is the sole reclaimer (the block's NAPI context
//! guarantees one poller) and owns `done` plus the slots in
//! `[done, nic_done)`.  `req - done <= ring size` keeps the two sides on
//! disjoint slots, which is what makes the `UnsafeCell` metadata sound.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering, fence};

use gvnic_abi::addr::BusAddr;
use gvnic_lib::{IrqMutex, klog_debug};
use gvnic_mm::dma::DmaRegion;

use super::GveError;
use super::desc::{
    QRES_COUNTER_INDEX, QRES_DB_INDEX, QRES_SIZE, TXD_SEG, TXD_STD, TXD_TSO, TXF_L4CSUM,
    TXSF_IPV6, TxPktDesc, TxSegDesc,
};
use super::fifo::{FifoIovec, TxFifo};
use super::qpl::QueuePageList;
use super::regs::DoorbellArray;
use crate::net::packetbuf::PacketBuf;
use crate::net::types::NetError;

/// Descriptor slots a packet needs in the worst case (one packet
/// descriptor, two payload segments); admission requires this many free.
const DESC_SLOTS_REQUIRED: u32 = 3;

/// Device-written completion counters, one cell per TX queue.
///
/// Allocated once per device; every TX ring reads its own cell, selected by
/// the counter index the device wrote into the ring's queue resources.
pub struct CounterArray {
    mem: DmaRegion,
    count: u32,
}

impl CounterArray {
    pub fn alloc(count: u32) -> Result<Self, GveError> {
        let mem = DmaRegion::zeroed(count as usize * core::mem::size_of::<u32>())
            .ok_or(GveError::OutOfMemory)?;
        Ok(Self { mem, count })
    }

    #[inline]
    pub fn bus_addr(&self) -> BusAddr {
        self.mem.bus_addr()
    }

    #[inline]
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Untorn read of one counter cell.
    #[inline]
    pub fn read(&self, index: u32) -> u32 {
        debug_assert!(index < self.count);
        u32::from_be(self.mem.read_at::<u32>(index as usize * 4))
    }
}

/// Per-slot bookkeeping: the packet owning the slot and the FIFO fragments
/// to return when it completes.  Only the packet-descriptor slot of a
/// multi-descriptor packet carries state; segment slots stay empty.
#[derive(Default)]
struct TxBufferState {
    pkt: Option<PacketBuf>,
    iov: [FifoIovec; 4],
}

pub struct TxRing {
    q_num: u32,
    mask: u32,
    ntfy_id: u32,
    qpl_id: u32,
    fifo: TxFifo,
    /// Descriptor ring, `mask + 1` slots of 16 bytes.
    desc: DmaRegion,
    info: Box<[UnsafeCell<TxBufferState>]>,
    /// Producer index: descriptors handed to the device.
    req: AtomicU32,
    /// Consumer index: descriptors reclaimed from the device.
    done: AtomicU32,
    /// Last event-counter value observed by the poll side.
    last_nic_done: AtomicU32,
    /// Device-written queue resources (doorbell index, counter index).
    q_resources: DmaRegion,
    counters: Arc<CounterArray>,
    /// Upper-layer queue state: `true` while admission is refusing packets.
    stopped: AtomicBool,
    stop_queue: AtomicU64,
    wake_queue: AtomicU64,
    pkt_done: AtomicU64,
    bytes_done: AtomicU64,
    /// Serializes the transmit path for this queue.
    producer: IrqMutex<()>,
}

// SAFETY: cross-thread access follows the producer/reclaimer split in the
// module docs; everything else is atomic or immutable after alloc.
unsafe impl Send for TxRing {}
unsafe impl Sync for TxRing {}

impl TxRing {
    /// Allocate a ring of `slots` descriptors over an assigned TX page
    /// list.
    pub fn alloc(
        q_num: u32,
        slots: u32,
        qpl: &QueuePageList,
        counters: Arc<CounterArray>,
        ntfy_id: u32,
    ) -> Result<TxRing, GveError> {
        debug_assert!(slots.is_power_of_two());
        let region = qpl.fifo_region().ok_or(GveError::Invalid)?;
        let desc = DmaRegion::zeroed(slots as usize * core::mem::size_of::<TxPktDesc>())
            .ok_or(GveError::OutOfMemory)?;
        let q_resources = DmaRegion::zeroed(QRES_SIZE).ok_or(GveError::OutOfMemory)?;
        let info = (0..slots)
            .map(|_| UnsafeCell::new(TxBufferState::default()))
            .collect();

        klog_debug!("gve: tx[{q_num}] ring allocated, {slots} slots");
        Ok(TxRing {
            q_num,
            mask: slots - 1,
            ntfy_id,
            qpl_id: qpl.id(),
            fifo: TxFifo::new(region),
            desc,
            info,
            req: AtomicU32::new(0),
            done: AtomicU32::new(0),
            last_nic_done: AtomicU32::new(0),
            q_resources,
            counters,
            stopped: AtomicBool::new(false),
            stop_queue: AtomicU64::new(0),
            wake_queue: AtomicU64::new(0),
            pkt_done: AtomicU64::new(0),
            bytes_done: AtomicU64::new(0),
            producer: IrqMutex::new(()),
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
    pub fn ring_size(&self) -> u32 {
        self.mask + 1
    }

    #[inline]
    pub fn req(&self) -> u32 {
        self.req.load(Ordering::Acquire)
    }

    #[inline]
    pub fn done(&self) -> u32 {
        self.done.load(Ordering::Acquire)
    }

    #[inline]
    pub fn last_nic_done(&self) -> u32 {
        self.last_nic_done.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    #[inline]
    pub fn stop_count(&self) -> u64 {
        self.stop_queue.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn wake_count(&self) -> u64 {
        self.wake_queue.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn pkt_done_count(&self) -> u64 {
        self.pkt_done.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn bytes_done_count(&self) -> u64 {
        self.bytes_done.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn fifo(&self) -> &TxFifo {
        &self.fifo
    }

    #[inline]
    pub fn desc_bus(&self) -> BusAddr {
        self.desc.bus_addr()
    }

    #[inline]
    pub fn q_resources_bus(&self) -> BusAddr {
        self.q_resources.bus_addr()
    }

    /// Doorbell cell assigned by the device at queue creation.
    #[inline]
    pub fn db_index(&self) -> u32 {
        u32::from_be(self.q_resources.read_at::<u32>(QRES_DB_INDEX))
    }

    /// Event-counter cell assigned by the device at queue creation.
    #[inline]
    pub fn counter_index(&self) -> u32 {
        u32::from_be(self.q_resources.read_at::<u32>(QRES_COUNTER_INDEX))
    }

    /// Free descriptor slots.  Capacity is the full ring; no slot is
    /// reserved.
    #[inline]
    fn descs_avail(&self) -> u32 {
        self.mask + 1
            - self
                .req
                .load(Ordering::Acquire)
                .wrapping_sub(self.done.load(Ordering::Acquire))
    }

    /// Raw descriptor readback, for inspection in tests.
    pub fn read_pkt_desc(&self, slot: u32) -> TxPktDesc {
        self.desc
            .read_at::<TxPktDesc>((slot & self.mask) as usize * core::mem::size_of::<TxPktDesc>())
    }

    pub fn read_seg_desc(&self, slot: u32) -> TxSegDesc {
        self.desc
            .read_at::<TxSegDesc>((slot & self.mask) as usize * core::mem::size_of::<TxSegDesc>())
    }

    // -- Admission -------------------------------------------------------------

    /// Header bytes that must land in the first segment: for GSO the
    /// protocol headers through TCP, otherwise the whole (linear) packet.
    fn header_len(pkt: &PacketBuf) -> u32 {
        if pkt.is_gso() {
            // Clamp against the packet so a malformed GSO request cannot
            // claim headers past its own end.
            (pkt.l4_offset() as u32 + tcp_header_len(pkt)).min(pkt.len() as u32)
        } else {
            pkt.len() as u32
        }
    }

    /// FIFO bytes this packet will consume: header alignment padding plus
    /// any pad-to-wrap for the header plus every packet byte.
    fn fifo_bytes_required(&self, pkt: &PacketBuf) -> u32 {
        let hlen = Self::header_len(pkt);
        let pad_to_wrap = self.fifo.pad_for(hlen);
        let align_pad = gvnic_lib::cache_line_align(hlen) - hlen;
        align_pad + pad_to_wrap + pkt.len() as u32
    }

    /// Check descriptor and FIFO space, stopping the queue when short.
    ///
    /// After stopping, a full fence orders our stop against the reclaim
    /// side's wake check, then the space test repeats: a completion that
    /// freed resources between our first check and the stop would otherwise
    /// strand the queue stopped forever.
    fn maybe_stop(&self, pkt: &PacketBuf) -> Result<(), ()> {
        let bytes_required = self.fifo_bytes_required(pkt);

        if self.descs_avail() >= DESC_SLOTS_REQUIRED && self.fifo.can_alloc(bytes_required) {
            return Ok(());
        }

        self.stop_queue.fetch_add(1, Ordering::Relaxed);
        self.stopped.store(true, Ordering::Release);
        fence(Ordering::SeqCst);

        if self.descs_avail() < DESC_SLOTS_REQUIRED || !self.fifo.can_alloc(bytes_required) {
            return Err(());
        }

        self.stopped.store(false, Ordering::Release);
        self.wake_queue.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    // -- Transmit --------------------------------------------------------------

    /// Queue one packet.  `more_coming` defers the doorbell; a stopped or
    /// busy queue always rings so the device drains what is already queued.
    pub fn transmit(
        &self,
        db: &DoorbellArray,
        link_up: bool,
        pkt: PacketBuf,
        more_coming: bool,
    ) -> Result<(), NetError> {
        let _guard = self.producer.lock();

        if !link_up {
            return Err(NetError::NotReady);
        }

        if self.maybe_stop(&pkt).is_err() {
            // Prior transmits may have deferred their doorbell; descriptor
            // writes must be visible before the device sees the index.
            fence(Ordering::Release);
            db.write(self.db_index(), self.req.load(Ordering::Relaxed));
            return Err(NetError::Busy);
        }

        let nsegs = self.add_pkt(pkt);
        self.req.fetch_add(nsegs, Ordering::Release);

        if !more_coming || self.stopped.load(Ordering::Acquire) {
            fence(Ordering::Release);
            db.write(self.db_index(), self.req.load(Ordering::Relaxed));
        }
        Ok(())
    }

    /// Copy the packet into the FIFO and write its descriptors.  Returns
    /// the number of descriptor slots consumed.
    fn add_pkt(&self, pkt: PacketBuf) -> u32 {
        let req = self.req.load(Ordering::Relaxed);
        let idx = (req & self.mask) as usize;
        let total_len = pkt.len() as u32;
        let is_gso = pkt.is_gso();
        let hlen = Self::header_len(&pkt);

        // SAFETY: producer lock held and this slot is free
        // (req - done < ring size was just checked in admission).
        let info = unsafe { &mut *self.info[idx].get() };

        // The header must not straddle the wrap: pad to the end of the
        // FIFO if needed so it lands at offset 0 instead.
        let pad_bytes = self.fifo.pad_for(hlen);
        let hdr_nfrags = self.fifo.alloc(hlen + pad_bytes, &mut info.iov[0..2]);
        debug_assert!(hdr_nfrags > 0);
        let payload_nfrags = self.fifo.alloc(total_len - hlen, &mut info.iov[2..4]);

        let header_iov = info.iov[hdr_nfrags - 1];

        // Offsets in the descriptor are in 2-byte units.
        let (type_flags, checksum_offset, l4_offset) = if is_gso {
            (
                TXD_TSO | TXF_L4CSUM,
                (pkt.csum_offset() >> 1) as u8,
                (pkt.l4_offset() >> 1) as u8,
            )
        } else if pkt.needs_csum() {
            (
                TXD_STD | TXF_L4CSUM,
                (pkt.csum_offset() >> 1) as u8,
                (pkt.l4_offset() >> 1) as u8,
            )
        } else {
            (TXD_STD, 0, 0)
        };

        let pkt_desc = TxPktDesc {
            type_flags,
            checksum_offset,
            l4_offset,
            seg_cnt: (1 + payload_nfrags) as u8,
            len_be: (total_len as u16).to_be(),
            seg_len_be: (hlen as u16).to_be(),
            seg_addr_be: (header_iov.offset as u64).to_be(),
        };
        self.desc
            .write_at(idx * core::mem::size_of::<TxPktDesc>(), pkt_desc);

        let payload = pkt.payload();
        self.fifo.write(header_iov.offset, &payload[..hlen as usize]);
        let mut copy_offset = hlen as usize;

        for i in 0..payload_nfrags {
            let next_idx = (req.wrapping_add(1 + i as u32) & self.mask) as usize;
            let iov = info.iov[2 + i];

            let mut seg_desc = TxSegDesc {
                type_flags: TXD_SEG,
                l3_offset: 0,
                reserved: 0,
                mss_be: 0,
                seg_len_be: (iov.len as u16).to_be(),
                seg_addr_be: (iov.offset as u64).to_be(),
            };
            if is_gso {
                if pkt.gso_ipv6() {
                    seg_desc.type_flags |= TXSF_IPV6;
                }
                seg_desc.l3_offset = (pkt.l3_offset() >> 1) as u8;
                seg_desc.mss_be = pkt.gso_size().to_be();
            }
            self.desc
                .write_at(next_idx * core::mem::size_of::<TxSegDesc>(), seg_desc);

            self.fifo
                .write(iov.offset, &payload[copy_offset..copy_offset + iov.len as usize]);
            copy_offset += iov.len as usize;
        }

        info.pkt = Some(pkt);
        (1 + payload_nfrags) as u32
    }

    // -- Completion ------------------------------------------------------------

    /// Event counter published by the device for this queue.
    #[inline]
    pub fn load_event_counter(&self) -> u32 {
        self.counters.read(self.counter_index())
    }

    /// Reclaim up to `to_do` completed descriptor slots, releasing packets
    /// and FIFO space.  Poll context only.
    pub fn clean_done(&self, to_do: u32, link_up: bool) -> u32 {
        let mut pkts = 0u64;
        let mut bytes = 0u64;
        let mut space_freed = 0u32;
        let mut done = self.done.load(Ordering::Relaxed);

        for _ in 0..to_do {
            let idx = (done & self.mask) as usize;
            // SAFETY: poll context is the sole reclaimer, and slots below
            // the event counter are no longer touched by the producer.
            let info = unsafe { &mut *self.info[idx].get() };

            if let Some(pkt) = info.pkt.take() {
                bytes += pkt.len() as u64;
                pkts += 1;
                for iov in info.iov.iter_mut() {
                    space_freed += iov.len + iov.padding;
                    *iov = FifoIovec::default();
                }
                // Dropping the packet hands its buffer back to the stack.
                drop(pkt);
            }
            done = done.wrapping_add(1);
        }

        self.done.store(done, Ordering::Release);
        self.fifo.free(space_freed);
        self.bytes_done.fetch_add(bytes, Ordering::Relaxed);
        self.pkt_done.fetch_add(pkts, Ordering::Relaxed);

        // Pairs with the fence in `maybe_stop`: either we see the stop and
        // wake below, or the producer's recheck sees our frees.
        fence(Ordering::SeqCst);
        if self.stopped.load(Ordering::Acquire) && link_up {
            self.stopped.store(false, Ordering::Release);
            self.wake_queue.fetch_add(1, Ordering::Relaxed);
        }

        pkts as u32
    }

    /// Budgeted completion poll.  A budget of 0 means unlimited; negative
    /// peeks without reclaiming.  Returns whether work remains.
    pub fn poll(&self, budget: i32, link_up: bool) -> bool {
        let nic_done = self.load_event_counter();
        self.last_nic_done.store(nic_done, Ordering::Relaxed);

        if budget >= 0 {
            let budget = if budget == 0 { u32::MAX } else { budget as u32 };
            let done = self.done.load(Ordering::Relaxed);
            let to_do = nic_done.wrapping_sub(done).min(budget);
            self.clean_done(to_do, link_up);
        }

        nic_done != self.done.load(Ordering::Relaxed)
    }

    /// Quiesce for teardown: reclaim everything outstanding as if the
    /// device had finished it, and zero the indices.
    pub fn drain(&self) {
        let outstanding = self
            .req
            .load(Ordering::Acquire)
            .wrapping_sub(self.done.load(Ordering::Acquire));
        self.clean_done(outstanding, false);
        self.req.store(0, Ordering::Release);
        self.done.store(0, Ordering::Release);
        self.stopped.store(false, Ordering::Release);
    }
}

/// TCP header length parsed from the packet's own bytes (data-offset
/// field).  Falls back to the minimum header when the packet is too short
/// to carry one, which only happens for malformed GSO requests.
fn tcp_header_len(pkt: &PacketBuf) -> u32 {
    let payload = pkt.payload();
    let l4 = pkt.l4_offset() as usize;
    if payload.len() < l4 + 13 {
        return 20;
    }
    ((payload[l4 + 12] >> 4) as u32) * 4
}
