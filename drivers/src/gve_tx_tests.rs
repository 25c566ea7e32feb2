//! TX ring tests against the software device model: descriptor emission,
//! doorbells, completion reclaim, and queue stop/wake.

use alloc::vec::Vec;

use gvnic_lib::testing::TestResult;
use gvnic_lib::{assert_eq_test, assert_test, pass};

use crate::gve::desc::{TXD_SEG, TXD_STD, TXD_TSO, TXF_L4CSUM};
use crate::gve::driver::probed_device;
use crate::gve_test_fixtures::{FakeDeviceSpec, TestEnv, setup};
use crate::net::packetbuf::PacketBuf;
use crate::net::types::NetError;

/// Linear TCP/IPv4-shaped packet of `len` bytes with offload metadata set
/// the way the stack would.
pub fn tcp_packet(len: usize) -> PacketBuf {
    let mut pkt = PacketBuf::oversized(len);
    let bytes = alloc::vec![0u8; len];
    pkt.append(&bytes).expect("payload fits");
    // 14-byte Ethernet + 20-byte IPv4 header; checksum 16 bytes into TCP.
    pkt.set_l2(0);
    pkt.set_l3(14);
    pkt.set_l4(34);
    pkt.set_csum_partial(16);
    // TCP data offset: 5 words (20-byte header).
    pkt.payload_mut()[34 + 12] = 0x50;
    pkt
}

fn open_one_queue(env: &mut TestEnv) -> Result<usize, TestResult> {
    let id = env.probe().map_err(|_| gvnic_lib::fail!("probe"))?;
    let gve = probed_device(id).ok_or_else(|| gvnic_lib::fail!("missing device"))?;
    gve.open().map_err(|_| gvnic_lib::fail!("open"))?;
    Ok(id)
}

pub fn test_tx_single_packet_descriptors() -> TestResult {
    let mut env = setup(FakeDeviceSpec::default());
    let id = match open_one_queue(&mut env) {
        Ok(id) => id,
        Err(fail) => return fail,
    };
    let gve = probed_device(id).unwrap_or_else(|| unreachable!());
    let ring = match gve.tx_ring(0) {
        Some(ring) => ring,
        None => return gvnic_lib::fail!("no tx ring"),
    };
    let fifo_size = ring.fifo().size();

    let pkt = tcp_packet(1500);
    assert_test!(
        ring.transmit(gve.doorbell_array(), true, pkt, false).is_ok(),
        "transmit admitted"
    );

    // A fully linear non-GSO packet is one descriptor: header == packet.
    assert_eq_test!(ring.req(), 1);
    assert_eq_test!(env.device(|dev| dev.tx_doorbell(0)), 1, "doorbell rung");

    let desc = ring.read_pkt_desc(0);
    assert_eq_test!(desc.type_flags, TXD_STD | TXF_L4CSUM);
    assert_eq_test!(desc.seg_cnt, 1);
    assert_eq_test!(u16::from_be(desc.len_be), 1500);
    assert_eq_test!(u16::from_be(desc.seg_len_be), 1500);
    assert_eq_test!(desc.l4_offset, 17, "l4 offset in 2-byte units");
    assert_eq_test!(desc.checksum_offset, 8, "csum offset in 2-byte units");
    assert_eq_test!(u64::from_be(desc.seg_addr_be), 0, "first fifo offset");

    // FIFO charged for the packet plus its cache-line padding.
    assert_eq_test!(ring.fifo().available(), fifo_size - 1536);

    // Completion: device publishes the counter, the poll reclaims.
    env.device(|dev| dev.complete_tx(0));
    let more = ring.poll(64, true);
    assert_test!(!more, "no completion work left");
    assert_eq_test!(ring.done(), 1);
    assert_eq_test!(ring.pkt_done_count(), 1);
    assert_eq_test!(ring.bytes_done_count(), 1500);
    assert_eq_test!(ring.fifo().available(), fifo_size, "fifo space returned");
    pass!()
}

pub fn test_tx_gso_packet_descriptors() -> TestResult {
    let mut env = setup(FakeDeviceSpec::default());
    let id = match open_one_queue(&mut env) {
        Ok(id) => id,
        Err(fail) => return fail,
    };
    let gve = probed_device(id).unwrap_or_else(|| unreachable!());
    let ring = match gve.tx_ring(0) {
        Some(ring) => ring,
        None => return gvnic_lib::fail!("no tx ring"),
    };

    // 14480-byte GSO frame with a 66-byte header (32-byte TCP header).
    let mut pkt = PacketBuf::oversized(14480);
    let bytes = alloc::vec![0u8; 14480];
    pkt.append(&bytes).expect("payload fits");
    pkt.set_l2(0);
    pkt.set_l3(14);
    pkt.set_l4(34);
    pkt.set_csum_partial(16);
    pkt.set_gso(1448, false);
    pkt.payload_mut()[34 + 12] = 0x80; // data offset 8 -> 32-byte header

    assert_test!(
        ring.transmit(gve.doorbell_array(), true, pkt, false).is_ok(),
        "transmit admitted"
    );

    // One packet descriptor plus one payload segment.
    assert_eq_test!(ring.req(), 2);

    let pkt_desc = ring.read_pkt_desc(0);
    assert_eq_test!(pkt_desc.type_flags, TXD_TSO | TXF_L4CSUM);
    assert_eq_test!(pkt_desc.seg_cnt, 2);
    assert_eq_test!(u16::from_be(pkt_desc.len_be), 14480);
    assert_eq_test!(u16::from_be(pkt_desc.seg_len_be), 66);

    let seg_desc = ring.read_seg_desc(1);
    assert_eq_test!(seg_desc.type_flags, TXD_SEG);
    assert_eq_test!(u16::from_be(seg_desc.mss_be), 1448);
    assert_eq_test!(seg_desc.l3_offset, 7);
    assert_eq_test!(u16::from_be(seg_desc.seg_len_be), 14480 - 66);

    // Segment lengths over the packet's descriptors add up to its size.
    let total = u16::from_be(pkt_desc.seg_len_be) as u32 + u16::from_be(seg_desc.seg_len_be) as u32;
    assert_eq_test!(total, 14480);

    env.device(|dev| dev.complete_tx(0));
    ring.poll(64, true);
    assert_eq_test!(ring.done(), 2);
    assert_eq_test!(ring.pkt_done_count(), 1);
    pass!()
}

pub fn test_tx_doorbell_batching() -> TestResult {
    let mut env = setup(FakeDeviceSpec::default());
    let id = match open_one_queue(&mut env) {
        Ok(id) => id,
        Err(fail) => return fail,
    };
    let gve = probed_device(id).unwrap_or_else(|| unreachable!());
    let ring = match gve.tx_ring(0) {
        Some(ring) => ring,
        None => return gvnic_lib::fail!("no tx ring"),
    };

    let first = tcp_packet(200);
    assert_test!(
        ring.transmit(gve.doorbell_array(), true, first, true).is_ok()
    );
    assert_eq_test!(
        env.device(|dev| dev.tx_doorbell(0)),
        0,
        "doorbell deferred while more packets are coming"
    );

    let second = tcp_packet(200);
    assert_test!(
        ring.transmit(gve.doorbell_array(), true, second, false).is_ok()
    );
    assert_eq_test!(
        env.device(|dev| dev.tx_doorbell(0)),
        2,
        "flush publishes everything queued"
    );
    pass!()
}

pub fn test_tx_fifo_exhaustion_stops_and_wakes() -> TestResult {
    // One-page FIFO: two 3000-byte packets cannot be in flight at once.
    let mut env = setup(FakeDeviceSpec::tiny_tx_fifo());
    let id = match open_one_queue(&mut env) {
        Ok(id) => id,
        Err(fail) => return fail,
    };
    let gve = probed_device(id).unwrap_or_else(|| unreachable!());
    let ring = match gve.tx_ring(0) {
        Some(ring) => ring,
        None => return gvnic_lib::fail!("no tx ring"),
    };

    assert_test!(
        ring.transmit(gve.doorbell_array(), true, tcp_packet(3000), false)
            .is_ok(),
        "first packet fits"
    );

    let verdict = ring.transmit(gve.doorbell_array(), true, tcp_packet(3000), false);
    assert_eq_test!(verdict.err(), Some(NetError::Busy), "fifo exhausted");
    assert_test!(ring.is_stopped(), "queue stopped");
    assert_eq_test!(ring.stop_count(), 1);
    assert_eq_test!(
        env.device(|dev| dev.tx_doorbell(0)),
        ring.req(),
        "busy path still rings so the device drains"
    );

    env.device(|dev| dev.complete_tx(0));
    ring.poll(64, true);
    assert_test!(!ring.is_stopped(), "completion wakes the queue");
    assert_test!(ring.wake_count() >= 1);

    // A packet that fits the remaining tail is admitted again.  (The full
    // 3000 bytes would still be refused here: the header cannot straddle
    // the wrap, and padding to it costs the whole tail.)
    assert_test!(
        ring.transmit(gve.doorbell_array(), true, tcp_packet(1000), false)
            .is_ok(),
        "retry succeeds after reclaim"
    );
    pass!()
}

pub fn test_tx_ring_slot_exhaustion_and_invariant() -> TestResult {
    let mut env = setup(FakeDeviceSpec::default());
    let id = match open_one_queue(&mut env) {
        Ok(id) => id,
        Err(fail) => return fail,
    };
    let gve = probed_device(id).unwrap_or_else(|| unreachable!());
    let ring = match gve.tx_ring(0) {
        Some(ring) => ring,
        None => return gvnic_lib::fail!("no tx ring"),
    };
    let size = ring.ring_size();

    // Fill until admission needs its 3-slot reserve.
    let mut queued = 0u32;
    let mut outcomes: Vec<Result<(), NetError>> = Vec::new();
    for _ in 0..size {
        let r = ring.transmit(gve.doorbell_array(), true, tcp_packet(60), true);
        let ok = r.is_ok();
        outcomes.push(r);
        if !ok {
            break;
        }
        queued += 1;
        assert_test!(
            ring.req().wrapping_sub(ring.done()) <= size,
            "req - done within ring size"
        );
    }
    assert_eq_test!(queued, size - 2, "stops when fewer than 3 slots remain");
    assert_eq_test!(
        outcomes.last().and_then(|r| r.err()),
        Some(NetError::Busy)
    );

    env.device(|dev| dev.complete_tx(0));
    ring.poll(0, true);
    assert_eq_test!(ring.done(), ring.req(), "everything reclaimed");
    assert_eq_test!(ring.pkt_done_count() as u32, queued);
    pass!()
}

gvnic_lib::define_test_suite!(
    gve_tx,
    [
        test_tx_single_packet_descriptors,
        test_tx_gso_packet_descriptors,
        test_tx_doorbell_batching,
        test_tx_fifo_exhaustion_stops_and_wakes,
        test_tx_ring_slot_exhaustion_and_invariant,
    ]
);
