//! RX ring tests against the software device model: sequence gating,
//! copybreak, page flipping, and refill doorbells.

use gvnic_lib::testing::TestResult;
use gvnic_lib::{assert_eq_test, assert_test, pass};

use crate::gve::desc::{RXF_IPV4, RXF_TCP};
use crate::gve::driver::probed_device;
use crate::gve_test_fixtures::{FakeDeviceSpec, TestEnv, setup};
use crate::net::netdev::NetDeviceFeatures;
use crate::net::types::{DevIndex, RxChecksum, RxHashType};

fn rx_features() -> NetDeviceFeatures {
    NetDeviceFeatures::CHECKSUM_RX | NetDeviceFeatures::RX_HASH
}

/// IPv4-ethertyped frame of `len` bytes.
fn eth_frame(len: usize) -> alloc::vec::Vec<u8> {
    let mut frame = alloc::vec![0u8; len];
    frame[12] = 0x08;
    frame[13] = 0x00;
    frame
}

fn open_one_queue(env: &mut TestEnv) -> Result<usize, TestResult> {
    let id = env.probe().map_err(|_| gvnic_lib::fail!("probe"))?;
    let gve = probed_device(id).ok_or_else(|| gvnic_lib::fail!("missing device"))?;
    gve.open().map_err(|_| gvnic_lib::fail!("open"))?;
    Ok(id)
}

pub fn test_rx_sequence_gating() -> TestResult {
    let mut env = setup(FakeDeviceSpec::default());
    let id = match open_one_queue(&mut env) {
        Ok(id) => id,
        Err(fail) => return fail,
    };
    let gve = probed_device(id).unwrap_or_else(|| unreachable!());
    let ring = match gve.rx_ring(0) {
        Some(ring) => ring,
        None => return gvnic_lib::fail!("no rx ring"),
    };
    let slots = ring.fill_cnt();
    assert_eq_test!(ring.expected_seqno(), 1, "first poll expects seqno 1");

    let frame = eth_frame(100);
    env.device(|dev| dev.rx_inject(0, &frame, RXF_IPV4 | RXF_TCP, 0, 0));

    let more = ring.clean_done(gve.doorbell_array(), 64, rx_features(), DevIndex(0));
    assert_test!(!more);
    assert_eq_test!(env.take_rx_packets().len(), 1);
    assert_eq_test!(ring.cnt(), 1);
    assert_eq_test!(ring.expected_seqno(), 2, "sequence advanced");
    assert_eq_test!(ring.fill_cnt(), slots + 1, "slot handed back");
    assert_eq_test!(
        env.device(|dev| dev.rx_doorbell(0)),
        slots + 1,
        "fill count published"
    );

    // A descriptor stamped with the stale sequence must not be consumed.
    env.device(|dev| dev.rx_inject_with_seq(0, &frame, RXF_IPV4, 1));
    let more = ring.clean_done(gve.doorbell_array(), 64, rx_features(), DevIndex(0));
    assert_test!(!more, "stale descriptor reports no work");
    assert_eq_test!(env.take_rx_packets().len(), 0);
    assert_eq_test!(ring.cnt(), 1, "consumer index unchanged");
    assert_eq_test!(ring.expected_seqno(), 2);
    pass!()
}

pub fn test_rx_copybreak_copy_with_metadata() -> TestResult {
    let mut env = setup(FakeDeviceSpec::default());
    let id = match open_one_queue(&mut env) {
        Ok(id) => id,
        Err(fail) => return fail,
    };
    let gve = probed_device(id).unwrap_or_else(|| unreachable!());
    let ring = match gve.rx_ring(0) {
        Some(ring) => ring,
        None => return gvnic_lib::fail!("no rx ring"),
    };

    let frame = eth_frame(100);
    env.device(|dev| dev.rx_inject(0, &frame, RXF_IPV4 | RXF_TCP, 0x1234, 0xabcd_ef01));
    ring.clean_done(gve.doorbell_array(), 64, rx_features(), DevIndex(0));

    let packets = env.take_rx_packets();
    assert_eq_test!(packets.len(), 1);
    let pkt = &packets[0];
    assert_test!(!pkt.is_frag(), "small packets are copied");
    assert_eq_test!(pkt.len(), 100);
    assert_eq_test!(pkt.protocol(), 0x0800, "ethertype decoded");
    assert_eq_test!(pkt.rx_csum(), RxChecksum::Complete(0x1234));
    assert_eq_test!(pkt.rx_hash(), Some((0xabcd_ef01, RxHashType::L4)));
    assert_eq_test!(ring.rx_copied(), 1);
    pass!()
}

pub fn test_rx_page_flip() -> TestResult {
    let mut env = setup(FakeDeviceSpec::default());
    let id = match open_one_queue(&mut env) {
        Ok(id) => id,
        Err(fail) => return fail,
    };
    let gve = probed_device(id).unwrap_or_else(|| unreachable!());
    let ring = match gve.rx_ring(0) {
        Some(ring) => ring,
        None => return gvnic_lib::fail!("no rx ring"),
    };

    // Slot i starts at QPL offset i * 4096; six packets land in slots 0-5.
    let frame = eth_frame(900);
    for _ in 0..6 {
        env.device(|dev| dev.rx_inject(0, &frame, RXF_IPV4 | RXF_TCP, 0, 0));
    }
    ring.clean_done(gve.doorbell_array(), 64, rx_features(), DevIndex(0));

    let packets = env.take_rx_packets();
    assert_eq_test!(packets.len(), 6);
    for pkt in &packets {
        assert_test!(pkt.is_frag(), "large packets are handed up zero-copy");
        assert_eq_test!(pkt.len(), 900);
        assert_eq_test!(pkt.truesize(), 2048, "half a page per buffer");
    }

    // Every consumed slot flipped to the other half of its page.
    assert_eq_test!(ring.data_slot_offset(0), 2048);
    assert_eq_test!(ring.data_slot_offset(5), 5 * 4096 + 2048);
    assert_eq_test!(ring.rx_frags(), 6);
    pass!()
}

pub fn test_rx_flip_falls_back_to_copy_while_half_held() -> TestResult {
    let mut env = setup(FakeDeviceSpec::small_rx());
    let id = match open_one_queue(&mut env) {
        Ok(id) => id,
        Err(fail) => return fail,
    };
    let gve = probed_device(id).unwrap_or_else(|| unreachable!());
    let ring = match gve.rx_ring(0) {
        Some(ring) => ring,
        None => return gvnic_lib::fail!("no rx ring"),
    };
    let slots = ring.fill_cnt();
    assert_eq_test!(slots, 64);

    // First packet into slot 0 flips and stays held by "the stack".
    let big = eth_frame(900);
    env.device(|dev| dev.rx_inject(0, &big, RXF_IPV4 | RXF_TCP, 0, 0));
    ring.clean_done(gve.doorbell_array(), 64, rx_features(), DevIndex(0));
    let mut held = env.take_rx_packets();
    assert_eq_test!(held.len(), 1);
    assert_test!(held[0].is_frag());
    assert_eq_test!(ring.data_slot_offset(0), 2048);

    // Drive the fill position all the way around back to slot 0.
    let small = eth_frame(64);
    for _ in 0..(slots - 1) {
        env.device(|dev| dev.rx_inject(0, &small, RXF_IPV4, 0, 0));
    }
    ring.clean_done(gve.doorbell_array(), slots, rx_features(), DevIndex(0));
    assert_eq_test!(env.take_rx_packets().len(), (slots - 1) as usize);

    // Slot 0 again, but its first half is still referenced: refcount 2
    // forces the copy fallback and the slot must not flip.
    env.device(|dev| dev.rx_inject(0, &big, RXF_IPV4 | RXF_TCP, 0, 0));
    ring.clean_done(gve.doorbell_array(), 64, rx_features(), DevIndex(0));
    let packets = env.take_rx_packets();
    assert_eq_test!(packets.len(), 1);
    assert_test!(!packets[0].is_frag(), "copy fallback while half is held");
    assert_eq_test!(ring.data_slot_offset(0), 2048, "no flip on fallback");

    held.clear();
    pass!()
}

pub fn test_rx_budget_limits_one_pass() -> TestResult {
    let mut env = setup(FakeDeviceSpec::default());
    let id = match open_one_queue(&mut env) {
        Ok(id) => id,
        Err(fail) => return fail,
    };
    let gve = probed_device(id).unwrap_or_else(|| unreachable!());
    let ring = match gve.rx_ring(0) {
        Some(ring) => ring,
        None => return gvnic_lib::fail!("no rx ring"),
    };

    let frame = eth_frame(80);
    for _ in 0..5 {
        env.device(|dev| dev.rx_inject(0, &frame, RXF_IPV4, 0, 0));
    }

    let more = ring.clean_done(gve.doorbell_array(), 3, rx_features(), DevIndex(0));
    assert_test!(more, "work remains past the budget");
    assert_eq_test!(ring.cnt(), 3);

    // Peek-only poll sees the pending work without consuming it.
    assert_test!(ring.poll(gve.doorbell_array(), -1, rx_features(), DevIndex(0)));
    assert_eq_test!(ring.cnt(), 3);

    let more = ring.clean_done(gve.doorbell_array(), 64, rx_features(), DevIndex(0));
    assert_test!(!more);
    assert_eq_test!(ring.cnt(), 5);
    assert_eq_test!(env.take_rx_packets().len(), 5);
    pass!()
}

gvnic_lib::define_test_suite!(
    gve_rx,
    [
        test_rx_sequence_gating,
        test_rx_copybreak_copy_with_metadata,
        test_rx_page_flip,
        test_rx_flip_falls_back_to_copy_while_half_held,
        test_rx_budget_limits_one_pass,
    ]
);
