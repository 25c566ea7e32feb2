//! Notification-block poll-loop tests: NAPI state machine, IRQ ack/rearm
//! protocol, budget-driven rerun, and the mask-on-late-work rule.

use gvnic_lib::testing::TestResult;
use gvnic_lib::{assert_eq_test, assert_test, pass};

use crate::gve::desc::{IRQ_ACK, IRQ_EVENT, IRQ_MASK, RXF_IPV4};
use crate::gve::driver::{gve_data_intr, probed_device, test_hooks};
use crate::gve_test_fixtures::{FakeDeviceSpec, setup, with_fake_device};
use crate::net::napi::{NapiContext, NapiState};

/// The RX block of a 3-block device (blocks split TX low / RX high).
const RX_BLOCK: u32 = 1;

pub fn test_napi_state_machine() -> TestResult {
    let ctx = NapiContext::new(4);
    assert_eq_test!(ctx.state(), NapiState::Disabled, "blocks start disabled");
    assert_test!(!ctx.schedule(), "cannot schedule a disabled block");

    ctx.enable();
    assert_eq_test!(ctx.state(), NapiState::Idle);
    assert_test!(ctx.schedule());
    assert_eq_test!(ctx.state(), NapiState::Scheduled);
    assert_test!(!ctx.schedule(), "double schedule is absorbed");

    assert_test!(ctx.begin_poll());
    assert_eq_test!(ctx.state(), NapiState::Polling);
    assert_test!(!ctx.begin_poll(), "single poller wins the claim");

    ctx.complete();
    assert_eq_test!(ctx.state(), NapiState::Idle);

    ctx.disable();
    assert_eq_test!(ctx.state(), NapiState::Disabled);
    pass!()
}

pub fn test_poll_completes_and_acks_interrupt() -> TestResult {
    let mut env = setup(FakeDeviceSpec::default());
    let id = match env.probe() {
        Ok(id) => id,
        Err(e) => return gvnic_lib::fail!("probe failed: {}", e),
    };
    let gve = probed_device(id).unwrap_or_else(|| unreachable!());
    assert_test!(gve.open().is_ok());

    let mut frame = alloc::vec![0u8; 100];
    frame[12] = 0x08;
    env.device(|dev| dev.rx_inject(0, &frame, RXF_IPV4, 0, 0));

    // IRQ schedules the block; the kicked poll drains it and rearms.
    gve_data_intr(id, RX_BLOCK);
    let block = match gve.notify_block(RX_BLOCK) {
        Some(block) => block,
        None => return gvnic_lib::fail!("missing rx block"),
    };
    assert_eq_test!(block.napi().state(), NapiState::Scheduled);

    gve.napi_poll_entry(RX_BLOCK);
    assert_eq_test!(block.napi().state(), NapiState::Idle);
    assert_eq_test!(env.take_rx_packets().len(), 1);

    let irq_db = env.device(|dev| dev.irq_db_indices[RX_BLOCK as usize]);
    assert_eq_test!(
        env.device(|dev| dev.doorbell(irq_db)),
        IRQ_ACK | IRQ_EVENT,
        "completion acks and rearms the vector"
    );
    pass!()
}

pub fn test_poll_reruns_until_budget_satisfied() -> TestResult {
    let mut env = setup(FakeDeviceSpec::default());
    let id = match env.probe() {
        Ok(id) => id,
        Err(e) => return gvnic_lib::fail!("probe failed: {}", e),
    };
    let gve = probed_device(id).unwrap_or_else(|| unreachable!());
    assert_test!(gve.open().is_ok());

    let mut frame = alloc::vec![0u8; 80];
    frame[12] = 0x08;
    for _ in 0..3 {
        env.device(|dev| dev.rx_inject(0, &frame, RXF_IPV4, 0, 0));
    }

    gve_data_intr(id, RX_BLOCK);
    let block = match gve.notify_block(RX_BLOCK) {
        Some(block) => block,
        None => return gvnic_lib::fail!("missing rx block"),
    };
    assert_test!(block.napi().begin_poll());

    // A too-small budget asks to be re-entered; the second pass finishes.
    assert_eq_test!(gve.block_poll(&block, 2), 2, "work past the budget");
    assert_eq_test!(block.napi().state(), NapiState::Polling);
    assert_eq_test!(gve.block_poll(&block, 64), 0, "second pass completes");
    assert_eq_test!(block.napi().state(), NapiState::Idle);
    assert_eq_test!(env.take_rx_packets().len(), 3);
    pass!()
}

fn inject_late_frame() {
    let mut frame = alloc::vec![0u8; 90];
    frame[12] = 0x08;
    let _ = with_fake_device(|dev| dev.rx_inject(0, &frame, RXF_IPV4, 0, 0));
}

pub fn test_late_work_masks_vector_and_reschedules() -> TestResult {
    let mut env = setup(FakeDeviceSpec::default());
    let id = match env.probe() {
        Ok(id) => id,
        Err(e) => return gvnic_lib::fail!("probe failed: {}", e),
    };
    let gve = probed_device(id).unwrap_or_else(|| unreachable!());
    assert_test!(gve.open().is_ok());

    let block = match gve.notify_block(RX_BLOCK) {
        Some(block) => block,
        None => return gvnic_lib::fail!("missing rx block"),
    };

    // No work yet; a descriptor lands between the IRQ ack and the
    // completion re-check.
    gve_data_intr(id, RX_BLOCK);
    assert_test!(block.napi().begin_poll());
    test_hooks::set_post_ack(inject_late_frame);
    let again = gve.block_poll(&block, 64);
    test_hooks::clear_post_ack();

    assert_eq_test!(again, 0);
    let irq_db = env.device(|dev| dev.irq_db_indices[RX_BLOCK as usize]);
    assert_eq_test!(
        env.device(|dev| dev.doorbell(irq_db)),
        IRQ_MASK,
        "late work leaves the vector masked"
    );
    assert_eq_test!(
        block.napi().state(),
        NapiState::Scheduled,
        "poll rescheduled for the late descriptor"
    );

    // The rescheduled poll picks the packet up and rearms.
    gve.napi_poll_entry(RX_BLOCK);
    assert_eq_test!(env.take_rx_packets().len(), 1);
    assert_eq_test!(env.device(|dev| dev.doorbell(irq_db)), IRQ_ACK | IRQ_EVENT);
    pass!()
}

gvnic_lib::define_test_suite!(
    napi,
    [
        test_napi_state_machine,
        test_poll_completes_and_acks_interrupt,
        test_poll_reruns_until_budget_satisfied,
        test_late_work_masks_vector_and_reschedules,
    ]
);
