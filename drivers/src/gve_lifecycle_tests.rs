//! Lifecycle and reset-machine tests: probe limits, open/close round
//! trips, queue adjustment, and the three reset severities.

use gvnic_lib::testing::TestResult;
use gvnic_lib::{assert_eq_test, assert_test, pass};

use crate::gve::adminq::{
    OPCODE_CONFIGURE_DEVICE_RESOURCES, OPCODE_CREATE_TX_QUEUE, STATUS_INVALID_ARGUMENT,
};
use crate::gve::driver::{
    QueueConfig, ServiceFlags, StateFlags, gve_service_task, probed_device,
};
use crate::gve_test_fixtures::{FakeDeviceSpec, setup};
use crate::gve_tx_tests::tcp_packet;

pub fn test_probe_reads_device_limits() -> TestResult {
    let mut spec = FakeDeviceSpec::default();
    spec.msix_vectors = 34;
    let mut env = setup(spec);

    let id = match env.probe() {
        Ok(id) => id,
        Err(e) => return gvnic_lib::fail!("probe failed: {}", e),
    };
    let gve = match probed_device(id) {
        Some(gve) => gve,
        None => return gvnic_lib::fail!("probed device not found"),
    };

    let desc = gve.device_descriptor();
    assert_eq_test!(desc.mtu, 1460);
    assert_eq_test!(desc.counters, 64);

    // One block per data vector; queues split the blocks between the
    // directions and are bounded by the device's max-queue registers.
    assert_eq_test!(gve.num_ntfy_blks(), 33);
    let (tx_cfg, rx_cfg) = gve.queue_config();
    assert_eq_test!(tx_cfg.max_queues, 16);
    assert_eq_test!(rx_cfg.max_queues, 16);
    assert_eq_test!(tx_cfg.num_queues, 1, "default queue count");
    assert_eq_test!(rx_cfg.num_queues, 1);

    assert_test!(!gve.is_up(), "probe leaves the link down");
    assert_test!(gve.state_flags().contains(StateFlags::ADMIN_QUEUE_OK));
    assert_test!(gve.state_flags().contains(StateFlags::DEVICE_RESOURCES_OK));
    assert_test!(!gve.state_flags().contains(StateFlags::DEVICE_RINGS_OK));
    assert_test!(!gve.service_flags().contains(ServiceFlags::PROBE_IN_PROGRESS));
    pass!()
}

pub fn test_open_close_roundtrip_restores_counters() -> TestResult {
    let mut env = setup(FakeDeviceSpec::default());
    let id = match env.probe() {
        Ok(id) => id,
        Err(e) => return gvnic_lib::fail!("probe failed: {}", e),
    };
    let gve = probed_device(id).unwrap_or_else(|| unreachable!());

    assert_test!(gve.open().is_ok(), "open");
    assert_test!(gve.is_up());
    assert_test!(gve.state_flags().contains(StateFlags::DEVICE_RINGS_OK));
    assert_test!(gve.state_flags().contains(StateFlags::NAPI_ENABLED));
    assert_eq_test!(env.device(|dev| dev.tx_queue_count()), 1);
    assert_eq_test!(env.device(|dev| dev.rx_queue_count()), 1);
    assert_eq_test!(
        env.device(|dev| dev.rx_doorbell(0)),
        128,
        "prefilled buffers handed to the device at open"
    );

    // Push one packet through so the counters move.
    let ring = match gve.tx_ring(0) {
        Some(ring) => ring,
        None => return gvnic_lib::fail!("no tx ring"),
    };
    let fifo_size = ring.fifo().size();
    assert_test!(
        ring.transmit(gve.doorbell_array(), true, tcp_packet(500), false)
            .is_ok()
    );
    env.device(|dev| dev.complete_tx(0));
    ring.poll(64, true);
    assert_eq_test!(ring.req(), 1);
    drop(ring);

    // The statistics surface covers aggregates plus one entry set per
    // queue, with names user tooling recognizes.
    let report = gve.stats_report();
    assert_eq_test!(report.tx.len(), 1);
    assert_eq_test!(report.rx.len(), 1);
    assert_eq_test!(report.main.tx_packets, 1);
    assert_eq_test!(report.main.tx_bytes, 500);
    assert_eq_test!(report.tx[0].event_counter, 1);
    let names = report.stat_names();
    assert_eq_test!(names.len(), 6 + 2 + 5);
    assert_test!(names.iter().any(|n| n == "tx_event_counter[0]"));
    assert_test!(names.iter().any(|n| n == "rx_desc_fill_cnt[0]"));

    gve.close();
    assert_test!(!gve.is_up());
    assert_test!(gve.tx_ring(0).is_none(), "rings freed on close");
    assert_eq_test!(env.device(|dev| dev.tx_queue_count()), 0);
    assert_eq_test!(env.device(|dev| dev.rx_queue_count()), 0);

    // Reopening lands every per-queue counter back at its post-init value.
    assert_test!(gve.open().is_ok(), "reopen");
    let ring = match gve.tx_ring(0) {
        Some(ring) => ring,
        None => return gvnic_lib::fail!("no tx ring after reopen"),
    };
    assert_eq_test!(ring.req(), 0);
    assert_eq_test!(ring.done(), 0);
    assert_eq_test!(ring.fifo().available(), fifo_size);
    let rx = match gve.rx_ring(0) {
        Some(rx) => rx,
        None => return gvnic_lib::fail!("no rx ring after reopen"),
    };
    assert_eq_test!(rx.cnt(), 0);
    assert_eq_test!(rx.fill_cnt(), 128);
    assert_eq_test!(rx.expected_seqno(), 1);
    pass!()
}

pub fn test_adjust_queues_up_and_down() -> TestResult {
    let mut spec = FakeDeviceSpec::default();
    spec.msix_vectors = 10;
    spec.descriptor.default_num_queues = 2;
    let mut env = setup(spec);

    let id = match env.probe() {
        Ok(id) => id,
        Err(e) => return gvnic_lib::fail!("probe failed: {}", e),
    };
    let gve = probed_device(id).unwrap_or_else(|| unreachable!());
    assert_test!(gve.open().is_ok());

    let (tx_cfg, rx_cfg) = gve.queue_config();
    assert_eq_test!(tx_cfg.num_queues, 2);
    assert_eq_test!(rx_cfg.num_queues, 2);
    assert_test!(gve.tx_ring(1).is_some());
    assert_eq_test!(env.device(|dev| dev.tx_queue_count()), 2);

    // Shrinking while up bounces the link through close/open.
    let one_tx = QueueConfig {
        max_queues: tx_cfg.max_queues,
        num_queues: 1,
    };
    let one_rx = QueueConfig {
        max_queues: rx_cfg.max_queues,
        num_queues: 1,
    };
    assert_test!(gve.adjust_queues(one_tx, one_rx).is_ok());
    assert_test!(gve.is_up(), "link restored after adjust");
    assert_test!(gve.tx_ring(1).is_none());
    assert_eq_test!(env.device(|dev| dev.tx_queue_count()), 1);

    // Adjusting while down only records the configuration.
    gve.close();
    let two_tx = QueueConfig {
        max_queues: tx_cfg.max_queues,
        num_queues: 2,
    };
    let two_rx = QueueConfig {
        max_queues: rx_cfg.max_queues,
        num_queues: 2,
    };
    assert_test!(gve.adjust_queues(two_tx, two_rx).is_ok());
    assert_test!(!gve.is_up());
    assert_test!(gve.tx_ring(0).is_none());
    let (tx_cfg, rx_cfg) = gve.queue_config();
    assert_eq_test!(tx_cfg.num_queues, 2);
    assert_eq_test!(rx_cfg.num_queues, 2);
    pass!()
}

pub fn test_device_requested_reset_recovers_link() -> TestResult {
    let mut env = setup(FakeDeviceSpec::default());
    let id = match env.probe() {
        Ok(id) => id,
        Err(e) => return gvnic_lib::fail!("probe failed: {}", e),
    };
    let gve = probed_device(id).unwrap_or_else(|| unreachable!());
    assert_test!(gve.open().is_ok());

    // Device raises its reset bit; the service task notices and runs the
    // full bus-level reset, then restores the link.
    env.device(|dev| dev.request_reset());
    gve_service_task(id);

    assert_test!(gve.is_up(), "link restored after device-requested reset");
    assert_test!(!gve.service_flags().contains(ServiceFlags::DO_PCI_RESET));
    assert_test!(!gve.service_flags().contains(ServiceFlags::RESET_IN_PROGRESS));
    assert_eq_test!(env.device(|dev| dev.tx_queue_count()), 1);
    assert_eq_test!(env.device(|dev| dev.rx_queue_count()), 1);

    // A full reset starts the world over.
    let ring = match gve.tx_ring(0) {
        Some(ring) => ring,
        None => return gvnic_lib::fail!("no tx ring after reset"),
    };
    assert_eq_test!(ring.req(), 0);
    assert_eq_test!(ring.pkt_done_count(), 0);
    pass!()
}

pub fn test_admin_timeout_escalates_and_recovers() -> TestResult {
    let mut env = setup(FakeDeviceSpec::default());
    let id = match env.probe() {
        Ok(id) => id,
        Err(e) => return gvnic_lib::fail!("probe failed: {}", e),
    };
    let gve = probed_device(id).unwrap_or_else(|| unreachable!());
    assert_test!(gve.open().is_ok());

    // Wedge the admin queue, then ask for an orderly reset: the destroy
    // command times out and escalates to an admin-queue reset request.
    env.device(|dev| dev.stall_adminq = true);
    gve.user_reset();
    assert_test!(!gve.is_up(), "link stays down after failed user reset");
    assert_test!(gve.service_flags().contains(ServiceFlags::DO_AQ_RESET));
    assert_test!(gve.service_flags().contains(ServiceFlags::DEVICE_WAS_UP));

    // Device comes back; the scheduled admin-queue reset runs and restores
    // the link with the still-allocated rings.
    env.device(|dev| dev.stall_adminq = false);
    gve_service_task(id);
    assert_test!(gve.is_up(), "admin-queue reset restored the link");
    assert_test!(!gve.service_flags().contains(ServiceFlags::DO_AQ_RESET));

    // Datapath works again end to end.
    let ring = match gve.tx_ring(0) {
        Some(ring) => ring,
        None => return gvnic_lib::fail!("no tx ring after recovery"),
    };
    assert_test!(
        ring.transmit(gve.doorbell_array(), true, tcp_packet(400), false)
            .is_ok()
    );
    env.device(|dev| dev.complete_tx(0));
    ring.poll(64, true);
    assert_eq_test!(ring.pkt_done_count(), 1);
    pass!()
}

pub fn test_open_failure_schedules_aq_reset() -> TestResult {
    let mut env = setup(FakeDeviceSpec::default());
    let id = match env.probe() {
        Ok(id) => id,
        Err(e) => return gvnic_lib::fail!("probe failed: {}", e),
    };
    let gve = probed_device(id).unwrap_or_else(|| unreachable!());

    env.device(|dev| dev.fail_opcode = Some((OPCODE_CREATE_TX_QUEUE, STATUS_INVALID_ARGUMENT)));
    assert_test!(gve.open().is_err(), "open fails when queue creation fails");
    assert_test!(!gve.is_up());
    assert_test!(gve.service_flags().contains(ServiceFlags::DO_AQ_RESET));

    // The service task clears the backlog; a later open succeeds.
    gve_service_task(id);
    assert_test!(!gve.service_flags().contains(ServiceFlags::DO_AQ_RESET));
    assert_test!(gve.open().is_ok(), "open succeeds after recovery");
    assert_test!(gve.is_up());
    pass!()
}

pub fn test_user_reset_rebuild_failure_escalates_to_pci() -> TestResult {
    let mut env = setup(FakeDeviceSpec::default());
    let id = match env.probe() {
        Ok(id) => id,
        Err(e) => return gvnic_lib::fail!("probe failed: {}", e),
    };
    let gve = probed_device(id).unwrap_or_else(|| unreachable!());
    assert_test!(gve.open().is_ok());

    // Teardown succeeds, but reconfiguring after the admin queue has been
    // rebuilt fails.  An admin-queue reset would just repeat that step, so
    // the escalation target is the PCI reset.
    env.device(|dev| {
        dev.fail_opcode = Some((OPCODE_CONFIGURE_DEVICE_RESOURCES, STATUS_INVALID_ARGUMENT))
    });
    gve.user_reset();
    assert_test!(!gve.is_up(), "link stays down after failed user reset");
    assert_test!(gve.service_flags().contains(ServiceFlags::DO_PCI_RESET));
    assert_test!(!gve.service_flags().contains(ServiceFlags::DO_AQ_RESET));
    assert_test!(gve.service_flags().contains(ServiceFlags::DEVICE_WAS_UP));

    // The scheduled PCI reset rebuilds the world and restores the link.
    gve_service_task(id);
    assert_test!(gve.is_up(), "pci reset restored the link");
    assert_test!(!gve.service_flags().contains(ServiceFlags::DO_PCI_RESET));
    assert_eq_test!(env.device(|dev| dev.tx_queue_count()), 1);
    pass!()
}

pub fn test_user_reset_on_healthy_device() -> TestResult {
    let mut env = setup(FakeDeviceSpec::default());
    let id = match env.probe() {
        Ok(id) => id,
        Err(e) => return gvnic_lib::fail!("probe failed: {}", e),
    };
    let gve = probed_device(id).unwrap_or_else(|| unreachable!());
    assert_test!(gve.open().is_ok());

    let ring = match gve.tx_ring(0) {
        Some(ring) => ring,
        None => return gvnic_lib::fail!("no tx ring"),
    };
    assert_test!(
        ring.transmit(gve.doorbell_array(), true, tcp_packet(300), false)
            .is_ok()
    );
    drop(ring);

    gve.user_reset();
    assert_test!(gve.is_up(), "healthy user reset keeps the link up");
    assert_test!(!gve.service_flags().contains(ServiceFlags::DO_AQ_RESET));
    assert_test!(!gve.service_flags().contains(ServiceFlags::DO_PCI_RESET));

    let ring = match gve.tx_ring(0) {
        Some(ring) => ring,
        None => return gvnic_lib::fail!("no tx ring after reset"),
    };
    assert_eq_test!(ring.req(), 0, "queues quiesced across the reset");
    pass!()
}

gvnic_lib::define_test_suite!(
    gve_lifecycle,
    [
        test_probe_reads_device_limits,
        test_open_close_roundtrip_restores_counters,
        test_adjust_queues_up_and_down,
        test_device_requested_reset_recovers_link,
        test_admin_timeout_escalates_and_recovers,
        test_open_failure_schedules_aq_reset,
        test_user_reset_rebuild_failure_escalates_to_pci,
        test_user_reset_on_healthy_device,
    ]
);
