//! Admin-queue tests against the software device model: command execution,
//! status translation, and the timeout path.

use gvnic_lib::testing::TestResult;
use gvnic_lib::{assert_eq_test, assert_test, pass};

use crate::gve::GveError;
use crate::gve::adminq::{
    self, AdminQueue, OPCODE_DESCRIBE_DEVICE, STATUS_INVALID_ARGUMENT, STATUS_PASSED,
    STATUS_RESOURCE_EXHAUSTED, STATUS_UNAVAILABLE, STATUS_UNIMPLEMENTED, STATUS_UNSET,
};
use crate::gve::regs::GveRegisters;
use crate::gve_test_fixtures::{FakeDeviceSpec, setup};

pub fn test_adminq_status_translation() -> TestResult {
    assert_eq_test!(adminq::parse_status(STATUS_PASSED), Ok(()));
    assert_eq_test!(adminq::parse_status(STATUS_UNSET), Err(GveError::Invalid));
    assert_eq_test!(
        adminq::parse_status(STATUS_UNAVAILABLE),
        Err(GveError::Transient)
    );
    assert_eq_test!(
        adminq::parse_status(adminq::STATUS_ABORTED),
        Err(GveError::Transient)
    );
    assert_eq_test!(
        adminq::parse_status(STATUS_INVALID_ARGUMENT),
        Err(GveError::Invalid)
    );
    assert_eq_test!(
        adminq::parse_status(adminq::STATUS_DEADLINE_EXCEEDED),
        Err(GveError::Timeout)
    );
    assert_eq_test!(
        adminq::parse_status(adminq::STATUS_PERMISSION_DENIED),
        Err(GveError::AccessDenied)
    );
    assert_eq_test!(
        adminq::parse_status(STATUS_RESOURCE_EXHAUSTED),
        Err(GveError::OutOfMemory)
    );
    assert_eq_test!(
        adminq::parse_status(STATUS_UNIMPLEMENTED),
        Err(GveError::Unsupported)
    );
    pass!()
}

pub fn test_adminq_describe_device() -> TestResult {
    let env = setup(FakeDeviceSpec::default());
    let regs = env.device(|dev| GveRegisters::new(dev.pci_info().bars[0]));

    let mut aq = match AdminQueue::alloc(&regs) {
        Ok(aq) => aq,
        Err(_) => return gvnic_lib::fail!("adminq alloc"),
    };

    let desc = match aq.describe_device(&regs) {
        Ok(desc) => desc,
        Err(e) => return gvnic_lib::fail!("describe failed: {}", e),
    };

    assert_eq_test!(desc.mtu, 1460);
    assert_eq_test!(desc.counters, 64);
    assert_eq_test!(desc.tx_queue_entries, 256);
    assert_eq_test!(desc.rx_queue_entries, 512);
    assert_eq_test!(desc.default_num_queues, 1);
    assert_eq_test!(desc.max_registered_pages, 4096);
    assert_eq_test!(
        desc.mac.as_bytes(),
        &[0x02, 0x00, 0x00, 0x00, 0x00, 0x01]
    );

    assert_eq_test!(aq.produced(), 1);
    assert_eq_test!(regs.adminq_event_counter(), 1, "device caught up");

    aq.release(&regs);
    pass!()
}

pub fn test_adminq_caps_pages_per_qpl() -> TestResult {
    let mut spec = FakeDeviceSpec::default();
    spec.descriptor.tx_pages_per_qpl = 2048;
    spec.descriptor.rx_pages_per_qpl = 4096;
    let env = setup(spec);
    let regs = env.device(|dev| GveRegisters::new(dev.pci_info().bars[0]));

    let mut aq = match AdminQueue::alloc(&regs) {
        Ok(aq) => aq,
        Err(_) => return gvnic_lib::fail!("adminq alloc"),
    };
    let desc = match aq.describe_device(&regs) {
        Ok(desc) => desc,
        Err(e) => return gvnic_lib::fail!("describe failed: {}", e),
    };

    assert_eq_test!(desc.tx_pages_per_qpl, 512, "tx cap applied");
    assert_eq_test!(desc.rx_pages_per_qpl, 1024, "rx cap applied");

    aq.release(&regs);
    pass!()
}

pub fn test_adminq_device_error_status() -> TestResult {
    let env = setup(FakeDeviceSpec::default());
    env.device(|dev| dev.fail_opcode = Some((OPCODE_DESCRIBE_DEVICE, STATUS_UNAVAILABLE)));
    let regs = env.device(|dev| GveRegisters::new(dev.pci_info().bars[0]));

    let mut aq = match AdminQueue::alloc(&regs) {
        Ok(aq) => aq,
        Err(_) => return gvnic_lib::fail!("adminq alloc"),
    };

    assert_eq_test!(
        aq.describe_device(&regs).err(),
        Some(GveError::Transient),
        "transient status surfaces as retryable"
    );

    // The failure consumed the injection; the retry goes through.
    assert_test!(aq.describe_device(&regs).is_ok());

    aq.release(&regs);
    pass!()
}

pub fn test_adminq_timeout_is_unrecoverable() -> TestResult {
    let env = setup(FakeDeviceSpec::default());
    env.device(|dev| dev.stall_adminq = true);
    let regs = env.device(|dev| GveRegisters::new(dev.pci_info().bars[0]));

    let mut aq = match AdminQueue::alloc(&regs) {
        Ok(aq) => aq,
        Err(_) => return gvnic_lib::fail!("adminq alloc"),
    };

    assert_eq_test!(
        aq.describe_device(&regs).err(),
        Some(GveError::NotRecoverable),
        "a wedged admin queue demands a reset"
    );

    aq.release(&regs);
    pass!()
}

gvnic_lib::define_test_suite!(
    gve_adminq,
    [
        test_adminq_status_translation,
        test_adminq_describe_device,
        test_adminq_caps_pages_per_qpl,
        test_adminq_device_error_status,
        test_adminq_timeout_is_unrecoverable,
    ]
);
