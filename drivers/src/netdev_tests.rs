//! NetDevice registry and handle tests.

extern crate alloc;

use alloc::boxed::Box;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use gvnic_abi::net::UserChannels;
use gvnic_lib::testing::TestResult;
use gvnic_lib::{assert_eq_test, assert_test, pass};

use crate::net::netdev::*;
use crate::net::packetbuf::PacketBuf;
use crate::net::pool::PACKET_POOL;
use crate::net::types::{MacAddr, NetError};

// =============================================================================
// Mock device
// =============================================================================

/// A minimal in-memory device for registry and handle tests, using the
/// same interior-mutability shape real drivers do.
struct MockNetDevice {
    mac_addr: MacAddr,
    dev_mtu: AtomicU64,
    feats: NetDeviceFeatures,
    tx_count: AtomicU64,
    up: AtomicBool,
    resets: AtomicU64,
}

impl MockNetDevice {
    fn new(mac: MacAddr, mtu: u16) -> Self {
        Self {
            mac_addr: mac,
            dev_mtu: AtomicU64::new(mtu as u64),
            feats: NetDeviceFeatures::CHECKSUM_TX | NetDeviceFeatures::SG,
            tx_count: AtomicU64::new(0),
            up: AtomicBool::new(false),
            resets: AtomicU64::new(0),
        }
    }
}

impl NetDevice for MockNetDevice {
    fn start_xmit(&self, queue: u16, _pkt: PacketBuf, _more: bool) -> Result<(), NetError> {
        if queue != 0 {
            return Err(NetError::InvalidArgument);
        }
        self.tx_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn open(&self) -> Result<(), NetError> {
        self.up.store(true, Ordering::Release);
        Ok(())
    }

    fn stop(&self) -> Result<(), NetError> {
        self.up.store(false, Ordering::Release);
        Ok(())
    }

    fn get_stats(&self) -> NetDeviceStats {
        // The mock smuggles its state into spare counters so tests can
        // observe control operations through the trait surface alone.
        NetDeviceStats {
            tx_packets: self.tx_count.load(Ordering::Relaxed),
            rx_packets: self.up.load(Ordering::Acquire) as u64,
            tx_dropped: self.resets.load(Ordering::Relaxed),
            ..NetDeviceStats::new()
        }
    }

    fn change_mtu(&self, mtu: u16) -> Result<(), NetError> {
        if mtu < 68 {
            return Err(NetError::InvalidArgument);
        }
        self.dev_mtu.store(mtu as u64, Ordering::Relaxed);
        Ok(())
    }

    fn mtu(&self) -> u16 {
        self.dev_mtu.load(Ordering::Relaxed) as u16
    }

    fn mac(&self) -> MacAddr {
        self.mac_addr
    }

    fn features(&self) -> NetDeviceFeatures {
        self.feats
    }

    fn channels(&self) -> UserChannels {
        UserChannels {
            max_tx: 4,
            max_rx: 4,
            tx_count: 1,
            rx_count: 1,
        }
    }

    fn set_channels(&self, channels: UserChannels) -> Result<(), NetError> {
        if channels.tx_count == 0 || channels.tx_count > 4 {
            return Err(NetError::InvalidArgument);
        }
        Ok(())
    }

    fn trigger_reset(&self) {
        self.resets.fetch_add(1, Ordering::Relaxed);
    }
}

fn mac(last: u8) -> MacAddr {
    MacAddr::from_bytes([0x02, 0, 0, 0, 0, last])
}

// =============================================================================
// Tests
// =============================================================================

pub fn test_registry_register_and_unregister() -> TestResult {
    let handle = match DEVICE_REGISTRY.register(Box::new(MockNetDevice::new(mac(0x11), 1500))) {
        Some(handle) => handle,
        None => return gvnic_lib::fail!("registry full"),
    };
    assert_eq_test!(handle.mac(), mac(0x11));
    assert_test!(DEVICE_REGISTRY.device_count() >= 1);

    assert_test!(DEVICE_REGISTRY.unregister(handle.index()));
    assert_test!(
        !DEVICE_REGISTRY.unregister(handle.index()),
        "slot already empty"
    );
    pass!()
}

pub fn test_handle_forwards_data_and_control() -> TestResult {
    PACKET_POOL.init();
    let handle = match DEVICE_REGISTRY.register(Box::new(MockNetDevice::new(mac(0x22), 1500))) {
        Some(handle) => handle,
        None => return gvnic_lib::fail!("registry full"),
    };

    assert_test!(handle.open().is_ok());
    assert_eq_test!(handle.stats().rx_packets, 1, "mock reports itself up");

    let pkt = match PacketBuf::alloc() {
        Some(pkt) => pkt,
        None => return gvnic_lib::fail!("pool exhausted"),
    };
    assert_test!(handle.start_xmit(0, pkt, false).is_ok());

    let pkt = match PacketBuf::alloc() {
        Some(pkt) => pkt,
        None => return gvnic_lib::fail!("pool exhausted"),
    };
    assert_eq_test!(
        handle.start_xmit(7, pkt, false).err(),
        Some(NetError::InvalidArgument),
        "queue index validated by the device"
    );

    assert_eq_test!(handle.stats().tx_packets, 1);

    assert_test!(handle.change_mtu(9000).is_ok());
    assert_eq_test!(handle.mtu(), 9000);
    assert_eq_test!(handle.change_mtu(10).err(), Some(NetError::InvalidArgument));

    assert_test!(handle.features().contains(NetDeviceFeatures::CHECKSUM_TX));
    assert_eq_test!(handle.channels().max_tx, 4);
    assert_test!(handle.set_channels(handle.channels()).is_ok());
    handle.trigger_reset();
    assert_eq_test!(handle.stats().tx_dropped, 1, "reset observed by the mock");
    assert_test!(handle.stop().is_ok());
    assert_eq_test!(handle.stats().rx_packets, 0, "mock reports itself down");

    DEVICE_REGISTRY.unregister(handle.index());
    pass!()
}

pub fn test_registry_enumerates_registered_devices() -> TestResult {
    let a = match DEVICE_REGISTRY.register(Box::new(MockNetDevice::new(mac(0x31), 1500))) {
        Some(handle) => handle,
        None => return gvnic_lib::fail!("registry full"),
    };
    let b = match DEVICE_REGISTRY.register(Box::new(MockNetDevice::new(mac(0x32), 1500))) {
        Some(handle) => handle,
        None => return gvnic_lib::fail!("registry full"),
    };

    let listed = DEVICE_REGISTRY.enumerate();
    assert_test!(listed.iter().any(|(i, m)| *i == a.index() && *m == mac(0x31)));
    assert_test!(listed.iter().any(|(i, m)| *i == b.index() && *m == mac(0x32)));

    DEVICE_REGISTRY.unregister(a.index());
    DEVICE_REGISTRY.unregister(b.index());
    pass!()
}

gvnic_lib::define_test_suite!(
    netdev,
    [
        test_registry_register_and_unregister,
        test_handle_forwards_data_and_control,
        test_registry_enumerates_registered_devices,
    ]
);
