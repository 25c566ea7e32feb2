//! User-facing NIC records shared across the driver boundary.

/// Channel (queue) configuration, mirroring the `ethtool --set-channels`
/// shape: independent TX/RX counts bounded by per-direction maxima.
#[repr(C)]
#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
pub struct UserChannels {
    pub max_tx: u32,
    pub max_rx: u32,
    pub tx_count: u32,
    pub rx_count: u32,
}
