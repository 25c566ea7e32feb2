//! Per-queue statistics snapshots, named after the counters user tooling
//! expects.

use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use crate::net::netdev::NetDeviceStats;

/// Aggregate counter names, in report order.
pub const MAIN_STAT_NAMES: [&str; 6] = [
    "rx_packets",
    "tx_packets",
    "rx_bytes",
    "tx_bytes",
    "rx_dropped",
    "tx_dropped",
];

/// Snapshot of one TX queue.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TxQueueStats {
    pub req: u32,
    pub done: u32,
    pub wake: u64,
    pub stop: u64,
    /// Raw device event counter at snapshot time.
    pub event_counter: u32,
}

/// Snapshot of one RX queue.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RxQueueStats {
    pub desc_cnt: u32,
    pub desc_fill_cnt: u32,
}

/// Full statistics report: aggregate counters plus per-queue detail.
#[derive(Clone, Debug, Default)]
pub struct StatsReport {
    pub main: NetDeviceStats,
    pub tx: Vec<TxQueueStats>,
    pub rx: Vec<RxQueueStats>,
}

impl StatsReport {
    /// Names for every value in the report, aggregate first, then RX and
    /// TX queues in index order.
    pub fn stat_names(&self) -> Vec<String> {
        let mut names: Vec<String> = MAIN_STAT_NAMES.iter().map(|s| String::from(*s)).collect();
        for i in 0..self.rx.len() {
            names.push(format!("rx_desc_cnt[{i}]"));
            names.push(format!("rx_desc_fill_cnt[{i}]"));
        }
        for i in 0..self.tx.len() {
            names.push(format!("tx_req[{i}]"));
            names.push(format!("tx_done[{i}]"));
            names.push(format!("tx_wake[{i}]"));
            names.push(format!("tx_stop[{i}]"));
            names.push(format!("tx_event_counter[{i}]"));
        }
        names
    }
}
