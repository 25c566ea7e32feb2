//! gVNIC (Google virtual Ethernet) driver.
//!
//! The device is a paravirtualized NIC behind two BARs: a small register
//! window (BAR0) and a dense doorbell array (BAR2).  Control flows through a
//! single admin command queue; data moves through per-queue descriptor rings
//! over pre-registered "queue page lists" the device is allowed to DMA
//! into.  Completion signalling is asymmetric: TX uses device-published
//! event counters, RX uses a 3-bit generation sequence stamped into each
//! descriptor.
//!
//! Module map:
//!
//! * [`regs`] / [`desc`] — bit-exact register window, doorbells, and on-wire
//!   descriptor layouts.
//! * [`adminq`] — the admin command channel.
//! * [`qpl`] — queue page lists and their id allocator.
//! * [`fifo`] — the TX bounce FIFO carved out of a TX page list.
//! * [`tx`] / [`rx`] — the datapath rings.
//! * [`notify`] — notification blocks binding MSI-X vectors to rings.
//! * [`driver`] — device lifecycle, reset state machine, netdev surface.
//! * [`stats`] — per-queue statistics snapshots.

pub mod adminq;
pub mod desc;
pub mod driver;
pub mod fifo;
pub mod notify;
pub mod qpl;
pub mod regs;
pub mod rx;
pub mod stats;
pub mod tx;

use core::fmt;

/// Smallest MTU the driver will accept or configure.
pub const MIN_MTU: u16 = 68;

/// Driver-internal error classification.
///
/// Admin status codes collapse onto these; allocation failures are
/// `OutOfMemory`; an admin queue that stopped answering is
/// `NotRecoverable` and escalates to a reset.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum GveError {
    /// Worth retrying after backoff (device momentarily unable).
    Transient,
    /// The request itself is wrong; retrying cannot help.
    Invalid,
    /// The device missed its deadline.
    Timeout,
    /// The device refused on authorization grounds.
    AccessDenied,
    /// Host or device resource exhaustion.
    OutOfMemory,
    /// The device does not implement the request.
    Unsupported,
    /// The admin queue is wedged; only a reset can recover.
    NotRecoverable,
}

impl fmt::Display for GveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            GveError::Transient => "transient failure",
            GveError::Invalid => "invalid request",
            GveError::Timeout => "timed out",
            GveError::AccessDenied => "access denied",
            GveError::OutOfMemory => "out of memory",
            GveError::Unsupported => "not supported",
            GveError::NotRecoverable => "not recoverable",
        };
        f.write_str(s)
    }
}
