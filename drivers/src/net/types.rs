//! Type-safe primitives for the network-device boundary.
//!
//! Newtypes keep device indices, MAC addresses, and protocol metadata from
//! collapsing into bare integers at the driver/stack seam.  Everything here
//! is `no_std` and zero-cost.

use core::fmt;

// =============================================================================
// Addresses and indices
// =============================================================================

/// Hardware MAC address.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const ZERO: Self = Self([0; 6]);

    #[inline]
    pub const fn from_bytes(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub const fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }

    /// `true` for the all-zero address, which no real NIC reports.
    #[inline]
    pub fn is_zero(&self) -> bool {
        self.0 == [0; 6]
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

/// Index of a registered network device.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct DevIndex(pub usize);

impl fmt::Display for DevIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev{}", self.0)
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Errors surfaced across the driver/stack boundary.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum NetError {
    /// Transmit resources are exhausted; retry after a completion.
    Busy,
    /// No buffer space (pool exhausted, frame too large for a buffer).
    NoBufferSpace,
    /// Caller error: bad queue index, out-of-range MTU, malformed request.
    InvalidArgument,
    /// The device is not up (link down, not probed, mid-reset).
    NotReady,
    /// The device cannot do what was asked.
    Unsupported,
}

impl fmt::Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NetError::Busy => "busy",
            NetError::NoBufferSpace => "no buffer space",
            NetError::InvalidArgument => "invalid argument",
            NetError::NotReady => "not ready",
            NetError::Unsupported => "unsupported",
        };
        f.write_str(s)
    }
}

// =============================================================================
// Receive metadata
// =============================================================================

/// Checksum state the driver attaches to a received packet.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum RxChecksum {
    /// The device reported nothing; the stack must verify in software.
    #[default]
    None,
    /// The device supplied the ones-complement sum over the whole packet.
    Complete(u16),
}

/// What the receive hash covers, mirroring the device's flow classification.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RxHashType {
    L2,
    L3,
    L4,
}
