//! On-wire descriptor layouts.
//!
//! Structs here are written into (TX) or read out of (RX) DMA rings shared
//! with the device.  Multi-byte fields hold their big-endian wire encoding;
//! the `_be`-suffixed field names mark them, and conversion happens at the
//! point of use with `to_be`/`from_be`.  Sizes are load-bearing: the device
//! steps through rings in fixed strides.

use crate::net::types::RxHashType;

// =============================================================================
// TX descriptors
// =============================================================================

/// TX descriptor type nibbles (upper 4 bits of `type_flags`).
pub const TXD_STD: u8 = 0x00;
pub const TXD_TSO: u8 = 0x10;
pub const TXD_SEG: u8 = 0x20;

/// TX packet-descriptor flags (lower 4 bits of `type_flags`).
pub const TXF_L4CSUM: u8 = 1 << 0;
pub const TXF_TSTAMP: u8 = 1 << 2;

/// TX segment-descriptor flag: TSO over IPv6.
pub const TXSF_IPV6: u8 = 1 << 1;

/// First descriptor of every packet.  16 bytes.
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct TxPktDesc {
    pub type_flags: u8,
    /// Checksum field position, in 2-byte units from the L4 header start.
    pub checksum_offset: u8,
    /// L4 header offset, in 2-byte units from the frame start.
    pub l4_offset: u8,
    /// 1 (the header segment) + number of payload segment descriptors.
    pub seg_cnt: u8,
    /// Total packet length.
    pub len_be: u16,
    /// Length of the first (header) segment.
    pub seg_len_be: u16,
    /// QPL offset of the first segment.
    pub seg_addr_be: u64,
}

const _: () = assert!(core::mem::size_of::<TxPktDesc>() == 16);

/// Payload continuation descriptor.  16 bytes.
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct TxSegDesc {
    pub type_flags: u8,
    /// TSO only: L3 header offset in 2-byte units from the frame start.
    pub l3_offset: u8,
    pub reserved: u16,
    /// TSO segment size.
    pub mss_be: u16,
    pub seg_len_be: u16,
    pub seg_addr_be: u64,
}

const _: () = assert!(core::mem::size_of::<TxSegDesc>() == 16);

// =============================================================================
// RX descriptors
// =============================================================================

/// The device lands each packet 2 bytes into its buffer so the L3 header is
/// 4-byte aligned behind the 14-byte Ethernet header.
pub const RX_PAD: usize = 2;

/// Device-written completion descriptor.  64 bytes.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct RxDesc {
    pub padding: [u8; 48],
    pub rss_hash_be: u32,
    pub mss_be: u16,
    pub reserved: u16,
    pub hdr_len: u8,
    pub hdr_off: u8,
    /// Ones-complement sum over the packet, or 0 if the device did not
    /// compute one.
    pub csum_be: u16,
    /// Buffer bytes used, including [`RX_PAD`].
    pub len_be: u16,
    /// Protocol flags plus the 3-bit ownership sequence number.
    pub flags_seq_be: u16,
}

const _: () = assert!(core::mem::size_of::<RxDesc>() == 64);

impl Default for RxDesc {
    fn default() -> Self {
        // SAFETY: RxDesc is plain old data; all-zero is a valid value.
        unsafe { core::mem::zeroed() }
    }
}

/// One slot of the RX data ring: the QPL byte offset the device fills
/// next.  8 bytes.
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct RxDataSlot {
    pub qpl_offset_be: u64,
}

const _: () = assert!(core::mem::size_of::<RxDataSlot>() == 8);

// -- flags_seq helpers (host byte order) --------------------------------------

/// RX protocol flags, tested against `u16::from_be(flags_seq_be)`.
pub const RXF_FRAG: u16 = 1 << 6;
pub const RXF_IPV4: u16 = 1 << 7;
pub const RXF_IPV6: u16 = 1 << 8;
pub const RXF_TCP: u16 = 1 << 9;
pub const RXF_UDP: u16 = 1 << 10;

/// Sequence number carried in the low 3 bits of the host-order flags.
#[inline]
pub const fn rx_seqno(flags: u16) -> u8 {
    (flags & 0x7) as u8
}

/// Sequence numbers count 1..=7 and skip 0, which marks a never-written
/// descriptor.
#[inline]
pub const fn next_seqno(seq: u8) -> u8 {
    if seq + 1 == 8 { 1 } else { seq + 1 }
}

/// An RSS hash is meaningful for unfragmented IP packets only.
#[inline]
pub const fn rss_valid(flags: u16) -> bool {
    if flags & RXF_FRAG != 0 {
        return false;
    }
    flags & (RXF_IPV4 | RXF_IPV6) != 0
}

/// What the reported hash covered.
#[inline]
pub fn rss_hash_type(flags: u16) -> RxHashType {
    if flags & (RXF_TCP | RXF_UDP) != 0 {
        RxHashType::L4
    } else if flags & (RXF_IPV4 | RXF_IPV6) != 0 {
        RxHashType::L3
    } else {
        RxHashType::L2
    }
}

// =============================================================================
// Queue resources
// =============================================================================

/// Size of the per-queue resources struct shared with the device.  The
/// device writes the first two fields after queue creation; the rest is
/// reserved.
pub const QRES_SIZE: usize = 64;
/// Offset of the device-written doorbell index (big-endian u32).
pub const QRES_DB_INDEX: usize = 0;
/// Offset of the device-written event-counter index (big-endian u32).
pub const QRES_COUNTER_INDEX: usize = 4;

// =============================================================================
// IRQ doorbell values
// =============================================================================

/// Clear the pending interrupt edge.
pub const IRQ_ACK: u32 = 1 << 31;
/// Mask the vector until the next ACK.
pub const IRQ_MASK: u32 = 1 << 30;
/// Rearm event delivery.
pub const IRQ_EVENT: u32 = 1 << 29;
