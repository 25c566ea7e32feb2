//! Memory constants shared by DMA and MMIO code.

/// Base page size.  All DMA-coherent allocations are sized and aligned in
/// multiples of this.
pub const PAGE_SIZE_4KB: usize = 4096;
