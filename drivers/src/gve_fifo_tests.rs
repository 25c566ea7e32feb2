//! TX FIFO tests: bump allocation, wrap handling, alignment accounting,
//! and the strict capacity rule.

use alloc::sync::Arc;

use gvnic_lib::testing::TestResult;
use gvnic_lib::{assert_eq_test, assert_test, pass};
use gvnic_mm::dma::DmaRegion;

use crate::gve::fifo::{FifoIovec, TxFifo};

const FIFO_SIZE: u32 = 4096;

fn one_page_fifo() -> TxFifo {
    let region = Arc::new(DmaRegion::zeroed(FIFO_SIZE as usize).expect("fifo region"));
    TxFifo::new(region)
}

pub fn test_fifo_initial_state() -> TestResult {
    let fifo = one_page_fifo();
    assert_eq_test!(fifo.size(), FIFO_SIZE);
    assert_eq_test!(fifo.available(), FIFO_SIZE);
    assert_eq_test!(fifo.pad_for(FIFO_SIZE), 0, "whole region fits at start");
    pass!()
}

pub fn test_fifo_alloc_aligns_head() -> TestResult {
    let fifo = one_page_fifo();
    let mut iov = [FifoIovec::default(); 2];

    let nfrags = fifo.alloc(100, &mut iov);
    assert_eq_test!(nfrags, 1);
    assert_eq_test!(iov[0].offset, 0);
    assert_eq_test!(iov[0].len, 100);
    assert_eq_test!(iov[0].padding, 28, "padding to the next cache line");
    assert_eq_test!(fifo.available(), FIFO_SIZE - 128);

    // The next allocation starts on the cache line after the padding.
    let nfrags = fifo.alloc(64, &mut iov);
    assert_eq_test!(nfrags, 1);
    assert_eq_test!(iov[0].offset, 128);
    assert_eq_test!(iov[0].padding, 0);
    pass!()
}

pub fn test_fifo_strict_capacity_check() -> TestResult {
    let fifo = one_page_fifo();
    // A request equal to the free space is refused; one byte less is
    // admitted.
    assert_test!(!fifo.can_alloc(FIFO_SIZE), "equal to available is refused");
    assert_test!(fifo.can_alloc(FIFO_SIZE - 1), "available - 1 is admitted");

    let mut iov = [FifoIovec::default(); 2];
    fifo.alloc(64, &mut iov);
    assert_test!(!fifo.can_alloc(FIFO_SIZE - 64));
    assert_test!(fifo.can_alloc(FIFO_SIZE - 65));
    pass!()
}

pub fn test_fifo_wrap_splits_allocation() -> TestResult {
    let fifo = one_page_fifo();
    let mut iov = [FifoIovec::default(); 2];

    // Park the head 64 bytes short of the end.
    fifo.alloc(FIFO_SIZE - 64, &mut iov);
    fifo.free(iov[0].len + iov[0].padding);
    assert_eq_test!(fifo.available(), FIFO_SIZE);

    // 128 bytes no longer fit the tail: expect a two-fragment wrap.
    let nfrags = fifo.alloc(128, &mut iov);
    assert_eq_test!(nfrags, 2);
    assert_eq_test!(iov[0].offset, FIFO_SIZE - 64);
    assert_eq_test!(iov[0].len, 64);
    assert_eq_test!(iov[1].offset, 0);
    assert_eq_test!(iov[1].len, 64);
    assert_eq_test!(iov[1].padding, 0);
    assert_eq_test!(fifo.available(), FIFO_SIZE - 128);
    pass!()
}

pub fn test_fifo_header_pad_to_wrap() -> TestResult {
    let fifo = one_page_fifo();
    let mut iov = [FifoIovec::default(); 2];

    fifo.alloc(FIFO_SIZE - 64, &mut iov);
    fifo.free(iov[0].len + iov[0].padding);

    // A 64-byte header still fits the tail exactly; a 65-byte one must be
    // padded past the wrap so it starts at offset 0.
    assert_eq_test!(fifo.pad_for(64), 0);
    assert_eq_test!(fifo.pad_for(65), 64);

    let pad = fifo.pad_for(65);
    let nfrags = fifo.alloc(65 + pad, &mut iov);
    assert_eq_test!(nfrags, 2);
    // The header fragment is the last one, at the start of the region.
    assert_eq_test!(iov[nfrags - 1].offset, 0);
    assert_eq_test!(iov[nfrags - 1].len, 65);
    // Alignment padding is charged to the header fragment and accounted.
    assert_eq_test!(iov[nfrags - 1].padding, 63);
    assert_eq_test!(fifo.available(), FIFO_SIZE - (64 + 65 + 63));
    pass!()
}

pub fn test_fifo_balanced_alloc_free_restores_available() -> TestResult {
    let fifo = one_page_fifo();
    let mut iov = [FifoIovec::default(); 2];
    let mut charged = 0u32;

    for request in [1u32, 54, 64, 100, 1500, 777] {
        let nfrags = fifo.alloc(request, &mut iov);
        for frag in iov.iter().take(nfrags) {
            charged += frag.len + frag.padding;
        }
        iov = [FifoIovec::default(); 2];
    }
    assert_eq_test!(fifo.available(), FIFO_SIZE - charged);

    fifo.free(charged);
    assert_eq_test!(fifo.available(), FIFO_SIZE);
    pass!()
}

pub fn test_fifo_zero_byte_alloc_is_empty() -> TestResult {
    let fifo = one_page_fifo();
    let mut iov = [FifoIovec::default(); 2];
    assert_eq_test!(fifo.alloc(0, &mut iov), 0);
    assert_eq_test!(fifo.available(), FIFO_SIZE);
    pass!()
}

gvnic_lib::define_test_suite!(
    gve_fifo,
    [
        test_fifo_initial_state,
        test_fifo_alloc_aligns_head,
        test_fifo_strict_capacity_check,
        test_fifo_wrap_splits_allocation,
        test_fifo_header_pad_to_wrap,
        test_fifo_balanced_alloc_free_restores_available,
        test_fifo_zero_byte_alloc_is_empty,
    ]
);
