#![no_std]
#![allow(unsafe_op_in_unsafe_fn)]

extern crate alloc;

pub mod gve;
pub mod net;
pub mod pci;

pub mod gve_test_fixtures;

pub mod gve_adminq_tests;
pub mod gve_fifo_tests;
pub mod gve_lifecycle_tests;
pub mod gve_rx_tests;
pub mod gve_tx_tests;
pub mod napi_tests;
pub mod netdev_tests;
