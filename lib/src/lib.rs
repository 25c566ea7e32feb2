#![no_std]
#![allow(unsafe_op_in_unsafe_fn)]

pub mod alignment;
pub mod kernel_services;
pub mod klog;
pub mod once_lock;
pub mod spinlock;
pub mod testing;

pub use alignment::{L1_CACHE_BYTES, align_down_u64, align_up_u64, cache_line_align};
pub use once_lock::OnceLock;
pub use spinlock::{IrqMutex, IrqMutexGuard, IrqRwLock, IrqRwLockReadGuard, IrqRwLockWriteGuard};

// Re-exported for macro expansion (`define_test_suite!`, `define_service!`).
pub use paste;
