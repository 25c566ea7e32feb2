//! Thread-safe one-time initialization container.
//!
//! The first caller of [`call_once()`](OnceLock::call_once) runs the
//! initializer; concurrent callers spin until it completes; later calls are
//! no-ops.  Consistent with the spin-based locking used elsewhere in the
//! stack, so it is usable before any scheduler exists.

use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicU8, Ordering};

const STATE_UNINIT: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_COMPLETE: u8 = 2;

pub struct OnceLock<T> {
    /// 0 = uninit, 1 = initializer running, 2 = complete.
    state: AtomicU8,
    data: UnsafeCell<MaybeUninit<T>>,
}

// SAFETY: the state machine guarantees the value is written exactly once,
// before any reader observes STATE_COMPLETE.
unsafe impl<T: Send + Sync> Sync for OnceLock<T> {}
unsafe impl<T: Send> Send for OnceLock<T> {}

impl<T> OnceLock<T> {
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(STATE_UNINIT),
            data: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    /// Run `init` if no one has yet; otherwise wait for completion.
    pub fn call_once(&self, init: impl FnOnce() -> T) {
        match self.state.compare_exchange(
            STATE_UNINIT,
            STATE_RUNNING,
            Ordering::Acquire,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                // SAFETY: we won the race; no other writer exists.
                unsafe { (*self.data.get()).write(init()) };
                self.state.store(STATE_COMPLETE, Ordering::Release);
            }
            Err(_) => {
                while self.state.load(Ordering::Acquire) != STATE_COMPLETE {
                    spin_loop();
                }
            }
        }
    }

    /// The value, if initialization has completed.
    pub fn get(&self) -> Option<&T> {
        if self.state.load(Ordering::Acquire) == STATE_COMPLETE {
            // SAFETY: COMPLETE implies the value was written.
            Some(unsafe { (*self.data.get()).assume_init_ref() })
        } else {
            None
        }
    }
}

impl<T> Default for OnceLock<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for OnceLock<T> {
    fn drop(&mut self) {
        if *self.state.get_mut() == STATE_COMPLETE {
            // SAFETY: COMPLETE implies the value was written and is unshared
            // here because we hold `&mut self`.
            unsafe { self.data.get_mut().assume_init_drop() };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initializes_once() {
        let cell: OnceLock<u32> = OnceLock::new();
        assert!(cell.get().is_none());
        cell.call_once(|| 11);
        cell.call_once(|| 99);
        assert_eq!(cell.get(), Some(&11));
    }
}
