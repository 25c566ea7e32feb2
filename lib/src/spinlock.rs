//! Interrupt-safe locks used throughout the driver stack.
//!
//! Both locks route interrupt masking through the registered
//! [`platform`](crate::kernel_services::platform) service table so that the
//! same code runs inside a kernel (where the table disables local interrupts)
//! and on a hosted target (where the default hooks are no-ops and the locks
//! degrade to plain spinlocks).

use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicI32, AtomicU16, AtomicU32, Ordering};

use crate::kernel_services::platform;

/// Mutex that masks interrupts while held.
///
/// Uses a ticket lock internally for FIFO fairness: each acquirer takes a
/// monotonically increasing ticket and spins until `now_serving` matches, so
/// contending CPUs are served in arrival order.  Tickets wrap at `u16::MAX`;
/// equality comparison is wrap-safe.
pub struct IrqMutex<T> {
    next_ticket: AtomicU16,
    now_serving: AtomicU16,
    data: UnsafeCell<T>,
}

// SAFETY: exclusive access is enforced by ticket acquisition with interrupts
// masked, so the protected data can be shared across contexts.
unsafe impl<T: Send> Send for IrqMutex<T> {}
unsafe impl<T: Send> Sync for IrqMutex<T> {}

pub struct IrqMutexGuard<'a, T> {
    mutex: &'a IrqMutex<T>,
    saved_flags: u64,
}

impl<T> IrqMutex<T> {
    #[inline]
    pub const fn new(data: T) -> Self {
        Self {
            next_ticket: AtomicU16::new(0),
            now_serving: AtomicU16::new(0),
            data: UnsafeCell::new(data),
        }
    }

    /// `true` if the lock is currently held or has waiters.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.next_ticket.load(Ordering::Relaxed) != self.now_serving.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn lock(&self) -> IrqMutexGuard<'_, T> {
        let saved_flags = platform::irq_save();
        let my_ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);

        // Acquire on `now_serving` so everything the previous holder wrote is
        // visible once our ticket comes up.
        loop {
            let serving = self.now_serving.load(Ordering::Acquire);
            if serving == my_ticket {
                break;
            }
            // Back off proportionally to queue distance to cut cache traffic.
            let distance = my_ticket.wrapping_sub(serving) as u32;
            for _ in 0..distance.min(64) {
                spin_loop();
            }
        }

        IrqMutexGuard {
            mutex: self,
            saved_flags,
        }
    }

    #[inline]
    pub fn try_lock(&self) -> Option<IrqMutexGuard<'_, T>> {
        let saved_flags = platform::irq_save();
        let current = self.now_serving.load(Ordering::Relaxed);
        if self
            .next_ticket
            .compare_exchange(
                current,
                current.wrapping_add(1),
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_ok()
        {
            Some(IrqMutexGuard {
                mutex: self,
                saved_flags,
            })
        } else {
            platform::irq_restore(saved_flags);
            None
        }
    }
}

impl<'a, T> Deref for IrqMutexGuard<'a, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // SAFETY: holding the guard means our ticket is being served.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<'a, T> DerefMut for IrqMutexGuard<'a, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: holding the guard means our ticket is being served.
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<'a, T> Drop for IrqMutexGuard<'a, T> {
    #[inline]
    fn drop(&mut self) {
        // Release hands the lock to the next waiter in FIFO order.
        self.mutex.now_serving.fetch_add(1, Ordering::Release);
        platform::irq_restore(self.saved_flags);
    }
}

// =============================================================================
// IrqRwLock - reader/writer lock with IRQ masking
// =============================================================================

/// Writer-preferring reader/writer lock that masks interrupts while held.
///
/// Readers share the lock; a waiting writer causes new readers to yield so a
/// steady read stream cannot starve the control plane.  Used for structures
/// the datapath reads on every packet but the lifecycle path rebuilds rarely
/// (ring arrays, notification blocks).
pub struct IrqRwLock<T> {
    /// 0 = unlocked, -1 = write-locked, >0 = reader count.
    state: AtomicI32,
    /// Writers waiting; readers yield while nonzero.
    writer_waiting: AtomicU32,
    data: UnsafeCell<T>,
}

// SAFETY: access is synchronized by the atomic state machine with interrupts
// masked while any guard is live.
unsafe impl<T: Send> Send for IrqRwLock<T> {}
unsafe impl<T: Send + Sync> Sync for IrqRwLock<T> {}

pub struct IrqRwLockReadGuard<'a, T> {
    lock: &'a IrqRwLock<T>,
    saved_flags: u64,
}

pub struct IrqRwLockWriteGuard<'a, T> {
    lock: &'a IrqRwLock<T>,
    saved_flags: u64,
}

impl<T> IrqRwLock<T> {
    #[inline]
    pub const fn new(data: T) -> Self {
        Self {
            state: AtomicI32::new(0),
            writer_waiting: AtomicU32::new(0),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquire shared read access.  Blocks while a writer holds the lock or
    /// is queued.
    #[inline]
    pub fn read(&self) -> IrqRwLockReadGuard<'_, T> {
        let saved_flags = platform::irq_save();
        loop {
            let state = self.state.load(Ordering::Relaxed);
            if state >= 0
                && self.writer_waiting.load(Ordering::Relaxed) == 0
                && self
                    .state
                    .compare_exchange_weak(state, state + 1, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                return IrqRwLockReadGuard {
                    lock: self,
                    saved_flags,
                };
            }
            spin_loop();
        }
    }

    /// Acquire exclusive write access.
    #[inline]
    pub fn write(&self) -> IrqRwLockWriteGuard<'_, T> {
        let saved_flags = platform::irq_save();
        self.writer_waiting.fetch_add(1, Ordering::Relaxed);
        loop {
            if self
                .state
                .compare_exchange_weak(0, -1, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                self.writer_waiting.fetch_sub(1, Ordering::Relaxed);
                return IrqRwLockWriteGuard {
                    lock: self,
                    saved_flags,
                };
            }
            spin_loop();
        }
    }
}

impl<'a, T> Deref for IrqRwLockReadGuard<'a, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // SAFETY: read guard excludes writers.
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T> Drop for IrqRwLockReadGuard<'a, T> {
    #[inline]
    fn drop(&mut self) {
        self.lock.state.fetch_sub(1, Ordering::Release);
        platform::irq_restore(self.saved_flags);
    }
}

impl<'a, T> Deref for IrqRwLockWriteGuard<'a, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // SAFETY: write guard is exclusive.
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T> DerefMut for IrqRwLockWriteGuard<'a, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: write guard is exclusive.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T> Drop for IrqRwLockWriteGuard<'a, T> {
    #[inline]
    fn drop(&mut self) {
        self.lock.state.store(0, Ordering::Release);
        platform::irq_restore(self.saved_flags);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mutex_serializes_and_releases() {
        let m = IrqMutex::new(0u32);
        {
            let mut g = m.lock();
            *g += 1;
            assert!(m.is_locked());
            assert!(m.try_lock().is_none());
        }
        assert!(!m.is_locked());
        assert_eq!(*m.lock(), 1);
    }

    #[test]
    fn rwlock_read_then_write() {
        let l = IrqRwLock::new(5u32);
        {
            let r1 = l.read();
            let r2 = l.read();
            assert_eq!(*r1 + *r2, 10);
        }
        {
            let mut w = l.write();
            *w = 7;
        }
        assert_eq!(*l.read(), 7);
    }
}
