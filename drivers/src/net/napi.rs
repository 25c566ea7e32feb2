//! NAPI-style poll coordination.
//!
//! One [`NapiContext`] per notification block gives the poll loop its
//! single-consumer guarantee: an interrupt marks the block `Scheduled`, one
//! poller wins the `Scheduled → Polling` transition, and nobody else may
//! touch the block's rings until it completes.  `Disabled` takes the block
//! out of service during close and reset.

use core::sync::atomic::{AtomicU8, AtomicU32, Ordering};

use gvnic_lib::kernel_services::platform;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NapiState {
    Idle = 0,
    Scheduled = 1,
    Polling = 2,
    Disabled = 3,
}

pub struct NapiContext {
    state: AtomicU8,
    budget: u32,
    processed: AtomicU32,
}

impl NapiContext {
    pub const fn new(budget: u32) -> Self {
        Self {
            state: AtomicU8::new(NapiState::Disabled as u8),
            budget,
            processed: AtomicU32::new(0),
        }
    }

    #[inline]
    pub fn budget(&self) -> u32 {
        self.budget
    }

    #[inline]
    pub fn processed(&self) -> u32 {
        self.processed.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn add_processed(&self, count: u32) {
        self.processed.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn state(&self) -> NapiState {
        match self.state.load(Ordering::Acquire) {
            1 => NapiState::Scheduled,
            2 => NapiState::Polling,
            3 => NapiState::Disabled,
            _ => NapiState::Idle,
        }
    }

    #[inline]
    pub fn is_scheduled(&self) -> bool {
        matches!(self.state(), NapiState::Scheduled)
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        !matches!(self.state(), NapiState::Disabled)
    }

    /// Request a poll.  Succeeds only from `Idle`; a disabled or already
    /// scheduled/polling block absorbs the request.
    pub fn schedule(&self) -> bool {
        self.state
            .compare_exchange(
                NapiState::Idle as u8,
                NapiState::Scheduled as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Claim the scheduled poll.  The winner becomes the block's sole
    /// consumer until [`complete`](Self::complete).
    pub fn begin_poll(&self) -> bool {
        self.state
            .compare_exchange(
                NapiState::Scheduled as u8,
                NapiState::Polling as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Finish a poll, returning the block to `Idle`.
    pub fn complete(&self) {
        let _ = self.state.compare_exchange(
            NapiState::Polling as u8,
            NapiState::Idle as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Allow scheduling.  Used when a block gains a ring at open.
    pub fn enable(&self) {
        self.state.store(NapiState::Idle as u8, Ordering::Release);
    }

    /// Take the block out of service, waiting out any in-flight poll.
    ///
    /// After this returns no new poll can start and none is running, so the
    /// caller may safely tear the block's rings down.
    pub fn disable(&self) {
        loop {
            let state = self.state.load(Ordering::Acquire);
            if state == NapiState::Polling as u8 {
                platform::cpu_relax();
                continue;
            }
            if self
                .state
                .compare_exchange(
                    state,
                    NapiState::Disabled as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return;
            }
        }
    }
}
