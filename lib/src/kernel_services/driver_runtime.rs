//! Deferred-work hooks provided by the embedding kernel.
//!
//! Interrupt handlers cannot run ring cleaning or resets inline; they hand a
//! token to the kernel, which later calls back into the driver from a
//! schedulable context.  Tokens are opaque to the kernel — the driver that
//! issued a kick knows how to decode its own token.

mod defaults {
    /// Dropping a kick is safe: the work is re-requested by the next
    /// interrupt or poll, so the default is a no-op rather than a panic.
    pub fn service_kick(_token: usize) {}

    pub fn napi_kick(_token: usize) {}
}

crate::define_service! {
    /// Deferred-work scheduling.  Registered once by the embedding kernel.
    driver_runtime => DriverRuntimeServices {
        /// Schedule a device's service task (management work, resets).
        service_kick: fn(usize) = defaults::service_kick;
        /// Schedule a poll for one notification block.
        napi_kick: fn(usize) = defaults::napi_kick;
    }
}

#[inline(always)]
pub fn service_kick(token: usize) {
    (driver_runtime_services().service_kick)(token)
}

#[inline(always)]
pub fn napi_kick(token: usize) {
    (driver_runtime_services().napi_kick)(token)
}
