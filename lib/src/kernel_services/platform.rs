//! Platform hardware abstraction for the driver stack.
//!
//! The embedding kernel registers this table during bring-up.  It covers the
//! pieces the stack deliberately does not implement itself: interrupt
//! masking, time, DMA address translation, and the bus-level device reset.

mod defaults {
    pub fn irq_save() -> u64 {
        0
    }

    pub fn irq_restore(_flags: u64) {}

    pub fn cpu_relax() {
        core::hint::spin_loop();
    }

    /// Without a timer there is nothing to sleep on; polling loops built on
    /// this degrade to busy iteration, which is what hosted test runs want.
    pub fn sleep_ms(_ms: u32) {}

    pub fn uptime_ms() -> u64 {
        0
    }

    /// Identity mapping: bus address == host address.  Correct wherever the
    /// device sees the same address space as the CPU (hosted tests, kernels
    /// with a 1:1 DMA window).
    pub fn bus_addr_of(ptr: *const u8) -> u64 {
        ptr as usize as u64
    }

    pub fn bus_reset(_bdf: u32) -> i32 {
        0
    }
}

crate::define_service! {
    /// Platform services.  Registered once by the embedding kernel.
    platform => PlatformServices {
        /// Mask local interrupts, returning the previous state.
        irq_save: fn() -> u64 = defaults::irq_save;
        /// Restore the interrupt state returned by `irq_save`.
        irq_restore: fn(u64) = defaults::irq_restore;
        /// Polite spin-wait hint.
        cpu_relax: fn() = defaults::cpu_relax;
        /// Sleep the calling context for at least `ms` milliseconds.
        sleep_ms: fn(u32) = defaults::sleep_ms;
        /// Milliseconds since boot.
        uptime_ms: fn() -> u64 = defaults::uptime_ms;
        /// Translate a host pointer into the device's DMA address space.
        bus_addr_of: fn(*const u8) -> u64 = defaults::bus_addr_of;
        /// Function-level reset of the device identified by `bdf`.
        bus_reset: fn(u32) -> i32 = defaults::bus_reset;
    }
}

// -- Convenience wrappers ----------------------------------------------------

#[inline(always)]
pub fn irq_save() -> u64 {
    (platform_services().irq_save)()
}

#[inline(always)]
pub fn irq_restore(flags: u64) {
    (platform_services().irq_restore)(flags)
}

#[inline(always)]
pub fn cpu_relax() {
    (platform_services().cpu_relax)()
}

#[inline(always)]
pub fn sleep_ms(ms: u32) {
    (platform_services().sleep_ms)(ms)
}

#[inline(always)]
pub fn uptime_ms() -> u64 {
    (platform_services().uptime_ms)()
}

#[inline(always)]
pub fn bus_addr_of(ptr: *const u8) -> u64 {
    (platform_services().bus_addr_of)(ptr)
}

#[inline(always)]
pub fn bus_reset(bdf: u32) -> i32 {
    (platform_services().bus_reset)(bdf)
}
