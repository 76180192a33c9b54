//! Platform hardware services.
//!
//! The timer, console, and lifecycle operations belong to drivers and the
//! arch bring-up; the core consumes them through this table, registered
//! once during early boot. Until registration every accessor falls back to
//! a harmless default so the core can be exercised headless.

use ferrite_lib::OnceLock;

pub struct PlatformServices {
    /// Monotonic tick counter maintained by the platform timer driver.
    pub timer_ticks: fn() -> u64,
    /// Timer interrupt rate in Hz.
    pub timer_frequency: fn() -> u32,
    /// Busy-wait fallback used before the scheduler runs.
    pub timer_poll_delay_ms: fn(u32),
    pub console_write: fn(&[u8]),
    /// Point the CPU's interrupt stack at the given kernel stack top
    /// before dispatching a user task.
    pub set_kernel_stack_top: fn(u64),
    pub shutdown: fn() -> !,
}

static PLATFORM: OnceLock<PlatformServices> = OnceLock::new();

pub fn register_platform(services: PlatformServices) {
    let _ = PLATFORM.set(services);
}

#[inline]
pub fn timer_ticks() -> u64 {
    match PLATFORM.get() {
        Some(p) => (p.timer_ticks)(),
        None => crate::clock::ticks(),
    }
}

#[inline]
pub fn timer_frequency() -> u32 {
    match PLATFORM.get() {
        Some(p) => (p.timer_frequency)(),
        None => crate::clock::tick_hz(),
    }
}

pub fn timer_poll_delay_ms(ms: u32) {
    if let Some(p) = PLATFORM.get() {
        (p.timer_poll_delay_ms)(ms);
    }
}

pub fn console_write(bytes: &[u8]) {
    match PLATFORM.get() {
        Some(p) => (p.console_write)(bytes),
        None => ferrite_lib::serial::write_bytes(bytes),
    }
}

pub fn set_kernel_stack_top(top: u64) {
    if let Some(p) = PLATFORM.get() {
        (p.set_kernel_stack_top)(top);
    }
}

pub fn shutdown() -> ! {
    if let Some(p) = PLATFORM.get() {
        (p.shutdown)();
    }
    ferrite_lib::cpu::halt_loop();
}
