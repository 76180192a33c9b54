//! Scheduler service hooks.
//!
//! The blocking primitives in this crate (wait queue, semaphore, mailbox,
//! condition variable) must suspend and wake tasks without depending on the
//! `core` crate. The scheduler registers this table once during boot; until
//! then the primitives degrade to non-blocking behaviour.

use core::ffi::c_void;

use crate::once_lock::OnceLock;

/// Opaque task reference owned by the scheduler.
pub type TaskHandle = *mut c_void;

pub struct SchedHooks {
    pub current_task: fn() -> TaskHandle,
    pub current_task_id: fn() -> u32,
    /// Suspend the current task. `timeout_ms == 0` blocks forever;
    /// otherwise the task goes to Sleeping with a wake-at tick and is made
    /// Ready again when the deadline passes. Returns after the task is
    /// rescheduled.
    pub block_current: fn(timeout_ms: u64),
    /// Make a suspended task Ready and enqueue it. Lost-wakeup safe: if the
    /// task has not suspended yet, a pending-wakeup flag makes its block a
    /// no-op.
    pub unblock: fn(TaskHandle) -> i32,
    /// True if the current task has a deliverable (pending & !blocked)
    /// signal; blocking calls return EINTR when this trips.
    pub signal_pending: fn() -> bool,
    pub ticks: fn() -> u64,
    pub tick_hz: fn() -> u32,
    pub yield_now: fn(),
}

static HOOKS: OnceLock<SchedHooks> = OnceLock::new();

pub fn register_sched_hooks(hooks: SchedHooks) {
    let _ = HOOKS.set(hooks);
}

#[inline]
pub fn sched_hooks() -> Option<&'static SchedHooks> {
    HOOKS.get()
}

#[inline]
pub fn hooks_ready() -> bool {
    HOOKS.is_set()
}

#[inline]
pub fn current_task() -> TaskHandle {
    match HOOKS.get() {
        Some(h) => (h.current_task)(),
        None => core::ptr::null_mut(),
    }
}

#[inline]
pub fn signal_pending() -> bool {
    match HOOKS.get() {
        Some(h) => (h.signal_pending)(),
        None => false,
    }
}

#[inline]
pub fn ticks() -> u64 {
    match HOOKS.get() {
        Some(h) => (h.ticks)(),
        None => 0,
    }
}

#[inline]
pub fn tick_hz() -> u32 {
    match HOOKS.get() {
        Some(h) => (h.tick_hz)(),
        None => 0,
    }
}

/// Milliseconds of uptime derived from the tick counter.
pub fn uptime_ms() -> u64 {
    let hz = tick_hz();
    if hz == 0 {
        return 0;
    }
    ticks().saturating_mul(1000) / hz as u64
}
