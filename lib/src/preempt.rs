//! Preemption disable nesting and deferred reschedule.
//!
//! An interrupt that wants to reschedule while preemption is disabled sets
//! the pending flag instead; the flag is honoured when the outermost
//! [`PreemptGuard`] drops.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::once_lock::OnceLock;
use crate::percpu::{MAX_CPUS, get_current_cpu};

struct PreemptState {
    count: AtomicU32,
    resched_pending: AtomicBool,
}

impl PreemptState {
    const fn new() -> Self {
        Self {
            count: AtomicU32::new(0),
            resched_pending: AtomicBool::new(false),
        }
    }
}

static PREEMPT: [PreemptState; MAX_CPUS] = [const { PreemptState::new() }; MAX_CPUS];
static RESCHED_CALLBACK: OnceLock<fn()> = OnceLock::new();

/// Scheduler registers the function run when a deferred reschedule fires.
pub fn register_reschedule_callback(callback: fn()) {
    let _ = RESCHED_CALLBACK.set(callback);
}

/// RAII guard: preemption is disabled on this CPU while any guard is live.
pub struct PreemptGuard {
    cpu: usize,
}

impl PreemptGuard {
    #[inline]
    pub fn new() -> Self {
        let cpu = get_current_cpu();
        PREEMPT[cpu].count.fetch_add(1, Ordering::AcqRel);
        Self { cpu }
    }

    #[inline]
    pub fn is_active() -> bool {
        PREEMPT[get_current_cpu()].count.load(Ordering::Acquire) > 0
    }

    /// Called from interrupt context when a reschedule is wanted but
    /// preemption is disabled.
    pub fn mark_reschedule_pending() {
        PREEMPT[get_current_cpu()]
            .resched_pending
            .store(true, Ordering::Release);
    }

    pub fn clear_reschedule_pending() {
        PREEMPT[get_current_cpu()]
            .resched_pending
            .store(false, Ordering::Release);
    }
}

impl Default for PreemptGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PreemptGuard {
    #[inline]
    fn drop(&mut self) {
        let state = &PREEMPT[self.cpu];
        let prev = state.count.fetch_sub(1, Ordering::AcqRel);
        if prev == 1 && state.resched_pending.swap(false, Ordering::AcqRel) {
            if let Some(callback) = RESCHED_CALLBACK.get() {
                callback();
            }
        }
    }
}

#[inline]
pub fn preempt_count() -> u32 {
    PREEMPT[get_current_cpu()].count.load(Ordering::Acquire)
}

#[inline]
pub fn is_preemption_disabled() -> bool {
    preempt_count() > 0
}
