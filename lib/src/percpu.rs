//! Per-CPU bookkeeping shared by every subsystem.
//!
//! The spec-level model is "one struct per CPU, addressed by CPU id through
//! a thin accessor". The accessor itself is architectural (it reads the id
//! from a CPU-local register), so the id lookup is a registered provider:
//! the arch bring-up installs one that reads its per-CPU segment, and until
//! then everything runs as CPU 0.

use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crate::once_lock::OnceLock;

pub const MAX_CPUS: usize = 16;

static CPU_ID_PROVIDER: OnceLock<fn() -> usize> = OnceLock::new();
static CPU_COUNT: AtomicUsize = AtomicUsize::new(1);
static ONLINE_MASK: AtomicU32 = AtomicU32::new(1);
static SEND_RESCHED_IPI: OnceLock<fn(usize)> = OnceLock::new();

/// Install the arch bring-up's CPU-id accessor. First registration wins.
pub fn register_cpu_id_provider(provider: fn() -> usize) {
    let _ = CPU_ID_PROVIDER.set(provider);
}

#[inline]
pub fn get_current_cpu() -> usize {
    match CPU_ID_PROVIDER.get() {
        Some(provider) => {
            let id = provider();
            if id < MAX_CPUS { id } else { 0 }
        }
        None => 0,
    }
}

pub fn set_cpu_count(count: usize) {
    let clamped = count.clamp(1, MAX_CPUS);
    CPU_COUNT.store(clamped, Ordering::Release);
}

#[inline]
pub fn get_cpu_count() -> usize {
    CPU_COUNT.load(Ordering::Acquire)
}

pub fn mark_cpu_online(cpu_id: usize) {
    if cpu_id < MAX_CPUS {
        ONLINE_MASK.fetch_or(1 << cpu_id, Ordering::AcqRel);
    }
}

#[inline]
pub fn is_cpu_online(cpu_id: usize) -> bool {
    cpu_id < MAX_CPUS && ONLINE_MASK.load(Ordering::Acquire) & (1 << cpu_id) != 0
}

/// Register the reschedule-IPI sender (arch bring-up owns the vector).
pub fn register_send_resched_ipi(sender: fn(usize)) {
    let _ = SEND_RESCHED_IPI.set(sender);
}

/// Kick `cpu_id` so its idle loop re-examines its run queue. No-op until
/// the arch layer registers a sender.
pub fn send_resched_ipi(cpu_id: usize) {
    if let Some(sender) = SEND_RESCHED_IPI.get() {
        sender(cpu_id);
    }
}
