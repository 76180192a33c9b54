#![no_std]
#![allow(unsafe_op_in_unsafe_fn)]

pub mod align;
pub mod boot_info;
pub mod cmdline;
pub mod cpu;
pub mod klog;
pub mod once_lock;
pub mod percpu;
pub mod preempt;
pub mod ring_buffer;
pub mod sched_hooks;
pub mod serial;
pub mod spinlock;
pub mod sync;
pub mod testing;
pub mod tests;
pub mod trapframe;
pub mod waitqueue;

#[doc(hidden)]
pub use paste;

pub use align::{align_down_u64, align_down_usize, align_up_u64, align_up_usize};
pub use align::{align_down_usize as align_down, align_up_usize as align_up};
pub use boot_info::{BootInfo, MemoryRange, MemoryRangeKind, MAX_MEMORY_RANGES};
pub use cmdline::{BootCommandLine, CMDLINE_MAX_LEN};
pub use klog::{
    KlogLevel, klog_get_level, klog_init, klog_register_backend, klog_set_level,
};
pub use once_lock::{InitFlag, OnceLock};
pub use percpu::{
    MAX_CPUS, get_cpu_count, get_current_cpu, is_cpu_online, mark_cpu_online,
    register_cpu_id_provider, register_send_resched_ipi, send_resched_ipi, set_cpu_count,
};
pub use preempt::{PreemptGuard, is_preemption_disabled, preempt_count};
pub use ring_buffer::RingBuffer;
pub use sched_hooks::{SchedHooks, TaskHandle};
pub use spinlock::{IrqMutex, IrqMutexGuard, IrqRwLock, IrqRwLockReadGuard, IrqRwLockWriteGuard};
pub use sync::{CondVar, Mailbox, Mutex, Semaphore, SyncError};
pub use trapframe::InterruptFrame;
pub use waitqueue::{WaitOutcome, WaitQueue};
