#![no_std]

pub mod clock;
pub mod exec;
pub mod hooks;
pub mod platform;
pub mod proc;
pub mod sched;
pub mod signal;
pub mod syscall;
pub mod tests;
pub mod trap;

pub use sched::scheduler::{
    block_current_timeout, current_task, current_task_id, init_scheduler, schedule,
    scheduler_start, unblock_task, yield_now,
};
pub use sched::task::{task_create_kernel, task_current_pid};
pub use syscall::dispatch::syscall_handle;
pub use trap::{handle_page_fault, handle_timer_interrupt};
