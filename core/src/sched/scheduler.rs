//! The dispatcher: voluntary and preemptive switching, block/unblock,
//! sleeping, and the timer hook.
//!
//! `schedule()` runs with interrupts disabled: demote the current task to
//! the tail of its priority queue if it is still Running, pop the head of
//! the highest non-empty priority (the idle task when nothing is queued),
//! mark it Running, and perform the register switch. Every task has its
//! own kernel stack, so a task preempted inside the kernel simply resumes
//! there later.

use core::ffi::c_void;
use core::ptr;
use core::sync::atomic::{AtomicBool, Ordering};

use ferrite_abi::task::{BlockReason, INVALID_PROCESS_ID, TaskStatus};
use ferrite_lib::sched_hooks::{SchedHooks, register_sched_hooks};
use ferrite_lib::{cpu, klog_info, percpu};
use ferrite_mm::process_vm::process_vm_space;

use super::per_cpu::{cpu_sched, init_percpu_schedulers, local_sched};
use super::sleep;
use super::switch::switch_registers;
use super::task_struct::Task;
use crate::clock;
use crate::platform;

static SCHEDULER_ENABLED: AtomicBool = AtomicBool::new(false);

/// Timer ticks a task may run before round-robin demotion.
const DEFAULT_TIME_SLICE: u32 = 5;

pub fn scheduler_is_enabled() -> bool {
    SCHEDULER_ENABLED.load(Ordering::Acquire)
}

#[inline]
pub fn current_task() -> *mut Task {
    local_sched().current_task()
}

pub fn current_task_id() -> u32 {
    let task = current_task();
    if task.is_null() {
        super::task_struct::INVALID_TASK_ID
    } else {
        unsafe { (*task).task_id }
    }
}

/// True if `task` is the current task of any CPU (reap safety check).
pub fn task_is_on_any_cpu(task: *mut Task) -> bool {
    (0..percpu::get_cpu_count()).any(|cpu| cpu_sched(cpu).current_task() == task)
}

/// Enqueue a Ready task on its home CPU, kicking that CPU if remote.
pub fn schedule_task(task: *mut Task) -> i32 {
    if task.is_null() || unsafe { !(*task).is_ready() } {
        return -1;
    }
    let home = unsafe { (*task).home_cpu as usize };
    let target = if percpu::is_cpu_online(home) {
        home
    } else {
        percpu::get_current_cpu()
    };

    if cpu_sched(target).enqueue(task) != 0 {
        return -1;
    }
    if target != percpu::get_current_cpu() {
        percpu::send_resched_ipi(target);
    }
    0
}

fn switch_address_space(next: &Task) {
    if next.process_id != INVALID_PROCESS_ID {
        if let Some(space) = process_vm_space(next.process_id) {
            space.activate();
            return;
        }
    }
    ferrite_mm::paging::kernel_space().activate();
}

/// Core dispatch. Interrupts must be disabled by the caller or are
/// disabled here for the duration.
fn schedule_locked() {
    let sched = local_sched();
    let current = sched.current_task();

    let next = sched.dequeue_highest();
    let next = if next.is_null() {
        let idle = sched.idle_task();
        if idle.is_null() || idle == current {
            // Nothing else to run and we are already the idle (or boot)
            // context.
            return;
        }
        // A runnable current keeps the CPU instead of the idle task.
        if !current.is_null() && unsafe { (*current).is_running() } {
            return;
        }
        idle
    } else {
        next
    };

    if next == current {
        return;
    }

    // Demote a still-running current to the tail of its queue.
    if !current.is_null() && current != sched.idle_task() {
        let current_ref = unsafe { &*current };
        if current_ref.is_running() && current_ref.try_transition_to(TaskStatus::Ready) {
            sched.enqueue(current);
        }
    }

    let next_ref = unsafe { &mut *next };
    if next != sched.idle_task() && !next_ref.try_transition_to(TaskStatus::Running) {
        // Lost the dispatch race (terminated under us); try again.
        return schedule_locked();
    }
    if next == sched.idle_task() {
        next_ref.set_status(TaskStatus::Running);
    }
    next_ref.time_slice_remaining = DEFAULT_TIME_SLICE;

    sched.set_current_task(next);
    sched.switches.fetch_add(1, Ordering::Relaxed);

    switch_address_space(next_ref);
    platform::set_kernel_stack_top(next_ref.kernel_stack_top());

    let prev_ctx = if current.is_null() {
        ptr::null_mut()
    } else {
        unsafe { &raw mut (*current).switch_ctx }
    };
    switch_registers(prev_ctx, &next_ref.switch_ctx);
    // Back on `current`'s stack: someone rescheduled us.
}

pub fn schedule() {
    let flags = cpu::save_flags_cli();
    if SCHEDULER_ENABLED.load(Ordering::Acquire) {
        schedule_locked();
    }
    cpu::restore_flags(flags);
}

pub fn yield_now() {
    let current = current_task();
    if !current.is_null() {
        // Voluntary yield surrenders the rest of the slice.
        unsafe { (*current).time_slice_remaining = 0 };
    }
    schedule();
}

// =============================================================================
// Suspension
// =============================================================================

/// Suspend the current task: Blocked when `timeout_ms == 0`, otherwise
/// Sleeping with a wake-at tick. Returns when rescheduled.
pub fn block_current_timeout(timeout_ms: u64) {
    let current = current_task();
    if current.is_null() || !scheduler_is_enabled() {
        return;
    }
    let task = unsafe { &mut *current };
    if task.is_suspended() {
        return;
    }

    // A wakeup that raced us between the caller dropping its lock and
    // this point must not be lost.
    if task.pending_wakeup.swap(false, Ordering::AcqRel) {
        return;
    }

    if timeout_ms == 0 {
        if task.block_reason == BlockReason::None {
            task.block_reason = BlockReason::Generic;
        }
        if !task.try_transition_to(TaskStatus::Blocked) {
            return;
        }
    } else {
        let wake_tick = clock::ticks().wrapping_add(clock::ms_to_ticks(timeout_ms));
        task.wake_at_tick = wake_tick;
        task.block_reason = BlockReason::Sleep;
        if !task.try_transition_to(TaskStatus::Sleeping) {
            return;
        }
        if !sleep::sleep_queue_insert(task.task_id, wake_tick) {
            // No sleep slot: fall back to a plain block so a waker can
            // still get us.
            task.set_status(TaskStatus::Blocked);
        }
    }

    schedule();
    task.block_reason = BlockReason::None;
    sleep::sleep_queue_remove(task.task_id);
}

/// Make a suspended task Ready and requeue it. If the task has not
/// suspended yet, the pending-wakeup flag makes its upcoming block a
/// no-op (lost-wakeup safety).
pub fn unblock_task(task: *mut Task) -> i32 {
    if task.is_null() {
        return -1;
    }
    let task_ref = unsafe { &*task };

    if !task_ref.is_suspended() {
        task_ref.pending_wakeup.store(true, Ordering::Release);
        return 0;
    }
    if !task_ref.try_transition_to(TaskStatus::Ready) {
        // Someone else changed the state; fine unless the task is gone.
        return if task_ref.status() == TaskStatus::Invalid { -1 } else { 0 };
    }
    sleep::sleep_queue_remove(task_ref.task_id);
    core::sync::atomic::fence(Ordering::SeqCst);
    schedule_task(task)
}

/// Sleep for at least `ms` milliseconds.
pub fn sleep_current_ms(ms: u64) {
    if ms == 0 {
        yield_now();
        return;
    }
    if !scheduler_is_enabled() {
        platform::timer_poll_delay_ms(ms as u32);
        return;
    }
    block_current_timeout(ms);
}

// =============================================================================
// Timer hook
// =============================================================================

/// Per-tick scheduling work, from the timer interrupt: wake due sleepers,
/// account the current slice, and decide whether to preempt. Returns true
/// if the caller should run `schedule()` on its way out.
pub fn scheduler_timer_tick(now_tick: u64, from_user: bool) -> bool {
    sleep::wake_due_sleepers(now_tick);

    if !scheduler_is_enabled() {
        return false;
    }
    let sched = local_sched();
    let current = sched.current_task();
    if current.is_null() {
        return false;
    }
    let task = unsafe { &mut *current };

    if from_user {
        task.user_ticks += 1;
    } else {
        task.system_ticks += 1;
    }

    if current == sched.idle_task() {
        return sched.ready_count() > 0;
    }
    if task.flags & super::task_struct::TASK_FLAG_NO_PREEMPT != 0 {
        return false;
    }

    // A higher-priority arrival preempts immediately.
    if let Some(top) = sched.top_priority() {
        if top < task.priority {
            sched.preemptions.fetch_add(1, Ordering::Relaxed);
            return true;
        }
    }

    if task.time_slice_remaining > 0 {
        task.time_slice_remaining -= 1;
    }
    if task.time_slice_remaining == 0 && sched.ready_count() > 0 {
        sched.preemptions.fetch_add(1, Ordering::Relaxed);
        return true;
    }
    false
}

// =============================================================================
// Init and the idle loop
// =============================================================================

fn hook_current_task() -> ferrite_lib::TaskHandle {
    current_task() as ferrite_lib::TaskHandle
}

fn hook_current_task_id() -> u32 {
    current_task_id()
}

fn hook_block_current(timeout_ms: u64) {
    block_current_timeout(timeout_ms);
}

fn hook_unblock(task: ferrite_lib::TaskHandle) -> i32 {
    unblock_task(task as *mut Task)
}

fn hook_signal_pending() -> bool {
    let task = current_task();
    !task.is_null() && unsafe { (*task).deliverable_signals() != 0 }
}

fn hook_ticks() -> u64 {
    clock::ticks()
}

fn hook_tick_hz() -> u32 {
    clock::tick_hz()
}

pub fn init_scheduler() {
    init_percpu_schedulers();
    register_sched_hooks(SchedHooks {
        current_task: hook_current_task,
        current_task_id: hook_current_task_id,
        block_current: hook_block_current,
        unblock: hook_unblock,
        signal_pending: hook_signal_pending,
        ticks: hook_ticks,
        tick_hz: hook_tick_hz,
        yield_now,
    });
    ferrite_lib::preempt::register_reschedule_callback(schedule);
}

/// Turn the boot context into this CPU's idle task and start scheduling.
/// Never returns; the boot stack becomes the idle stack.
pub fn scheduler_start() -> ! {
    let cpu_id = percpu::get_current_cpu();
    let idle = super::task::task_adopt_idle_current(cpu_id);
    let _ = idle;
    percpu::mark_cpu_online(cpu_id);
    SCHEDULER_ENABLED.store(true, Ordering::Release);
    klog_info!("scheduler: CPU {} entering idle loop", cpu_id);

    loop {
        if local_sched().ready_count() > 0 {
            schedule();
        } else {
            cpu::idle_halt();
        }
    }
}

/// Idle entry for secondary CPUs, called from the SMP bring-up.
pub fn scheduler_start_ap(_arg: *mut c_void) -> ! {
    scheduler_start()
}
