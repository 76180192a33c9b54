//! Core test suites: run-queue order, status encoding, signal logic,
//! clock conversions, and cross-thread synchronisation.

use core::ffi::c_void;
use core::sync::atomic::{AtomicU32, Ordering};

use ferrite_abi::task::{
    TaskStatus, exit_status_normal, exit_status_signaled, priority_from_nice, status_exited,
    exit_code_of, term_signal_of,
};
use ferrite_lib::testing::TestResult;
use ferrite_lib::{Mailbox, Semaphore, define_test_suite, fail, pass, test_expect};
use ferrite_mm::kernel_heap::{kfree, kmalloc};

use crate::clock;
use crate::sched::per_cpu::cpu_sched;
use crate::sched::task::task_create_kernel;
use crate::sched::task_struct::Task;

// =============================================================================
// Run queues — exercised on the last CPU's (offline) queue so the live
// scheduler never sees the scratch tasks.
// =============================================================================

const SCRATCH_CPU: usize = ferrite_lib::MAX_CPUS - 1;

fn alloc_scratch_task(priority: u8) -> *mut Task {
    let mem = kmalloc(core::mem::size_of::<Task>()) as *mut Task;
    if mem.is_null() {
        return core::ptr::null_mut();
    }
    unsafe {
        mem.write(Task::invalid());
        (*mem).priority = priority;
        (*mem).set_status(TaskStatus::Ready);
    }
    mem
}

fn free_scratch_task(task: *mut Task) {
    if !task.is_null() {
        kfree(task as *mut c_void);
    }
}

fn test_runqueue_priority_order() -> TestResult {
    let sched = cpu_sched(SCRATCH_CPU);
    let low = alloc_scratch_task(20);
    let high = alloc_scratch_task(3);
    let mid = alloc_scratch_task(10);
    test_expect!(!low.is_null() && !high.is_null() && !mid.is_null());

    test_expect!(sched.enqueue(low) == 0);
    test_expect!(sched.enqueue(high) == 0);
    test_expect!(sched.enqueue(mid) == 0);
    test_expect!(sched.top_priority() == Some(3));

    // Lowest-numbered priority first, regardless of insertion order.
    test_expect!(sched.dequeue_highest() == high);
    test_expect!(sched.dequeue_highest() == mid);
    test_expect!(sched.dequeue_highest() == low);
    test_expect!(sched.dequeue_highest().is_null());
    test_expect!(sched.top_priority().is_none());

    free_scratch_task(low);
    free_scratch_task(high);
    free_scratch_task(mid);
    pass!()
}

fn test_runqueue_fifo_within_priority() -> TestResult {
    let sched = cpu_sched(SCRATCH_CPU);
    let first = alloc_scratch_task(8);
    let second = alloc_scratch_task(8);
    let third = alloc_scratch_task(8);
    test_expect!(!first.is_null() && !second.is_null() && !third.is_null());

    sched.enqueue(first);
    sched.enqueue(second);
    sched.enqueue(third);

    // Same priority drains in arrival order: round-robin.
    test_expect!(sched.dequeue_highest() == first);
    test_expect!(sched.dequeue_highest() == second);
    test_expect!(sched.dequeue_highest() == third);

    free_scratch_task(first);
    free_scratch_task(second);
    free_scratch_task(third);
    pass!()
}

fn test_runqueue_remove_clears_bitmap() -> TestResult {
    let sched = cpu_sched(SCRATCH_CPU);
    let task = alloc_scratch_task(5);
    test_expect!(!task.is_null());

    sched.enqueue(task);
    test_expect!(sched.top_priority() == Some(5));
    test_expect!(sched.remove(task));
    test_expect!(sched.top_priority().is_none());
    test_expect!(!sched.remove(task));

    free_scratch_task(task);
    pass!()
}

fn test_runqueue_duplicate_enqueue_is_idempotent() -> TestResult {
    let sched = cpu_sched(SCRATCH_CPU);
    let task = alloc_scratch_task(5);
    test_expect!(!task.is_null());

    sched.enqueue(task);
    sched.enqueue(task);
    test_expect!(sched.ready_count() == 1);
    test_expect!(sched.dequeue_highest() == task);
    test_expect!(sched.dequeue_highest().is_null());

    free_scratch_task(task);
    pass!()
}

// =============================================================================
// Status encoding, priorities, signal sets
// =============================================================================

fn test_exit_status_encoding() -> TestResult {
    let normal = exit_status_normal(7);
    test_expect!(status_exited(normal));
    test_expect!(exit_code_of(normal) == 7);

    let signaled = exit_status_signaled(9);
    test_expect!(!status_exited(signaled));
    test_expect!(term_signal_of(signaled) == 9);
    pass!()
}

fn test_priority_from_nice_clamps() -> TestResult {
    use ferrite_abi::task::TASK_PRIORITY_DEFAULT;
    test_expect!(priority_from_nice(0) == TASK_PRIORITY_DEFAULT);
    test_expect!(priority_from_nice(-40) == 0);
    test_expect!(priority_from_nice(40) == 31);
    test_expect!(priority_from_nice(1) == TASK_PRIORITY_DEFAULT + 1);
    pass!()
}

fn test_signal_deliverable_masking() -> TestResult {
    use ferrite_abi::signal::{SIGINT, SIGTERM, sig_bit};
    let task = Task::invalid();
    task.signal_pending
        .store(sig_bit(SIGINT) | sig_bit(SIGTERM), Ordering::Release);

    let mut task = task;
    task.signal_blocked = sig_bit(SIGINT);
    // Blocked signals accumulate but do not deliver.
    test_expect!(task.deliverable_signals() == sig_bit(SIGTERM));

    task.signal_blocked = 0;
    let deliverable = task.deliverable_signals();
    // Lowest-numbered first.
    test_expect!((deliverable.trailing_zeros() + 1) as u8 == SIGINT);
    pass!()
}

fn test_uncatchable_signals() -> TestResult {
    use ferrite_abi::signal::{SIG_UNCATCHABLE, SIGKILL, SIGSTOP, sig_bit};
    test_expect!(SIG_UNCATCHABLE & sig_bit(SIGKILL) != 0);
    test_expect!(SIG_UNCATCHABLE & sig_bit(SIGSTOP) != 0);
    test_expect!(SIG_UNCATCHABLE & sig_bit(2) == 0);
    pass!()
}

// =============================================================================
// Clock
// =============================================================================

fn test_clock_tick_conversion() -> TestResult {
    let hz = clock::tick_hz() as u64;
    test_expect!(hz > 0);
    // One full second of milliseconds is exactly hz ticks.
    test_expect!(clock::ms_to_ticks(1000) == hz);
    // Sub-tick requests round up to one tick.
    test_expect!(clock::ms_to_ticks(1) >= 1);
    pass!()
}

fn test_monotonic_timespec_shape() -> TestResult {
    let ts = clock::monotonic_timespec();
    test_expect!(ts.tv_nsec >= 0 && ts.tv_nsec < 1_000_000_000);
    pass!()
}

// =============================================================================
// Synchronisation across kernel threads
// =============================================================================

static HANDSHAKE_SEM: Semaphore = Semaphore::new(0);
static HANDSHAKE_STATE: AtomicU32 = AtomicU32::new(0);

fn handshake_helper(_arg: *mut c_void) {
    HANDSHAKE_STATE.store(1, Ordering::Release);
    HANDSHAKE_SEM.signal();
}

fn test_semaphore_cross_thread_handshake() -> TestResult {
    HANDSHAKE_STATE.store(0, Ordering::Release);
    let tid = task_create_kernel(b"sem_helper", handshake_helper, core::ptr::null_mut(), 10);
    test_expect!(tid != ferrite_abi::task::INVALID_TASK_ID);

    // Block until the helper signals (bounded by the timeout).
    match HANDSHAKE_SEM.wait(2000) {
        Ok(()) => {}
        Err(e) => return fail!("semaphore wait failed: {:?}", e),
    }
    test_expect!(HANDSHAKE_STATE.load(Ordering::Acquire) == 1);
    pass!()
}

fn test_semaphore_counting() -> TestResult {
    let sem = Semaphore::new(2);
    test_expect!(sem.try_wait());
    test_expect!(sem.try_wait());
    test_expect!(!sem.try_wait());
    sem.signal();
    test_expect!(sem.try_wait());
    pass!()
}

fn test_mailbox_multiset_integrity() -> TestResult {
    // Capacity-bounded: every message posted is fetched exactly once, in
    // order, with no loss or duplication.
    let mbox: Mailbox<8> = Mailbox::new();
    for i in 1..=8usize {
        if mbox.post(i as *mut c_void, 0).is_err() {
            return fail!("post {} failed", i);
        }
    }
    test_expect!(mbox.len() == 8);
    for i in 1..=8usize {
        match mbox.fetch(0) {
            Ok(msg) => test_expect!(msg as usize == i, "message {} out of order", i),
            Err(_) => return fail!("fetch {} failed", i),
        }
    }
    test_expect!(mbox.is_empty());
    pass!()
}

define_test_suite!(
    core_runqueue,
    [
        test_runqueue_priority_order,
        test_runqueue_fifo_within_priority,
        test_runqueue_remove_clears_bitmap,
        test_runqueue_duplicate_enqueue_is_idempotent,
    ]
);

define_test_suite!(
    core_process_model,
    [
        test_exit_status_encoding,
        test_priority_from_nice_clamps,
        test_signal_deliverable_masking,
        test_uncatchable_signals,
    ]
);

define_test_suite!(core_clock, [test_clock_tick_conversion, test_monotonic_timespec_shape]);

define_test_suite!(
    core_sync,
    [
        test_semaphore_cross_thread_handshake,
        test_semaphore_counting,
        test_mailbox_multiset_integrity,
    ]
);
