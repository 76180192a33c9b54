//! Trap entry points called by the arch interrupt glue.
//!
//! The glue saves the register frame on the per-CPU kernel stack, sends
//! EOI where needed, and calls in here. Both entries may context-switch;
//! every task has its own kernel stack, so the interrupted frame stays put
//! until the task is dispatched again.

use ferrite_abi::signal::{SIGBUS, SIGSEGV};
use ferrite_abi::task::exit_status_signaled;
use ferrite_lib::{InterruptFrame, PreemptGuard, klog_error};
use ferrite_mm::process_vm::process_vm_handle_fault;
use ferrite_mm::user_copy;

use crate::clock;
use crate::sched::scheduler::{self, current_task};
use crate::sched::task::task_exit_current;
use crate::signal::{deliver_pending_signals, send_signal};

/// Platform timer interrupt: advance the clock, wake sleepers, preempt.
pub fn handle_timer_interrupt(frame: &mut InterruptFrame) {
    let now = clock::clock_tick();
    let should_resched = scheduler::scheduler_timer_tick(now, frame.from_user());

    if should_resched {
        if PreemptGuard::is_active() {
            PreemptGuard::mark_reschedule_pending();
        } else {
            scheduler::schedule();
        }
    }

    // Delivery check on every return to user mode.
    if frame.from_user() {
        deliver_pending_signals(frame);
    }
}

/// Page-fault entry. `fault_addr` is CR2, `error_code` the hardware code
/// (bit 0 = present, bit 1 = write, bit 2 = user).
pub fn handle_page_fault(frame: &mut InterruptFrame, fault_addr: u64, error_code: u64) {
    // A fault inside an armed kernel user-copy means a racing unmap beat
    // the pre-validation. The sentinel keeps it from being treated as a
    // kernel bug; the offending task dies with SIGSEGV instead.
    let in_user_copy = user_copy::fault_in_user_access();

    let from_user = frame.from_user() || in_user_copy;
    if from_user {
        let current = current_task();
        if !current.is_null() {
            let pid_vm = unsafe { (*current).process_id };
            if !in_user_copy && process_vm_handle_fault(pid_vm, fault_addr, error_code) {
                // CoW write satisfied; retry the instruction.
                return;
            }
            // Genuine bad access.
            let task_id = unsafe { (*current).task_id };
            klog_error!(
                "task {}: segmentation fault at 0x{:x} (err 0x{:x}, rip 0x{:x})",
                task_id,
                fault_addr,
                error_code,
                frame.rip
            );
            let _ = send_signal(current, SIGSEGV);
            // Default action runs on the way back out; an unhandled
            // SIGSEGV terminates there.
            deliver_pending_signals(frame);
            return;
        }
    }

    panic!(
        "kernel page fault at 0x{:x} (err 0x{:x}, rip 0x{:x})",
        fault_addr, error_code, frame.rip
    );
}

/// Alignment-check entry: misaligned user access surfaces as SIGBUS.
pub fn handle_alignment_fault(frame: &mut InterruptFrame) {
    if frame.from_user() {
        let current = current_task();
        if !current.is_null() {
            let _ = send_signal(current, SIGBUS);
            deliver_pending_signals(frame);
            return;
        }
        task_exit_current(exit_status_signaled(SIGBUS));
    }
    panic!("kernel alignment fault at rip 0x{:x}", frame.rip);
}
