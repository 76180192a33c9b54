//! Signal generation and user-space delivery.
//!
//! Generation (`kill`, `kill_pgrp`, the TTY hook) sets bits in the
//! target's pending mask and knocks it out of interruptible waits so the
//! interrupted call returns EINTR. Delivery runs on every return to user
//! mode: the lowest-numbered deliverable signal either takes its default
//! action or gets a frame pushed on the user stack — a magic cookie, the
//! full saved register image, and the restorer as the handler's return
//! address. `sigreturn` refuses frames without the cookie or with
//! non-user segment selectors and sanitises RFLAGS so user space cannot
//! smuggle privilege bits through the restore.

use core::sync::atomic::Ordering;

use ferrite_abi::errno;
use ferrite_abi::signal::{
    NSIG, SA_NODEFER, SIG_DFL, SIG_IGN, SIG_UNCATCHABLE, SIGNAL_FRAME_MAGIC, SigDefault, SignalFrame,
    sig_bit, sig_default_action,
};
use ferrite_abi::task::exit_status_signaled;
use ferrite_lib::InterruptFrame;
use ferrite_mm::user_copy::{copy_from_user, copy_to_user};
use ferrite_mm::user_ptr::UserPtr;

use crate::sched::scheduler::{current_task, unblock_task};
use crate::sched::task::{task_exit_current, task_find_by_id, task_iterate_active};
use crate::sched::task_struct::{Task, USER_CODE_SELECTOR, USER_DATA_SELECTOR};

/// RFLAGS bits user space may control through sigreturn.
const RFLAGS_USER_MASK: u64 = 0x0000_0000_0000_0CD5; // CF PF AF ZF SF TF DF OF
/// Interrupts stay enabled in restored frames.
const RFLAGS_IF: u64 = 1 << 9;
const RFLAGS_RESERVED_ONE: u64 = 1 << 1;

/// The handler starts with RSP pointing at the `restorer` field, so its
/// `ret` lands in the trampoline with the rest of the frame intact.
const SIGFRAME_RET_OFFSET: u64 = core::mem::offset_of!(SignalFrame, restorer) as u64;

pub fn signal_valid(signum: u8) -> bool {
    signum >= 1 && (signum as usize) <= NSIG
}

/// Post `signum` to a task: set the pending bit and break it out of an
/// interruptible wait.
pub fn send_signal(task: *mut Task, signum: u8) -> Result<(), i32> {
    if task.is_null() {
        return Err(errno::ESRCH);
    }
    if !signal_valid(signum) {
        return Err(errno::EINVAL);
    }
    let task_ref = unsafe { &*task };
    task_ref
        .signal_pending
        .fetch_or(sig_bit(signum), Ordering::AcqRel);

    if task_ref.is_suspended() && task_ref.block_reason.is_interruptible() {
        let _ = unblock_task(task);
    }
    Ok(())
}

pub fn send_signal_pid(pid: u32, signum: u8) -> Result<(), i32> {
    let task = task_find_by_id(pid);
    if task.is_null() {
        return Err(errno::ESRCH);
    }
    send_signal(task, signum)
}

/// Deliver to every member of a process group. Used by `kill(-pgid)` and
/// the TTY's Ctrl-C/Ctrl-Z/Ctrl-\ handling.
pub fn send_signal_pgrp(pgid: u32, signum: u8) -> Result<usize, i32> {
    if !signal_valid(signum) {
        return Err(errno::EINVAL);
    }
    let mut hit = 0usize;
    let mut targets: [*mut Task; 16] = [core::ptr::null_mut(); 16];
    task_iterate_active(|task| {
        if unsafe { (*task).pgid } == pgid && hit < targets.len() {
            targets[hit] = task;
            hit += 1;
        }
    });
    for task in &targets[..hit] {
        let _ = send_signal(*task, signum);
    }
    if hit == 0 { Err(errno::ESRCH) } else { Ok(hit) }
}

/// TTY hook target (Ctrl-C and friends arrive here from devfs).
pub fn tty_signal_hook(pgid: u32, signum: u8) {
    let _ = send_signal_pgrp(pgid, signum);
}

/// Propagate a sigaction change across a sharing thread group.
pub fn set_action_shared(task: &mut Task, signum: u8, action: crate::sched::task_struct::SignalAction) {
    let idx = (signum - 1) as usize;
    task.signal_actions[idx] = action;
    if task.shares_sighand {
        let tgid = task.tgid;
        let self_ptr = task as *mut Task;
        task_iterate_active(|other| {
            if other != self_ptr && unsafe { (*other).tgid } == tgid {
                unsafe { (*other).signal_actions[idx] = action };
            }
        });
    }
}

// =============================================================================
// Delivery
// =============================================================================

/// Run on every return to user mode with the outgoing register frame.
///
/// Lowest-numbered deliverable signal first; IGNORE clears and recurses,
/// DEFAULT/TERM records the signal in the exit status, anything handled
/// gets a signal frame built on the user stack.
pub fn deliver_pending_signals(frame: &mut InterruptFrame) {
    let current = current_task();
    if current.is_null() {
        return;
    }
    let task = unsafe { &mut *current };
    if !task.is_user() {
        return;
    }

    loop {
        let deliverable = task.deliverable_signals();
        if deliverable == 0 {
            return;
        }
        let signum = (deliverable.trailing_zeros() + 1) as u8;
        let bit = sig_bit(signum);
        task.signal_pending.fetch_and(!bit, Ordering::AcqRel);

        let action = task.signal_actions[(signum - 1) as usize];

        if action.handler == SIG_IGN && bit & SIG_UNCATCHABLE == 0 {
            continue;
        }

        if action.handler == SIG_DFL || bit & SIG_UNCATCHABLE != 0 {
            match sig_default_action(signum) {
                SigDefault::Ignore => continue,
                // The task state machine has no Stopped state, so the
                // stop/continue defaults degrade to ignore here. See the
                // job-control decision in DESIGN.md.
                SigDefault::Stop | SigDefault::Continue => continue,
                SigDefault::Terminate => {
                    task_exit_current(exit_status_signaled(signum));
                }
            }
        }

        // User handler: build the signal frame below the current stack
        // pointer (16-byte aligned) and redirect the return path.
        if push_signal_frame(task, frame, signum, &action) {
            return;
        }
        // Frame push failed (bad user stack): that is fatal for the task.
        task_exit_current(exit_status_signaled(ferrite_abi::signal::SIGSEGV));
    }
}

fn push_signal_frame(
    task: &mut Task,
    frame: &mut InterruptFrame,
    signum: u8,
    action: &crate::sched::task_struct::SignalAction,
) -> bool {
    let frame_size = core::mem::size_of::<SignalFrame>() as u64;
    let frame_addr = frame.rsp.wrapping_sub(frame_size) & !0xF;

    let Ok(user_ptr) = UserPtr::<SignalFrame>::try_new(frame_addr) else {
        return false;
    };

    let saved_mask = task.signal_blocked;
    let sigframe = SignalFrame {
        magic: SIGNAL_FRAME_MAGIC,
        _pad: 0,
        signum: signum as u64,
        restorer: action.restorer,
        rax: frame.rax,
        rbx: frame.rbx,
        rcx: frame.rcx,
        rdx: frame.rdx,
        rsi: frame.rsi,
        rdi: frame.rdi,
        rbp: frame.rbp,
        rsp: frame.rsp,
        r8: frame.r8,
        r9: frame.r9,
        r10: frame.r10,
        r11: frame.r11,
        r12: frame.r12,
        r13: frame.r13,
        r14: frame.r14,
        r15: frame.r15,
        rip: frame.rip,
        rflags: frame.rflags,
        cs: frame.cs,
        ss: frame.ss,
        saved_mask,
    };

    if copy_to_user(user_ptr, &sigframe).is_err() {
        return false;
    }

    // Handler mask: the action's mask plus (unless SA_NODEFER) the signal
    // itself.
    let mut blocked = saved_mask | action.mask;
    if action.flags & SA_NODEFER == 0 {
        blocked |= sig_bit(signum);
    }
    task.signal_blocked = blocked & !SIG_UNCATCHABLE;

    // The handler returns into the trampoline, which invokes sigreturn
    // with the frame still on the stack.
    frame.rsp = frame_addr + SIGFRAME_RET_OFFSET;
    frame.rip = action.handler;
    frame.rdi = signum as u64;
    frame.rsi = 0;
    frame.rdx = 0;
    true
}

/// Restore execution state from the frame `sigreturn` points at.
pub fn sigreturn(frame: &mut InterruptFrame) -> Result<(), i32> {
    let current = current_task();
    if current.is_null() {
        return Err(errno::EINVAL);
    }
    let task = unsafe { &mut *current };

    // At trampoline entry RSP sits just past the `restorer` slot (the
    // handler's ret popped it); recover the frame base from there. The
    // second candidate covers a trampoline that jumps without the pop.
    let rsp = frame.rsp;
    let sigframe = read_signal_frame(rsp.wrapping_sub(SIGFRAME_RET_OFFSET + 8))
        .filter(|sf| sf.magic == SIGNAL_FRAME_MAGIC)
        .or_else(|| {
            read_signal_frame(rsp.wrapping_sub(SIGFRAME_RET_OFFSET))
                .filter(|sf| sf.magic == SIGNAL_FRAME_MAGIC)
        })
        .ok_or(errno::EFAULT)?;

    // Only user-mode segments come back; anything else is a forged frame.
    if sigframe.cs != USER_CODE_SELECTOR || sigframe.ss != USER_DATA_SELECTOR {
        return Err(errno::EFAULT);
    }

    task.signal_blocked = sigframe.saved_mask & !SIG_UNCATCHABLE;

    frame.rax = sigframe.rax;
    frame.rbx = sigframe.rbx;
    frame.rcx = sigframe.rcx;
    frame.rdx = sigframe.rdx;
    frame.rsi = sigframe.rsi;
    frame.rdi = sigframe.rdi;
    frame.rbp = sigframe.rbp;
    frame.rsp = sigframe.rsp;
    frame.r8 = sigframe.r8;
    frame.r9 = sigframe.r9;
    frame.r10 = sigframe.r10;
    frame.r11 = sigframe.r11;
    frame.r12 = sigframe.r12;
    frame.r13 = sigframe.r13;
    frame.r14 = sigframe.r14;
    frame.r15 = sigframe.r15;
    frame.rip = sigframe.rip;
    frame.cs = USER_CODE_SELECTOR;
    frame.ss = USER_DATA_SELECTOR;
    // Flags: user-controllable bits only, interrupts forced on, IOPL 0.
    frame.rflags = (sigframe.rflags & RFLAGS_USER_MASK) | RFLAGS_IF | RFLAGS_RESERVED_ONE;
    Ok(())
}

fn read_signal_frame(rsp: u64) -> Option<SignalFrame> {
    let ptr = UserPtr::<SignalFrame>::try_new(rsp).ok()?;
    copy_from_user(ptr).ok()
}
