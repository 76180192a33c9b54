//! Process, signal, and identity syscalls.

use core::sync::atomic::Ordering;

use ferrite_abi::errno::{EFAULT, EINTR, EINVAL, EPERM, ESRCH};
use ferrite_abi::signal::{
    NSIG, SIG_DFL, SIG_IGN, SIG_SETMASK, SIG_UNBLOCK, SIG_UNCATCHABLE, SigSet, UserSigaction,
    sig_bit,
};
use ferrite_abi::task::{
    CLONE_PARENT_SETTID, INVALID_TASK_ID, WNOHANG, exit_status_normal,
};
use ferrite_abi::task::BlockReason;
use ferrite_lib::InterruptFrame;
use ferrite_mm::user_copy::{copy_from_user, copy_to_user};
use ferrite_mm::user_ptr::UserPtr;

use crate::exec::{ArgVec, do_exec};
use crate::sched::scheduler::{block_current_timeout, yield_now};
use crate::sched::task::{
    WAIT_ANY_CHILD, task_clone, task_exit_current, task_find_by_id, task_fork, task_try_reap,
};
use crate::sched::task_struct::{SignalAction, Task};
use crate::signal::{self, send_signal_pgrp, send_signal_pid, set_action_shared, signal_valid};
use crate::syscall::context::{SysResult, SyscallArgs, copy_path, user_err};

pub fn sys_getpid(task: &mut Task, _frame: &mut InterruptFrame) -> SysResult {
    // POSIX getpid reports the thread-group id.
    SysResult::Ok(task.tgid as u64)
}

pub fn sys_getppid(task: &mut Task, _frame: &mut InterruptFrame) -> SysResult {
    SysResult::Ok(task.parent_id as u64)
}

pub fn sys_yield(_task: &mut Task, frame: &mut InterruptFrame) -> SysResult {
    frame.rax = 0;
    yield_now();
    SysResult::FrameRewritten
}

pub fn sys_fork(task: &mut Task, frame: &mut InterruptFrame) -> SysResult {
    match task_fork(task as *mut Task, frame) {
        Ok(child) => SysResult::Ok(child as u64),
        Err(e) => SysResult::Err(e),
    }
}

/// clone(flags, child_stack, ptid, ctid, tls)
pub fn sys_clone(task: &mut Task, frame: &mut InterruptFrame) -> SysResult {
    let args = SyscallArgs::from_frame(frame);
    let flags = args.arg0;
    let child_stack = args.arg1;
    let ptid = args.arg2;
    let ctid = args.arg3;
    let tls = args.arg4;

    match task_clone(task as *mut Task, frame, flags, child_stack, tls, ctid) {
        Ok(child) => {
            if flags & CLONE_PARENT_SETTID != 0 && ptid != 0 {
                if let Ok(ptr) = UserPtr::<u32>::try_new(ptid) {
                    let _ = copy_to_user(ptr, &child);
                }
            }
            SysResult::Ok(child as u64)
        }
        Err(e) => SysResult::Err(e),
    }
}

pub fn sys_execve(task: &mut Task, frame: &mut InterruptFrame) -> SysResult {
    let args = SyscallArgs::from_frame(frame);

    let mut path = [0u8; crate::exec::EXEC_MAX_PATH];
    let len = match copy_path(args.arg0, &mut path) {
        Ok(len) => len,
        Err(e) => return SysResult::Err(e),
    };

    // Snapshot argv/envp into kernel memory before the old image dies.
    let argv = match ArgVec::from_user(args.arg1) {
        Ok(v) => v,
        Err(e) => return SysResult::Err(e),
    };
    let envp = match ArgVec::from_user(args.arg2) {
        Ok(v) => v,
        Err(e) => return SysResult::Err(e),
    };

    match do_exec(task, frame, &path[..len], argv, envp) {
        Ok(()) => SysResult::FrameRewritten,
        Err(e) => SysResult::Err(e),
    }
}

pub fn sys_exit(_task: &mut Task, frame: &mut InterruptFrame) -> SysResult {
    let args = SyscallArgs::from_frame(frame);
    task_exit_current(exit_status_normal(args.arg0 as u32));
}

/// waitpid(pid, &status, options)
pub fn sys_waitpid(task: &mut Task, frame: &mut InterruptFrame) -> SysResult {
    let args = SyscallArgs::from_frame(frame);
    let wanted = args.arg0 as i64;
    let status_ptr = args.arg1;
    let options = args.arg2 as u32;

    if wanted == 0 || wanted < -1 {
        // Wait-by-process-group is not part of this surface.
        return SysResult::Err(EINVAL);
    }

    loop {
        match task_try_reap(task.task_id, wanted) {
            Err(e) => return SysResult::Err(e),
            Ok(Some((pid, status))) => {
                if status_ptr != 0 {
                    let ptr = match UserPtr::<u32>::try_new(status_ptr) {
                        Ok(p) => p,
                        Err(e) => return SysResult::Err(user_err(e)),
                    };
                    if copy_to_user(ptr, &status).is_err() {
                        return SysResult::Err(EFAULT);
                    }
                }
                return SysResult::Ok(pid as u64);
            }
            Ok(None) => {
                if options & WNOHANG != 0 {
                    return SysResult::Ok(0);
                }
                // Park until a child's exit wakes us through waiting_on.
                let marker = if wanted == -1 {
                    WAIT_ANY_CHILD
                } else {
                    wanted as u32
                };
                task.waiting_on.store(marker, Ordering::Release);
                task.block_reason = BlockReason::WaitingOnChild;
                block_current_timeout(0);
                task.waiting_on.store(INVALID_TASK_ID, Ordering::Release);

                if task.deliverable_signals() & !sig_bit(ferrite_abi::signal::SIGCHLD) != 0 {
                    return SysResult::Err(EINTR);
                }
            }
        }
    }
}

pub fn sys_setsid(task: &mut Task, _frame: &mut InterruptFrame) -> SysResult {
    if task.pgid == task.task_id {
        // A group leader cannot start a new session.
        return SysResult::Err(EPERM);
    }
    task.sid = task.task_id;
    task.pgid = task.task_id;
    SysResult::Ok(task.sid as u64)
}

pub fn sys_setpgid(task: &mut Task, frame: &mut InterruptFrame) -> SysResult {
    let args = SyscallArgs::from_frame(frame);
    let pid = args.arg0 as u32;
    let pgid = args.arg1 as u32;

    let target = if pid == 0 {
        task as *mut Task
    } else {
        let t = task_find_by_id(pid);
        if t.is_null() {
            return SysResult::Err(ESRCH);
        }
        t
    };
    let target_ref = unsafe { &mut *target };
    // Only self or a child may be moved.
    if target_ref.task_id != task.task_id && target_ref.parent_id != task.task_id {
        return SysResult::Err(EPERM);
    }
    target_ref.pgid = if pgid == 0 { target_ref.task_id } else { pgid };
    SysResult::Ok(0)
}

pub fn sys_getpgrp(task: &mut Task, _frame: &mut InterruptFrame) -> SysResult {
    SysResult::Ok(task.pgid as u64)
}

pub fn sys_kill(task: &mut Task, frame: &mut InterruptFrame) -> SysResult {
    let args = SyscallArgs::from_frame(frame);
    let pid = args.arg0 as i64;
    let signum = args.arg1 as u8;

    // Signal 0 probes for existence without delivering.
    if args.arg1 != 0 && !signal_valid(signum) {
        return SysResult::Err(EINVAL);
    }

    let result: Result<(), i32> = if pid > 0 {
        if args.arg1 == 0 {
            if task_find_by_id(pid as u32).is_null() {
                Err(ESRCH)
            } else {
                Ok(())
            }
        } else {
            send_signal_pid(pid as u32, signum)
        }
    } else if pid == 0 {
        send_signal_pgrp(task.pgid, signum).map(|_| ())
    } else if pid == -1 {
        // Everyone except self and init.
        let mut any = false;
        let self_id = task.task_id;
        crate::sched::task::task_iterate_active(|t| {
            let id = unsafe { (*t).task_id };
            if id != self_id && id != ferrite_abi::task::INIT_PID {
                let _ = signal::send_signal(t, signum);
                any = true;
            }
        });
        if any { Ok(()) } else { Err(ESRCH) }
    } else {
        send_signal_pgrp((-pid) as u32, signum).map(|_| ())
    };

    match result {
        Ok(()) => SysResult::Ok(0),
        Err(e) => SysResult::Err(e),
    }
}

/// sigaction(sig, act, oldact)
pub fn sys_sigaction(task: &mut Task, frame: &mut InterruptFrame) -> SysResult {
    let args = SyscallArgs::from_frame(frame);
    let signum = args.arg0 as u8;
    if !signal_valid(signum) || signum as usize > NSIG {
        return SysResult::Err(EINVAL);
    }
    let idx = (signum - 1) as usize;

    if args.arg2 != 0 {
        let action = task.signal_actions[idx];
        let out = UserSigaction {
            sa_handler: action.handler,
            sa_flags: action.flags,
            sa_restorer: action.restorer,
            sa_mask: action.mask,
        };
        let ptr = match UserPtr::<UserSigaction>::try_new(args.arg2) {
            Ok(p) => p,
            Err(e) => return SysResult::Err(user_err(e)),
        };
        if copy_to_user(ptr, &out).is_err() {
            return SysResult::Err(EFAULT);
        }
    }

    if args.arg1 != 0 {
        if sig_bit(signum) & SIG_UNCATCHABLE != 0 {
            return SysResult::Err(EINVAL);
        }
        let ptr = match UserPtr::<UserSigaction>::try_new(args.arg1) {
            Ok(p) => p,
            Err(e) => return SysResult::Err(user_err(e)),
        };
        let new_action = match copy_from_user(ptr) {
            Ok(a) => a,
            Err(_) => return SysResult::Err(EFAULT),
        };
        // A real handler needs a way back: the restorer trampoline.
        if new_action.sa_handler != SIG_DFL
            && new_action.sa_handler != SIG_IGN
            && new_action.sa_restorer == 0
        {
            return SysResult::Err(EINVAL);
        }
        set_action_shared(
            task,
            signum,
            SignalAction {
                handler: new_action.sa_handler,
                mask: new_action.sa_mask & !SIG_UNCATCHABLE,
                flags: new_action.sa_flags,
                restorer: new_action.sa_restorer,
            },
        );
    }

    SysResult::Ok(0)
}

/// sigprocmask(how, set, oldset)
pub fn sys_sigprocmask(task: &mut Task, frame: &mut InterruptFrame) -> SysResult {
    let args = SyscallArgs::from_frame(frame);

    if args.arg2 != 0 {
        let ptr = match UserPtr::<SigSet>::try_new(args.arg2) {
            Ok(p) => p,
            Err(e) => return SysResult::Err(user_err(e)),
        };
        if copy_to_user(ptr, &task.signal_blocked).is_err() {
            return SysResult::Err(EFAULT);
        }
    }

    if args.arg1 != 0 {
        let ptr = match UserPtr::<SigSet>::try_new(args.arg1) {
            Ok(p) => p,
            Err(e) => return SysResult::Err(user_err(e)),
        };
        let set = match copy_from_user(ptr) {
            Ok(s) => s,
            Err(_) => return SysResult::Err(EFAULT),
        };
        let mut blocked = task.signal_blocked;
        match args.arg0 as u32 {
            ferrite_abi::signal::SIG_BLOCK => blocked |= set,
            SIG_UNBLOCK => blocked &= !set,
            SIG_SETMASK => blocked = set,
            _ => return SysResult::Err(EINVAL),
        }
        task.signal_blocked = blocked & !SIG_UNCATCHABLE;
    }

    SysResult::Ok(0)
}

pub fn sys_sigreturn(_task: &mut Task, frame: &mut InterruptFrame) -> SysResult {
    match signal::sigreturn(frame) {
        Ok(()) => SysResult::FrameRewritten,
        Err(e) => SysResult::Err(e),
    }
}
