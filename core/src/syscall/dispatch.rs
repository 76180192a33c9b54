//! Syscall dispatch.
//!
//! The trap glue hands the saved register frame to [`syscall_handle`];
//! the number in `rax` picks a handler from the static table, which may
//! rewrite the return value (all of them) or the whole frame (`execve`,
//! `sigreturn`). Pending signals are delivered on the way out.

use ferrite_abi::errno::{ENOSYS, errno_ret};
use ferrite_abi::syscall::*;
use ferrite_lib::{InterruptFrame, klog_debug};
use ferrite_mm::user_copy::set_syscall_process_id;

use crate::sched::scheduler::current_task;
use crate::sched::task_struct::{TASK_FLAG_NO_PREEMPT, Task};
use crate::signal::deliver_pending_signals;
use crate::syscall::context::{SyscallHandler, apply_result};

/// Keeps the task on this CPU while its syscall runs; cleared on every
/// exit path including panics.
struct NoPreemptGuard {
    task: *mut Task,
}

impl NoPreemptGuard {
    fn new(task: *mut Task) -> Self {
        unsafe { (*task).flags |= TASK_FLAG_NO_PREEMPT };
        Self { task }
    }
}

impl Drop for NoPreemptGuard {
    fn drop(&mut self) {
        if !self.task.is_null() {
            unsafe { (*self.task).flags &= !TASK_FLAG_NO_PREEMPT };
        }
    }
}

macro_rules! syscall_table {
    (size: $size:expr; $( [$num:expr] => $handler:path; )*) => {{
        let mut table: [Option<SyscallHandler>; $size] = [None; $size];
        $(
            table[$num as usize] = Some($handler as SyscallHandler);
        )*
        table
    }};
}

static SYSCALL_TABLE: [Option<SyscallHandler>; SYSCALL_TABLE_SIZE] = syscall_table! {
    size: SYSCALL_TABLE_SIZE;

    // File & directory
    [SYS_OPEN]     => super::fs::sys_open;
    [SYS_OPENAT]   => super::fs::sys_openat;
    [SYS_CLOSE]    => super::fs::sys_close;
    [SYS_READ]     => super::fs::sys_read;
    [SYS_WRITE]    => super::fs::sys_write;
    [SYS_LSEEK]    => super::fs::sys_lseek;
    [SYS_FSTAT]    => super::fs::sys_fstat;
    [SYS_STAT]     => super::fs::sys_stat;
    [SYS_FSTATAT]  => super::fs::sys_fstatat;
    [SYS_GETDENTS] => super::fs::sys_getdents;
    [SYS_MKDIR]    => super::fs::sys_mkdir;
    [SYS_RMDIR]    => super::fs::sys_rmdir;
    [SYS_UNLINK]   => super::fs::sys_unlink;
    [SYS_UNLINKAT] => super::fs::sys_unlinkat;
    [SYS_RENAME]   => super::fs::sys_rename;
    [SYS_CHDIR]    => super::fs::sys_chdir;
    [SYS_GETCWD]   => super::fs::sys_getcwd;
    [SYS_DUP]      => super::fs::sys_dup;
    [SYS_DUP2]     => super::fs::sys_dup2;
    [SYS_DUP3]     => super::fs::sys_dup3;
    [SYS_PIPE]     => super::fs::sys_pipe;
    [SYS_PIPE2]    => super::fs::sys_pipe2;
    [SYS_FCNTL]    => super::fs::sys_fcntl;
    [SYS_IOCTL]    => super::fs::sys_ioctl;

    // Process
    [SYS_GETPID]      => super::process::sys_getpid;
    [SYS_GETPPID]     => super::process::sys_getppid;
    [SYS_FORK]        => super::process::sys_fork;
    [SYS_CLONE]       => super::process::sys_clone;
    [SYS_EXECVE]      => super::process::sys_execve;
    [SYS_EXIT]        => super::process::sys_exit;
    [SYS_WAITPID]     => super::process::sys_waitpid;
    [SYS_SETSID]      => super::process::sys_setsid;
    [SYS_SETPGID]     => super::process::sys_setpgid;
    [SYS_GETPGRP]     => super::process::sys_getpgrp;
    [SYS_KILL]        => super::process::sys_kill;
    [SYS_SIGACTION]   => super::process::sys_sigaction;
    [SYS_SIGPROCMASK] => super::process::sys_sigprocmask;
    [SYS_SIGRETURN]   => super::process::sys_sigreturn;
    [SYS_YIELD]       => super::process::sys_yield;

    // Memory
    [SYS_MMAP]   => super::memory::sys_mmap;
    [SYS_MUNMAP] => super::memory::sys_munmap;
    [SYS_BRK]    => super::memory::sys_brk;

    // Time
    [SYS_NANOSLEEP]     => super::time::sys_nanosleep;
    [SYS_CLOCK_GETTIME] => super::time::sys_clock_gettime;

    // IPC
    [SYS_SHMGET] => super::ipc::sys_shmget;
    [SYS_SHMAT]  => super::ipc::sys_shmat;
    [SYS_SHMDT]  => super::ipc::sys_shmdt;
    [SYS_SHMCTL] => super::ipc::sys_shmctl;

    // Multiplexing
    [SYS_POLL]   => super::poll::sys_poll;
    [SYS_SELECT] => super::poll::sys_select;
};

pub fn syscall_handle(frame: &mut InterruptFrame) {
    let task = current_task();
    if task.is_null() {
        frame.rax = errno_ret(ENOSYS);
        return;
    }
    let task_ref = unsafe { &mut *task };
    if !task_ref.is_user() {
        frame.rax = errno_ret(ENOSYS);
        return;
    }

    let _no_preempt = NoPreemptGuard::new(task);
    let _pid_guard = set_syscall_process_id(task_ref.process_id);

    let sysno = frame.rax;
    let handler = SYSCALL_TABLE
        .get(sysno as usize)
        .and_then(|entry| entry.as_ref());

    match handler {
        Some(handler) => {
            let result = handler(task_ref, frame);
            apply_result(frame, result);
        }
        None => {
            klog_debug!("syscall: unknown number {} -> ENOSYS", sysno);
            frame.rax = errno_ret(ENOSYS);
        }
    }

    deliver_pending_signals(frame);
}
