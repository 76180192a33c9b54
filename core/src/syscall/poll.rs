//! I/O multiplexing: poll and select.
//!
//! Both evaluate readiness through the descriptor layer, park on the
//! shared poll wait queue, and are woken by any pipe/console readiness
//! change; the check-under-wakeup loop then re-evaluates.

use ferrite_abi::errno::{EFAULT, EINTR, EINVAL};
use ferrite_abi::fs::{POLLERR, POLLHUP, POLLIN, POLLNVAL, POLLOUT, UserFdSet, UserPollFd};
use ferrite_abi::syscall::UserTimespec;
use ferrite_lib::{InterruptFrame, WaitOutcome};
use ferrite_mm::user_copy::{copy_from_user, copy_to_user};
use ferrite_mm::user_ptr::{UserPtr, UserSlice};

use crate::clock;
use crate::sched::task_struct::Task;
use crate::syscall::context::{SysResult, SyscallArgs, user_err};

const MAX_POLL_FDS: usize = 16;

fn eval_poll(pid: u32, fds: &mut [UserPollFd]) -> usize {
    let mut ready = 0;
    for entry in fds.iter_mut() {
        if entry.fd < 0 {
            entry.revents = 0;
            continue;
        }
        let revents = ferrite_fs::fd_poll_revents(
            pid,
            entry.fd,
            entry.events | POLLERR | POLLHUP | POLLNVAL,
        );
        entry.revents = revents;
        if revents != 0 {
            ready += 1;
        }
    }
    ready
}

/// poll(fds, nfds, timeout_ticks). Timeout < 0 blocks forever, 0 is a
/// pure poll.
pub fn sys_poll(task: &mut Task, frame: &mut InterruptFrame) -> SysResult {
    let args = SyscallArgs::from_frame(frame);
    let nfds = args.arg1 as usize;
    let timeout_ticks = args.arg2 as i64;

    if nfds > MAX_POLL_FDS {
        return SysResult::Err(EINVAL);
    }

    let mut fds = [UserPollFd {
        fd: -1,
        events: 0,
        revents: 0,
    }; MAX_POLL_FDS];

    if nfds > 0 {
        let user_fds = match UserSlice::<UserPollFd>::try_new(args.arg0, nfds) {
            Ok(s) => s,
            Err(e) => return SysResult::Err(user_err(e)),
        };
        for (i, slot) in fds[..nfds].iter_mut().enumerate() {
            let ptr = match UserPtr::<UserPollFd>::try_new(
                user_fds.base().as_u64() + (i * core::mem::size_of::<UserPollFd>()) as u64,
            ) {
                Ok(p) => p,
                Err(e) => return SysResult::Err(user_err(e)),
            };
            *slot = match copy_from_user(ptr) {
                Ok(v) => v,
                Err(_) => return SysResult::Err(EFAULT),
            };
        }
    }

    let pid = task.process_id;
    let timeout_ms = if timeout_ticks < 0 {
        0
    } else {
        let hz = clock::tick_hz() as u64;
        ((timeout_ticks as u64).saturating_mul(1000) / hz.max(1)).max(1)
    };

    let mut ready = eval_poll(pid, &mut fds[..nfds]);
    if ready == 0 && timeout_ticks != 0 {
        let outcome = ferrite_fs::poll_wait(
            || {
                let mut probe = fds;
                eval_poll(pid, &mut probe[..nfds]) > 0
            },
            timeout_ms,
        );
        if outcome == WaitOutcome::Interrupted {
            return SysResult::Err(EINTR);
        }
        ready = eval_poll(pid, &mut fds[..nfds]);
    }

    // Write revents back.
    for (i, slot) in fds[..nfds].iter().enumerate() {
        let addr = args.arg0 + (i * core::mem::size_of::<UserPollFd>()) as u64;
        let ptr = match UserPtr::<UserPollFd>::try_new(addr) {
            Ok(p) => p,
            Err(e) => return SysResult::Err(user_err(e)),
        };
        if copy_to_user(ptr, slot).is_err() {
            return SysResult::Err(EFAULT);
        }
    }
    SysResult::Ok(ready as u64)
}

/// select(nfds, readfds, writefds, exceptfds, timeout) over the poll
/// machinery.
pub fn sys_select(task: &mut Task, frame: &mut InterruptFrame) -> SysResult {
    let args = SyscallArgs::from_frame(frame);
    let nfds = (args.arg0 as usize).min(ferrite_abi::fs::FD_SETSIZE);

    let read_set = match read_fdset(args.arg1) {
        Ok(s) => s,
        Err(e) => return SysResult::Err(e),
    };
    let write_set = match read_fdset(args.arg2) {
        Ok(s) => s,
        Err(e) => return SysResult::Err(e),
    };
    // Exceptional conditions are not tracked; the set is consumed and
    // cleared.
    let _except_set = match read_fdset(args.arg3) {
        Ok(s) => s,
        Err(e) => return SysResult::Err(e),
    };

    let timeout_ms: u64 = if args.arg4 == 0 {
        0
    } else {
        let ptr = match UserPtr::<UserTimespec>::try_new(args.arg4) {
            Ok(p) => p,
            Err(e) => return SysResult::Err(user_err(e)),
        };
        let ts = match copy_from_user(ptr) {
            Ok(v) => v,
            Err(_) => return SysResult::Err(EFAULT),
        };
        ((ts.tv_sec as u64) * 1000 + (ts.tv_nsec as u64) / 1_000_000).max(1)
    };

    let pid = task.process_id;
    let eval = |ready_read: &mut UserFdSet, ready_write: &mut UserFdSet| -> usize {
        let mut count = 0;
        for fd in 0..nfds {
            if read_set.is_set(fd) {
                let revents = ferrite_fs::fd_poll_revents(pid, fd as i32, POLLIN | POLLHUP);
                if revents != 0 {
                    ready_read.set(fd);
                    count += 1;
                }
            }
            if write_set.is_set(fd) {
                let revents = ferrite_fs::fd_poll_revents(pid, fd as i32, POLLOUT | POLLERR);
                if revents != 0 {
                    ready_write.set(fd);
                    count += 1;
                }
            }
        }
        count
    };

    let mut ready_read = UserFdSet::default();
    let mut ready_write = UserFdSet::default();
    let mut count = eval(&mut ready_read, &mut ready_write);

    if count == 0 && (args.arg4 == 0 || timeout_ms > 0) {
        let outcome = ferrite_fs::poll_wait(
            || {
                let mut probe_read = UserFdSet::default();
                let mut probe_write = UserFdSet::default();
                eval(&mut probe_read, &mut probe_write) > 0
            },
            timeout_ms,
        );
        if outcome == WaitOutcome::Interrupted {
            return SysResult::Err(EINTR);
        }
        ready_read = UserFdSet::default();
        ready_write = UserFdSet::default();
        count = eval(&mut ready_read, &mut ready_write);
    }

    if let Err(e) = write_fdset(args.arg1, &ready_read) {
        return SysResult::Err(e);
    }
    if let Err(e) = write_fdset(args.arg2, &ready_write) {
        return SysResult::Err(e);
    }
    if let Err(e) = write_fdset(args.arg3, &UserFdSet::default()) {
        return SysResult::Err(e);
    }
    SysResult::Ok(count as u64)
}

fn read_fdset(user_ptr: u64) -> Result<UserFdSet, i32> {
    if user_ptr == 0 {
        return Ok(UserFdSet::default());
    }
    let ptr = UserPtr::<UserFdSet>::try_new(user_ptr).map_err(user_err)?;
    copy_from_user(ptr).map_err(|_| EFAULT)
}

fn write_fdset(user_ptr: u64, set: &UserFdSet) -> Result<(), i32> {
    if user_ptr == 0 {
        return Ok(());
    }
    let ptr = UserPtr::<UserFdSet>::try_new(user_ptr).map_err(user_err)?;
    copy_to_user(ptr, set).map_err(|_| EFAULT)
}
