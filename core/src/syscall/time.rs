//! Time syscalls.

use ferrite_abi::errno::{EFAULT, EINTR, EINVAL};
use ferrite_abi::syscall::{CLOCK_MONOTONIC, CLOCK_REALTIME, NSEC_PER_SEC, UserTimespec};
use ferrite_lib::InterruptFrame;
use ferrite_mm::user_copy::{copy_from_user, copy_to_user};
use ferrite_mm::user_ptr::UserPtr;

use crate::clock;
use crate::sched::scheduler::sleep_current_ms;
use crate::sched::task_struct::Task;
use crate::syscall::context::{SysResult, SyscallArgs, user_err};

/// nanosleep(req, rem)
pub fn sys_nanosleep(task: &mut Task, frame: &mut InterruptFrame) -> SysResult {
    let args = SyscallArgs::from_frame(frame);
    let req_ptr = match UserPtr::<UserTimespec>::try_new(args.arg0) {
        Ok(p) => p,
        Err(e) => return SysResult::Err(user_err(e)),
    };
    let req = match copy_from_user(req_ptr) {
        Ok(ts) => ts,
        Err(_) => return SysResult::Err(EFAULT),
    };
    if req.tv_sec < 0 || req.tv_nsec < 0 || req.tv_nsec >= NSEC_PER_SEC {
        return SysResult::Err(EINVAL);
    }

    let total_ms = (req.tv_sec as u64)
        .saturating_mul(1000)
        .saturating_add((req.tv_nsec as u64) / 1_000_000);
    let deadline_ms = clock::uptime_ms().saturating_add(total_ms);

    sleep_current_ms(total_ms);

    // A signal may have cut the sleep short.
    if task.deliverable_signals() != 0 {
        let now = clock::uptime_ms();
        if args.arg1 != 0 && now < deadline_ms {
            let left_ms = deadline_ms - now;
            let rem = UserTimespec {
                tv_sec: (left_ms / 1000) as i64,
                tv_nsec: ((left_ms % 1000) as i64) * 1_000_000,
            };
            if let Ok(rem_ptr) = UserPtr::<UserTimespec>::try_new(args.arg1) {
                let _ = copy_to_user(rem_ptr, &rem);
            }
        }
        if clock::uptime_ms() < deadline_ms {
            return SysResult::Err(EINTR);
        }
    }
    SysResult::Ok(0)
}

/// clock_gettime(clk, &ts)
pub fn sys_clock_gettime(_task: &mut Task, frame: &mut InterruptFrame) -> SysResult {
    let args = SyscallArgs::from_frame(frame);
    let ts = match args.arg0 as u32 {
        CLOCK_MONOTONIC => clock::monotonic_timespec(),
        CLOCK_REALTIME => clock::realtime_timespec(),
        _ => return SysResult::Err(EINVAL),
    };
    let ptr = match UserPtr::<UserTimespec>::try_new(args.arg1) {
        Ok(p) => p,
        Err(e) => return SysResult::Err(user_err(e)),
    };
    match copy_to_user(ptr, &ts) {
        Ok(()) => SysResult::Ok(0),
        Err(_) => SysResult::Err(EFAULT),
    }
}
