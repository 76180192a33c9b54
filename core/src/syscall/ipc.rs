//! System V shared-memory syscalls.

use ferrite_abi::errno::{EFAULT, EINVAL};
use ferrite_abi::syscall::{IPC_RMID, IPC_STAT, UserShmidDs};
use ferrite_lib::InterruptFrame;
use ferrite_mm::shared_memory::{shmat, shmctl_rmid, shmctl_stat, shmdt, shmget};
use ferrite_mm::user_copy::copy_to_user;
use ferrite_mm::user_ptr::UserPtr;

use crate::sched::task_struct::Task;
use crate::syscall::context::{SysResult, SyscallArgs, user_err};

pub fn sys_shmget(_task: &mut Task, frame: &mut InterruptFrame) -> SysResult {
    let args = SyscallArgs::from_frame(frame);
    match shmget(args.arg0 as u32, args.arg1, args.arg2 as u32) {
        Ok(id) => SysResult::Ok(id as u64),
        Err(err) => SysResult::Err(err.to_errno()),
    }
}

pub fn sys_shmat(task: &mut Task, frame: &mut InterruptFrame) -> SysResult {
    let args = SyscallArgs::from_frame(frame);
    match shmat(task.process_id, args.arg0 as u32, args.arg1) {
        Ok(base) => SysResult::Ok(base),
        Err(err) => SysResult::Err(err.to_errno()),
    }
}

pub fn sys_shmdt(task: &mut Task, frame: &mut InterruptFrame) -> SysResult {
    let args = SyscallArgs::from_frame(frame);
    match shmdt(task.process_id, args.arg0) {
        Ok(()) => SysResult::Ok(0),
        Err(err) => SysResult::Err(err.to_errno()),
    }
}

pub fn sys_shmctl(_task: &mut Task, frame: &mut InterruptFrame) -> SysResult {
    let args = SyscallArgs::from_frame(frame);
    let shmid = args.arg0 as u32;
    match args.arg1 as u32 {
        IPC_RMID => match shmctl_rmid(shmid) {
            Ok(()) => SysResult::Ok(0),
            Err(err) => SysResult::Err(err.to_errno()),
        },
        IPC_STAT => match shmctl_stat(shmid) {
            Ok(ds) => {
                let ptr = match UserPtr::<UserShmidDs>::try_new(args.arg2) {
                    Ok(p) => p,
                    Err(e) => return SysResult::Err(user_err(e)),
                };
                match copy_to_user(ptr, &ds) {
                    Ok(()) => SysResult::Ok(0),
                    Err(_) => SysResult::Err(EFAULT),
                }
            }
            Err(err) => SysResult::Err(err.to_errno()),
        },
        _ => SysResult::Err(EINVAL),
    }
}
