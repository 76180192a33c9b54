//! Memory syscalls: mmap, munmap, brk.

use ferrite_abi::syscall::MAP_FAILED;
use ferrite_lib::InterruptFrame;
use ferrite_mm::process_vm::{process_vm_brk, process_vm_mmap, process_vm_munmap};

use crate::sched::task_struct::Task;
use crate::syscall::context::{SysResult, SyscallArgs};

/// mmap(addr, len, prot, flags, fd, off) — anonymous private only; a
/// file-backed request is refused rather than half-honoured (demand
/// paging of file mappings is out of scope).
pub fn sys_mmap(task: &mut Task, frame: &mut InterruptFrame) -> SysResult {
    use ferrite_abi::errno::EINVAL;
    use ferrite_abi::syscall::MAP_ANONYMOUS;

    let args = SyscallArgs::from_frame(frame);
    if args.arg3 as u32 & MAP_ANONYMOUS == 0 {
        return SysResult::Err(EINVAL);
    }

    match process_vm_mmap(
        task.process_id,
        args.arg0,
        args.arg1,
        args.arg2 as u32,
        args.arg3 as u32,
    ) {
        Ok(base) => SysResult::Ok(base),
        Err(_) => SysResult::Ok(MAP_FAILED),
    }
}

pub fn sys_munmap(task: &mut Task, frame: &mut InterruptFrame) -> SysResult {
    let args = SyscallArgs::from_frame(frame);
    match process_vm_munmap(task.process_id, args.arg0, args.arg1) {
        Ok(()) => SysResult::Ok(0),
        Err(err) => SysResult::Err(err.to_errno()),
    }
}

/// brk(addr): 0 queries; otherwise the break moves and the new break is
/// returned (unchanged on failure).
pub fn sys_brk(task: &mut Task, frame: &mut InterruptFrame) -> SysResult {
    let args = SyscallArgs::from_frame(frame);
    SysResult::Ok(process_vm_brk(task.process_id, args.arg0))
}
