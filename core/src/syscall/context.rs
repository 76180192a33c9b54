//! Per-syscall context: the caller's task, its register frame, and the
//! decoded argument registers.

use ferrite_abi::errno::errno_ret;
use ferrite_lib::InterruptFrame;
use ferrite_mm::user_ptr::UserPtrError;

use crate::sched::task_struct::Task;

/// What the dispatcher writes back to the return register.
pub enum SysResult {
    /// Non-negative success value.
    Ok(u64),
    /// Negative errno.
    Err(i32),
    /// The handler rewrote the frame itself (exec, sigreturn, exit).
    FrameRewritten,
}

pub type SyscallHandler = fn(&mut Task, &mut InterruptFrame) -> SysResult;

#[derive(Clone, Copy)]
pub struct SyscallArgs {
    pub arg0: u64,
    pub arg1: u64,
    pub arg2: u64,
    pub arg3: u64,
    pub arg4: u64,
    pub arg5: u64,
}

impl SyscallArgs {
    pub fn from_frame(frame: &InterruptFrame) -> Self {
        Self {
            arg0: frame.rdi,
            arg1: frame.rsi,
            arg2: frame.rdx,
            arg3: frame.r10,
            arg4: frame.r8,
            arg5: frame.r9,
        }
    }

    #[inline]
    pub fn fd(&self, which: usize) -> i32 {
        self.raw(which) as i32
    }

    #[inline]
    pub fn raw(&self, which: usize) -> u64 {
        match which {
            0 => self.arg0,
            1 => self.arg1,
            2 => self.arg2,
            3 => self.arg3,
            4 => self.arg4,
            _ => self.arg5,
        }
    }
}

pub fn apply_result(frame: &mut InterruptFrame, result: SysResult) {
    match result {
        SysResult::Ok(value) => frame.rax = value,
        SysResult::Err(errno) => frame.rax = errno_ret(errno),
        SysResult::FrameRewritten => {}
    }
}

/// Map a user-pointer validation failure onto its errno.
pub fn user_err(err: UserPtrError) -> i32 {
    use ferrite_abi::errno::*;
    match err {
        UserPtrError::Overflow => EFAULT,
        UserPtrError::Null => EFAULT,
        UserPtrError::NonCanonical => EFAULT,
        UserPtrError::OutOfUserRange => EFAULT,
        UserPtrError::NotMapped => EFAULT,
        UserPtrError::CopyFailed => EFAULT,
    }
}

/// Copy a user path into a fixed kernel buffer; ENAMETOOLONG when no NUL
/// fits.
pub fn copy_path(user_ptr: u64, buf: &mut [u8]) -> Result<usize, i32> {
    use ferrite_abi::errno::{EFAULT, ENAMETOOLONG};
    use ferrite_mm::user_copy::copy_user_cstr;
    if user_ptr == 0 {
        return Err(EFAULT);
    }
    match copy_user_cstr(buf, user_ptr) {
        Ok(len) => Ok(len),
        Err(UserPtrError::Overflow) => Err(ENAMETOOLONG),
        Err(_) => Err(EFAULT),
    }
}
