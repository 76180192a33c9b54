//! Fault-safe copies across the user/kernel boundary.
//!
//! Strategy: validate first, then copy. `user_range_ok` walks the current
//! process's page tables and requires every covered page to be mapped USER
//! (and WRITABLE for writes). The copy then runs with a per-CPU
//! user-access marker raised; if a racing unmap still faults the access,
//! the page-fault handler consults the marker, aborts back to the syscall
//! path, and the operation reports `CopyFailed` → EFAULT instead of
//! killing the task.
//!
//! Integers and structs are never read through raw user pointers; every
//! crossing goes through `copy_from_user`/`copy_to_user`.

use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use ferrite_abi::addr::VirtAddr;
use ferrite_abi::task::INVALID_PROCESS_ID;
use ferrite_lib::percpu::{MAX_CPUS, get_current_cpu};

use crate::layout::PAGE_SIZE_4KB;
use crate::paging::AddressSpace;
use crate::process_vm::process_vm_space;
use crate::user_ptr::{UserBytes, UserPtr, UserPtrError, UserVirtAddr};

// Per-CPU: the pid whose address space the in-flight syscall validates
// against, and whether a user copy is active.
static SYSCALL_PID: [AtomicU32; MAX_CPUS] = [const { AtomicU32::new(INVALID_PROCESS_ID) }; MAX_CPUS];
static USER_ACCESS_ACTIVE: [AtomicBool; MAX_CPUS] = [const { AtomicBool::new(false) }; MAX_CPUS];
static USER_ACCESS_FAULTED: [AtomicBool; MAX_CPUS] = [const { AtomicBool::new(false) }; MAX_CPUS];

/// Scope guard installed by the syscall dispatcher: while it lives, user
/// pointer validation resolves against `pid`'s address space.
pub struct SyscallPidGuard {
    cpu: usize,
    previous: u32,
}

pub fn set_syscall_process_id(pid: u32) -> SyscallPidGuard {
    let cpu = get_current_cpu();
    let previous = SYSCALL_PID[cpu].swap(pid, Ordering::AcqRel);
    SyscallPidGuard { cpu, previous }
}

impl Drop for SyscallPidGuard {
    fn drop(&mut self) {
        SYSCALL_PID[self.cpu].store(self.previous, Ordering::Release);
    }
}

pub fn current_syscall_pid() -> u32 {
    SYSCALL_PID[get_current_cpu()].load(Ordering::Acquire)
}

fn current_space() -> Option<AddressSpace> {
    let pid = current_syscall_pid();
    if pid == INVALID_PROCESS_ID {
        return None;
    }
    process_vm_space(pid)
}

/// Page-fault hook: true if the faulting access was a kernel-side user
/// copy, in which case the fault is converted to an error return rather
/// than a kill. The flag is consumed by [`UserAccessScope::finish`].
pub fn fault_in_user_access() -> bool {
    let cpu = get_current_cpu();
    if USER_ACCESS_ACTIVE[cpu].load(Ordering::Acquire) {
        USER_ACCESS_FAULTED[cpu].store(true, Ordering::Release);
        true
    } else {
        false
    }
}

struct UserAccessScope {
    cpu: usize,
}

impl UserAccessScope {
    fn begin() -> Self {
        let cpu = get_current_cpu();
        USER_ACCESS_FAULTED[cpu].store(false, Ordering::Release);
        USER_ACCESS_ACTIVE[cpu].store(true, Ordering::Release);
        Self { cpu }
    }

    fn finish(self) -> Result<(), UserPtrError> {
        USER_ACCESS_ACTIVE[self.cpu].store(false, Ordering::Release);
        if USER_ACCESS_FAULTED[self.cpu].swap(false, Ordering::AcqRel) {
            Err(UserPtrError::CopyFailed)
        } else {
            Ok(())
        }
    }
}

/// The spec-level `user_range_ok`: the range is non-empty, does not wrap,
/// lies below the kernel base (enforced by `UserVirtAddr`), and every
/// covered page is mapped USER — plus WRITABLE when `write`.
pub fn user_range_ok(addr: UserVirtAddr, len: usize, write: bool) -> Result<(), UserPtrError> {
    if len == 0 {
        return Ok(());
    }
    let Some(space) = current_space() else {
        return Err(UserPtrError::NotMapped);
    };

    let start = addr.as_u64();
    let end = start + len as u64;
    let mut page = start & !(PAGE_SIZE_4KB - 1);
    while page < end {
        if !space.is_user_accessible(VirtAddr::new(page), write) {
            return Err(UserPtrError::NotMapped);
        }
        page = page.wrapping_add(PAGE_SIZE_4KB);
    }
    Ok(())
}

pub fn copy_from_user<T: Copy>(src: UserPtr<T>) -> Result<T, UserPtrError> {
    user_range_ok(src.addr(), core::mem::size_of::<T>(), false)?;

    let scope = UserAccessScope::begin();
    let value = unsafe { ptr::read_unaligned(src.as_ptr()) };
    scope.finish()?;
    Ok(value)
}

pub fn copy_to_user<T: Copy>(dst: UserPtr<T>, value: &T) -> Result<(), UserPtrError> {
    user_range_ok(dst.addr(), core::mem::size_of::<T>(), true)?;

    let scope = UserAccessScope::begin();
    unsafe {
        ptr::write_unaligned(dst.as_mut_ptr(), *value);
    }
    scope.finish()
}

pub fn copy_bytes_from_user(src: UserBytes, dst: &mut [u8]) -> Result<usize, UserPtrError> {
    let copy_len = src.len().min(dst.len());
    if copy_len == 0 {
        return Ok(0);
    }
    user_range_ok(src.base(), copy_len, false)?;

    let scope = UserAccessScope::begin();
    unsafe {
        ptr::copy_nonoverlapping(src.base().as_ptr::<u8>(), dst.as_mut_ptr(), copy_len);
    }
    scope.finish()?;
    Ok(copy_len)
}

pub fn copy_bytes_to_user(dst: UserBytes, src: &[u8]) -> Result<usize, UserPtrError> {
    let copy_len = dst.len().min(src.len());
    if copy_len == 0 {
        return Ok(0);
    }
    user_range_ok(dst.base(), copy_len, true)?;

    let scope = UserAccessScope::begin();
    unsafe {
        ptr::copy_nonoverlapping(src.as_ptr(), dst.base().as_mut_ptr::<u8>(), copy_len);
    }
    scope.finish()?;
    Ok(copy_len)
}

/// Copy a NUL-terminated string out of user space into `dst`, always
/// leaving it terminated. Fails with `Overflow` if no NUL shows up within
/// the buffer (ENAMETOOLONG at the syscall layer).
pub fn copy_user_cstr(dst: &mut [u8], user_src: u64) -> Result<usize, UserPtrError> {
    if dst.len() < 2 {
        return Err(UserPtrError::Null);
    }
    let cap = dst.len() - 1;

    // Byte-wise with per-page validation so a terminator on the first page
    // doesn't require the next page to be mapped.
    let mut copied = 0usize;
    while copied < cap {
        let addr = user_src + copied as u64;
        let chunk_end = (addr & !(PAGE_SIZE_4KB - 1)) + PAGE_SIZE_4KB;
        let chunk = ((chunk_end - addr) as usize).min(cap - copied);

        let bytes = UserBytes::try_new(addr, chunk)?;
        let n = copy_bytes_from_user(bytes, &mut dst[copied..copied + chunk])?;
        for i in 0..n {
            if dst[copied + i] == 0 {
                return Ok(copied + i);
            }
        }
        copied += n;
    }
    dst[cap] = 0;
    Err(UserPtrError::Overflow)
}
