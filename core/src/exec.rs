//! Program execution: image loading and the initial user stack.
//!
//! `do_exec` validates the binary, snapshots argv/envp into kernel
//! memory, throws the old user mappings away, loads the PT_LOAD segments,
//! builds the initial stack as `[argc][argv…NULL][envp…NULL][auxv
//! NULL][strings]`, closes close-on-exec descriptors, and rewrites the
//! caller's return frame to the new entry point. On any failure before
//! the old image is destroyed the syscall returns with the caller
//! untouched; after that point a failure is fatal for the process.

use core::ffi::c_void;

use ferrite_abi::errno;
use ferrite_lib::{InterruptFrame, klog_debug, klog_info};
use ferrite_mm::elf::{LoadedImage, load_elf, write_to_space};
use ferrite_mm::kernel_heap::{kfree, kmalloc};
use ferrite_mm::layout::USER_STACK_TOP_VA;
use ferrite_mm::process_vm::{
    process_vm_reset_user, process_vm_set_heap_start, process_vm_space,
};
use ferrite_mm::user_copy::{copy_user_cstr, copy_from_user};
use ferrite_mm::user_ptr::UserPtr;

use crate::sched::task_struct::{
    RFLAGS_DEFAULT, Task, USER_CODE_SELECTOR, USER_DATA_SELECTOR,
};

pub const EXEC_MAX_PATH: usize = 256;
pub const EXEC_MAX_ARGS: usize = 16;
pub const EXEC_MAX_ARG_LEN: usize = 128;
const EXEC_MAX_IMAGE: usize = 256 * 1024;

/// Kernel-side snapshot of an argv/envp vector.
pub struct ArgVec {
    storage: [[u8; EXEC_MAX_ARG_LEN]; EXEC_MAX_ARGS],
    lengths: [usize; EXEC_MAX_ARGS],
    count: usize,
}

impl ArgVec {
    pub const fn new() -> Self {
        Self {
            storage: [[0; EXEC_MAX_ARG_LEN]; EXEC_MAX_ARGS],
            lengths: [0; EXEC_MAX_ARGS],
            count: 0,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) -> Result<(), i32> {
        if self.count >= EXEC_MAX_ARGS {
            return Err(errno::E2BIG);
        }
        if bytes.len() >= EXEC_MAX_ARG_LEN {
            return Err(errno::E2BIG);
        }
        self.storage[self.count][..bytes.len()].copy_from_slice(bytes);
        self.lengths[self.count] = bytes.len();
        self.count += 1;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn entry(&self, idx: usize) -> &[u8] {
        &self.storage[idx][..self.lengths[idx]]
    }

    /// Snapshot a NULL-terminated user pointer array of C strings.
    pub fn from_user(user_array: u64) -> Result<Self, i32> {
        let mut vec = Self::new();
        if user_array == 0 {
            return Ok(vec);
        }
        for slot in 0..EXEC_MAX_ARGS + 1 {
            let slot_addr = user_array + (slot as u64) * 8;
            let ptr = UserPtr::<u64>::try_new(slot_addr).map_err(|_| errno::EFAULT)?;
            let str_addr = copy_from_user(ptr).map_err(|_| errno::EFAULT)?;
            if str_addr == 0 {
                return Ok(vec);
            }
            let mut buf = [0u8; EXEC_MAX_ARG_LEN];
            let len = copy_user_cstr(&mut buf, str_addr).map_err(|_| errno::E2BIG)?;
            vec.push(&buf[..len])?;
        }
        Err(errno::E2BIG)
    }
}

impl Default for ArgVec {
    fn default() -> Self {
        Self::new()
    }
}

/// Read a whole executable out of the VFS into a kernel buffer.
fn read_image(pid_vm: u32, path: &[u8]) -> Result<(*mut u8, usize), i32> {
    let mut cwd = [0u8; 256];
    let cwd_len = ferrite_fs::fileio_cwd(pid_vm, &mut cwd).unwrap_or(1);
    if cwd_len == 0 {
        cwd[0] = b'/';
    }

    let node = ferrite_fs::vfs::vfs_stat(&cwd[..cwd_len.max(1)], path)
        .map_err(|e| e.to_errno())?;
    if node.stat.file_type != ferrite_fs::FileType::Regular {
        return Err(errno::EACCES);
    }
    let size = node.stat.size as usize;
    if size == 0 || size > EXEC_MAX_IMAGE {
        return Err(errno::ENOEXEC);
    }

    let buf = kmalloc(size) as *mut u8;
    if buf.is_null() {
        return Err(errno::ENOMEM);
    }
    let slice = unsafe { core::slice::from_raw_parts_mut(buf, size) };
    let mut read_total = 0usize;
    while read_total < size {
        match node.fs.read(node.inode, read_total as u64, &mut slice[read_total..]) {
            Ok(0) => break,
            Ok(n) => read_total += n,
            Err(err) => {
                kfree(buf as *mut c_void);
                return Err(err.to_errno());
            }
        }
    }
    if read_total < size {
        kfree(buf as *mut c_void);
        return Err(errno::EIO);
    }
    Ok((buf, size))
}

/// Build the initial stack image. Layout, highest address first:
/// strings, then `[argc][argv ptrs…NULL][envp ptrs…NULL][auxv NULL]`
/// growing downward; returns the final user stack pointer.
fn build_user_stack(pid_vm: u32, argv: &ArgVec, envp: &ArgVec) -> Result<u64, i32> {
    let space = process_vm_space(pid_vm).ok_or(errno::ESRCH)?;

    let mut string_cursor = USER_STACK_TOP_VA;
    let mut argv_addrs = [0u64; EXEC_MAX_ARGS];
    let mut envp_addrs = [0u64; EXEC_MAX_ARGS];

    // Strings first, high to low, NUL-terminated.
    for idx in (0..argv.len()).rev() {
        let bytes = argv.entry(idx);
        string_cursor -= bytes.len() as u64 + 1;
        argv_addrs[idx] = string_cursor;
        write_to_space(&space, string_cursor, bytes).map_err(|e| e.to_errno())?;
        write_to_space(&space, string_cursor + bytes.len() as u64, &[0]).map_err(|e| e.to_errno())?;
    }
    for idx in (0..envp.len()).rev() {
        let bytes = envp.entry(idx);
        string_cursor -= bytes.len() as u64 + 1;
        envp_addrs[idx] = string_cursor;
        write_to_space(&space, string_cursor, bytes).map_err(|e| e.to_errno())?;
        write_to_space(&space, string_cursor + bytes.len() as u64, &[0]).map_err(|e| e.to_errno())?;
    }

    // Pointer block: argc, argv…, NULL, envp…, NULL, auxv terminator.
    let words = 1 + argv.len() + 1 + envp.len() + 1 + 2;
    let mut sp = (string_cursor - (words as u64) * 8) & !0xF;
    let block_base = sp;

    let mut write_word = |value: u64| -> Result<(), i32> {
        write_to_space(&space, sp, &value.to_le_bytes()).map_err(|e| e.to_errno())?;
        sp += 8;
        Ok(())
    };

    write_word(argv.len() as u64)?;
    for addr in &argv_addrs[..argv.len()] {
        write_word(*addr)?;
    }
    write_word(0)?;
    for addr in &envp_addrs[..envp.len()] {
        write_word(*addr)?;
    }
    write_word(0)?;
    // Empty aux vector: AT_NULL pair.
    write_word(0)?;
    write_word(0)?;

    Ok(block_base)
}

/// Replace `task`'s program image. On success the register frame resumes
/// at the new entry with the fresh stack.
pub fn do_exec(
    task: &mut Task,
    frame: &mut InterruptFrame,
    path: &[u8],
    argv: ArgVec,
    envp: ArgVec,
) -> Result<(), i32> {
    if path.is_empty() || path.len() > EXEC_MAX_PATH {
        return Err(errno::ENAMETOOLONG);
    }
    let pid_vm = task.process_id;

    // Everything that can fail without damage happens before the reset.
    let (image, image_len) = read_image(pid_vm, path)?;
    let image_slice = unsafe { core::slice::from_raw_parts(image, image_len) };

    // Point of no return: the old mappings go away.
    if let Err(err) = process_vm_reset_user(pid_vm) {
        kfree(image as *mut c_void);
        return Err(err.to_errno());
    }

    let loaded: LoadedImage = match load_elf(pid_vm, image_slice) {
        Ok(loaded) => loaded,
        Err(err) => {
            kfree(image as *mut c_void);
            klog_info!("exec: load failed after reset: {:?}", err);
            crate::sched::task::task_exit_current(ferrite_abi::task::exit_status_signaled(
                ferrite_abi::signal::SIGSEGV,
            ));
        }
    };
    kfree(image as *mut c_void);

    let stack_ptr = match build_user_stack(pid_vm, &argv, &envp) {
        Ok(sp) => sp,
        Err(_) => {
            crate::sched::task::task_exit_current(ferrite_abi::task::exit_status_signaled(
                ferrite_abi::signal::SIGSEGV,
            ));
        }
    };

    process_vm_set_heap_start(pid_vm, loaded.load_end);
    ferrite_fs::fileio_close_cloexec(pid_vm);

    // Exec resets handled signals to default; the blocked mask persists.
    for action in task.signal_actions.iter_mut() {
        if action.handler > ferrite_abi::signal::SIG_IGN {
            *action = crate::sched::task_struct::SignalAction::default();
        }
    }
    task.fs_base = 0;

    *frame = InterruptFrame::zero();
    frame.rip = loaded.entry;
    frame.rsp = stack_ptr;
    frame.cs = USER_CODE_SELECTOR;
    frame.ss = USER_DATA_SELECTOR;
    frame.rflags = RFLAGS_DEFAULT;

    klog_debug!(
        "exec: task {} -> entry 0x{:x} sp 0x{:x}",
        task.task_id,
        loaded.entry,
        stack_ptr
    );
    Ok(())
}

/// Spawn the init process from the boot command line: a fresh user task
/// whose first dispatch lands in the loaded binary.
pub fn spawn_init(path: &[u8], argv: ArgVec, envp: ArgVec) -> Result<u32, i32> {
    let task_ptr = crate::sched::task::task_create_user_shell(b"init");
    if task_ptr.is_null() {
        return Err(errno::ENOMEM);
    }
    let task = unsafe { &mut *task_ptr };
    let pid_vm = task.process_id;

    let (image, image_len) = read_image(pid_vm, path)?;
    let image_slice = unsafe { core::slice::from_raw_parts(image, image_len) };
    let loaded = load_elf(pid_vm, image_slice).map_err(|e| e.to_errno());
    kfree(image as *mut c_void);
    let loaded = loaded?;

    // argv[0] convention: the binary path leads the vector.
    let mut full_argv = ArgVec::new();
    full_argv.push(path)?;
    for idx in 0..argv.len() {
        full_argv.push(argv.entry(idx))?;
    }

    let stack_ptr = build_user_stack(pid_vm, &full_argv, &envp)?;
    process_vm_set_heap_start(pid_vm, loaded.load_end);

    task.user_frame = InterruptFrame::zero();
    task.user_frame.rip = loaded.entry;
    task.user_frame.rsp = stack_ptr;
    task.user_frame.cs = USER_CODE_SELECTOR;
    task.user_frame.ss = USER_DATA_SELECTOR;
    task.user_frame.rflags = RFLAGS_DEFAULT;

    task.set_status(crate::sched::task_struct::TaskStatus::Ready);
    crate::sched::scheduler::schedule_task(task_ptr);
    Ok(task.task_id)
}
