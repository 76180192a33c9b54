//! The process table: task slots, creation, fork/clone, exit, wait.
//!
//! Descriptors are arena entries in a static table; run queues hold only
//! non-owning pointers. A Zombie has already released its address space
//! (if it was the last holder) and its descriptors, but keeps its pid and
//! exit status until the parent reaps it.

use core::ffi::c_void;
use core::ptr;
use core::sync::atomic::Ordering;

use ferrite_abi::signal::{SIGCHLD, sig_bit};
use ferrite_abi::task::{
    CLONE_CHILD_CLEARTID, CLONE_FILES, CLONE_FS, CLONE_SETTLS, CLONE_SIGHAND, CLONE_THREAD,
    CLONE_VM, INIT_PID, exit_status_normal,
};
use ferrite_abi::errno;
use ferrite_lib::{InterruptFrame, IrqMutex, klog_debug, klog_info};
use ferrite_mm::kernel_heap::{kfree, kmalloc};
use ferrite_mm::process_vm::{create_process_vm, destroy_process_vm, process_vm_clone_cow};
use ferrite_mm::shared_memory::{shm_on_exit, shm_on_fork};

use super::per_cpu::{self, cpu_sched};
use super::scheduler;
use super::switch::task_entry_trampoline;
use super::task_struct::{
    INVALID_PROCESS_ID, INVALID_TASK_ID, MAX_TASKS, SwitchContext, TASK_FLAG_KERNEL_MODE,
    TASK_FLAG_SYSTEM, TASK_FLAG_USER_MODE, TASK_KERNEL_STACK_SIZE, TASK_PRIORITY_DEFAULT,
    TASK_PRIORITY_IDLE, Task, TaskStatus,
};

/// `waiting_on` sentinel: any child will do.
pub const WAIT_ANY_CHILD: u32 = u32::MAX - 1;

/// Idle tasks live outside the normal pid space.
pub const IDLE_ID_BASE: u32 = 0xFFFF_0000;

pub type KernelTaskEntry = fn(*mut c_void);

struct TaskTable {
    tasks: [Task; MAX_TASKS],
    next_task_id: u32,
}

unsafe impl Send for TaskTable {}

static TASK_TABLE: IrqMutex<TaskTable> = IrqMutex::new(TaskTable {
    tasks: [const { Task::invalid() }; MAX_TASKS],
    next_task_id: 1,
});

fn reserve_slot(mgr: &mut TaskTable) -> Option<*mut Task> {
    mgr.tasks
        .iter_mut()
        .find(|t| t.status() == TaskStatus::Invalid)
        .map(|t| t as *mut Task)
}

fn alloc_task_id(mgr: &mut TaskTable) -> u32 {
    // Skip ids still present in the table (zombies hold theirs).
    loop {
        let id = mgr.next_task_id;
        mgr.next_task_id = mgr.next_task_id.wrapping_add(1).max(1);
        if !mgr
            .tasks
            .iter()
            .any(|t| t.status() != TaskStatus::Invalid && t.task_id == id)
        {
            return id;
        }
    }
}

pub fn task_find_by_id(task_id: u32) -> *mut Task {
    if task_id == INVALID_TASK_ID {
        return ptr::null_mut();
    }
    let mut mgr = TASK_TABLE.lock();
    for task in mgr.tasks.iter_mut() {
        if task.status() != TaskStatus::Invalid && task.task_id == task_id {
            return task as *mut Task;
        }
    }
    ptr::null_mut()
}

/// Visit every live (non-idle) task.
pub fn task_iterate_active(mut f: impl FnMut(*mut Task)) {
    let mut mgr = TASK_TABLE.lock();
    for task in mgr.tasks.iter_mut() {
        if task.status() != TaskStatus::Invalid && task.task_id < IDLE_ID_BASE {
            f(task as *mut Task);
        }
    }
}

pub fn task_current_pid() -> u32 {
    let current = scheduler::current_task();
    if current.is_null() {
        INVALID_TASK_ID
    } else {
        unsafe { (*current).task_id }
    }
}

// =============================================================================
// Creation
// =============================================================================

fn init_kernel_context(task: &mut Task, entry: KernelTaskEntry, arg: *mut c_void) {
    task.switch_ctx = SwitchContext::new_for_task(
        entry as usize as u64,
        arg as u64,
        task.kernel_stack_top(),
        task_entry_trampoline as *const () as usize as u64,
    );
}

/// Create a kernel thread. It starts Ready on the least-loaded CPU.
pub fn task_create_kernel(
    name: &[u8],
    entry: KernelTaskEntry,
    arg: *mut c_void,
    priority: u8,
) -> u32 {
    let kstack = kmalloc(TASK_KERNEL_STACK_SIZE as usize);
    if kstack.is_null() {
        klog_info!("task_create_kernel: no kernel stack");
        return INVALID_TASK_ID;
    }

    let task = {
        let mut mgr = TASK_TABLE.lock();
        let Some(slot) = reserve_slot(&mut mgr) else {
            drop(mgr);
            kfree(kstack);
            klog_info!("task_create_kernel: table full");
            return INVALID_TASK_ID;
        };
        let task_id = alloc_task_id(&mut mgr);
        let task = unsafe { &mut *slot };
        *task = Task::invalid();
        task.task_id = task_id;
        task.tgid = task_id;
        task.pgid = task_id;
        task.sid = task_id;
        task.parent_id = task_current_pid();
        task.set_name(name);
        task.priority = priority.min(TASK_PRIORITY_IDLE);
        task.flags = TASK_FLAG_KERNEL_MODE | TASK_FLAG_SYSTEM;
        task.kernel_stack_base = kstack as u64;
        task.kernel_stack_size = TASK_KERNEL_STACK_SIZE;
        init_kernel_context(task, entry, arg);
        task.home_cpu = per_cpu::select_target_cpu() as u8;
        task.set_status(TaskStatus::Ready);
        slot
    };

    scheduler::schedule_task(task);
    unsafe { (*task).task_id }
}

/// Adopt the currently executing boot context as this CPU's idle task.
/// Its switch context is captured by the first switch away from it.
pub fn task_adopt_idle_current(cpu_id: usize) -> *mut Task {
    let mut mgr = TASK_TABLE.lock();
    let Some(slot) = reserve_slot(&mut mgr) else {
        panic!("task_adopt_idle_current: table full");
    };
    let task = unsafe { &mut *slot };
    *task = Task::invalid();
    task.task_id = if cpu_id == 0 { 0 } else { IDLE_ID_BASE + cpu_id as u32 };
    task.tgid = task.task_id;
    task.pgid = task.task_id;
    task.sid = task.task_id;
    task.set_name(b"idle");
    task.priority = TASK_PRIORITY_IDLE;
    task.flags = TASK_FLAG_KERNEL_MODE | TASK_FLAG_SYSTEM;
    task.home_cpu = cpu_id as u8;
    task.set_status(TaskStatus::Running);

    let sched = cpu_sched(cpu_id);
    sched.set_idle_task(slot);
    sched.set_current_task(slot);
    slot
}

/// Build a fresh user task shell: its own VM, descriptor tables, and a
/// kernel context that drops into `user_frame` on first dispatch. The
/// caller loads the image and fills `user_frame` before making it Ready.
pub fn task_create_user_shell(name: &[u8]) -> *mut Task {
    let process_id = create_process_vm();
    if process_id == INVALID_PROCESS_ID {
        return ptr::null_mut();
    }
    if ferrite_fs::fileio_create_for_process(process_id).is_err() {
        destroy_process_vm(process_id);
        return ptr::null_mut();
    }
    let kstack = kmalloc(TASK_KERNEL_STACK_SIZE as usize);
    if kstack.is_null() {
        ferrite_fs::fileio_destroy_for_process(process_id);
        destroy_process_vm(process_id);
        return ptr::null_mut();
    }

    let mut mgr = TASK_TABLE.lock();
    let Some(slot) = reserve_slot(&mut mgr) else {
        drop(mgr);
        kfree(kstack);
        ferrite_fs::fileio_destroy_for_process(process_id);
        destroy_process_vm(process_id);
        return ptr::null_mut();
    };
    let task_id = alloc_task_id(&mut mgr);
    let task = unsafe { &mut *slot };
    *task = Task::invalid();
    task.task_id = task_id;
    task.tgid = task_id;
    task.pgid = task_id;
    task.sid = task_id;
    task.parent_id = task_current_pid();
    task.set_name(name);
    task.priority = TASK_PRIORITY_DEFAULT;
    task.flags = TASK_FLAG_USER_MODE;
    task.process_id = process_id;
    task.kernel_stack_base = kstack as u64;
    task.kernel_stack_size = TASK_KERNEL_STACK_SIZE;
    init_kernel_context(task, user_entry_thunk, slot as *mut c_void);
    task.home_cpu = per_cpu::select_target_cpu() as u8;
    slot
}

/// First dispatch of a fresh user task: drop to ring 3 from its saved
/// frame.
fn user_entry_thunk(arg: *mut c_void) {
    let task = arg as *mut Task;
    unsafe {
        crate::platform::set_kernel_stack_top((*task).kernel_stack_top());
        super::switch::enter_user_frame(&(*task).user_frame);
    }
}

// =============================================================================
// fork / clone
// =============================================================================

/// `fork`: clone with nothing shared — CoW address space, copied
/// descriptor tables, copied signal state. The child resumes from
/// `frame` with return value 0.
pub fn task_fork(parent: *mut Task, frame: &InterruptFrame) -> Result<u32, i32> {
    task_clone(parent, frame, 0, 0, 0, 0)
}

/// `clone`: each flag means "share the named table instead of copying".
pub fn task_clone(
    parent: *mut Task,
    frame: &InterruptFrame,
    flags: u64,
    child_stack: u64,
    tls: u64,
    ctid: u64,
) -> Result<u32, i32> {
    if parent.is_null() {
        return Err(errno::EINVAL);
    }
    let parent_ref = unsafe { &mut *parent };
    if !parent_ref.is_user() {
        return Err(errno::EINVAL);
    }
    if flags & CLONE_THREAD != 0 && flags & (CLONE_VM | CLONE_SIGHAND) != (CLONE_VM | CLONE_SIGHAND)
    {
        // A thread shares its group's memory and handlers by definition.
        return Err(errno::EINVAL);
    }

    // Address space: share or CoW-duplicate.
    let (child_vm, vm_shared) = if flags & CLONE_VM != 0 {
        (parent_ref.process_id, true)
    } else {
        let vm = process_vm_clone_cow(parent_ref.process_id);
        if vm == INVALID_PROCESS_ID {
            return Err(errno::ENOMEM);
        }
        (vm, false)
    };

    // Descriptor tables and cwd: share or copy. A VM-sharing thread keeps
    // the group's binding (same process id), so nothing to clone there.
    if !vm_shared
        && ferrite_fs::fileio_clone_for_process(
            parent_ref.process_id,
            child_vm,
            flags & CLONE_FILES != 0,
            flags & CLONE_FS != 0,
        )
        .is_err()
    {
        destroy_process_vm(child_vm);
        return Err(errno::ENOMEM);
    }

    let kstack = kmalloc(TASK_KERNEL_STACK_SIZE as usize);
    if kstack.is_null() {
        cleanup_clone_tables(child_vm, vm_shared);
        return Err(errno::ENOMEM);
    }

    let child_ptr = {
        let mut mgr = TASK_TABLE.lock();
        let Some(slot) = reserve_slot(&mut mgr) else {
            drop(mgr);
            kfree(kstack);
            cleanup_clone_tables(child_vm, vm_shared);
            return Err(errno::EAGAIN);
        };
        let task_id = alloc_task_id(&mut mgr);
        let child = unsafe { &mut *slot };
        *child = Task::invalid();
        child.task_id = task_id;
        child.parent_id = parent_ref.task_id;
        child.uid = parent_ref.uid;
        child.gid = parent_ref.gid;
        child.sid = parent_ref.sid;
        child.name = parent_ref.name;
        child.priority = parent_ref.priority;
        child.flags = TASK_FLAG_USER_MODE;
        child.process_id = child_vm;
        child.vm_shared = vm_shared;
        child.kernel_stack_base = kstack as u64;
        child.kernel_stack_size = TASK_KERNEL_STACK_SIZE;

        if flags & CLONE_THREAD != 0 {
            child.tgid = parent_ref.tgid;
            child.pgid = parent_ref.pgid;
        } else {
            child.tgid = task_id;
            // A new process starts its own group unless placed explicitly.
            child.pgid = task_id;
        }

        // Signal state: handlers copied (or shared via propagation),
        // blocked mask inherited, pending cleared.
        child.signal_actions = parent_ref.signal_actions;
        child.signal_blocked = parent_ref.signal_blocked;
        child.signal_pending.store(0, Ordering::Release);
        child.shares_sighand = flags & CLONE_SIGHAND != 0;
        if child.shares_sighand {
            parent_ref.shares_sighand = true;
        }

        child.fs_base = if flags & CLONE_SETTLS != 0 {
            tls
        } else {
            parent_ref.fs_base
        };
        if flags & CLONE_CHILD_CLEARTID != 0 {
            child.clear_child_tid = ctid;
        }

        // The child resumes in user space at the same instruction with
        // rax = 0; a thread gets its own stack pointer.
        child.user_frame = *frame;
        child.user_frame.rax = 0;
        if child_stack != 0 && flags & CLONE_VM != 0 {
            child.user_frame.rsp = child_stack;
        }
        init_kernel_context(child, user_entry_thunk, slot as *mut c_void);
        child.home_cpu = per_cpu::select_target_cpu() as u8;
        child.set_status(TaskStatus::Ready);
        slot
    };

    if !vm_shared {
        shm_on_fork(child_vm);
    }
    scheduler::schedule_task(child_ptr);

    let child_id = unsafe { (*child_ptr).task_id };
    klog_debug!(
        "clone: parent {} -> child {} (flags 0x{:x})",
        parent_ref.task_id,
        child_id,
        flags
    );
    Ok(child_id)
}

fn cleanup_clone_tables(child_vm: u32, vm_shared: bool) {
    if !vm_shared {
        ferrite_fs::fileio_destroy_for_process(child_vm);
        destroy_process_vm(child_vm);
    }
}

// =============================================================================
// Exit and wait
// =============================================================================

/// True if any other live task still uses this VM (thread group).
fn vm_has_other_users(exiting: *mut Task, process_id: u32) -> bool {
    let mut found = false;
    task_iterate_active(|task| {
        if task != exiting && unsafe { (*task).process_id } == process_id {
            found = true;
        }
    });
    found
}

/// Terminate the calling task. Resources that can be released now are
/// released; the pid and status linger until the parent reaps.
pub fn task_exit_current(status: u32) -> ! {
    let current = scheduler::current_task();
    if current.is_null() {
        panic!("task_exit_current: no current task");
    }
    let task = unsafe { &mut *current };
    let task_id = task.task_id;
    let process_id = task.process_id;

    klog_debug!("exit: task {} status 0x{:x}", task_id, status);

    // CHILD_CLEARTID: zero the registered user word before the VM goes.
    if task.clear_child_tid != 0 && process_id != INVALID_PROCESS_ID {
        use ferrite_mm::user_copy::{copy_to_user, set_syscall_process_id};
        use ferrite_mm::user_ptr::UserPtr;
        let _guard = set_syscall_process_id(process_id);
        if let Ok(ptr) = UserPtr::<u32>::try_new(task.clear_child_tid) {
            let _ = copy_to_user(ptr, &0u32);
        }
    }

    if process_id != INVALID_PROCESS_ID {
        // Threads leave the group's tables alone; the last VM holder
        // tears everything down.
        let last_vm_user = !vm_has_other_users(current, process_id);
        if last_vm_user {
            shm_on_exit(process_id);
            ferrite_fs::fileio_destroy_for_process(process_id);
            // Drop to the kernel address space before the user one dies.
            ferrite_mm::paging::kernel_space().activate();
            destroy_process_vm(process_id);
        }
    }

    task.exit_status = status;

    // Orphans go to init.
    task_iterate_active(|t| {
        let t = unsafe { &mut *t };
        if t.parent_id == task_id {
            t.parent_id = INIT_PID;
        }
    });

    // Tell the parent: SIGCHLD plus a wake if it is blocked in wait.
    let parent = task_find_by_id(task.parent_id);
    if !parent.is_null() {
        unsafe {
            (*parent)
                .signal_pending
                .fetch_or(sig_bit(SIGCHLD), Ordering::AcqRel);
        }
        wake_waiting_parent(parent, task_id);
    }

    task.set_status(TaskStatus::Zombie);
    scheduler::schedule();
    unreachable!("zombie task rescheduled");
}

/// Kthread entry fell off the end; exit cleanly.
pub extern "sysv64" fn task_exit_current_trampoline() {
    task_exit_current(exit_status_normal(0));
}

fn wake_waiting_parent(parent: *mut Task, child_id: u32) {
    let parent_ref = unsafe { &*parent };
    let waiting_for = parent_ref.waiting_on.load(Ordering::Acquire);
    if waiting_for != child_id && waiting_for != WAIT_ANY_CHILD {
        return;
    }
    // Single winner: only one waker clears the slot.
    if parent_ref
        .waiting_on
        .compare_exchange(
            waiting_for,
            INVALID_TASK_ID,
            Ordering::AcqRel,
            Ordering::Acquire,
        )
        .is_ok()
    {
        scheduler::unblock_task(parent);
    }
}

/// Harvest one zombie child. Returns `(pid, status)`; `Ok(None)` means no
/// matching zombie yet (live children exist).
pub fn task_try_reap(parent_id: u32, wanted_pid: i64) -> Result<Option<(u32, u32)>, i32> {
    let mut zombie: *mut Task = ptr::null_mut();
    let mut have_children = false;

    {
        let mut mgr = TASK_TABLE.lock();
        for task in mgr.tasks.iter_mut() {
            if task.status() == TaskStatus::Invalid || task.parent_id != parent_id {
                continue;
            }
            let matches = match wanted_pid {
                -1 => true,
                pid if pid > 0 => task.task_id == pid as u32,
                _ => false,
            };
            if !matches {
                continue;
            }
            have_children = true;
            if task.is_zombie() {
                zombie = task as *mut Task;
                break;
            }
        }
    }

    if zombie.is_null() {
        return if have_children { Ok(None) } else { Err(errno::ECHILD) };
    }

    // The zombie may still be mid-switch on another CPU; wait until no
    // CPU claims it, then let one more scheduling round pass so the far
    // side of its final switch has definitely left the stack.
    while scheduler::task_is_on_any_cpu(zombie) {
        scheduler::yield_now();
    }
    scheduler::yield_now();

    let (pid, status, kstack) = unsafe {
        let task = &mut *zombie;
        let tuple = (task.task_id, task.exit_status, task.kernel_stack_base);
        task.set_status(TaskStatus::Invalid);
        *task = Task::invalid();
        tuple
    };
    if kstack != 0 {
        kfree(kstack as *mut c_void);
    }
    Ok(Some((pid, status)))
}

pub fn task_stats(total: &mut u32, zombies: &mut u32) {
    let mgr = TASK_TABLE.lock();
    *total = 0;
    *zombies = 0;
    for task in mgr.tasks.iter() {
        if task.status() != TaskStatus::Invalid {
            *total += 1;
            if task.is_zombie() {
                *zombies += 1;
            }
        }
    }
}
