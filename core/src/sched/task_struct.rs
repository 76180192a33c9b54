//! Kernel task control block and register contexts.
//!
//! One record describes both processes and threads: a thread is a task
//! sharing its group leader's address space. The ABI-stable enums and
//! constants stay in `ferrite_abi::task`.

use core::mem::offset_of;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering};

use ferrite_abi::signal::{NSIG, SIG_DFL, SIG_EMPTY, SigSet};
use ferrite_lib::InterruptFrame;

pub use ferrite_abi::task::{
    BlockReason, INVALID_PROCESS_ID, INVALID_TASK_ID, MAX_TASKS, TASK_FLAG_KERNEL_MODE,
    TASK_FLAG_NO_PREEMPT, TASK_FLAG_SYSTEM, TASK_FLAG_USER_MODE, TASK_KERNEL_STACK_SIZE,
    TASK_NAME_MAX_LEN, TASK_PRIORITY_DEFAULT, TASK_PRIORITY_IDLE, TaskStatus,
};

// Ring-3 selectors laid down by the bring-up GDT: entry 3 = user code,
// entry 4 = user data, both RPL 3.
pub const USER_CODE_SELECTOR: u64 = 0x1B;
pub const USER_DATA_SELECTOR: u64 = 0x23;

/// RFLAGS for fresh contexts: IF set, reserved bit 1 set.
pub const RFLAGS_DEFAULT: u64 = 0x202;

// =============================================================================
// SwitchContext — callee-saved registers for the software context switch
// =============================================================================

/// Offsets are consumed by the naked switch routine via `offset_of!`, so
/// layout changes are caught at compile time.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct SwitchContext {
    pub rbx: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub rflags: u64,
    pub rip: u64,
}

impl SwitchContext {
    pub const fn zero() -> Self {
        Self {
            rbx: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            rbp: 0,
            rsp: 0,
            rflags: RFLAGS_DEFAULT,
            rip: 0,
        }
    }

    /// Context for a task that has never run: "returns" into the entry
    /// trampoline with the entry point in r12 and its argument in r13.
    pub const fn new_for_task(entry: u64, arg: u64, stack_top: u64, trampoline: u64) -> Self {
        Self {
            rbx: 0,
            r12: entry,
            r13: arg,
            r14: 0,
            r15: 0,
            rbp: 0,
            rsp: stack_top - 8,
            rflags: RFLAGS_DEFAULT,
            rip: trampoline,
        }
    }
}

const _: () = assert!(core::mem::size_of::<SwitchContext>() == 72);
const _: () = assert!(offset_of!(SwitchContext, rsp) == 48);
const _: () = assert!(offset_of!(SwitchContext, rip) == 64);

// =============================================================================
// SignalAction — kernel-internal per-signal disposition
// =============================================================================

#[derive(Copy, Clone)]
pub struct SignalAction {
    /// SIG_DFL (0), SIG_IGN (1), or a user handler address.
    pub handler: u64,
    /// Mask OR-ed into the blocked set while the handler runs.
    pub mask: SigSet,
    /// SA_* flags.
    pub flags: u64,
    /// sigreturn trampoline address.
    pub restorer: u64,
}

impl SignalAction {
    pub const fn default() -> Self {
        Self {
            handler: SIG_DFL,
            mask: SIG_EMPTY,
            flags: 0,
            restorer: 0,
        }
    }
}

// =============================================================================
// Task
// =============================================================================

#[repr(C)]
pub struct Task {
    // --- Identity ---
    pub task_id: u32,
    pub parent_id: u32,
    /// Thread-group id; the group leader has tgid == task_id.
    pub tgid: u32,
    pub pgid: u32,
    pub sid: u32,
    pub uid: u32,
    pub gid: u32,
    pub name: [u8; TASK_NAME_MAX_LEN],

    // --- Scheduling ---
    state_atomic: AtomicU8,
    pub priority: u8,
    pub flags: u16,
    pub block_reason: BlockReason,
    /// Owning CPU of the run queue this task lives on while Ready.
    pub home_cpu: u8,
    pub time_slice_remaining: u32,
    pub wake_at_tick: u64,
    /// Closes the lost-wakeup window between dropping a primitive's lock
    /// and suspending.
    pub pending_wakeup: AtomicBool,
    /// Child pid a waitpid sleeper is waiting for (`u32::MAX - 1` = any).
    pub waiting_on: AtomicU32,

    // --- Memory ---
    /// VM handle (`process_vm` pid); shared across a thread group.
    pub process_id: u32,
    /// Extra VM reference holders (threads); the last one tears it down.
    pub vm_shared: bool,

    // --- Stacks and contexts ---
    pub kernel_stack_base: u64,
    pub kernel_stack_size: u64,
    /// Kernel resume point, valid while not Running.
    pub switch_ctx: SwitchContext,
    /// User-mode register image for first entry (fork child / exec).
    pub user_frame: InterruptFrame,

    // --- Signals ---
    pub signal_pending: AtomicU64,
    pub signal_blocked: SigSet,
    pub signal_actions: [SignalAction; NSIG],
    /// CLONE_SIGHAND: sigaction writes propagate across the thread group.
    pub shares_sighand: bool,

    // --- TLS / clone bookkeeping ---
    pub fs_base: u64,
    /// User address cleared (and woken) on exit; CLONE_CHILD_CLEARTID.
    pub clear_child_tid: u64,

    // --- Exit ---
    pub exit_status: u32,

    // --- Accounting ---
    pub user_ticks: u64,
    pub system_ticks: u64,

    // --- Run-queue linkage (non-owning) ---
    pub next_ready: *mut Task,
}

unsafe impl Send for Task {}

impl Task {
    pub const fn invalid() -> Self {
        Self {
            task_id: INVALID_TASK_ID,
            parent_id: INVALID_TASK_ID,
            tgid: INVALID_TASK_ID,
            pgid: INVALID_TASK_ID,
            sid: INVALID_TASK_ID,
            uid: 0,
            gid: 0,
            name: [0; TASK_NAME_MAX_LEN],
            state_atomic: AtomicU8::new(TaskStatus::Invalid.as_u8()),
            priority: TASK_PRIORITY_DEFAULT,
            flags: 0,
            block_reason: BlockReason::None,
            home_cpu: 0,
            time_slice_remaining: 0,
            wake_at_tick: 0,
            pending_wakeup: AtomicBool::new(false),
            waiting_on: AtomicU32::new(INVALID_TASK_ID),
            process_id: INVALID_PROCESS_ID,
            vm_shared: false,
            kernel_stack_base: 0,
            kernel_stack_size: 0,
            switch_ctx: SwitchContext::zero(),
            user_frame: InterruptFrame::zero(),
            signal_pending: AtomicU64::new(0),
            signal_blocked: SIG_EMPTY,
            signal_actions: [SignalAction::default(); NSIG],
            shares_sighand: false,
            fs_base: 0,
            clear_child_tid: 0,
            exit_status: 0,
            user_ticks: 0,
            system_ticks: 0,
            next_ready: ptr::null_mut(),
        }
    }

    #[inline]
    pub fn status(&self) -> TaskStatus {
        TaskStatus::from_u8(self.state_atomic.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set_status(&self, status: TaskStatus) {
        self.state_atomic.store(status.as_u8(), Ordering::Release);
    }

    /// CAS transition honouring the state machine; at most one CPU wins.
    #[inline]
    pub fn try_transition_to(&self, target: TaskStatus) -> bool {
        let current = self.state_atomic.load(Ordering::Acquire);
        if !TaskStatus::from_u8(current).can_transition_to(target) {
            return false;
        }
        self.state_atomic
            .compare_exchange(current, target.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[inline]
    pub fn is_ready(&self) -> bool {
        self.status() == TaskStatus::Ready
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.status() == TaskStatus::Running
    }

    #[inline]
    pub fn is_suspended(&self) -> bool {
        matches!(self.status(), TaskStatus::Blocked | TaskStatus::Sleeping)
    }

    #[inline]
    pub fn is_zombie(&self) -> bool {
        self.status() == TaskStatus::Zombie
    }

    #[inline]
    pub fn is_user(&self) -> bool {
        self.flags & TASK_FLAG_USER_MODE != 0
    }

    pub fn set_name(&mut self, name: &[u8]) {
        let len = name.len().min(TASK_NAME_MAX_LEN - 1);
        self.name[..len].copy_from_slice(&name[..len]);
        self.name[len] = 0;
    }

    pub fn kernel_stack_top(&self) -> u64 {
        self.kernel_stack_base + self.kernel_stack_size
    }

    /// Deliverable = pending and not blocked.
    #[inline]
    pub fn deliverable_signals(&self) -> SigSet {
        self.signal_pending.load(Ordering::Acquire) & !self.signal_blocked
    }
}
