//! Task ABI types shared between kernel subsystems and userland.
//!
//! This module contains **only** the types, constants, and enums that form
//! the stable interface between kernel subsystems. Kernel-internal details
//! (the Task struct, register contexts, scheduler linkage) live in
//! `ferrite_core::sched::task_struct`.

// --- Task configuration ---

pub const MAX_TASKS: usize = 64;
pub const TASK_STACK_SIZE: u64 = 0x8000; // 32 KiB
pub const TASK_KERNEL_STACK_SIZE: u64 = 0x8000; // 32 KiB
pub const TASK_NAME_MAX_LEN: usize = 32;
pub const INVALID_TASK_ID: u32 = 0xFFFF_FFFF;
pub const INVALID_PROCESS_ID: u32 = 0xFFFF_FFFF;

/// Pid of the init process; orphans are reparented to it.
pub const INIT_PID: u32 = 1;

// --- TaskStatus ---

/// Type-safe task status with explicit state-machine semantics.
///
/// ```text
/// Ready ⇄ Running        dispatch / preempt or yield
/// Running → Blocked      wait on a sync primitive or I/O
/// Running → Sleeping     timed wait or sleep(ticks)
/// Blocked → Ready        signal on the primitive
/// Sleeping → Ready       timer wake or signal
/// Running → Zombie       exit
/// Zombie → Invalid       reaped by the parent's wait
/// ```
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum TaskStatus {
    /// Task slot is not in use.
    #[default]
    Invalid = 0,
    /// Eligible to run, sitting in a run queue.
    Ready = 1,
    /// Currently executing on a CPU.
    Running = 2,
    /// Waiting for an event with no deadline.
    Blocked = 3,
    /// Waiting for a wake-at tick (or an earlier signal).
    Sleeping = 4,
    /// Exited; pid and exit status persist until reaped.
    Zombie = 5,
}

impl TaskStatus {
    #[inline]
    pub const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Ready,
            2 => Self::Running,
            3 => Self::Blocked,
            4 => Self::Sleeping,
            5 => Self::Zombie,
            _ => Self::Invalid,
        }
    }

    #[inline]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    #[inline]
    pub const fn can_transition_to(self, target: Self) -> bool {
        match self {
            Self::Invalid => matches!(target, Self::Ready),
            Self::Ready => matches!(target, Self::Running | Self::Zombie),
            Self::Running => matches!(
                target,
                Self::Ready | Self::Blocked | Self::Sleeping | Self::Zombie
            ),
            Self::Blocked => matches!(target, Self::Ready | Self::Zombie),
            Self::Sleeping => matches!(target, Self::Ready | Self::Zombie),
            Self::Zombie => matches!(target, Self::Invalid),
        }
    }

    /// Single-letter state code used by `/proc/<pid>/status`.
    pub const fn proc_code(self) -> u8 {
        match self {
            Self::Invalid => b'?',
            Self::Ready => b'R',
            Self::Running => b'R',
            Self::Blocked => b'D',
            Self::Sleeping => b'S',
            Self::Zombie => b'Z',
        }
    }
}

// --- BlockReason ---

/// Why a task is Blocked or Sleeping.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum BlockReason {
    #[default]
    None = 0,
    /// Target task ID stored in `waiting_on`.
    WaitingOnChild = 1,
    Sleep = 2,
    IoWait = 3,
    SemWait = 4,
    PipeWait = 5,
    PollWait = 6,
    Generic = 7,
}

impl BlockReason {
    #[inline]
    pub const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::WaitingOnChild,
            2 => Self::Sleep,
            3 => Self::IoWait,
            4 => Self::SemWait,
            5 => Self::PipeWait,
            6 => Self::PollWait,
            7 => Self::Generic,
            _ => Self::None,
        }
    }

    /// A blocked task in one of these states may be woken early by a
    /// signal, making the interrupted call return EINTR.
    #[inline]
    pub const fn is_interruptible(self) -> bool {
        !matches!(self, Self::None)
    }
}

// --- Priorities ---

/// Number of scheduler priority levels. Priority 0 is the highest.
pub const NUM_PRIORITIES: usize = 32;

pub const TASK_PRIORITY_HIGH: u8 = 0;
pub const TASK_PRIORITY_DEFAULT: u8 = 16;
pub const TASK_PRIORITY_IDLE: u8 = (NUM_PRIORITIES - 1) as u8;

/// Scale factor from nice steps to priority levels.
const NICE_PRIORITY_K: i32 = 1;

/// `priority = clamp(DEFAULT + (nice + 20) * K - 20, 0, 31)`, so nice 0
/// lands on the default level and each nice step moves one level.
#[inline]
pub const fn priority_from_nice(nice: i32) -> u8 {
    let p = TASK_PRIORITY_DEFAULT as i32 + (nice + 20) * NICE_PRIORITY_K - 20;
    if p < 0 {
        0
    } else if p >= NUM_PRIORITIES as i32 {
        (NUM_PRIORITIES - 1) as u8
    } else {
        p as u8
    }
}

// --- Task flags ---

pub const TASK_FLAG_USER_MODE: u16 = 0x01;
pub const TASK_FLAG_KERNEL_MODE: u16 = 0x02;
pub const TASK_FLAG_NO_PREEMPT: u16 = 0x04;
pub const TASK_FLAG_SYSTEM: u16 = 0x08;

// --- clone() share flags ---
//
// Each flag means "share the named table with the parent instead of copy".
// Values follow the Linux clone(2) ABI for userland familiarity.

pub const CLONE_VM: u64 = 0x0000_0100;
pub const CLONE_FS: u64 = 0x0000_0200;
pub const CLONE_FILES: u64 = 0x0000_0400;
pub const CLONE_SIGHAND: u64 = 0x0000_0800;
pub const CLONE_THREAD: u64 = 0x0001_0000;
pub const CLONE_SETTLS: u64 = 0x0008_0000;
pub const CLONE_PARENT_SETTID: u64 = 0x0010_0000;
pub const CLONE_CHILD_CLEARTID: u64 = 0x0020_0000;

// --- wait() options ---

pub const WNOHANG: u32 = 1;

/// Encode a normal exit for waitpid status reporting.
#[inline]
pub const fn exit_status_normal(code: u32) -> u32 {
    (code & 0xFF) << 8
}

/// Encode termination by signal for waitpid status reporting.
#[inline]
pub const fn exit_status_signaled(signum: u8) -> u32 {
    (signum as u32) & 0x7F
}

/// True if the status encodes a normal exit; pair with `exit_code_of`.
#[inline]
pub const fn status_exited(status: u32) -> bool {
    status & 0x7F == 0
}

#[inline]
pub const fn exit_code_of(status: u32) -> u32 {
    (status >> 8) & 0xFF
}

#[inline]
pub const fn term_signal_of(status: u32) -> u32 {
    status & 0x7F
}
