//! Blocking synchronisation primitives: counting semaphore, mutex,
//! mailbox, condition variable.
//!
//! All of them are built on [`WaitQueue`] and the scheduler hooks. Every
//! blocking call takes a timeout in milliseconds (0 = block forever) and
//! returns `Err(SyncError::Interrupted)` when a terminating signal wakes
//! the waiter, so the syscall layer can surface EINTR.

use core::ffi::c_void;

use crate::sched_hooks;
use crate::spinlock::IrqMutex;
use crate::waitqueue::WaitQueue;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncError {
    TimedOut,
    Interrupted,
    /// The scheduler is not running or the waiter queue is full.
    WouldBlock,
}

// =============================================================================
// Counting semaphore
// =============================================================================

pub struct Semaphore {
    count: IrqMutex<i32>,
    waiters: WaitQueue,
}

impl Semaphore {
    pub const fn new(initial: i32) -> Self {
        Self {
            count: IrqMutex::new(initial),
            waiters: WaitQueue::new(),
        }
    }

    /// Acquire one unit. `timeout_ms == 0` blocks forever.
    ///
    /// A waiter dequeued by [`signal`] has the unit transferred directly:
    /// waking up no longer queued means the wake carried the token. Waking
    /// up still queued means timeout, signal, or a spurious wake.
    pub fn wait(&self, timeout_ms: u64) -> Result<(), SyncError> {
        let deadline = if timeout_ms == 0 {
            None
        } else {
            Some(sched_hooks::uptime_ms().saturating_add(timeout_ms))
        };

        loop {
            {
                let mut count = self.count.lock();
                if *count > 0 {
                    *count -= 1;
                    return Ok(());
                }
                if !sched_hooks::hooks_ready() {
                    return Err(SyncError::WouldBlock);
                }
                if !self.waiters.enqueue_current() {
                    return Err(SyncError::WouldBlock);
                }
            }

            let remaining = match deadline {
                None => 0,
                Some(deadline) => {
                    let now = sched_hooks::uptime_ms();
                    if now >= deadline {
                        // Too late to sleep; fall through to the post-wake
                        // bookkeeping with an expired budget.
                        1
                    } else {
                        deadline - now
                    }
                }
            };

            if let Some(hooks) = sched_hooks::sched_hooks() {
                (hooks.block_current)(remaining);
            }

            let still_queued = self.waiters.remove_current();
            if !still_queued {
                // A signaller dequeued us; the unit is ours.
                return Ok(());
            }
            if sched_hooks::signal_pending() {
                return Err(SyncError::Interrupted);
            }
            if let Some(deadline) = deadline {
                if sched_hooks::uptime_ms() >= deadline {
                    return Err(SyncError::TimedOut);
                }
            }
            // Spurious wake; take another lap.
        }
    }

    /// Non-blocking acquire.
    pub fn try_wait(&self) -> bool {
        let mut count = self.count.lock();
        if *count > 0 {
            *count -= 1;
            true
        } else {
            false
        }
    }

    /// Release one unit, waking the first waiter if any.
    ///
    /// The woken task is enqueued outside the semaphore lock so the
    /// scheduler lock never nests inside it.
    pub fn signal(&self) {
        let wake = {
            let mut count = self.count.lock();
            if self.waiters.has_waiters() {
                true
            } else {
                *count = count.saturating_add(1);
                false
            }
        };
        if wake && !self.waiters.wake_one() {
            // The waiter vanished between the check and the wake (timeout
            // or kill); the unit must not be lost.
            let mut count = self.count.lock();
            *count = count.saturating_add(1);
        }
    }

    pub fn value(&self) -> i32 {
        *self.count.lock()
    }
}

// =============================================================================
// Mutex — binary semaphore
// =============================================================================

pub struct Mutex {
    sem: Semaphore,
}

impl Mutex {
    pub const fn new() -> Self {
        Self {
            sem: Semaphore::new(1),
        }
    }

    pub fn lock(&self) -> Result<(), SyncError> {
        self.sem.wait(0)
    }

    pub fn lock_timeout(&self, timeout_ms: u64) -> Result<(), SyncError> {
        self.sem.wait(timeout_ms)
    }

    pub fn try_lock(&self) -> bool {
        self.sem.try_wait()
    }

    pub fn unlock(&self) {
        self.sem.signal();
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Mailbox — fixed-capacity queue of opaque pointers
// =============================================================================

pub struct Mailbox<const N: usize> {
    slots: IrqMutex<MailboxSlots<N>>,
    not_empty: Semaphore,
    not_full: Semaphore,
}

struct MailboxSlots<const N: usize> {
    items: [*mut c_void; N],
    head: usize,
    tail: usize,
    len: usize,
}

unsafe impl<const N: usize> Send for MailboxSlots<N> {}

impl<const N: usize> Mailbox<N> {
    pub const fn new() -> Self {
        Self {
            slots: IrqMutex::new(MailboxSlots {
                items: [core::ptr::null_mut(); N],
                head: 0,
                tail: 0,
                len: 0,
            }),
            not_empty: Semaphore::new(0),
            not_full: Semaphore::new(N as i32),
        }
    }

    pub fn post(&self, message: *mut c_void, timeout_ms: u64) -> Result<(), SyncError> {
        self.not_full.wait(timeout_ms)?;
        {
            let mut slots = self.slots.lock();
            let tail = slots.tail;
            slots.items[tail] = message;
            slots.tail = (tail + 1) % N;
            slots.len += 1;
        }
        self.not_empty.signal();
        Ok(())
    }

    pub fn fetch(&self, timeout_ms: u64) -> Result<*mut c_void, SyncError> {
        self.not_empty.wait(timeout_ms)?;
        let message = {
            let mut slots = self.slots.lock();
            let head = slots.head;
            let message = slots.items[head];
            slots.items[head] = core::ptr::null_mut();
            slots.head = (head + 1) % N;
            slots.len -= 1;
            message
        };
        self.not_full.signal();
        Ok(message)
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<const N: usize> Default for Mailbox<N> {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Condition variable
// =============================================================================

pub struct CondVar {
    waiters: WaitQueue,
}

impl CondVar {
    pub const fn new() -> Self {
        Self {
            waiters: WaitQueue::new(),
        }
    }

    /// Atomically release `mutex`, wait for a signal, re-acquire.
    ///
    /// The enqueue happens before the mutex is released, so a signal fired
    /// between release and suspend still finds the waiter.
    pub fn wait(&self, mutex: &Mutex, timeout_ms: u64) -> Result<(), SyncError> {
        if !sched_hooks::hooks_ready() {
            return Err(SyncError::WouldBlock);
        }
        if !self.waiters.enqueue_current() {
            return Err(SyncError::WouldBlock);
        }
        mutex.unlock();

        if let Some(hooks) = sched_hooks::sched_hooks() {
            (hooks.block_current)(timeout_ms);
        }

        let still_queued = self.waiters.remove_current();
        let result = if !still_queued {
            Ok(())
        } else if sched_hooks::signal_pending() {
            Err(SyncError::Interrupted)
        } else {
            Err(SyncError::TimedOut)
        };

        // Re-acquire regardless of the wait outcome; an interrupt during
        // the re-acquire still reports the original outcome.
        let _ = mutex.lock();
        result
    }

    pub fn signal(&self) -> bool {
        self.waiters.wake_one()
    }

    pub fn broadcast(&self) -> usize {
        self.waiters.wake_all()
    }
}

impl Default for CondVar {
    fn default() -> Self {
        Self::new()
    }
}
