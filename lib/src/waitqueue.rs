//! Wait queue: the shared plumbing behind every blocking primitive.
//!
//! A bounded FIFO of task handles protected by an `IrqMutex`. A task
//! appears in at most one wait queue while suspended; leaving the queue
//! through a waker transitions it back to Ready. The scheduler's
//! pending-wakeup flag closes the window between dropping the queue lock
//! and actually suspending, so wakeups cannot be lost.

use crate::sched_hooks::{self, TaskHandle};
use crate::spinlock::IrqMutex;

/// Maximum number of tasks that can wait on a single queue.
pub const WAITQUEUE_CAPACITY: usize = 32;

const NULL_HANDLE: TaskHandle = core::ptr::null_mut();

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The awaited condition held when we were scheduled again.
    Satisfied,
    /// The timeout expired first.
    TimedOut,
    /// A signal arrived first; the caller surfaces EINTR.
    Interrupted,
    /// The queue was full or the scheduler is not running yet.
    NotQueued,
}

struct WaitQueueInner {
    waiters: [TaskHandle; WAITQUEUE_CAPACITY],
    count: usize,
}

// SAFETY: the handles are opaque scheduler-owned pointers; all access is
// serialised by the IrqMutex.
unsafe impl Send for WaitQueueInner {}

impl WaitQueueInner {
    const fn new() -> Self {
        Self {
            waiters: [NULL_HANDLE; WAITQUEUE_CAPACITY],
            count: 0,
        }
    }

    fn enqueue(&mut self, task: TaskHandle) -> bool {
        if task.is_null() {
            return false;
        }
        for slot in self.waiters.iter_mut() {
            if *slot == task {
                return true;
            }
        }
        for slot in self.waiters.iter_mut() {
            if slot.is_null() {
                *slot = task;
                self.count += 1;
                return true;
            }
        }
        false
    }

    fn dequeue_one(&mut self) -> Option<TaskHandle> {
        for slot in self.waiters.iter_mut() {
            if !slot.is_null() {
                let task = *slot;
                *slot = NULL_HANDLE;
                self.count = self.count.saturating_sub(1);
                return Some(task);
            }
        }
        None
    }

    fn remove(&mut self, task: TaskHandle) -> bool {
        for slot in self.waiters.iter_mut() {
            if *slot == task {
                *slot = NULL_HANDLE;
                self.count = self.count.saturating_sub(1);
                return true;
            }
        }
        false
    }

    fn contains(&self, task: TaskHandle) -> bool {
        self.waiters.iter().any(|slot| *slot == task)
    }
}

pub struct WaitQueue {
    inner: IrqMutex<WaitQueueInner>,
}

unsafe impl Send for WaitQueue {}
unsafe impl Sync for WaitQueue {}

impl WaitQueue {
    pub const fn new() -> Self {
        Self {
            inner: IrqMutex::new(WaitQueueInner::new()),
        }
    }

    /// Put the current task on the queue. The caller suspends afterwards
    /// via the scheduler hooks. Returns false if the queue is full or the
    /// scheduler is not up.
    pub fn enqueue_current(&self) -> bool {
        let task = sched_hooks::current_task();
        if task.is_null() {
            return false;
        }
        self.inner.lock().enqueue(task)
    }

    /// Remove the current task from the queue. Returns true if it was
    /// still queued (nobody woke it); false means a waker dequeued it.
    pub fn remove_current(&self) -> bool {
        let task = sched_hooks::current_task();
        if task.is_null() {
            return false;
        }
        self.inner.lock().remove(task)
    }

    pub fn contains_current(&self) -> bool {
        let task = sched_hooks::current_task();
        if task.is_null() {
            return false;
        }
        self.inner.lock().contains(task)
    }

    /// Wake one waiting task; returns true if one was dequeued.
    ///
    /// The unblock call runs after the queue lock drops, keeping the
    /// queue lock out of any ordering relationship with scheduler locks.
    pub fn wake_one(&self) -> bool {
        let task = self.inner.lock().dequeue_one();
        match task {
            Some(task) => {
                if let Some(hooks) = sched_hooks::sched_hooks() {
                    let _ = (hooks.unblock)(task);
                }
                true
            }
            None => false,
        }
    }

    /// Wake every waiting task; returns the count woken.
    pub fn wake_all(&self) -> usize {
        let mut tasks = [NULL_HANDLE; WAITQUEUE_CAPACITY];
        let count = {
            let mut inner = self.inner.lock();
            let mut n = 0;
            while let Some(task) = inner.dequeue_one() {
                tasks[n] = task;
                n += 1;
            }
            n
        };
        if let Some(hooks) = sched_hooks::sched_hooks() {
            for task in &tasks[..count] {
                let _ = (hooks.unblock)(*task);
            }
        }
        count
    }

    /// Drop a specific task from the queue (task exit, signal kill path).
    pub fn remove_task(&self, task: TaskHandle) -> bool {
        self.inner.lock().remove(task)
    }

    pub fn has_waiters(&self) -> bool {
        self.inner.lock().count > 0
    }

    pub fn waiter_count(&self) -> usize {
        self.inner.lock().count
    }

    /// Block the current task until `condition()` is true, a signal
    /// arrives, or `timeout_ms` elapses (0 = no timeout).
    pub fn wait_event_timeout<F: Fn() -> bool>(&self, condition: F, timeout_ms: u64) -> WaitOutcome {
        let Some(hooks) = sched_hooks::sched_hooks() else {
            return if condition() {
                WaitOutcome::Satisfied
            } else {
                WaitOutcome::NotQueued
            };
        };

        let deadline = if timeout_ms == 0 {
            None
        } else {
            Some(sched_hooks::uptime_ms().saturating_add(timeout_ms))
        };

        loop {
            if condition() {
                return WaitOutcome::Satisfied;
            }
            if sched_hooks::signal_pending() {
                return WaitOutcome::Interrupted;
            }

            let remaining = match deadline {
                None => 0,
                Some(deadline) => {
                    let now = sched_hooks::uptime_ms();
                    if now >= deadline {
                        return WaitOutcome::TimedOut;
                    }
                    deadline - now
                }
            };

            {
                let mut inner = self.inner.lock();
                // Re-check under the lock to close the race with a waker.
                if condition() {
                    return WaitOutcome::Satisfied;
                }
                if !inner.enqueue(sched_hooks::current_task()) {
                    return WaitOutcome::NotQueued;
                }
            }
            // Window between unlock and suspend is covered by the
            // scheduler's pending-wakeup flag.
            (hooks.block_current)(remaining);

            // Scheduled again: either woken, timed out, or signalled.
            self.remove_current();
        }
    }

    /// Block until `condition()` is true or a signal arrives.
    pub fn wait_event<F: Fn() -> bool>(&self, condition: F) -> WaitOutcome {
        self.wait_event_timeout(condition, 0)
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}
