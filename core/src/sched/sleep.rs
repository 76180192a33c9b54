//! Sleep queue: wake-at-tick bookkeeping for Sleeping tasks.

use ferrite_abi::task::{INVALID_TASK_ID, MAX_TASKS, TaskStatus};
use ferrite_lib::IrqMutex;

#[derive(Copy, Clone)]
struct SleepEntry {
    task_id: u32,
    wake_tick: u64,
    active: bool,
}

impl SleepEntry {
    const fn empty() -> Self {
        Self {
            task_id: INVALID_TASK_ID,
            wake_tick: 0,
            active: false,
        }
    }
}

struct SleepQueue {
    entries: [SleepEntry; MAX_TASKS],
}

static SLEEP_QUEUE: IrqMutex<SleepQueue> = IrqMutex::new(SleepQueue {
    entries: [SleepEntry::empty(); MAX_TASKS],
});

/// Wrap-safe "now >= deadline".
#[inline]
fn tick_reached(now: u64, deadline: u64) -> bool {
    now.wrapping_sub(deadline) < (1u64 << 63)
}

/// Record (or move) a task's wake deadline.
pub fn sleep_queue_insert(task_id: u32, wake_tick: u64) -> bool {
    let mut queue = SLEEP_QUEUE.lock();
    let mut free_idx = None;
    for (idx, entry) in queue.entries.iter_mut().enumerate() {
        if entry.active && entry.task_id == task_id {
            entry.wake_tick = wake_tick;
            return true;
        }
        if !entry.active && free_idx.is_none() {
            free_idx = Some(idx);
        }
    }
    match free_idx {
        Some(idx) => {
            queue.entries[idx] = SleepEntry {
                task_id,
                wake_tick,
                active: true,
            };
            true
        }
        None => false,
    }
}

pub fn sleep_queue_remove(task_id: u32) {
    let mut queue = SLEEP_QUEUE.lock();
    for entry in queue.entries.iter_mut() {
        if entry.active && entry.task_id == task_id {
            *entry = SleepEntry::empty();
            return;
        }
    }
}

/// Timer path: move every task whose deadline has passed back to Ready.
pub fn wake_due_sleepers(now_tick: u64) {
    let mut due = [INVALID_TASK_ID; MAX_TASKS];
    let due_count = {
        let mut queue = SLEEP_QUEUE.lock();
        let mut count = 0;
        for entry in queue.entries.iter_mut() {
            if entry.active && tick_reached(now_tick, entry.wake_tick) {
                due[count] = entry.task_id;
                count += 1;
                *entry = SleepEntry::empty();
            }
        }
        count
    };

    for task_id in &due[..due_count] {
        let task = super::task::task_find_by_id(*task_id);
        if task.is_null() {
            continue;
        }
        let task_ref = unsafe { &*task };
        if task_ref.status() == TaskStatus::Sleeping
            && task_ref.try_transition_to(TaskStatus::Ready)
        {
            super::scheduler::schedule_task(task);
        }
    }
}
