//! Per-CPU run queues: 32 priority FIFOs plus an occupancy bitmap.
//!
//! Each CPU owns its scheduler instance. `enqueue` sets the priority's
//! bit and appends; `dequeue` takes the head of the lowest-numbered
//! non-empty priority (`trailing_zeros` of the bitmap) and clears the bit
//! when the list drains — O(1) either way. Tie-break within a priority is
//! FIFO, which gives round-robin among equals.

use core::ptr;
use core::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, Ordering};

use ferrite_abi::task::NUM_PRIORITIES;
use ferrite_lib::{MAX_CPUS, klog_info};
use spin::Mutex;

use super::task_struct::Task;

struct ReadyQueue {
    head: *mut Task,
    tail: *mut Task,
    count: u32,
}

unsafe impl Send for ReadyQueue {}
unsafe impl Sync for ReadyQueue {}

impl ReadyQueue {
    const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            tail: ptr::null_mut(),
            count: 0,
        }
    }

    fn contains(&self, task: *mut Task) -> bool {
        let mut cursor = self.head;
        while !cursor.is_null() {
            if cursor == task {
                return true;
            }
            cursor = unsafe { (*cursor).next_ready };
        }
        false
    }

    fn push_tail(&mut self, task: *mut Task) {
        unsafe { (*task).next_ready = ptr::null_mut() };
        if self.head.is_null() {
            self.head = task;
        } else {
            unsafe { (*self.tail).next_ready = task };
        }
        self.tail = task;
        self.count += 1;
    }

    fn pop_head(&mut self) -> *mut Task {
        let task = self.head;
        if task.is_null() {
            return ptr::null_mut();
        }
        unsafe {
            self.head = (*task).next_ready;
            if self.head.is_null() {
                self.tail = ptr::null_mut();
            }
            (*task).next_ready = ptr::null_mut();
        }
        self.count -= 1;
        task
    }

    fn remove(&mut self, task: *mut Task) -> bool {
        let mut prev: *mut Task = ptr::null_mut();
        let mut cursor = self.head;
        while !cursor.is_null() {
            if cursor == task {
                unsafe {
                    if prev.is_null() {
                        self.head = (*cursor).next_ready;
                    } else {
                        (*prev).next_ready = (*cursor).next_ready;
                    }
                    if self.tail == cursor {
                        self.tail = prev;
                    }
                    (*cursor).next_ready = ptr::null_mut();
                }
                self.count -= 1;
                return true;
            }
            prev = cursor;
            cursor = unsafe { (*cursor).next_ready };
        }
        false
    }
}

struct RunQueues {
    queues: [ReadyQueue; NUM_PRIORITIES],
    /// Bit N set ⇔ priority N has at least one task queued.
    occupancy: u32,
}

impl RunQueues {
    const fn new() -> Self {
        Self {
            queues: [const { ReadyQueue::new() }; NUM_PRIORITIES],
            occupancy: 0,
        }
    }
}

#[repr(align(64))]
pub struct PerCpuSched {
    run: Mutex<RunQueues>,
    current: AtomicPtr<Task>,
    idle: AtomicPtr<Task>,
    ready_count: AtomicU32,
    pub switches: AtomicU64,
    pub preemptions: AtomicU64,
}

unsafe impl Send for PerCpuSched {}
unsafe impl Sync for PerCpuSched {}

impl PerCpuSched {
    const fn new() -> Self {
        Self {
            run: Mutex::new(RunQueues::new()),
            current: AtomicPtr::new(ptr::null_mut()),
            idle: AtomicPtr::new(ptr::null_mut()),
            ready_count: AtomicU32::new(0),
            switches: AtomicU64::new(0),
            preemptions: AtomicU64::new(0),
        }
    }

    /// This scheduler's CPU index, derived from its slot in the array.
    #[inline]
    pub fn cpu_id(&self) -> usize {
        let base = CPU_SCHEDS.as_ptr() as usize;
        (self as *const PerCpuSched as usize - base) / core::mem::size_of::<PerCpuSched>()
    }

    #[inline]
    pub fn current_task(&self) -> *mut Task {
        self.current.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_current_task(&self, task: *mut Task) {
        self.current.store(task, Ordering::Release);
    }

    #[inline]
    pub fn idle_task(&self) -> *mut Task {
        self.idle.load(Ordering::Acquire)
    }

    pub fn set_idle_task(&self, task: *mut Task) {
        self.idle.store(task, Ordering::Release);
    }

    #[inline]
    pub fn ready_count(&self) -> u32 {
        self.ready_count.load(Ordering::Acquire)
    }

    /// Append a Ready task to its priority's FIFO.
    pub fn enqueue(&self, task: *mut Task) -> i32 {
        if task.is_null() {
            return -1;
        }
        let priority = unsafe { (*task).priority as usize }.min(NUM_PRIORITIES - 1);
        let mut run = self.run.lock();
        if run.queues[priority].contains(task) {
            return 0;
        }
        unsafe { (*task).home_cpu = self.cpu_id() as u8 };
        run.queues[priority].push_tail(task);
        run.occupancy |= 1 << priority;
        self.ready_count.fetch_add(1, Ordering::Release);
        0
    }

    /// Pop the head of the highest (lowest-numbered) non-empty priority.
    pub fn dequeue_highest(&self) -> *mut Task {
        let mut run = self.run.lock();
        if run.occupancy == 0 {
            return ptr::null_mut();
        }
        let priority = run.occupancy.trailing_zeros() as usize;
        let task = run.queues[priority].pop_head();
        if task.is_null() {
            // Occupancy said non-empty but the list is drained: the bitmap
            // is corrupt.
            panic!("run queue bitmap out of sync at priority {}", priority);
        }
        if run.queues[priority].count == 0 {
            run.occupancy &= !(1 << priority);
        }
        self.ready_count.fetch_sub(1, Ordering::Release);
        task
    }

    /// Highest queued priority, if any (preemption decisions).
    pub fn top_priority(&self) -> Option<u8> {
        let run = self.run.lock();
        if run.occupancy == 0 {
            None
        } else {
            Some(run.occupancy.trailing_zeros() as u8)
        }
    }

    pub fn remove(&self, task: *mut Task) -> bool {
        if task.is_null() {
            return false;
        }
        let priority = unsafe { (*task).priority as usize }.min(NUM_PRIORITIES - 1);
        let mut run = self.run.lock();
        if run.queues[priority].remove(task) {
            if run.queues[priority].count == 0 {
                run.occupancy &= !(1 << priority);
            }
            self.ready_count.fetch_sub(1, Ordering::Release);
            return true;
        }
        false
    }
}

static CPU_SCHEDS: [PerCpuSched; MAX_CPUS] = [const { PerCpuSched::new() }; MAX_CPUS];

pub fn init_percpu_schedulers() {
    klog_info!("scheduler: {} per-CPU run queues ready", MAX_CPUS);
}

#[inline]
pub fn cpu_sched(cpu_id: usize) -> &'static PerCpuSched {
    &CPU_SCHEDS[cpu_id.min(MAX_CPUS - 1)]
}

#[inline]
pub fn local_sched() -> &'static PerCpuSched {
    cpu_sched(ferrite_lib::get_current_cpu())
}

/// Least-loaded online CPU; used once, at task creation. No migration
/// afterwards.
pub fn select_target_cpu() -> usize {
    let mut best = 0usize;
    let mut min_load = u32::MAX;
    for cpu_id in 0..ferrite_lib::get_cpu_count() {
        if !ferrite_lib::is_cpu_online(cpu_id) {
            continue;
        }
        let load = cpu_sched(cpu_id).ready_count();
        if load < min_load {
            min_load = load;
            best = cpu_id;
        }
    }
    best
}

pub fn total_ready_tasks() -> u32 {
    (0..ferrite_lib::get_cpu_count())
        .map(|cpu| cpu_sched(cpu).ready_count())
        .sum()
}
