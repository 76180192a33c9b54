//! `/proc` content providers and hook registration.

use core::fmt::Write;
use core::sync::atomic::Ordering;

use ferrite_fs::procfs::{ProcHooks, register_proc_hooks};
use ferrite_lib::IrqMutex;
use ferrite_mm::frame_alloc::frame_alloc_stats;
use ferrite_mm::kernel_heap::get_heap_stats;
use ferrite_mm::layout::PAGE_SIZE_4KB;
use ferrite_mm::process_vm::{
    INVALID_SHM_ID, process_vm_heap_bounds, process_vm_for_each_region,
};

use crate::clock;
use crate::sched::task::{task_current_pid, task_find_by_id, task_iterate_active};

/// Boot command line kept for `/proc/cmdline`.
static SAVED_CMDLINE: IrqMutex<([u8; 512], usize)> = IrqMutex::new(([0; 512], 0));

pub fn save_cmdline(raw: &[u8]) {
    let mut saved = SAVED_CMDLINE.lock();
    let len = raw.len().min(saved.0.len());
    saved.0[..len].copy_from_slice(&raw[..len]);
    saved.1 = len;
}

/// `core::fmt` sink over a fixed byte buffer.
struct BufWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> BufWriter<'a> {
    fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }
}

impl Write for BufWriter<'_> {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let bytes = s.as_bytes();
        let room = self.buf.len() - self.pos;
        let take = bytes.len().min(room);
        self.buf[self.pos..self.pos + take].copy_from_slice(&bytes[..take]);
        self.pos += take;
        if take < bytes.len() { Err(core::fmt::Error) } else { Ok(()) }
    }
}

fn hook_for_each_pid(f: &mut dyn FnMut(u32)) {
    task_iterate_active(|task| f(unsafe { (*task).task_id }));
}

fn hook_pid_exists(pid: u32) -> bool {
    !task_find_by_id(pid).is_null()
}

fn hook_current_pid() -> u32 {
    task_current_pid()
}

fn hook_write_status(pid: u32, buf: &mut [u8]) -> usize {
    let task = task_find_by_id(pid);
    if task.is_null() {
        return 0;
    }
    let task = unsafe { &*task };
    let (heap_start, heap_break) = process_vm_heap_bounds(task.process_id);

    let mut w = BufWriter::new(buf);
    let _ = write!(
        w,
        "Pid:\t{}\nPPid:\t{}\nPgrp:\t{}\nSession:\t{}\nState:\t{}\nSigPnd:\t{:016x}\nSigBlk:\t{:016x}\nHeapStart:\t{:#x}\nHeapBreak:\t{:#x}\n",
        task.task_id,
        task.parent_id,
        task.pgid,
        task.sid,
        task.status().proc_code() as char,
        task.signal_pending.load(Ordering::Acquire),
        task.signal_blocked,
        heap_start,
        heap_break,
    );
    w.pos
}

fn hook_write_maps(pid: u32, buf: &mut [u8]) -> usize {
    let task = task_find_by_id(pid);
    if task.is_null() {
        return 0;
    }
    let process_id = unsafe { (*task).process_id };
    let (heap_start, heap_break) = process_vm_heap_bounds(process_id);

    let mut w = BufWriter::new(buf);
    if heap_break > heap_start {
        let _ = writeln!(w, "{:016x}-{:016x} rw-p [heap]", heap_start, heap_break);
    }
    process_vm_for_each_region(process_id, |region| {
        let tag: &str = if region.shmid != INVALID_SHM_ID { "shm" } else { "anon" };
        let _ = writeln!(
            w,
            "{:016x}-{:016x} rw-p [{}]",
            region.base,
            region.base + region.length,
            tag
        );
    });
    let _ = writeln!(
        w,
        "{:016x}-{:016x} rw-p [stack]",
        ferrite_mm::layout::USER_STACK_TOP_VA - ferrite_mm::layout::USER_STACK_SIZE,
        ferrite_mm::layout::USER_STACK_TOP_VA
    );
    w.pos
}

fn hook_write_meminfo(buf: &mut [u8]) -> usize {
    let mut total = 0u32;
    let mut free = 0u32;
    frame_alloc_stats(&mut total, &mut free);
    let heap = get_heap_stats();

    let kb = |frames: u32| frames as u64 * PAGE_SIZE_4KB / 1024;
    let mut w = BufWriter::new(buf);
    let _ = write!(
        w,
        "MemTotal:\t{} kB\nMemFree:\t{} kB\nKernelHeapTotal:\t{} kB\nKernelHeapUsed:\t{} kB\n",
        kb(total),
        kb(free),
        heap.total_bytes / 1024,
        heap.allocated_bytes / 1024,
    );
    w.pos
}

fn hook_write_uptime(buf: &mut [u8]) -> usize {
    let ms = clock::uptime_ms();
    let mut w = BufWriter::new(buf);
    let _ = writeln!(w, "{}.{:02}", ms / 1000, (ms % 1000) / 10);
    w.pos
}

fn hook_write_cmdline(buf: &mut [u8]) -> usize {
    let saved = SAVED_CMDLINE.lock();
    let len = saved.1.min(buf.len().saturating_sub(1));
    buf[..len].copy_from_slice(&saved.0[..len]);
    if len < buf.len() {
        buf[len] = b'\n';
        return len + 1;
    }
    len
}

/// Wire the `/proc` providers into the fs crate.
pub fn init_proc() {
    register_proc_hooks(ProcHooks {
        for_each_pid: hook_for_each_pid,
        pid_exists: hook_pid_exists,
        current_pid: hook_current_pid,
        write_status: hook_write_status,
        write_maps: hook_write_maps,
        write_meminfo: hook_write_meminfo,
        write_uptime: hook_write_uptime,
        write_cmdline: hook_write_cmdline,
    });
}
