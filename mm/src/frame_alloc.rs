//! Physical page-frame allocator.
//!
//! A bitmap over the physical address space (0 = free, 1 = used) with a
//! parallel `u16` reference-count array for copy-on-write sharing, both
//! behind one `IrqMutex`. Allocation scans from a rotating cursor to spread
//! placement; contiguous allocation scans for a run of clear bits. The boot
//! memory map decides which ranges are usable; the kernel image, the
//! initrd, and frame 0 are never handed out.

use ferrite_abi::addr::PhysAddr;
use ferrite_lib::boot_info::{BootInfo, MemoryRangeKind};
use ferrite_lib::{IrqMutex, align_down_u64, align_up_u64, klog_debug, klog_info};

use crate::layout::PAGE_SIZE_4KB;

/// Highest physical frame the allocator tracks (1 GiB of RAM).
pub const MAX_FRAMES: usize = 262_144;

const BITMAP_WORDS: usize = MAX_FRAMES / 64;

struct FrameAllocator {
    bitmap: [u64; BITMAP_WORDS],
    refcounts: [u16; MAX_FRAMES],
    total_frames: u32,
    free_frames: u32,
    cursor: u32,
    initialized: bool,
}

impl FrameAllocator {
    const fn new() -> Self {
        Self {
            bitmap: [u64::MAX; BITMAP_WORDS],
            refcounts: [0; MAX_FRAMES],
            total_frames: 0,
            free_frames: 0,
            cursor: 1,
            initialized: false,
        }
    }

    #[inline]
    fn is_used(&self, frame: usize) -> bool {
        self.bitmap[frame / 64] & (1 << (frame % 64)) != 0
    }

    #[inline]
    fn set_used(&mut self, frame: usize) {
        self.bitmap[frame / 64] |= 1 << (frame % 64);
    }

    #[inline]
    fn set_free(&mut self, frame: usize) {
        self.bitmap[frame / 64] &= !(1 << (frame % 64));
    }

    fn mark_range_free(&mut self, start: u64, end: u64) {
        let first = (align_up_u64(start, PAGE_SIZE_4KB) / PAGE_SIZE_4KB) as usize;
        let last = (align_down_u64(end, PAGE_SIZE_4KB) / PAGE_SIZE_4KB) as usize;
        for frame in first..last.min(MAX_FRAMES) {
            if frame == 0 {
                continue;
            }
            if self.is_used(frame) {
                self.set_free(frame);
                self.refcounts[frame] = 0;
                self.free_frames += 1;
            }
        }
    }

    fn mark_range_used(&mut self, start: u64, end: u64) {
        let first = (align_down_u64(start, PAGE_SIZE_4KB) / PAGE_SIZE_4KB) as usize;
        let last = (align_up_u64(end, PAGE_SIZE_4KB) / PAGE_SIZE_4KB) as usize;
        for frame in first..last.min(MAX_FRAMES) {
            if !self.is_used(frame) {
                self.set_used(frame);
                self.free_frames = self.free_frames.saturating_sub(1);
            }
        }
    }

    /// Scan for one free frame starting at the rotating cursor.
    fn take_one(&mut self) -> Option<usize> {
        if self.free_frames == 0 {
            return None;
        }
        let total = self.total_frames as usize;
        let start = self.cursor as usize;
        for step in 0..total {
            let frame = 1 + (start + step - 1) % (total - 1).max(1);
            if !self.is_used(frame) {
                self.set_used(frame);
                self.refcounts[frame] = 1;
                self.free_frames -= 1;
                self.cursor = (frame as u32 + 1).min(self.total_frames - 1).max(1);
                return Some(frame);
            }
        }
        None
    }

    /// Scan for `count` consecutive free frames.
    fn take_contiguous(&mut self, count: usize) -> Option<usize> {
        if count == 0 || (self.free_frames as usize) < count {
            return None;
        }
        let total = self.total_frames as usize;
        let mut run_start = 0usize;
        let mut run_len = 0usize;
        for frame in 1..total {
            if self.is_used(frame) {
                run_len = 0;
                continue;
            }
            if run_len == 0 {
                run_start = frame;
            }
            run_len += 1;
            if run_len == count {
                for f in run_start..run_start + count {
                    self.set_used(f);
                    self.refcounts[f] = 1;
                }
                self.free_frames -= count as u32;
                return Some(run_start);
            }
        }
        None
    }
}

static FRAME_ALLOCATOR: IrqMutex<FrameAllocator> = IrqMutex::new(FrameAllocator::new());

#[inline]
fn frame_index(phys: PhysAddr) -> Option<usize> {
    let frame = phys.frame_number() as usize;
    if frame == 0 || frame >= MAX_FRAMES {
        None
    } else {
        Some(frame)
    }
}

/// Seed the allocator from the boot memory map. Usable ranges become free;
/// the kernel image and initrd are carved back out as used.
pub fn frame_alloc_init(boot: &BootInfo) {
    let mut alloc = FRAME_ALLOCATOR.lock();

    let mut highest: u64 = 0;
    for range in boot.ranges[..boot.range_count].iter() {
        let end = range.base + range.length;
        if range.kind == MemoryRangeKind::Available && end > highest {
            highest = end;
        }
    }
    let total = ((highest / PAGE_SIZE_4KB) as usize).min(MAX_FRAMES);
    alloc.total_frames = total as u32;

    for range in boot.ranges[..boot.range_count].iter() {
        if range.kind == MemoryRangeKind::Available {
            alloc.mark_range_free(range.base, range.base + range.length);
        }
    }

    if !boot.kernel_start.is_null() {
        alloc.mark_range_used(boot.kernel_start.as_u64(), boot.kernel_end.as_u64());
    }
    if !boot.initrd_start.is_null() {
        alloc.mark_range_used(boot.initrd_start.as_u64(), boot.initrd_end.as_u64());
    }

    alloc.initialized = true;
    klog_info!(
        "frame allocator: {} frames tracked, {} free",
        alloc.total_frames,
        alloc.free_frames
    );
}

/// Allocate one zeroed page frame. Returns `PhysAddr::NULL` on exhaustion.
pub fn alloc_page_frame() -> PhysAddr {
    let frame = {
        let mut alloc = FRAME_ALLOCATOR.lock();
        if !alloc.initialized {
            return PhysAddr::NULL;
        }
        alloc.take_one()
    };

    match frame {
        Some(frame) => {
            let phys = PhysAddr::new(frame as u64 * PAGE_SIZE_4KB);
            zero_frame(phys);
            phys
        }
        None => {
            klog_info!("alloc_page_frame: out of memory");
            PhysAddr::NULL
        }
    }
}

/// Allocate `count` physically contiguous zeroed frames.
pub fn alloc_contiguous_frames(count: u32) -> PhysAddr {
    if count == 0 {
        return PhysAddr::NULL;
    }
    if count == 1 {
        return alloc_page_frame();
    }

    let start = {
        let mut alloc = FRAME_ALLOCATOR.lock();
        if !alloc.initialized {
            return PhysAddr::NULL;
        }
        alloc.take_contiguous(count as usize)
    };

    match start {
        Some(start) => {
            let base = PhysAddr::new(start as u64 * PAGE_SIZE_4KB);
            for i in 0..count as u64 {
                zero_frame(base.offset(i * PAGE_SIZE_4KB));
            }
            base
        }
        None => {
            klog_info!("alloc_contiguous_frames: no run of {} free frames", count);
            PhysAddr::NULL
        }
    }
}

/// Release one reference; the frame returns to the pool when the last
/// reference drops.
pub fn free_page_frame(phys: PhysAddr) {
    let Some(frame) = frame_index(phys) else {
        klog_info!("free_page_frame: untracked address {}", phys);
        return;
    };

    let mut alloc = FRAME_ALLOCATOR.lock();
    if !alloc.is_used(frame) {
        panic!("free_page_frame: double free of {}", phys);
    }
    match alloc.refcounts[frame] {
        0 => panic!("free_page_frame: used frame {} with zero refcount", phys),
        1 => {
            alloc.refcounts[frame] = 0;
            alloc.set_free(frame);
            alloc.free_frames += 1;
        }
        _ => {
            alloc.refcounts[frame] -= 1;
        }
    }
}

/// Add one reference to a live frame. Returns the new count, or 0 if the
/// address is not an allocated frame.
pub fn frame_incref(phys: PhysAddr) -> u32 {
    let Some(frame) = frame_index(phys) else {
        return 0;
    };
    let mut alloc = FRAME_ALLOCATOR.lock();
    if !alloc.is_used(frame) || alloc.refcounts[frame] == 0 {
        return 0;
    }
    alloc.refcounts[frame] = alloc.refcounts[frame].saturating_add(1);
    alloc.refcounts[frame] as u32
}

/// Drop one reference and return the new count; frees the frame at zero.
pub fn frame_decref(phys: PhysAddr) -> u32 {
    let Some(frame) = frame_index(phys) else {
        return 0;
    };
    let mut alloc = FRAME_ALLOCATOR.lock();
    if !alloc.is_used(frame) || alloc.refcounts[frame] == 0 {
        return 0;
    }
    alloc.refcounts[frame] -= 1;
    let remaining = alloc.refcounts[frame] as u32;
    if remaining == 0 {
        alloc.set_free(frame);
        alloc.free_frames += 1;
    }
    remaining
}

pub fn frame_refcount(phys: PhysAddr) -> u32 {
    let Some(frame) = frame_index(phys) else {
        return 0;
    };
    let alloc = FRAME_ALLOCATOR.lock();
    alloc.refcounts[frame] as u32
}

/// True if the address names a frame this allocator handed out.
pub fn frame_is_allocated(phys: PhysAddr) -> bool {
    let Some(frame) = frame_index(phys) else {
        return false;
    };
    let alloc = FRAME_ALLOCATOR.lock();
    alloc.is_used(frame) && alloc.refcounts[frame] > 0
}

pub fn frame_alloc_stats(total: &mut u32, free: &mut u32) {
    let alloc = FRAME_ALLOCATOR.lock();
    *total = alloc.total_frames;
    *free = alloc.free_frames;
}

fn zero_frame(phys: PhysAddr) {
    use crate::hhdm::PhysAddrHhdm;
    if let Some(virt) = phys.to_virt_checked() {
        unsafe {
            core::ptr::write_bytes(virt.as_mut_ptr::<u8>(), 0, PAGE_SIZE_4KB as usize);
        }
    } else {
        klog_debug!("zero_frame: no HHDM mapping for {}", phys);
    }
}

// =============================================================================
// OwnedFrame — RAII wrapper for code that may bail out mid-construction
// =============================================================================

/// A page frame freed automatically when dropped. `into_phys` transfers
/// ownership out for mappings that take over the reference.
pub struct OwnedFrame {
    phys: PhysAddr,
}

impl OwnedFrame {
    pub fn alloc() -> Option<Self> {
        let phys = alloc_page_frame();
        if phys.is_null() { None } else { Some(Self { phys }) }
    }

    #[inline]
    pub fn phys_addr(&self) -> PhysAddr {
        self.phys
    }

    #[inline]
    pub fn into_phys(self) -> PhysAddr {
        let phys = self.phys;
        core::mem::forget(self);
        phys
    }
}

impl Drop for OwnedFrame {
    fn drop(&mut self) {
        if !self.phys.is_null() {
            free_page_frame(self.phys);
        }
    }
}

unsafe impl Send for OwnedFrame {}
