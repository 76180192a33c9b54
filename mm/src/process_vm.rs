//! Per-process virtual memory: address space, heap range, recorded mmap
//! regions, stack, and the fault entry point.
//!
//! Each process owns one [`AddressSpace`] plus bookkeeping: the brk-managed
//! heap `[heap_start, heap_break)`, up to [`MAX_MMAP_REGIONS`] recorded
//! regions (anonymous mmap or attached shared-memory segments), and the
//! last faulting address surfaced in `/proc/<pid>/maps` debugging. All
//! mutation of one process's tables happens under the manager lock, which
//! doubles as the per-address-space structural lock the ordering rules
//! require.

use ferrite_abi::addr::{PhysAddr, VirtAddr};
use ferrite_abi::task::INVALID_PROCESS_ID;
use ferrite_lib::{IrqMutex, align_up_u64, klog_debug, klog_info};

use crate::cow;
use crate::error::{MmError, MmResult};
use crate::frame_alloc::{alloc_page_frame, free_page_frame};
use crate::layout::{
    MAX_MMAP_REGIONS, MAX_PROCESSES, PAGE_SIZE_4KB, USER_HEAP_START_VA, USER_MMAP_BASE_VA,
    USER_SPACE_END_VA, USER_SPACE_START_VA, USER_STACK_SIZE, USER_STACK_TOP_VA, USER_VDSO_VA,
};
use crate::paging::{AddressSpace, PageFlags};
use crate::tlb;

pub const INVALID_SHM_ID: u32 = u32::MAX;

#[derive(Clone, Copy)]
pub struct MmapRegion {
    pub base: u64,
    pub length: u64,
    /// Attached shared-memory segment, or `INVALID_SHM_ID` for anonymous.
    pub shmid: u32,
    pub in_use: bool,
}

impl MmapRegion {
    const fn empty() -> Self {
        Self {
            base: 0,
            length: 0,
            shmid: INVALID_SHM_ID,
            in_use: false,
        }
    }

    #[inline]
    pub fn contains(&self, addr: u64) -> bool {
        self.in_use && addr >= self.base && addr < self.base + self.length
    }
}

#[derive(Clone, Copy)]
struct ProcessVm {
    process_id: u32,
    space: AddressSpace,
    heap_start: u64,
    heap_break: u64,
    stack_low: u64,
    stack_high: u64,
    mmap_cursor: u64,
    regions: [MmapRegion; MAX_MMAP_REGIONS],
    last_fault_addr: u64,
}

unsafe impl Send for ProcessVm {}

impl ProcessVm {
    const fn unused() -> Self {
        Self {
            process_id: INVALID_PROCESS_ID,
            space: AddressSpace::null(),
            heap_start: 0,
            heap_break: 0,
            stack_low: 0,
            stack_high: 0,
            mmap_cursor: USER_MMAP_BASE_VA,
            regions: [MmapRegion::empty(); MAX_MMAP_REGIONS],
            last_fault_addr: 0,
        }
    }
}

struct VmManager {
    processes: [ProcessVm; MAX_PROCESSES],
    next_process_id: u32,
}

unsafe impl Send for VmManager {}

static VM_MANAGER: IrqMutex<VmManager> = IrqMutex::new(VmManager {
    processes: [ProcessVm::unused(); MAX_PROCESSES],
    next_process_id: 1,
});

// Physical frame of the shared vDSO page, registered by the clock.
static VDSO_FRAME: IrqMutex<PhysAddr> = IrqMutex::new(PhysAddr::NULL);

pub fn register_vdso_frame(phys: PhysAddr) {
    *VDSO_FRAME.lock() = phys;
}

fn with_process<R>(pid: u32, f: impl FnOnce(&mut ProcessVm) -> R) -> Option<R> {
    let mut mgr = VM_MANAGER.lock();
    for slot in mgr.processes.iter_mut() {
        if slot.process_id == pid {
            return Some(f(slot));
        }
    }
    None
}

/// Map freshly allocated zeroed frames over `[start, end)`, rolling back
/// every page already placed if allocation or mapping fails midway.
fn map_zeroed_range(space: &AddressSpace, start: u64, end: u64, flags: PageFlags) -> MmResult<()> {
    let mut addr = start;
    while addr < end {
        let phys = alloc_page_frame();
        if phys.is_null() {
            unmap_range(space, start, addr);
            return Err(MmError::NoMemory);
        }
        if let Err(err) = space.map_page(VirtAddr::new(addr), phys, flags) {
            free_page_frame(phys);
            unmap_range(space, start, addr);
            return Err(err);
        }
        addr += PAGE_SIZE_4KB;
    }
    Ok(())
}

/// Unmap `[start, end)` and drop one reference on each mapped frame.
fn unmap_range(space: &AddressSpace, start: u64, end: u64) {
    let mut addr = start;
    while addr < end {
        if let Some(phys) = space.unmap_page(VirtAddr::new(addr)) {
            free_page_frame(phys.page_base());
        }
        addr += PAGE_SIZE_4KB;
    }
}

fn map_vdso(space: &AddressSpace) {
    let vdso = *VDSO_FRAME.lock();
    if vdso.is_null() {
        return;
    }
    match space.map_page(
        VirtAddr::new(USER_VDSO_VA),
        vdso,
        PageFlags::USER_RO | PageFlags::NX,
    ) {
        // Each mapping holds a reference; teardown decrefs it with the
        // rest of the leaves, leaving the clock's base reference alive.
        Ok(()) => {
            crate::frame_alloc::frame_incref(vdso);
        }
        Err(err) => klog_info!("map_vdso: {:?}", err),
    }
}

fn setup_user_stack(space: &AddressSpace) -> MmResult<(u64, u64)> {
    let high = USER_STACK_TOP_VA;
    let low = high - USER_STACK_SIZE;
    map_zeroed_range(space, low, high, PageFlags::USER_RW | PageFlags::NX)?;
    Ok((low, high))
}

/// Create a new process VM: fresh kernel-cloned address space, mapped
/// stack, vDSO page, and an empty heap at the canonical base.
pub fn create_process_vm() -> u32 {
    let space = match AddressSpace::clone_kernel() {
        Ok(space) => space,
        Err(err) => {
            klog_info!("create_process_vm: {:?}", err);
            return INVALID_PROCESS_ID;
        }
    };

    let (stack_low, stack_high) = match setup_user_stack(&space) {
        Ok(bounds) => bounds,
        Err(err) => {
            klog_info!("create_process_vm: stack setup failed: {:?}", err);
            space.destroy();
            return INVALID_PROCESS_ID;
        }
    };
    map_vdso(&space);

    let mut mgr = VM_MANAGER.lock();
    let pid = mgr.next_process_id;
    for slot in mgr.processes.iter_mut() {
        if slot.process_id != INVALID_PROCESS_ID {
            continue;
        }
        *slot = ProcessVm {
            process_id: pid,
            space,
            heap_start: USER_HEAP_START_VA,
            heap_break: USER_HEAP_START_VA,
            stack_low,
            stack_high,
            mmap_cursor: USER_MMAP_BASE_VA,
            regions: [MmapRegion::empty(); MAX_MMAP_REGIONS],
            last_fault_addr: 0,
        };
        mgr.next_process_id = pid.wrapping_add(1).max(1);
        return pid;
    }
    drop(mgr);

    klog_info!("create_process_vm: process table full");
    space.destroy();
    INVALID_PROCESS_ID
}

/// CoW duplicate of `src_pid` for fork: shares every user page read-only,
/// copies the heap/stack/region bookkeeping.
pub fn process_vm_clone_cow(src_pid: u32) -> u32 {
    let Some(src) = with_process(src_pid, |p| *p) else {
        return INVALID_PROCESS_ID;
    };

    let space = match src.space.clone_user_cow() {
        Ok(space) => space,
        Err(err) => {
            klog_info!("process_vm_clone_cow: {:?}", err);
            return INVALID_PROCESS_ID;
        }
    };

    let mut mgr = VM_MANAGER.lock();
    let pid = mgr.next_process_id;
    for slot in mgr.processes.iter_mut() {
        if slot.process_id != INVALID_PROCESS_ID {
            continue;
        }
        *slot = ProcessVm {
            process_id: pid,
            space,
            heap_start: src.heap_start,
            heap_break: src.heap_break,
            stack_low: src.stack_low,
            stack_high: src.stack_high,
            mmap_cursor: src.mmap_cursor,
            regions: src.regions,
            last_fault_addr: 0,
        };
        mgr.next_process_id = pid.wrapping_add(1).max(1);
        return pid;
    }
    drop(mgr);

    space.destroy();
    INVALID_PROCESS_ID
}

pub fn destroy_process_vm(pid: u32) {
    let taken = with_process(pid, |p| {
        let copy = *p;
        *p = ProcessVm::unused();
        copy
    });
    if let Some(vm) = taken {
        vm.space.destroy();
    }
}

pub fn process_vm_space(pid: u32) -> Option<AddressSpace> {
    with_process(pid, |p| p.space)
}

pub fn process_vm_stack_top(pid: u32) -> u64 {
    with_process(pid, |p| p.stack_high).unwrap_or(0)
}

pub fn process_vm_heap_bounds(pid: u32) -> (u64, u64) {
    with_process(pid, |p| (p.heap_start, p.heap_break)).unwrap_or((0, 0))
}

pub fn process_vm_last_fault(pid: u32) -> u64 {
    with_process(pid, |p| p.last_fault_addr).unwrap_or(0)
}

// =============================================================================
// brk
// =============================================================================

/// Grow or shrink the heap. `addr == 0` queries the current break. Returns
/// the (possibly unchanged) break; on failure the old break is returned so
/// the caller sees no movement.
pub fn process_vm_brk(pid: u32, addr: u64) -> u64 {
    with_process(pid, |p| {
        if addr == 0 {
            return p.heap_break;
        }
        let new_break = align_up_u64(addr, PAGE_SIZE_4KB);
        if new_break < p.heap_start || new_break > USER_MMAP_BASE_VA {
            return p.heap_break;
        }
        let old_break = align_up_u64(p.heap_break, PAGE_SIZE_4KB);

        if new_break > old_break {
            if map_zeroed_range(&p.space, old_break, new_break, PageFlags::USER_RW | PageFlags::NX)
                .is_err()
            {
                return p.heap_break;
            }
        } else if new_break < old_break {
            unmap_range(&p.space, new_break, old_break);
        }
        p.heap_break = addr;
        p.heap_break
    })
    .unwrap_or(0)
}

// =============================================================================
// mmap / munmap
// =============================================================================

fn prot_to_flags(prot: u32) -> PageFlags {
    use ferrite_abi::syscall::{PROT_EXEC, PROT_WRITE};
    let mut flags = PageFlags::USER_RO;
    if prot & PROT_WRITE != 0 {
        flags |= PageFlags::WRITABLE;
    }
    if prot & PROT_EXEC == 0 {
        flags |= PageFlags::NX;
    }
    flags
}

fn record_region(p: &mut ProcessVm, base: u64, length: u64, shmid: u32) -> MmResult<()> {
    for region in p.regions.iter_mut() {
        if !region.in_use {
            *region = MmapRegion {
                base,
                length,
                shmid,
                in_use: true,
            };
            return Ok(());
        }
    }
    Err(MmError::RegionTableFull)
}

/// Anonymous-private mmap. `MAP_FIXED` honours `addr` exactly (it must be
/// page-aligned and free); otherwise placement walks the mmap cursor.
pub fn process_vm_mmap(pid: u32, addr: u64, length: u64, prot: u32, flags: u32) -> MmResult<u64> {
    use ferrite_abi::syscall::{MAP_ANONYMOUS, MAP_FIXED, MAP_PRIVATE};

    if length == 0 {
        return Err(MmError::InvalidArgument);
    }
    if flags & MAP_ANONYMOUS == 0 || flags & MAP_PRIVATE == 0 {
        return Err(MmError::InvalidArgument);
    }
    let length = align_up_u64(length, PAGE_SIZE_4KB);
    let page_flags = prot_to_flags(prot);

    with_process(pid, |p| {
        let base = if flags & MAP_FIXED != 0 {
            if addr == 0 || addr % PAGE_SIZE_4KB != 0 {
                return Err(MmError::InvalidArgument);
            }
            if addr < USER_SPACE_START_VA || addr + length > USER_SPACE_END_VA {
                return Err(MmError::InvalidAddress);
            }
            addr
        } else {
            let base = p.mmap_cursor;
            p.mmap_cursor += length + PAGE_SIZE_4KB;
            base
        };

        map_zeroed_range(&p.space, base, base + length, page_flags)?;
        if let Err(err) = record_region(p, base, length, INVALID_SHM_ID) {
            unmap_range(&p.space, base, base + length);
            return Err(err);
        }
        Ok(base)
    })
    .unwrap_or(Err(MmError::NoSuchProcess))
}

/// Unmap an anonymous region. Shared-memory attachments must go through
/// shmdt, not munmap.
pub fn process_vm_munmap(pid: u32, addr: u64, length: u64) -> MmResult<()> {
    if addr % PAGE_SIZE_4KB != 0 || length == 0 {
        return Err(MmError::InvalidArgument);
    }
    let length = align_up_u64(length, PAGE_SIZE_4KB);

    with_process(pid, |p| {
        let Some(idx) = p
            .regions
            .iter()
            .position(|r| r.in_use && r.base == addr && r.length == length)
        else {
            return Err(MmError::NotMapped);
        };
        if p.regions[idx].shmid != INVALID_SHM_ID {
            return Err(MmError::InvalidArgument);
        }
        unmap_range(&p.space, addr, addr + length);
        p.regions[idx] = MmapRegion::empty();
        Ok(())
    })
    .unwrap_or(Err(MmError::NoSuchProcess))
}

// =============================================================================
// Shared-memory attachment plumbing (called by `shared_memory`)
// =============================================================================

/// Map `frames` contiguously at `addr` (or at the shm cursor region when
/// `addr == 0`) and record the region with its segment id.
pub fn process_vm_attach_shm(
    pid: u32,
    shmid: u32,
    frames: &[PhysAddr],
    addr: u64,
) -> MmResult<u64> {
    use crate::layout::USER_SHM_BASE_VA;

    let length = frames.len() as u64 * PAGE_SIZE_4KB;
    with_process(pid, |p| {
        let base = if addr != 0 {
            if addr % PAGE_SIZE_4KB != 0 {
                return Err(MmError::InvalidArgument);
            }
            addr
        } else {
            // Deterministic per-segment placement keeps attaches stable
            // across fork.
            USER_SHM_BASE_VA + (shmid as u64) * 0x1000_0000
        };

        for (i, phys) in frames.iter().enumerate() {
            let vaddr = VirtAddr::new(base + i as u64 * PAGE_SIZE_4KB);
            if let Err(err) = p.space.map_page(vaddr, *phys, PageFlags::USER_RW | PageFlags::NX) {
                for j in 0..i {
                    p.space
                        .unmap_page(VirtAddr::new(base + j as u64 * PAGE_SIZE_4KB));
                }
                return Err(err);
            }
            crate::frame_alloc::frame_incref(*phys);
        }

        if let Err(err) = record_region(p, base, length, shmid) {
            unmap_range(&p.space, base, base + length);
            return Err(err);
        }
        Ok(base)
    })
    .unwrap_or(Err(MmError::NoSuchProcess))
}

/// Detach the shm region at `addr`; returns the segment id that was there.
pub fn process_vm_detach_shm(pid: u32, addr: u64) -> MmResult<u32> {
    with_process(pid, |p| {
        let Some(idx) = p
            .regions
            .iter()
            .position(|r| r.in_use && r.base == addr && r.shmid != INVALID_SHM_ID)
        else {
            return Err(MmError::NotMapped);
        };
        let region = p.regions[idx];
        unmap_range(&p.space, region.base, region.base + region.length);
        p.regions[idx] = MmapRegion::empty();
        Ok(region.shmid)
    })
    .unwrap_or(Err(MmError::NoSuchProcess))
}

/// Visit each recorded region (for `/proc/<pid>/maps` and shm fork/exit).
pub fn process_vm_for_each_region(pid: u32, mut f: impl FnMut(&MmapRegion)) {
    let _ = with_process(pid, |p| {
        for region in p.regions.iter() {
            if region.in_use {
                f(region);
            }
        }
    });
}

// =============================================================================
// exec support
// =============================================================================

/// Throw away every user mapping (exec): frames lose one reference, the
/// region table and heap reset, and a fresh stack plus vDSO are mapped.
pub fn process_vm_reset_user(pid: u32) -> MmResult<()> {
    with_process(pid, |p| {
        p.space.for_each_user_leaf(|_vaddr, entry| {
            crate::frame_alloc::frame_decref(entry.address());
            entry.clear();
        });
        tlb::shootdown_all();

        p.regions = [MmapRegion::empty(); MAX_MMAP_REGIONS];
        p.heap_start = USER_HEAP_START_VA;
        p.heap_break = USER_HEAP_START_VA;
        p.mmap_cursor = USER_MMAP_BASE_VA;

        let (low, high) = setup_user_stack(&p.space)?;
        p.stack_low = low;
        p.stack_high = high;
        map_vdso(&p.space);
        Ok(())
    })
    .unwrap_or(Err(MmError::NoSuchProcess))
}

/// Map zeroed user pages over `[start, end)` with `flags` (ELF loading).
pub fn process_vm_map_user_range(pid: u32, start: u64, end: u64, flags: PageFlags) -> MmResult<()> {
    if start % PAGE_SIZE_4KB != 0 || end <= start {
        return Err(MmError::InvalidArgument);
    }
    with_process(pid, |p| map_zeroed_range(&p.space, start, align_up_u64(end, PAGE_SIZE_4KB), flags))
        .unwrap_or(Err(MmError::NoSuchProcess))
}

/// Move the heap base after exec loads the image (heap starts above the
/// highest loaded segment).
pub fn process_vm_set_heap_start(pid: u32, start: u64) {
    let _ = with_process(pid, |p| {
        let aligned = align_up_u64(start.max(USER_HEAP_START_VA), PAGE_SIZE_4KB);
        p.heap_start = aligned;
        p.heap_break = aligned;
    });
}

// =============================================================================
// Fault entry
// =============================================================================

/// Resolve a user page fault. Returns true if it was a CoW write the
/// kernel satisfied; false means the fault is genuine (SIGSEGV territory).
pub fn process_vm_handle_fault(pid: u32, fault_addr: u64, error_code: u64) -> bool {
    let Some(space) = ({
        let result = with_process(pid, |p| {
            p.last_fault_addr = fault_addr;
            p.space
        });
        result
    }) else {
        return false;
    };

    if !cow::is_cow_fault(&space, fault_addr, error_code) {
        return false;
    }
    match cow::handle_cow_fault(&space, fault_addr) {
        Ok(()) => true,
        Err(err) => {
            klog_debug!("cow fault at 0x{:x} failed: {:?}", fault_addr, err);
            false
        }
    }
}
