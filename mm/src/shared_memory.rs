//! System V shared-memory segments.
//!
//! A segment is a key, a size, and a run of frame-allocated physical
//! pages. `shmget` creates or looks up by key, `shmat`/`shmdt` map and
//! unmap it in a process address space (bumping the attach count), and
//! `shmctl(IPC_RMID)` marks it for removal: the pages are returned to the
//! frame allocator once the attach count reaches zero AND the removal
//! flag is set.

use ferrite_abi::addr::PhysAddr;
use ferrite_abi::syscall::{IPC_CREAT, IPC_EXCL, IPC_PRIVATE, UserShmidDs};
use ferrite_lib::{IrqMutex, klog_debug};

use crate::error::{MmError, MmResult};
use crate::frame_alloc::{alloc_page_frame, free_page_frame};
use crate::layout::PAGE_SIZE_4KB;
use crate::process_vm::{
    INVALID_SHM_ID, process_vm_attach_shm, process_vm_detach_shm, process_vm_for_each_region,
};

pub const MAX_SHM_SEGMENTS: usize = 16;
pub const MAX_SHM_PAGES: usize = 64;

#[derive(Clone, Copy)]
struct ShmSegment {
    in_use: bool,
    key: u32,
    size: u64,
    page_count: u32,
    frames: [PhysAddr; MAX_SHM_PAGES],
    attach_count: u32,
    marked_for_removal: bool,
}

impl ShmSegment {
    const fn empty() -> Self {
        Self {
            in_use: false,
            key: 0,
            size: 0,
            page_count: 0,
            frames: [PhysAddr::NULL; MAX_SHM_PAGES],
            attach_count: 0,
            marked_for_removal: false,
        }
    }
}

static SEGMENTS: IrqMutex<[ShmSegment; MAX_SHM_SEGMENTS]> =
    IrqMutex::new([ShmSegment::empty(); MAX_SHM_SEGMENTS]);

fn release_segment(segment: &mut ShmSegment) {
    for frame in segment.frames[..segment.page_count as usize].iter() {
        if !frame.is_null() {
            free_page_frame(*frame);
        }
    }
    *segment = ShmSegment::empty();
}

/// Create or look up a segment by key. `IPC_PRIVATE` always creates.
pub fn shmget(key: u32, size: u64, flags: u32) -> MmResult<u32> {
    if size == 0 {
        return Err(MmError::InvalidArgument);
    }
    let page_count = size.div_ceil(PAGE_SIZE_4KB);
    if page_count as usize > MAX_SHM_PAGES {
        return Err(MmError::InvalidArgument);
    }

    let mut segments = SEGMENTS.lock();

    if key != IPC_PRIVATE {
        for (id, segment) in segments.iter().enumerate() {
            if segment.in_use && segment.key == key && !segment.marked_for_removal {
                if flags & IPC_CREAT != 0 && flags & IPC_EXCL != 0 {
                    return Err(MmError::SegmentExists);
                }
                if size > segment.size {
                    return Err(MmError::InvalidArgument);
                }
                return Ok(id as u32);
            }
        }
        if flags & IPC_CREAT == 0 {
            return Err(MmError::NoSuchSegment);
        }
    }

    let Some(id) = segments.iter().position(|s| !s.in_use) else {
        return Err(MmError::NoMemory);
    };

    let mut segment = ShmSegment {
        in_use: true,
        key,
        size,
        page_count: page_count as u32,
        frames: [PhysAddr::NULL; MAX_SHM_PAGES],
        attach_count: 0,
        marked_for_removal: false,
    };
    for i in 0..page_count as usize {
        let phys = alloc_page_frame();
        if phys.is_null() {
            segment.page_count = i as u32;
            release_segment(&mut segment);
            return Err(MmError::NoMemory);
        }
        segment.frames[i] = phys;
    }

    segments[id] = segment;
    klog_debug!("shmget: segment {} key {} ({} pages)", id, key, page_count);
    Ok(id as u32)
}

/// Attach a segment into `pid`'s address space at `addr` (0 = kernel
/// chooses). Returns the mapped base address.
pub fn shmat(pid: u32, shmid: u32, addr: u64) -> MmResult<u64> {
    let frames = {
        let mut segments = SEGMENTS.lock();
        let segment = segments
            .get_mut(shmid as usize)
            .filter(|s| s.in_use)
            .ok_or(MmError::NoSuchSegment)?;
        segment.attach_count += 1;
        let mut frames = [PhysAddr::NULL; MAX_SHM_PAGES];
        frames[..segment.page_count as usize]
            .copy_from_slice(&segment.frames[..segment.page_count as usize]);
        (frames, segment.page_count as usize)
    };

    match process_vm_attach_shm(pid, shmid, &frames.0[..frames.1], addr) {
        Ok(base) => Ok(base),
        Err(err) => {
            shm_drop_attachment(shmid);
            Err(err)
        }
    }
}

/// Detach whatever segment is mapped at `addr` in `pid`'s space.
pub fn shmdt(pid: u32, addr: u64) -> MmResult<()> {
    let shmid = process_vm_detach_shm(pid, addr)?;
    shm_drop_attachment(shmid);
    Ok(())
}

fn shm_drop_attachment(shmid: u32) {
    let mut segments = SEGMENTS.lock();
    if let Some(segment) = segments.get_mut(shmid as usize) {
        if segment.in_use {
            segment.attach_count = segment.attach_count.saturating_sub(1);
            if segment.attach_count == 0 && segment.marked_for_removal {
                release_segment(segment);
            }
        }
    }
}

/// Fork inherits every attachment of the parent.
pub fn shm_on_fork(child_pid: u32) {
    process_vm_for_each_region(child_pid, |region| {
        if region.shmid != INVALID_SHM_ID {
            let mut segments = SEGMENTS.lock();
            if let Some(segment) = segments.get_mut(region.shmid as usize) {
                if segment.in_use {
                    segment.attach_count += 1;
                }
            }
        }
    });
}

/// Exit detaches everything the process still has attached.
pub fn shm_on_exit(pid: u32) {
    let mut attached = [0u64; crate::layout::MAX_MMAP_REGIONS];
    let mut count = 0usize;
    process_vm_for_each_region(pid, |region| {
        if region.shmid != INVALID_SHM_ID && count < attached.len() {
            attached[count] = region.base;
            count += 1;
        }
    });
    for base in &attached[..count] {
        let _ = shmdt(pid, *base);
    }
}

pub fn shmctl_rmid(shmid: u32) -> MmResult<()> {
    let mut segments = SEGMENTS.lock();
    let segment = segments
        .get_mut(shmid as usize)
        .filter(|s| s.in_use)
        .ok_or(MmError::NoSuchSegment)?;
    segment.marked_for_removal = true;
    if segment.attach_count == 0 {
        release_segment(segment);
    }
    Ok(())
}

pub fn shmctl_stat(shmid: u32) -> MmResult<UserShmidDs> {
    let segments = SEGMENTS.lock();
    let segment = segments
        .get(shmid as usize)
        .filter(|s| s.in_use)
        .ok_or(MmError::NoSuchSegment)?;
    Ok(UserShmidDs {
        shm_key: segment.key,
        shm_segsz: segment.size,
        shm_npages: segment.page_count,
        shm_nattch: segment.attach_count,
    })
}
