//! ELF64 program loading for exec.
//!
//! Validates the header, maps each PT_LOAD segment into the target process
//! with permissions derived from the segment flags, copies the file bytes,
//! and leaves the trailing BSS zeroed (fresh frames come zeroed from the
//! allocator). Writing goes through the direct map, so the target address
//! space does not need to be active.

use ferrite_abi::addr::VirtAddr;
use ferrite_lib::klog_debug;

use crate::error::{MmError, MmResult};
use crate::hhdm::PhysAddrHhdm;
use crate::layout::{PAGE_SIZE_4KB, USER_SPACE_END_VA, USER_SPACE_START_VA};
use crate::paging::{AddressSpace, PageFlags};
use crate::process_vm::{process_vm_map_user_range, process_vm_space};

const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const ET_EXEC: u16 = 2;
const EM_X86_64: u16 = 62;
const PT_LOAD: u32 = 1;

const PF_X: u32 = 1;
const PF_W: u32 = 2;

pub const MAX_LOAD_SEGMENTS: usize = 8;

#[repr(C)]
#[derive(Clone, Copy)]
struct Elf64Ehdr {
    e_ident: [u8; 16],
    e_type: u16,
    e_machine: u16,
    e_version: u32,
    e_entry: u64,
    e_phoff: u64,
    e_shoff: u64,
    e_flags: u32,
    e_ehsize: u16,
    e_phentsize: u16,
    e_phnum: u16,
    e_shentsize: u16,
    e_shnum: u16,
    e_shstrndx: u16,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct Elf64Phdr {
    p_type: u32,
    p_flags: u32,
    p_offset: u64,
    p_vaddr: u64,
    p_paddr: u64,
    p_filesz: u64,
    p_memsz: u64,
    p_align: u64,
}

pub struct LoadedImage {
    pub entry: u64,
    /// One past the highest mapped byte; the heap starts above this.
    pub load_end: u64,
}

fn read_struct<T: Copy>(image: &[u8], offset: usize) -> Option<T> {
    let size = core::mem::size_of::<T>();
    if offset.checked_add(size)? > image.len() {
        return None;
    }
    // SAFETY: bounds checked above; T is a plain #[repr(C)] header type.
    Some(unsafe { core::ptr::read_unaligned(image.as_ptr().add(offset) as *const T) })
}

fn segment_flags(p_flags: u32) -> PageFlags {
    let mut flags = PageFlags::USER_RO;
    if p_flags & PF_W != 0 {
        flags |= PageFlags::WRITABLE;
    }
    if p_flags & PF_X == 0 {
        flags |= PageFlags::NX;
    }
    flags
}

/// Copy `bytes` into `space` at `vaddr`, page by page via the direct map.
/// Also used by exec to build the initial user stack.
pub fn write_to_space(space: &AddressSpace, vaddr: u64, bytes: &[u8]) -> MmResult<()> {
    let mut written = 0usize;
    while written < bytes.len() {
        let addr = vaddr + written as u64;
        let page_off = addr % PAGE_SIZE_4KB;
        let chunk = ((PAGE_SIZE_4KB - page_off) as usize).min(bytes.len() - written);

        let Some((phys, _)) = space.translate(VirtAddr::new(addr)) else {
            return Err(MmError::NotMapped);
        };
        let dst = phys.to_virt();
        unsafe {
            core::ptr::copy_nonoverlapping(
                bytes.as_ptr().add(written),
                dst.as_mut_ptr::<u8>(),
                chunk,
            );
        }
        written += chunk;
    }
    Ok(())
}

/// Validate `image` and load its PT_LOAD segments into `pid`'s user space.
pub fn load_elf(pid: u32, image: &[u8]) -> MmResult<LoadedImage> {
    let ehdr: Elf64Ehdr = read_struct(image, 0).ok_or(MmError::BadExecutable)?;

    if ehdr.e_ident[..4] != ELF_MAGIC
        || ehdr.e_ident[4] != ELFCLASS64
        || ehdr.e_ident[5] != ELFDATA2LSB
        || ehdr.e_type != ET_EXEC
        || ehdr.e_machine != EM_X86_64
        || ehdr.e_phnum == 0
    {
        return Err(MmError::BadExecutable);
    }
    if ehdr.e_phentsize as usize != core::mem::size_of::<Elf64Phdr>() {
        return Err(MmError::BadExecutable);
    }
    if ehdr.e_phnum as usize > MAX_LOAD_SEGMENTS * 2 {
        return Err(MmError::BadExecutable);
    }

    let space = process_vm_space(pid).ok_or(MmError::NoSuchProcess)?;
    let mut load_end = 0u64;
    let mut loaded = 0usize;

    for i in 0..ehdr.e_phnum as usize {
        let off = ehdr.e_phoff as usize + i * core::mem::size_of::<Elf64Phdr>();
        let phdr: Elf64Phdr = read_struct(image, off).ok_or(MmError::BadExecutable)?;
        if phdr.p_type != PT_LOAD {
            continue;
        }
        if loaded >= MAX_LOAD_SEGMENTS {
            return Err(MmError::BadExecutable);
        }
        if phdr.p_memsz == 0 || phdr.p_filesz > phdr.p_memsz {
            return Err(MmError::BadExecutable);
        }
        let start = phdr.p_vaddr;
        let end = start
            .checked_add(phdr.p_memsz)
            .ok_or(MmError::BadExecutable)?;
        if start < USER_SPACE_START_VA || end > USER_SPACE_END_VA {
            return Err(MmError::BadExecutable);
        }
        let file_end = (phdr.p_offset)
            .checked_add(phdr.p_filesz)
            .ok_or(MmError::BadExecutable)?;
        if file_end as usize > image.len() {
            return Err(MmError::BadExecutable);
        }

        let page_start = start & !(PAGE_SIZE_4KB - 1);
        // Segments are loaded writable so the file bytes can land, then
        // tightened to their final permissions.
        process_vm_map_user_range(pid, page_start, end, PageFlags::USER_RW | PageFlags::NX)?;

        let bytes = &image[phdr.p_offset as usize..file_end as usize];
        write_to_space(&space, start, bytes)?;

        let final_flags = segment_flags(phdr.p_flags);
        let mut page = page_start;
        while page < end {
            space.set_flags(VirtAddr::new(page), final_flags)?;
            page += PAGE_SIZE_4KB;
        }

        load_end = load_end.max(end);
        loaded += 1;
    }

    if loaded == 0 {
        return Err(MmError::BadExecutable);
    }

    klog_debug!(
        "load_elf: pid {} entry 0x{:x} load_end 0x{:x}",
        pid,
        ehdr.e_entry,
        load_end
    );
    Ok(LoadedImage {
        entry: ehdr.e_entry,
        load_end,
    })
}
