//! Copy-on-write fault resolution.

use core::ptr;

use ferrite_abi::addr::VirtAddr;

use crate::error::{MmError, MmResult};
use crate::frame_alloc::{alloc_page_frame, frame_decref, frame_refcount, free_page_frame};
use crate::hhdm::PhysAddrHhdm;
use crate::layout::PAGE_SIZE_4KB;
use crate::paging::{AddressSpace, PageFlags};
use crate::tlb;

/// Classify a page fault: a write to a present page carrying the COW
/// marker is ours to resolve.
pub fn is_cow_fault(space: &AddressSpace, fault_addr: u64, error_code: u64) -> bool {
    let is_present = error_code & 0x01 != 0;
    let is_write = error_code & 0x02 != 0;
    if !is_present || !is_write {
        return false;
    }
    let Some(vaddr) = VirtAddr::try_new(fault_addr) else {
        return false;
    };
    space.is_cow(vaddr)
}

/// Resolve a CoW write fault at `fault_addr`.
///
/// Sole owner: the page just becomes writable again. Shared: allocate a
/// fresh frame, copy, remap this space at the new frame, and drop one
/// reference on the old one. May block for frame allocation.
pub fn handle_cow_fault(space: &AddressSpace, fault_addr: u64) -> MmResult<()> {
    let Some(vaddr) = VirtAddr::try_new(fault_addr) else {
        return Err(MmError::InvalidAddress);
    };
    let page = vaddr.page_base();

    let Some((phys, flags)) = space.translate(page) else {
        return Err(MmError::NotMapped);
    };
    if !flags.contains(PageFlags::COW) {
        return Err(MmError::NotCowPage);
    }

    let mut resolved = flags;
    resolved.remove(PageFlags::COW);
    resolved.insert(PageFlags::WRITABLE);

    let old_phys = phys.page_base();
    if frame_refcount(old_phys) <= 1 {
        space.set_flags(page, resolved)?;
        return Ok(());
    }

    let new_phys = alloc_page_frame();
    if new_phys.is_null() {
        return Err(MmError::NoMemory);
    }

    let src = old_phys.to_virt();
    let dst = new_phys.to_virt();
    unsafe {
        ptr::copy_nonoverlapping(
            src.as_ptr::<u8>(),
            dst.as_mut_ptr::<u8>(),
            PAGE_SIZE_4KB as usize,
        );
    }

    if let Err(err) = space.remap_page(page, new_phys, resolved) {
        free_page_frame(new_phys);
        return Err(err);
    }
    tlb::flush_page(page);
    frame_decref(old_phys);
    Ok(())
}
