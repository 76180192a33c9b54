//! In-kernel memory-management test suites. These run from the kernel test
//! task after the allocators are initialized.

use ferrite_abi::addr::VirtAddr;
use ferrite_lib::testing::TestResult;
use ferrite_lib::{define_test_suite, fail, pass, test_expect};

use crate::frame_alloc::{
    alloc_contiguous_frames, alloc_page_frame, frame_decref, frame_incref, frame_refcount,
    free_page_frame,
};
use crate::hhdm::PhysAddrHhdm;
use crate::kernel_heap::{kfree, kmalloc, kzalloc};
use crate::layout::PAGE_SIZE_4KB;
use crate::paging::{AddressSpace, PageFlags};
use crate::user_ptr::{UserBytes, UserPtrError, UserVirtAddr};

// =============================================================================
// Frame allocator
// =============================================================================

fn test_frame_alloc_refcount_lifecycle() -> TestResult {
    let frame = alloc_page_frame();
    test_expect!(!frame.is_null(), "allocation failed");
    test_expect!(frame_refcount(frame) == 1);

    test_expect!(frame_incref(frame) == 2);
    test_expect!(frame_decref(frame) == 1);

    free_page_frame(frame);
    test_expect!(frame_refcount(frame) == 0);
    pass!()
}

fn test_frame_alloc_returns_zeroed() -> TestResult {
    let frame = alloc_page_frame();
    test_expect!(!frame.is_null());
    let virt = frame.to_virt();
    let bytes = unsafe {
        core::slice::from_raw_parts(virt.as_ptr::<u8>(), PAGE_SIZE_4KB as usize)
    };
    let dirty = bytes.iter().any(|&b| b != 0);
    free_page_frame(frame);
    test_expect!(!dirty, "fresh frame was not zeroed");
    pass!()
}

fn test_frame_alloc_contiguous_run() -> TestResult {
    let base = alloc_contiguous_frames(4);
    test_expect!(!base.is_null(), "contiguous allocation failed");
    for i in 0..4u64 {
        test_expect!(frame_refcount(base.offset(i * PAGE_SIZE_4KB)) == 1);
    }
    for i in 0..4u64 {
        free_page_frame(base.offset(i * PAGE_SIZE_4KB));
    }
    pass!()
}

fn test_frame_shared_until_last_decref() -> TestResult {
    let frame = alloc_page_frame();
    test_expect!(!frame.is_null());
    frame_incref(frame);
    // First free only drops one of the two references.
    free_page_frame(frame);
    test_expect!(frame_refcount(frame) == 1);
    free_page_frame(frame);
    test_expect!(frame_refcount(frame) == 0);
    pass!()
}

// =============================================================================
// Kernel heap
// =============================================================================

fn test_heap_alloc_write_free() -> TestResult {
    let ptr = kmalloc(100);
    test_expect!(!ptr.is_null());
    unsafe {
        core::ptr::write_bytes(ptr as *mut u8, 0xA5, 100);
        test_expect!(*(ptr as *const u8) == 0xA5);
    }
    kfree(ptr);
    pass!()
}

fn test_heap_kzalloc_zeroes() -> TestResult {
    let ptr = kzalloc(256);
    test_expect!(!ptr.is_null());
    let bytes = unsafe { core::slice::from_raw_parts(ptr as *const u8, 256) };
    let dirty = bytes.iter().any(|&b| b != 0);
    kfree(ptr);
    test_expect!(!dirty);
    pass!()
}

fn test_heap_coalescing_reuses_space() -> TestResult {
    // Free both halves of a split; the coalesced block must satisfy an
    // allocation bigger than either half.
    let a = kmalloc(512);
    let b = kmalloc(512);
    test_expect!(!a.is_null() && !b.is_null());
    kfree(a);
    kfree(b);
    let big = kmalloc(900);
    test_expect!(!big.is_null(), "coalesced block not found");
    kfree(big);
    pass!()
}

fn test_heap_alignment() -> TestResult {
    for size in [1usize, 7, 24, 100, 4096] {
        let ptr = kmalloc(size);
        test_expect!(!ptr.is_null());
        test_expect!((ptr as usize) % 8 == 0, "allocation not 8-byte aligned");
        kfree(ptr);
    }
    pass!()
}

fn test_heap_zero_and_huge_rejected() -> TestResult {
    test_expect!(kmalloc(0).is_null());
    test_expect!(kmalloc(usize::MAX / 2).is_null());
    pass!()
}

// =============================================================================
// Address spaces and CoW
// =============================================================================

fn test_address_space_map_translate_unmap() -> TestResult {
    let Ok(space) = AddressSpace::clone_kernel() else {
        return fail!("clone_kernel failed");
    };
    let frame = alloc_page_frame();
    test_expect!(!frame.is_null());
    let vaddr = VirtAddr::new(0x50_0000);

    test_expect!(space.map_page(vaddr, frame, PageFlags::USER_RW).is_ok());
    match space.translate(vaddr) {
        Some((phys, flags)) => {
            test_expect!(phys.page_base() == frame);
            test_expect!(flags.contains(PageFlags::USER));
        }
        None => return fail!("translate failed after map"),
    }

    // Double map of the same slot must be refused.
    test_expect!(space.map_page(vaddr, frame, PageFlags::USER_RW).is_err());

    test_expect!(space.unmap_page(vaddr) == Some(frame));
    test_expect!(space.translate(vaddr).is_none());

    free_page_frame(frame);
    space.destroy();
    pass!()
}

fn test_cow_clone_shares_then_splits() -> TestResult {
    let Ok(parent) = AddressSpace::clone_kernel() else {
        return fail!("clone_kernel failed");
    };
    let frame = alloc_page_frame();
    test_expect!(!frame.is_null());
    let vaddr = VirtAddr::new(0x60_0000);
    test_expect!(parent.map_page(vaddr, frame, PageFlags::USER_RW).is_ok());

    // Write "A" through the direct map.
    unsafe {
        *frame.to_virt().as_mut_ptr::<u8>() = b'A';
    }

    let Ok(child) = parent.clone_user_cow() else {
        parent.destroy();
        return fail!("clone_user_cow failed");
    };

    // Both sides now share the frame read-only with the CoW marker.
    test_expect!(frame_refcount(frame) == 2);
    test_expect!(parent.is_cow(vaddr));
    test_expect!(child.is_cow(vaddr));
    test_expect!(!parent.is_user_accessible(vaddr, true));

    // Child write faults; resolution gives it a private copy.
    test_expect!(crate::cow::handle_cow_fault(&child, vaddr.as_u64()).is_ok());
    let (child_phys, child_flags) = match child.translate(vaddr) {
        Some(v) => v,
        None => return fail!("child unmapped after cow"),
    };
    test_expect!(child_phys.page_base() != frame, "child still shares frame");
    test_expect!(child_flags.contains(PageFlags::WRITABLE));
    test_expect!(!child_flags.contains(PageFlags::COW));

    // Old frame is back to a single owner; the copy carried the data.
    test_expect!(frame_refcount(frame) == 1);
    test_expect!(frame_refcount(child_phys.page_base()) == 1);
    unsafe {
        test_expect!(*child_phys.page_base().to_virt().as_ptr::<u8>() == b'A');
    }

    // Parent write fault with refcount 1 flips the page writable in place.
    test_expect!(crate::cow::handle_cow_fault(&parent, vaddr.as_u64()).is_ok());
    match parent.translate(vaddr) {
        Some((phys, flags)) => {
            test_expect!(phys.page_base() == frame);
            test_expect!(flags.contains(PageFlags::WRITABLE));
        }
        None => return fail!("parent unmapped after cow"),
    }

    child.destroy();
    parent.destroy();
    pass!()
}

fn test_cow_clone_preserves_contents() -> TestResult {
    let Ok(parent) = AddressSpace::clone_kernel() else {
        return fail!("clone_kernel failed");
    };
    let vaddr = VirtAddr::new(0x70_0000);
    let frame = alloc_page_frame();
    test_expect!(!frame.is_null());
    test_expect!(parent.map_page(vaddr, frame, PageFlags::USER_RW).is_ok());
    unsafe {
        let p = frame.to_virt().as_mut_ptr::<u8>();
        for i in 0..64 {
            *p.add(i) = i as u8;
        }
    }

    let Ok(child) = parent.clone_user_cow() else {
        parent.destroy();
        return fail!("clone failed");
    };

    // The clone reads the same bytes through its own mapping.
    let (child_phys, _) = match child.translate(vaddr) {
        Some(v) => v,
        None => return fail!("child missing mapping"),
    };
    let same = unsafe {
        let a = frame.to_virt().as_ptr::<u8>();
        let b = child_phys.page_base().to_virt().as_ptr::<u8>();
        (0..64).all(|i| *a.add(i) == *b.add(i))
    };
    test_expect!(same, "clone sees different bytes");

    child.destroy();
    parent.destroy();
    pass!()
}

// =============================================================================
// User pointer validation
// =============================================================================

fn test_user_ptr_rejects_kernel_and_null() -> TestResult {
    test_expect!(UserVirtAddr::try_new(0, 8) == Err(UserPtrError::Null));
    test_expect!(
        UserVirtAddr::try_new(0xFFFF_8000_0000_0000, 8) == Err(UserPtrError::NonCanonical)
            || UserVirtAddr::try_new(0xFFFF_8000_0000_0000, 8) == Err(UserPtrError::OutOfUserRange)
    );
    test_expect!(UserVirtAddr::try_new(0x1000, 8) == Err(UserPtrError::OutOfUserRange));
    pass!()
}

fn test_user_ptr_rejects_wrapping_range() -> TestResult {
    let near_top = crate::layout::USER_SPACE_END_VA - 4;
    test_expect!(UserVirtAddr::try_new(near_top, 64).is_err());
    test_expect!(UserBytes::try_new(0x40_0000, usize::MAX).is_err());
    pass!()
}

fn test_user_ptr_accepts_valid_range() -> TestResult {
    test_expect!(UserVirtAddr::try_new(0x40_0000, 4096).is_ok());
    test_expect!(UserBytes::try_new(0x40_0000, 16).is_ok());
    pass!()
}

define_test_suite!(
    mm_frame_alloc,
    [
        test_frame_alloc_refcount_lifecycle,
        test_frame_alloc_returns_zeroed,
        test_frame_alloc_contiguous_run,
        test_frame_shared_until_last_decref,
    ]
);

define_test_suite!(
    mm_kernel_heap,
    [
        test_heap_alloc_write_free,
        test_heap_kzalloc_zeroes,
        test_heap_coalescing_reuses_space,
        test_heap_alignment,
        test_heap_zero_and_huge_rejected,
    ]
);

define_test_suite!(
    mm_address_space,
    [
        test_address_space_map_translate_unmap,
        test_cow_clone_shares_then_splits,
        test_cow_clone_preserves_contents,
    ]
);

define_test_suite!(
    mm_user_ptr,
    [
        test_user_ptr_rejects_kernel_and_null,
        test_user_ptr_rejects_wrapping_range,
        test_user_ptr_accepts_valid_range,
    ]
);
