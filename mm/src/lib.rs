#![no_std]
#![allow(unsafe_op_in_unsafe_fn)]

pub mod cow;
pub mod elf;
pub mod error;
pub mod frame_alloc;
pub mod hhdm;
pub mod kernel_heap;
pub mod layout;
pub mod paging;
pub mod process_vm;
pub mod shared_memory;
pub mod tests;
pub mod tlb;
pub mod user_copy;
pub mod user_ptr;

use core::alloc::{GlobalAlloc, Layout};
use core::mem;
use core::ptr;
use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use ferrite_lib::{align_up, align_up_usize};

const EARLY_HEAP_SIZE: usize = 512 * 1024;

/// Early boot bump arena. Alignment 16 so collection types relying on
/// aligned allocations behave before the real heap exists.
#[repr(C, align(16))]
struct AlignedArena([u8; EARLY_HEAP_SIZE]);

static mut EARLY_HEAP: AlignedArena = AlignedArena([0; EARLY_HEAP_SIZE]);
static EARLY_NEXT: AtomicUsize = AtomicUsize::new(0);

const ALLOC_MODE_BUMP: u8 = 0;
const ALLOC_MODE_HEAP: u8 = 1;
static GLOBAL_ALLOC_MODE: AtomicU8 = AtomicU8::new(ALLOC_MODE_BUMP);

unsafe fn bump_alloc(layout: Layout) -> *mut u8 {
    let align = layout.align().max(8);
    let size = layout.size();
    let mut offset = EARLY_NEXT.load(Ordering::Relaxed);
    offset = align_up(offset, align);
    if offset + size > EARLY_HEAP_SIZE {
        return ptr::null_mut();
    }
    EARLY_NEXT.store(offset + size, Ordering::Relaxed);
    unsafe { (&raw mut EARLY_HEAP).cast::<u8>().add(offset) }
}

/// Global allocator: bump arena until the kernel heap is up, first-fit
/// heap afterwards. Over-aligned requests get a stashed base pointer just
/// below the returned address so dealloc can find the real block.
pub struct KernelAllocator;

unsafe impl GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if GLOBAL_ALLOC_MODE.load(Ordering::Acquire) == ALLOC_MODE_HEAP {
            let align = layout.align().max(8);
            let size = layout.size();
            if align <= 8 {
                return kernel_heap::kmalloc(size) as *mut u8;
            }

            let extra = align_up_usize(mem::size_of::<usize>(), 8);
            let total = size.saturating_add(align).saturating_add(extra);
            let raw = kernel_heap::kmalloc(total) as *mut u8;
            if raw.is_null() {
                return ptr::null_mut();
            }
            let base = raw as usize;
            let aligned = align_up_usize(base + extra, align);
            unsafe {
                *((aligned - mem::size_of::<usize>()) as *mut usize) = base;
            }
            return aligned as *mut u8;
        }

        unsafe { bump_alloc(layout) }
    }

    unsafe fn dealloc(&self, ptr_in: *mut u8, layout: Layout) {
        if ptr_in.is_null() {
            return;
        }
        if GLOBAL_ALLOC_MODE.load(Ordering::Acquire) != ALLOC_MODE_HEAP {
            // Bump arena never frees.
            return;
        }
        let align = layout.align().max(8);
        if align <= 8 {
            kernel_heap::kfree(ptr_in as *mut _);
            return;
        }
        let slot = (ptr_in as usize - mem::size_of::<usize>()) as *const usize;
        let base = unsafe { *slot } as *mut u8;
        if !base.is_null() {
            kernel_heap::kfree(base as *mut _);
        }
    }
}

/// Flip the global allocator over to the real kernel heap.
pub fn global_allocator_use_kernel_heap() {
    GLOBAL_ALLOC_MODE.store(ALLOC_MODE_HEAP, Ordering::Release);
}
