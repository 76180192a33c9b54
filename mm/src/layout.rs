//! Virtual address space layout and sizing constants.
//!
//! ```text
//! user:   0x0000_0000_0040_0000 .. 0x0000_7FFF_FFFF_F000
//!   code     0x0000_0000_0040_0000 ..
//!   heap     0x0000_0000_1000_0000 .. (grows by brk)
//!   mmap     0x0000_2000_0000_0000 .. (anonymous mappings)
//!   shm      0x0000_3000_0000_0000 .. (shmat attachments)
//!   vdso     0x0000_7FFF_FE00_0000    (one read-only page)
//!   stack  ..0x0000_7FFF_FF00_0000    (grows down)
//! kernel: 0xFFFF_8000_0000_0000 ..    (HHDM and image)
//!   heap     0xFFFF_C000_0000_0000 .. +256 MiB
//! ```

pub const PAGE_SIZE_4KB: u64 = 0x1000;

pub const MAX_PROCESSES: usize = 32;

pub const KERNEL_VIRTUAL_BASE: u64 = 0xFFFF_8000_0000_0000;

pub const KERNEL_HEAP_START: u64 = 0xFFFF_C000_0000_0000;
pub const KERNEL_HEAP_SIZE: u64 = 256 * 1024 * 1024;
pub const KERNEL_HEAP_END: u64 = KERNEL_HEAP_START + KERNEL_HEAP_SIZE;

pub const USER_SPACE_START_VA: u64 = 0x0000_0000_0040_0000;
pub const USER_SPACE_END_VA: u64 = 0x0000_7FFF_FFFF_F000;

pub const PROCESS_CODE_START_VA: u64 = USER_SPACE_START_VA;

pub const USER_HEAP_START_VA: u64 = 0x0000_0000_1000_0000;

pub const USER_MMAP_BASE_VA: u64 = 0x0000_2000_0000_0000;
pub const USER_SHM_BASE_VA: u64 = 0x0000_3000_0000_0000;

pub const USER_VDSO_VA: u64 = 0x0000_7FFF_FE00_0000;

pub const USER_STACK_TOP_VA: u64 = 0x0000_7FFF_FF00_0000;
pub const USER_STACK_PAGES: u64 = 16;
pub const USER_STACK_SIZE: u64 = USER_STACK_PAGES * PAGE_SIZE_4KB;

/// Per-process cap on recorded mmap/shm regions.
pub const MAX_MMAP_REGIONS: usize = 16;
