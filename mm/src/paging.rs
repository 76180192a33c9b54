//! Page tables and address spaces.
//!
//! The PD-array direct form: an [`AddressSpace`] owns its root table frame
//! and every intermediate table frame reachable under the user half. Leaf
//! frames are owned by the frame allocator and reference-counted. The
//! kernel half of every address space aliases the kernel root's tables, so
//! kernel mappings are visible everywhere without synchronisation.
//!
//! All structural mutation of one address space is serialised by the owning
//! process's memory lock (`process_vm`); the kernel space has its own lock.

use core::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;
use ferrite_abi::addr::{PhysAddr, VirtAddr};
use ferrite_lib::klog_info;

use crate::error::{MmError, MmResult};
use crate::frame_alloc::{alloc_page_frame, frame_decref, frame_incref, free_page_frame};
use crate::hhdm::PhysAddrHhdm;
use crate::layout::{KERNEL_HEAP_START, KERNEL_VIRTUAL_BASE, PAGE_SIZE_4KB, USER_SPACE_END_VA};
use crate::tlb;

pub const PAGE_TABLE_ENTRIES: usize = 512;

bitflags! {
    /// Page-table entry flags. `COW` lives in an ignored/available bit and
    /// is an implementation-visible marker, never exposed to userland.
    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PageFlags: u64 {
        const PRESENT      = 1 << 0;
        const WRITABLE     = 1 << 1;
        const USER         = 1 << 2;
        const WRITETHROUGH = 1 << 3;
        const NOCACHE      = 1 << 4;
        const ACCESSED     = 1 << 5;
        const DIRTY        = 1 << 6;
        const HUGE         = 1 << 7;
        const GLOBAL       = 1 << 8;
        const COW          = 1 << 9;
        const NX           = 1 << 63;
    }
}

impl PageFlags {
    pub const KERNEL_RW: PageFlags = PageFlags::PRESENT.union(PageFlags::WRITABLE);
    pub const USER_RO: PageFlags = PageFlags::PRESENT.union(PageFlags::USER);
    pub const USER_RW: PageFlags = PageFlags::PRESENT
        .union(PageFlags::WRITABLE)
        .union(PageFlags::USER);
    pub const USER_RX: PageFlags = PageFlags::PRESENT.union(PageFlags::USER);
    pub const USER_RW_NX: PageFlags = Self::USER_RW.union(PageFlags::NX);
}

const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

#[derive(Clone, Copy, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageTableEntry(u64);

impl PageTableEntry {
    pub const EMPTY: Self = Self(0);

    #[inline]
    pub fn set(&mut self, phys: PhysAddr, flags: PageFlags) {
        self.0 = (phys.as_u64() & ADDR_MASK) | flags.bits();
    }

    #[inline]
    pub fn clear(&mut self) {
        self.0 = 0;
    }

    #[inline]
    pub fn address(self) -> PhysAddr {
        PhysAddr::new(self.0 & ADDR_MASK)
    }

    #[inline]
    pub fn flags(self) -> PageFlags {
        PageFlags::from_bits_truncate(self.0 & !ADDR_MASK)
    }

    #[inline]
    pub fn is_present(self) -> bool {
        self.0 & PageFlags::PRESENT.bits() != 0
    }

    #[inline]
    pub fn is_huge(self) -> bool {
        self.0 & PageFlags::HUGE.bits() != 0
    }
}

#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; PAGE_TABLE_ENTRIES],
}

impl PageTable {
    pub const EMPTY: Self = Self {
        entries: [PageTableEntry::EMPTY; PAGE_TABLE_ENTRIES],
    };

    #[inline]
    pub fn entry(&self, index: usize) -> &PageTableEntry {
        &self.entries[index]
    }

    #[inline]
    pub fn entry_mut(&mut self, index: usize) -> &mut PageTableEntry {
        &mut self.entries[index]
    }

    pub fn zero(&mut self) {
        self.entries = [PageTableEntry::EMPTY; PAGE_TABLE_ENTRIES];
    }
}

#[inline]
fn table_at(phys: PhysAddr) -> *mut PageTable {
    phys.to_virt().as_mut_ptr()
}

#[inline]
const fn l4_index(v: u64) -> usize {
    ((v >> 39) & 0x1FF) as usize
}
#[inline]
const fn l3_index(v: u64) -> usize {
    ((v >> 30) & 0x1FF) as usize
}
#[inline]
const fn l2_index(v: u64) -> usize {
    ((v >> 21) & 0x1FF) as usize
}
#[inline]
const fn l1_index(v: u64) -> usize {
    ((v >> 12) & 0x1FF) as usize
}

/// First kernel-half slot in a root table.
const KERNEL_L4_FIRST: usize = 256;

#[inline]
fn is_user_address(vaddr: VirtAddr) -> bool {
    vaddr.as_u64() < USER_SPACE_END_VA
}

/// One address space: a root table plus the bookkeeping to walk it.
///
/// Owns the frames of its page-table intermediate nodes under the user
/// half; does NOT own the leaf frames it maps.
#[derive(Clone, Copy)]
pub struct AddressSpace {
    root_phys: PhysAddr,
}

impl AddressSpace {
    pub const fn null() -> Self {
        Self {
            root_phys: PhysAddr::NULL,
        }
    }

    #[inline]
    pub fn root_phys(&self) -> PhysAddr {
        self.root_phys
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.root_phys.is_null()
    }

    fn root(&self) -> *mut PageTable {
        table_at(self.root_phys)
    }

    /// Descend one level, allocating the child table when absent.
    fn ensure_table(entry: &mut PageTableEntry, user: bool) -> MmResult<*mut PageTable> {
        if entry.is_present() {
            if entry.is_huge() {
                return Err(MmError::AlreadyMapped);
            }
            return Ok(table_at(entry.address()));
        }
        let phys = alloc_page_frame();
        if phys.is_null() {
            return Err(MmError::NoMemory);
        }
        let mut flags = PageFlags::PRESENT | PageFlags::WRITABLE;
        if user {
            flags |= PageFlags::USER;
        }
        entry.set(phys, flags);
        Ok(table_at(phys))
    }

    fn leaf_entry(&self, vaddr: VirtAddr) -> Option<*mut PageTableEntry> {
        let v = vaddr.as_u64();
        unsafe {
            let l4e = (*self.root()).entry(l4_index(v));
            if !l4e.is_present() {
                return None;
            }
            let l3 = table_at(l4e.address());
            let l3e = (*l3).entry(l3_index(v));
            if !l3e.is_present() || l3e.is_huge() {
                return None;
            }
            let l2 = table_at(l3e.address());
            let l2e = (*l2).entry(l2_index(v));
            if !l2e.is_present() || l2e.is_huge() {
                return None;
            }
            let l1 = table_at(l2e.address());
            Some((*l1).entry_mut(l1_index(v)) as *mut PageTableEntry)
        }
    }

    /// Map one 4 KiB page. Fails with `AlreadyMapped` if the slot is taken.
    pub fn map_page(&self, vaddr: VirtAddr, phys: PhysAddr, flags: PageFlags) -> MmResult<()> {
        if !vaddr.is_aligned(PAGE_SIZE_4KB) || !phys.is_aligned(PAGE_SIZE_4KB) {
            return Err(MmError::InvalidArgument);
        }
        let v = vaddr.as_u64();
        let user = flags.contains(PageFlags::USER) && is_user_address(vaddr);

        unsafe {
            let l4e = (*self.root()).entry_mut(l4_index(v));
            let l3 = Self::ensure_table(l4e, user)?;
            let l3e = (*l3).entry_mut(l3_index(v));
            let l2 = Self::ensure_table(l3e, user)?;
            let l2e = (*l2).entry_mut(l2_index(v));
            let l1 = Self::ensure_table(l2e, user)?;
            let l1e = (*l1).entry_mut(l1_index(v));
            if l1e.is_present() {
                return Err(MmError::AlreadyMapped);
            }
            l1e.set(phys, flags | PageFlags::PRESENT);
        }
        Ok(())
    }

    /// Replace an existing leaf mapping (CoW resolution path).
    pub fn remap_page(&self, vaddr: VirtAddr, phys: PhysAddr, flags: PageFlags) -> MmResult<()> {
        let Some(entry) = self.leaf_entry(vaddr.page_base()) else {
            return Err(MmError::NotMapped);
        };
        unsafe {
            (*entry).set(phys, flags | PageFlags::PRESENT);
        }
        tlb::flush_page(vaddr);
        Ok(())
    }

    /// Remove a leaf mapping and return the frame it pointed at.
    pub fn unmap_page(&self, vaddr: VirtAddr) -> Option<PhysAddr> {
        let entry = self.leaf_entry(vaddr.page_base())?;
        unsafe {
            if !(*entry).is_present() {
                return None;
            }
            let phys = (*entry).address();
            (*entry).clear();
            tlb::flush_page(vaddr);
            Some(phys)
        }
    }

    /// Rewrite the flags of an existing leaf, keeping the frame.
    pub fn set_flags(&self, vaddr: VirtAddr, flags: PageFlags) -> MmResult<()> {
        let Some(entry) = self.leaf_entry(vaddr.page_base()) else {
            return Err(MmError::NotMapped);
        };
        unsafe {
            if !(*entry).is_present() {
                return Err(MmError::NotMapped);
            }
            let phys = (*entry).address();
            (*entry).set(phys, flags | PageFlags::PRESENT);
        }
        tlb::flush_page(vaddr);
        Ok(())
    }

    /// Resolve a virtual address to its frame and flags. Understands the
    /// huge-page mappings the boot layer uses for the kernel half.
    pub fn translate(&self, vaddr: VirtAddr) -> Option<(PhysAddr, PageFlags)> {
        let v = vaddr.as_u64();
        unsafe {
            let l4e = (*self.root()).entry(l4_index(v));
            if !l4e.is_present() {
                return None;
            }
            let l3 = table_at(l4e.address());
            let l3e = (*l3).entry(l3_index(v));
            if !l3e.is_present() {
                return None;
            }
            if l3e.is_huge() {
                let base = l3e.address().as_u64();
                return Some((PhysAddr::new(base + (v & 0x3FFF_FFFF)), l3e.flags()));
            }
            let l2 = table_at(l3e.address());
            let l2e = (*l2).entry(l2_index(v));
            if !l2e.is_present() {
                return None;
            }
            if l2e.is_huge() {
                let base = l2e.address().as_u64();
                return Some((PhysAddr::new(base + (v & 0x1F_FFFF)), l2e.flags()));
            }
            let l1 = table_at(l2e.address());
            let l1e = (*l1).entry(l1_index(v));
            if !l1e.is_present() {
                return None;
            }
            Some((
                PhysAddr::new(l1e.address().as_u64() + vaddr.page_offset()),
                l1e.flags(),
            ))
        }
    }

    /// True if the page is mapped with USER (and WRITABLE when `write`).
    pub fn is_user_accessible(&self, vaddr: VirtAddr, write: bool) -> bool {
        match self.translate(vaddr) {
            Some((_, flags)) => {
                flags.contains(PageFlags::USER) && (!write || flags.contains(PageFlags::WRITABLE))
            }
            None => false,
        }
    }

    pub fn is_cow(&self, vaddr: VirtAddr) -> bool {
        matches!(self.translate(vaddr), Some((_, flags)) if flags.contains(PageFlags::COW))
    }

    /// Visit every present user-half 4 KiB leaf entry.
    ///
    /// The callback gets the page's virtual address and a mutable reference
    /// to its entry; it must not change the table structure.
    pub fn for_each_user_leaf(&self, mut f: impl FnMut(VirtAddr, &mut PageTableEntry)) {
        unsafe {
            for i4 in 0..KERNEL_L4_FIRST {
                let l4e = (*self.root()).entry(i4);
                if !l4e.is_present() {
                    continue;
                }
                let l3 = table_at(l4e.address());
                for i3 in 0..PAGE_TABLE_ENTRIES {
                    let l3e = (*l3).entry(i3);
                    if !l3e.is_present() || l3e.is_huge() {
                        continue;
                    }
                    let l2 = table_at(l3e.address());
                    for i2 in 0..PAGE_TABLE_ENTRIES {
                        let l2e = (*l2).entry(i2);
                        if !l2e.is_present() || l2e.is_huge() {
                            continue;
                        }
                        let l1 = table_at(l2e.address());
                        for i1 in 0..PAGE_TABLE_ENTRIES {
                            let l1e = (*l1).entry_mut(i1);
                            if !l1e.is_present() {
                                continue;
                            }
                            let v = ((i4 as u64) << 39)
                                | ((i3 as u64) << 30)
                                | ((i2 as u64) << 21)
                                | ((i1 as u64) << 12);
                            f(VirtAddr::new(v), l1e);
                        }
                    }
                }
            }
        }
    }

    /// Fresh address space whose kernel half aliases the kernel root.
    pub fn clone_kernel() -> MmResult<AddressSpace> {
        let root_phys = alloc_page_frame();
        if root_phys.is_null() {
            return Err(MmError::NoMemory);
        }
        let kernel = kernel_space();
        unsafe {
            let src = table_at(kernel.root_phys);
            let dst = table_at(root_phys);
            for i in KERNEL_L4_FIRST..PAGE_TABLE_ENTRIES {
                *(*dst).entry_mut(i) = *(*src).entry(i);
            }
        }
        Ok(AddressSpace { root_phys })
    }

    /// Copy-on-write clone. Every writable user page in `self` loses its
    /// WRITABLE bit and gains the COW marker in **both** spaces; the frame
    /// gains one reference. Read-only pages are shared as-is.
    pub fn clone_user_cow(&self) -> MmResult<AddressSpace> {
        let clone = Self::clone_kernel()?;

        let mut failed = false;
        self.for_each_user_leaf(|vaddr, entry| {
            if failed {
                return;
            }
            let phys = entry.address();
            let mut flags = entry.flags();
            if flags.contains(PageFlags::WRITABLE) {
                flags.remove(PageFlags::WRITABLE);
                flags.insert(PageFlags::COW);
                entry.set(phys, flags);
            }
            if clone.map_page(vaddr, phys, flags).is_err() {
                failed = true;
                return;
            }
            frame_incref(phys);
        });

        // Source lost write permissions; every CPU that may hold its
        // translations gets invalidated.
        tlb::shootdown_all();

        if failed {
            clone.destroy();
            return Err(MmError::NoMemory);
        }
        Ok(clone)
    }

    /// Load this address space on the current CPU.
    pub fn activate(&self) {
        // SAFETY: the kernel half of every address space aliases the kernel
        // root tables, so the executing code stays mapped.
        unsafe {
            ferrite_lib::cpu::write_cr3(self.root_phys);
        }
    }

    /// Tear down: drop one reference on every mapped user frame, free the
    /// user-half intermediate tables, then the root. The kernel-half tables
    /// are shared and stay untouched.
    pub fn destroy(&self) {
        if self.is_null() {
            return;
        }
        if self.root_phys == kernel_space().root_phys {
            klog_info!("AddressSpace::destroy: refusing to destroy the kernel space");
            return;
        }

        unsafe {
            let root = self.root();
            for i4 in 0..KERNEL_L4_FIRST {
                let l4e = (*root).entry_mut(i4);
                if !l4e.is_present() {
                    continue;
                }
                let l3 = table_at(l4e.address());
                for i3 in 0..PAGE_TABLE_ENTRIES {
                    let l3e = (*l3).entry_mut(i3);
                    if !l3e.is_present() || l3e.is_huge() {
                        continue;
                    }
                    let l2 = table_at(l3e.address());
                    for i2 in 0..PAGE_TABLE_ENTRIES {
                        let l2e = (*l2).entry_mut(i2);
                        if !l2e.is_present() || l2e.is_huge() {
                            continue;
                        }
                        let l1 = table_at(l2e.address());
                        for i1 in 0..PAGE_TABLE_ENTRIES {
                            let l1e = (*l1).entry_mut(i1);
                            if l1e.is_present() {
                                frame_decref(l1e.address());
                                l1e.clear();
                            }
                        }
                        free_page_frame(l2e.address());
                        l2e.clear();
                    }
                    free_page_frame(l3e.address());
                    l3e.clear();
                }
                free_page_frame(l4e.address());
                l4e.clear();
            }
        }
        free_page_frame(self.root_phys);
    }
}

// =============================================================================
// Kernel address space
// =============================================================================

static KERNEL_ROOT: AtomicU64 = AtomicU64::new(0);

/// Adopt the identity address space delivered by the boot handoff as the
/// kernel space, and pre-create the root slot covering the kernel heap so
/// later heap growth is visible in every clone.
pub fn kernel_space_init(boot_root: PhysAddr) -> MmResult<()> {
    if boot_root.is_null() {
        return Err(MmError::InvalidArgument);
    }
    KERNEL_ROOT.store(boot_root.as_u64(), Ordering::Release);

    let space = kernel_space();
    unsafe {
        let root = table_at(space.root_phys);
        let slot = (*root).entry_mut(l4_index(KERNEL_HEAP_START));
        AddressSpace::ensure_table(slot, false)?;
    }
    debug_assert!(KERNEL_HEAP_START >= KERNEL_VIRTUAL_BASE);
    Ok(())
}

#[inline]
pub fn kernel_space() -> AddressSpace {
    AddressSpace {
        root_phys: PhysAddr::new(KERNEL_ROOT.load(Ordering::Acquire)),
    }
}

pub fn kernel_map_page(vaddr: VirtAddr, phys: PhysAddr, flags: PageFlags) -> MmResult<()> {
    kernel_space().map_page(vaddr, phys, flags)
}

pub fn kernel_unmap_page(vaddr: VirtAddr) -> Option<PhysAddr> {
    kernel_space().unmap_page(vaddr)
}

pub fn kernel_translate(vaddr: VirtAddr) -> Option<(PhysAddr, PageFlags)> {
    kernel_space().translate(vaddr)
}
