//! Higher-half direct map: the boot-time linear mapping of all physical
//! memory at a fixed kernel-half offset. Page tables and frame contents are
//! touched through it.

use core::sync::atomic::{AtomicU64, Ordering};

use ferrite_abi::addr::{PhysAddr, VirtAddr};

use crate::layout::KERNEL_VIRTUAL_BASE;

static HHDM_OFFSET: AtomicU64 = AtomicU64::new(0);

/// Record the direct-map offset delivered in the boot handoff.
pub fn hhdm_init(offset: u64) {
    HHDM_OFFSET.store(offset, Ordering::Release);
}

#[inline]
pub fn hhdm_offset() -> u64 {
    HHDM_OFFSET.load(Ordering::Acquire)
}

pub trait PhysAddrHhdm {
    /// Translate through the direct map. Panics if the HHDM is not set up.
    fn to_virt(self) -> VirtAddr;
    fn to_virt_checked(self) -> Option<VirtAddr>;
}

impl PhysAddrHhdm for PhysAddr {
    #[inline]
    fn to_virt(self) -> VirtAddr {
        self.to_virt_checked()
            .expect("HHDM not initialized or physical address out of range")
    }

    #[inline]
    fn to_virt_checked(self) -> Option<VirtAddr> {
        let offset = hhdm_offset();
        if offset == 0 || self.is_null() {
            return None;
        }
        let virt = offset.checked_add(self.as_u64())?;
        if virt < KERNEL_VIRTUAL_BASE {
            return None;
        }
        Some(VirtAddr::new(virt))
    }
}

/// Inverse translation for pointers inside the direct map.
pub fn virt_to_phys_hhdm(virt: VirtAddr) -> Option<PhysAddr> {
    let offset = hhdm_offset();
    if offset == 0 || virt.as_u64() < offset {
        return None;
    }
    PhysAddr::try_new(virt.as_u64() - offset)
}
