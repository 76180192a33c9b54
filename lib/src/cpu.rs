//! Thin wrappers over the privileged instructions the core needs.
//!
//! Everything here is x86_64; the rest of the kernel goes through these
//! helpers (and the `x86_64` crate) rather than open-coding asm.

use core::arch::asm;

use ferrite_abi::addr::PhysAddr;
use x86_64::instructions::interrupts;

/// Save RFLAGS and disable interrupts. Pair with [`restore_flags`].
#[inline(always)]
pub fn save_flags_cli() -> u64 {
    let flags: u64;
    unsafe {
        asm!(
            "pushfq",
            "pop {flags}",
            "cli",
            flags = out(reg) flags,
            options(nomem, preserves_flags)
        );
    }
    flags
}

/// Restore a flags image saved by [`save_flags_cli`]. Re-enables interrupts
/// only if they were enabled at save time.
#[inline(always)]
pub fn restore_flags(flags: u64) {
    const IF_BIT: u64 = 1 << 9;
    if flags & IF_BIT != 0 {
        interrupts::enable();
    }
}

#[inline(always)]
pub fn interrupts_enabled() -> bool {
    interrupts::are_enabled()
}

#[inline(always)]
pub fn pause() {
    core::hint::spin_loop();
}

/// Halt until the next interrupt, interrupts enabled atomically around it.
#[inline(always)]
pub fn idle_halt() {
    unsafe {
        asm!("sti", "hlt", "cli", options(nomem, nostack));
    }
}

pub fn halt_loop() -> ! {
    loop {
        unsafe {
            asm!("cli", "hlt", options(nomem, nostack, preserves_flags));
        }
    }
}

#[inline(always)]
pub fn read_cr3() -> u64 {
    let value: u64;
    unsafe {
        asm!("mov {}, cr3", out(reg) value, options(nomem, nostack, preserves_flags));
    }
    value
}

/// # Safety
/// `pml4_phys` must be the physical address of a valid top-level page table
/// whose kernel half maps the currently executing code.
#[inline(always)]
pub unsafe fn write_cr3(pml4_phys: PhysAddr) {
    asm!("mov cr3, {}", in(reg) pml4_phys.as_u64(), options(nostack, preserves_flags));
}

#[inline(always)]
pub fn read_cr2() -> u64 {
    let value: u64;
    unsafe {
        asm!("mov {}, cr2", out(reg) value, options(nomem, nostack, preserves_flags));
    }
    value
}

/// Invalidate one TLB entry on the current CPU.
#[inline(always)]
pub fn invlpg(vaddr: u64) {
    x86_64::instructions::tlb::flush(x86_64::VirtAddr::new(vaddr));
}

/// Full TLB flush by CR3 reload (global pages survive).
#[inline(always)]
pub fn flush_tlb_all() {
    unsafe {
        let cr3 = read_cr3();
        asm!("mov cr3, {}", in(reg) cr3, options(nostack, preserves_flags));
    }
}

/// Timestamp counter, used for coarse elapsed-time measurement in tests.
#[inline(always)]
pub fn rdtsc() -> u64 {
    let lo: u32;
    let hi: u32;
    unsafe {
        asm!(
            "rdtsc",
            out("eax") lo,
            out("edx") hi,
            options(nomem, nostack, preserves_flags)
        );
    }
    ((hi as u64) << 32) | (lo as u64)
}
