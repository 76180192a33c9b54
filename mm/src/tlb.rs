//! Translation-cache invalidation.
//!
//! Single-page flushes cover the local CPU; structural changes to a shared
//! address space are followed by a shootdown request to the other CPUs
//! through the reschedule IPI (the remote CPU reloads CR3 on its next
//! dispatch, which folds the invalidation into the context switch).

use ferrite_abi::addr::VirtAddr;
use ferrite_lib::{cpu, percpu};

/// Invalidate one page translation on the current CPU.
#[inline]
pub fn flush_page(vaddr: VirtAddr) {
    cpu::invlpg(vaddr.as_u64());
}

/// Invalidate all non-global translations on the current CPU.
#[inline]
pub fn flush_all() {
    cpu::flush_tlb_all();
}

/// Ask every other online CPU to refresh its translations.
pub fn shootdown_all() {
    flush_all();
    let self_cpu = percpu::get_current_cpu();
    for cpu_id in 0..percpu::get_cpu_count() {
        if cpu_id != self_cpu && percpu::is_cpu_online(cpu_id) {
            percpu::send_resched_ipi(cpu_id);
        }
    }
}
