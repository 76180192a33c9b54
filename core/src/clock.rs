//! Tick clock and the shared vDSO page.
//!
//! The platform timer handler drives [`clock_tick`] at a fixed rate. The
//! monotonic clock is `ticks * tick_period`; the realtime clock adds a
//! boot-time wall offset. One read-only page holding `{tick_count,
//! tick_hz}` is mapped into every user address space so userland can
//! answer `clock_gettime(MONOTONIC)` without a syscall.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use ferrite_abi::syscall::{NSEC_PER_SEC, UserTimespec, VdsoPage};
use ferrite_lib::klog_info;
use ferrite_mm::frame_alloc::alloc_page_frame;
use ferrite_mm::hhdm::PhysAddrHhdm;
use ferrite_mm::process_vm::register_vdso_frame;

/// Default platform timer rate when the driver does not say otherwise.
pub const DEFAULT_TICK_HZ: u32 = 100;

static TICKS: AtomicU64 = AtomicU64::new(0);
static TICK_HZ: AtomicU32 = AtomicU32::new(DEFAULT_TICK_HZ);
/// Wall-clock seconds at boot, from the RTC via the bring-up.
static BOOT_WALL_SECONDS: AtomicU64 = AtomicU64::new(0);

static VDSO_VIRT: AtomicU64 = AtomicU64::new(0);

pub fn clock_init(tick_hz: u32, boot_wall_seconds: u64) {
    if tick_hz != 0 {
        TICK_HZ.store(tick_hz, Ordering::Release);
    }
    BOOT_WALL_SECONDS.store(boot_wall_seconds, Ordering::Release);

    // The vDSO page: one frame, published to process_vm so every address
    // space created from here on maps it read-only.
    let frame = alloc_page_frame();
    if frame.is_null() {
        klog_info!("clock: no frame for the vDSO page");
        return;
    }
    let virt = frame.to_virt();
    unsafe {
        let page = virt.as_mut_ptr::<VdsoPage>();
        (*page).tick_count = 0;
        (*page).tick_hz = TICK_HZ.load(Ordering::Acquire);
        (*page)._reserved = 0;
    }
    VDSO_VIRT.store(virt.as_u64(), Ordering::Release);
    register_vdso_frame(frame);
    klog_info!("clock: {} Hz, vDSO page ready", TICK_HZ.load(Ordering::Acquire));
}

/// One timer period elapsed. Called from the timer interrupt.
pub fn clock_tick() -> u64 {
    let now = TICKS.fetch_add(1, Ordering::AcqRel) + 1;
    let vdso = VDSO_VIRT.load(Ordering::Acquire);
    if vdso != 0 {
        unsafe {
            (*(vdso as *mut VdsoPage)).tick_count = now;
        }
    }
    now
}

#[inline]
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Acquire)
}

#[inline]
pub fn tick_hz() -> u32 {
    TICK_HZ.load(Ordering::Acquire)
}

pub fn uptime_ms() -> u64 {
    let hz = tick_hz() as u64;
    if hz == 0 {
        return 0;
    }
    ticks().saturating_mul(1000) / hz
}

pub fn ms_to_ticks(ms: u64) -> u64 {
    let hz = tick_hz() as u64;
    (ms.saturating_mul(hz).saturating_add(999) / 1000).max(1)
}

pub fn monotonic_timespec() -> UserTimespec {
    let hz = tick_hz() as u64;
    let t = ticks();
    if hz == 0 {
        return UserTimespec::default();
    }
    UserTimespec {
        tv_sec: (t / hz) as i64,
        tv_nsec: ((t % hz) as i64) * (NSEC_PER_SEC / hz as i64),
    }
}

pub fn realtime_timespec() -> UserTimespec {
    let mut ts = monotonic_timespec();
    ts.tv_sec += BOOT_WALL_SECONDS.load(Ordering::Acquire) as i64;
    ts
}
