//! Kernel entry: consume the boot handoff and bring the core up.
//!
//! The arch bring-up (boot stub, GDT/IDT, SMP and ACPI glue — outside
//! this tree) assembles a [`BootInfo`] and calls [`kernel_main`]. Init
//! order: logging → frame allocator → kernel heap → address spaces →
//! scheduler → VFS → hooks and `/proc` → clock → init process, then the
//! boot context degrades into the CPU 0 idle loop.

#![no_std]
#![no_main]

mod test_runner;

use core::panic::PanicInfo;

use ferrite_core::exec::ArgVec;
use ferrite_core::{clock, exec, hooks, platform, proc, sched};
use ferrite_lib::boot_info::BootInfo;
use ferrite_lib::cmdline::BootCommandLine;
use ferrite_lib::klog::KlogLevel;
use ferrite_lib::{klog_error, klog_info};
use ferrite_mm::KernelAllocator;

#[global_allocator]
static GLOBAL_ALLOCATOR: KernelAllocator = KernelAllocator;

fn platform_console_write(bytes: &[u8]) {
    ferrite_lib::serial::write_bytes(bytes);
}

fn platform_shutdown() -> ! {
    klog_info!("kernel: shutdown requested, halting");
    ferrite_lib::cpu::halt_loop();
}

fn register_fallback_platform() {
    platform::register_platform(platform::PlatformServices {
        timer_ticks: clock::ticks,
        timer_frequency: clock::tick_hz,
        timer_poll_delay_ms: |_ms| {
            // No calibrated delay before the timer driver registers.
        },
        console_write: platform_console_write,
        set_kernel_stack_top: |_top| {
            // The bring-up owns the TSS; it replaces this hook.
        },
        shutdown: platform_shutdown,
    });
}

fn apply_loglevel(cmdline: &BootCommandLine) {
    if cmdline.quiet {
        ferrite_lib::klog::klog_set_level(KlogLevel::Warn);
    }
    if let Some(level) = cmdline.loglevel() {
        ferrite_lib::klog::klog_set_level(KlogLevel::from_raw(level));
    }
}

/// Entry from the arch bring-up. The identity address space in
/// `boot_info` stays live; the core adopts it as the kernel space.
#[unsafe(no_mangle)]
pub extern "C" fn kernel_main(boot_info: &'static BootInfo) -> ! {
    ferrite_lib::serial::init();
    ferrite_lib::klog::klog_init(KlogLevel::Info);
    klog_info!("ferrite: booting");

    let cmdline = BootCommandLine::parse(boot_info.cmdline_bytes());
    apply_loglevel(&cmdline);
    proc::save_cmdline(boot_info.cmdline_bytes());

    // Memory: frames, then the kernel address space, then the heap over it.
    ferrite_mm::hhdm::hhdm_init(boot_info.hhdm_offset);
    ferrite_mm::frame_alloc::frame_alloc_init(boot_info);
    if ferrite_mm::paging::kernel_space_init(boot_info.boot_pml4).is_err() {
        panic!("cannot adopt the boot address space");
    }
    ferrite_mm::kernel_heap::init_kernel_heap();
    ferrite_mm::global_allocator_use_kernel_heap();

    register_fallback_platform();

    // Processes and time.
    sched::scheduler::init_scheduler();
    clock::clock_init(clock::DEFAULT_TICK_HZ, 0);

    // Filesystems.
    ferrite_fs::devfs::devfs_register_builtin();
    ferrite_fs::vfs::vfs_init_root();
    hooks::register_core_hooks();

    unpack_initrd(boot_info);

    #[cfg(feature = "builtin-tests")]
    test_runner::spawn_test_task();

    spawn_init_process(&cmdline);

    // The boot context becomes CPU 0's idle task.
    sched::scheduler::scheduler_start();
}

/// Hand the initrd to the root filesystem. The archive format parser is
/// driver territory; a missing or empty initrd just leaves /bin bare.
fn unpack_initrd(boot_info: &BootInfo) {
    if boot_info.initrd_start.is_null() {
        klog_info!("initrd: none");
        return;
    }
    let len = boot_info
        .initrd_end
        .as_u64()
        .saturating_sub(boot_info.initrd_start.as_u64());
    klog_info!(
        "initrd: {} KiB at {} (unpacked by the initrd driver)",
        len / 1024,
        boot_info.initrd_start
    );
}

fn spawn_init_process(cmdline: &BootCommandLine) {
    let mut argv = ArgVec::new();
    for arg in cmdline.init_argv() {
        if argv.push(arg).is_err() {
            break;
        }
    }
    if cmdline.single {
        let _ = argv.push(b"single");
    }
    let mut envp = ArgVec::new();
    for entry in cmdline.init_env() {
        if envp.push(entry).is_err() {
            break;
        }
    }

    match exec::spawn_init(cmdline.init_path(), argv, envp) {
        Ok(pid) => klog_info!("init: pid {} ({})", pid, PathDisplay(cmdline.init_path())),
        Err(err) => klog_error!(
            "init: cannot start {} (errno {})",
            PathDisplay(cmdline.init_path()),
            err
        ),
    }
}

/// Best-effort display wrapper for path bytes.
struct PathDisplay<'a>(&'a [u8]);

impl core::fmt::Display for PathDisplay<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        for &b in self.0 {
            let c = if b.is_ascii_graphic() || b == b' ' { b as char } else { '?' };
            write!(f, "{}", c)?;
        }
        Ok(())
    }
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    ferrite_lib::serial::init();
    klog_error!("==================== KERNEL PANIC ====================");
    klog_error!("{}", info);
    klog_error!("======================================================");
    ferrite_lib::cpu::halt_loop();
}
