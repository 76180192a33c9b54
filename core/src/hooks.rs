//! One-stop registration of the cross-crate hook tables the core serves.

use ferrite_fs::devfs::register_tty_signal_hook;

use crate::proc::init_proc;
use crate::signal::tty_signal_hook;

/// Install every hook the lower crates expect from the process core.
/// Called once from kernel init, after the scheduler exists.
pub fn register_core_hooks() {
    register_tty_signal_hook(tty_signal_hook);
    init_proc();
}
