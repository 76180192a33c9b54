pub mod context;
pub mod dispatch;
pub mod fs;
pub mod ipc;
pub mod memory;
pub mod poll;
pub mod process;
pub mod time;

pub use dispatch::syscall_handle;
