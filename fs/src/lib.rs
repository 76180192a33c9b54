#![no_std]

pub const MAX_PATH_LEN: usize = 256;
pub const MAX_NAME_LEN: usize = 64;

pub mod devfs;
pub mod fileio;
pub mod procfs;
pub mod ramfs;
pub mod tests;
pub mod vfs;

pub use devfs::DevFs;
pub use fileio::*;
pub use procfs::ProcFs;
pub use ramfs::RamFs;
pub use vfs::{
    FileStat, FileSystem, FileType, InodeId, VfsError, VfsResult, mount, vfs_init_root,
};
