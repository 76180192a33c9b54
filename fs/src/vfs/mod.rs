pub mod mount;
pub mod ops;
pub mod path;
pub mod traits;

use ferrite_lib::klog_info;

pub use mount::{mount, unmount, with_mount_table};
pub use ops::{
    vfs_mkdir, vfs_mount_at, vfs_open, vfs_rename, vfs_resolve_dir, vfs_rmdir, vfs_stat,
    vfs_unlink,
};
pub use path::{NormalizedPath, ResolvedNode, ResolvedParent, normalize, walk, walk_parent};
pub use traits::{FileStat, FileSystem, FileType, InodeId, VfsError, VfsResult};

/// Mount the built-in filesystems: ramfs as `/`, devfs on `/dev`, procfs
/// on `/proc`. Disk-backed filesystems register later through
/// [`vfs_mount_at`] once their drivers probe.
pub fn vfs_init_root() {
    use crate::devfs::devfs_instance;
    use crate::procfs::procfs_instance;
    use crate::ramfs::ramfs_instance;

    if let Err(err) = mount(b"/", ramfs_instance()) {
        panic!("vfs: cannot mount root: {:?}", err);
    }

    let root = ramfs_instance();
    let _ = root.create(root.root_inode(), b"dev", FileType::Directory);
    let _ = root.create(root.root_inode(), b"proc", FileType::Directory);
    let _ = root.create(root.root_inode(), b"tmp", FileType::Directory);
    let _ = root.create(root.root_inode(), b"bin", FileType::Directory);

    if let Err(err) = vfs_mount_at(b"/dev", devfs_instance()) {
        klog_info!("vfs: /dev mount failed: {:?}", err);
    }
    if let Err(err) = vfs_mount_at(b"/proc", procfs_instance()) {
        klog_info!("vfs: /proc mount failed: {:?}", err);
    }

    klog_info!("vfs: root hierarchy mounted");
}
