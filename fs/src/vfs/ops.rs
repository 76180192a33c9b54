//! Path-level VFS operations consumed by the syscall layer.

use ferrite_abi::fs::{O_CREAT, O_DIRECTORY, O_EXCL, O_TRUNC};

use crate::vfs::path::{NormalizedPath, ResolvedNode, normalize, walk, walk_parent};
use crate::vfs::traits::{FileType, VfsError, VfsResult};

fn resolve(cwd: &[u8], path: &[u8], follow_last: bool) -> VfsResult<ResolvedNode> {
    let normalized = normalize(cwd, path)?;
    walk(&normalized, follow_last)
}

/// Resolve for open: creates with `O_CREAT`, truncates with `O_TRUNC`.
pub fn vfs_open(cwd: &[u8], path: &[u8], flags: u32) -> VfsResult<ResolvedNode> {
    let normalized = normalize(cwd, path)?;

    match walk(&normalized, true) {
        Ok(node) => {
            if flags & O_CREAT != 0 && flags & O_EXCL != 0 {
                return Err(VfsError::AlreadyExists);
            }
            if flags & O_DIRECTORY != 0 && node.stat.file_type != FileType::Directory {
                return Err(VfsError::NotDirectory);
            }
            if flags & O_TRUNC != 0 && node.stat.file_type == FileType::Regular {
                node.fs.truncate(node.inode, 0)?;
            }
            Ok(node)
        }
        Err(VfsError::NotFound) if flags & O_CREAT != 0 => {
            let parent = walk_parent(&normalized)?;
            let inode = parent
                .fs
                .create(parent.dir_inode, parent.name_bytes(), FileType::Regular)?;
            let stat = parent.fs.stat(inode)?;
            Ok(ResolvedNode {
                fs: parent.fs,
                inode,
                stat,
            })
        }
        Err(err) => Err(err),
    }
}

pub fn vfs_stat(cwd: &[u8], path: &[u8]) -> VfsResult<ResolvedNode> {
    resolve(cwd, path, true)
}

pub fn vfs_mkdir(cwd: &[u8], path: &[u8]) -> VfsResult<()> {
    let normalized = normalize(cwd, path)?;
    if walk(&normalized, true).is_ok() {
        return Err(VfsError::AlreadyExists);
    }
    let parent = walk_parent(&normalized)?;
    parent
        .fs
        .create(parent.dir_inode, parent.name_bytes(), FileType::Directory)?;
    Ok(())
}

pub fn vfs_rmdir(cwd: &[u8], path: &[u8]) -> VfsResult<()> {
    let normalized = normalize(cwd, path)?;
    let node = walk(&normalized, false)?;
    if node.stat.file_type != FileType::Directory {
        return Err(VfsError::NotDirectory);
    }
    let parent = walk_parent(&normalized)?;
    parent.fs.rmdir(parent.dir_inode, parent.name_bytes())
}

pub fn vfs_unlink(cwd: &[u8], path: &[u8]) -> VfsResult<()> {
    let normalized = normalize(cwd, path)?;
    let node = walk(&normalized, false)?;
    if node.stat.file_type == FileType::Directory {
        return Err(VfsError::IsDirectory);
    }
    let parent = walk_parent(&normalized)?;
    parent.fs.unlink(parent.dir_inode, parent.name_bytes())
}

/// Rename within a single filesystem; crossing mounts is `CrossDevice`.
pub fn vfs_rename(cwd: &[u8], old_path: &[u8], new_path: &[u8]) -> VfsResult<()> {
    let old_norm = normalize(cwd, old_path)?;
    let new_norm = normalize(cwd, new_path)?;

    walk(&old_norm, false)?;
    let old_parent = walk_parent(&old_norm)?;
    let new_parent = walk_parent(&new_norm)?;

    if !core::ptr::eq(
        old_parent.fs as *const _ as *const (),
        new_parent.fs as *const _ as *const (),
    ) {
        return Err(VfsError::CrossDevice);
    }

    old_parent.fs.rename(
        old_parent.dir_inode,
        old_parent.name_bytes(),
        new_parent.dir_inode,
        new_parent.name_bytes(),
    )
}

/// Resolve a directory path for chdir; returns the normalised absolute
/// path to store as the process cwd.
pub fn vfs_resolve_dir(cwd: &[u8], path: &[u8]) -> VfsResult<NormalizedPath> {
    let normalized = normalize(cwd, path)?;
    let node = walk(&normalized, true)?;
    if node.stat.file_type != FileType::Directory {
        return Err(VfsError::NotDirectory);
    }
    Ok(normalized)
}

/// Validate a mount point (must resolve to a directory) then register the
/// mount.
pub fn vfs_mount_at(path: &[u8], fs: &'static dyn crate::vfs::traits::FileSystem) -> VfsResult<()> {
    if path != b"/" {
        let normalized = normalize(b"/", path)?;
        let node = walk(&normalized, true)?;
        if node.stat.file_type != FileType::Directory {
            return Err(VfsError::NotDirectory);
        }
        return crate::vfs::mount::mount(normalized.as_bytes(), fs);
    }
    crate::vfs::mount::mount(path, fs)
}
