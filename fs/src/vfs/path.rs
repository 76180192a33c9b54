//! Path normalisation and component walking.
//!
//! Normalisation collapses `.`, resolves `..` without climbing above the
//! root, and strips duplicate slashes, producing an absolute path. The
//! walk then consults the mount table and follows each component through
//! `lookup`, splicing in symlink targets up to a bounded depth.

use crate::MAX_PATH_LEN;
use crate::vfs::mount::resolve_mount;
use crate::vfs::traits::{FileStat, FileSystem, FileType, InodeId, VfsError, VfsResult};

/// Maximum symlink indirections before `ELOOP`.
const MAX_SYMLINK_DEPTH: usize = 8;

/// An absolute, normalised path in a fixed buffer.
#[derive(Clone, Copy)]
pub struct NormalizedPath {
    buf: [u8; MAX_PATH_LEN],
    len: usize,
}

impl NormalizedPath {
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    fn push_component(&mut self, component: &[u8]) -> VfsResult<()> {
        let extra = if self.len == 1 { component.len() } else { component.len() + 1 };
        if self.len + extra > MAX_PATH_LEN {
            return Err(VfsError::NameTooLong);
        }
        if self.len > 1 {
            self.buf[self.len] = b'/';
            self.len += 1;
        }
        self.buf[self.len..self.len + component.len()].copy_from_slice(component);
        self.len += component.len();
        Ok(())
    }

    fn pop_component(&mut self) {
        while self.len > 1 && self.buf[self.len - 1] != b'/' {
            self.len -= 1;
        }
        if self.len > 1 {
            self.len -= 1;
        }
    }
}

/// Build an absolute normalised path from `cwd` (must be absolute) and
/// `path` (absolute or relative).
pub fn normalize(cwd: &[u8], path: &[u8]) -> VfsResult<NormalizedPath> {
    if path.len() > MAX_PATH_LEN || cwd.len() > MAX_PATH_LEN {
        return Err(VfsError::NameTooLong);
    }

    let mut out = NormalizedPath {
        buf: [0; MAX_PATH_LEN],
        len: 1,
    };
    out.buf[0] = b'/';

    let absolute = path.first() == Some(&b'/');
    if !absolute {
        if cwd.first() != Some(&b'/') {
            return Err(VfsError::InvalidPath);
        }
        for component in cwd.split(|&b| b == b'/') {
            match component {
                b"" | b"." => {}
                b".." => out.pop_component(),
                name => out.push_component(name)?,
            }
        }
    }

    for component in path.split(|&b| b == b'/') {
        match component {
            b"" | b"." => {}
            b".." => out.pop_component(),
            name => out.push_component(name)?,
        }
    }

    Ok(out)
}

/// Result of resolving a path to a node.
pub struct ResolvedNode {
    pub fs: &'static dyn FileSystem,
    pub inode: InodeId,
    pub stat: FileStat,
}

/// Parent-directory resolution for create/unlink/rename: the directory
/// node plus the final name component.
pub struct ResolvedParent {
    pub fs: &'static dyn FileSystem,
    pub dir_inode: InodeId,
    pub name: [u8; crate::MAX_NAME_LEN],
    pub name_len: usize,
}

impl ResolvedParent {
    pub fn name_bytes(&self) -> &[u8] {
        &self.name[..self.name_len]
    }
}

/// Walk `normalized` from its mount root, following symlinks. When
/// `follow_last` is false, a trailing symlink is returned as the node
/// itself (lstat/unlink semantics).
pub fn walk(normalized: &NormalizedPath, follow_last: bool) -> VfsResult<ResolvedNode> {
    walk_inner(normalized, follow_last, 0)
}

fn walk_inner(
    normalized: &NormalizedPath,
    follow_last: bool,
    depth: usize,
) -> VfsResult<ResolvedNode> {
    if depth > MAX_SYMLINK_DEPTH {
        return Err(VfsError::TooManyLinks);
    }

    let path = normalized.as_bytes();
    let (fs, relative) = resolve_mount(path)?;
    let mut inode = fs.root_inode();

    let mut components = relative.split(|&b| b == b'/').filter(|c| !c.is_empty());
    let mut walked: usize = 0;
    let total = relative
        .split(|&b| b == b'/')
        .filter(|c| !c.is_empty())
        .count();

    while let Some(component) = components.next() {
        walked += 1;
        let is_last = walked == total;

        let stat = fs.stat(inode)?;
        if stat.file_type != FileType::Directory {
            return Err(VfsError::NotDirectory);
        }

        inode = fs.lookup(inode, component)?;
        let stat = fs.stat(inode)?;

        if stat.file_type == FileType::Symlink && (follow_last || !is_last) {
            // Splice the target in: absolute targets restart from the
            // root, relative ones from the containing directory.
            let mut target = [0u8; MAX_PATH_LEN];
            let target_len = fs.readlink(inode, &mut target)?;
            let target = &target[..target_len];

            let mut base = *normalized;
            // Drop the components not yet consumed plus the symlink itself.
            for _ in walked..=total {
                base.pop_component();
            }

            let respliced = normalize(base.as_bytes(), target)?;
            // Re-append the remaining components after the symlink.
            let mut full = respliced;
            for rest in components {
                full.push_component(rest)?;
            }
            return walk_inner(&full, follow_last, depth + 1);
        }

        if !is_last && stat.file_type != FileType::Directory {
            return Err(VfsError::NotDirectory);
        }
    }

    let stat = fs.stat(inode)?;
    Ok(ResolvedNode { fs, inode, stat })
}

/// Resolve everything but the last component; the parent must exist and
/// be a directory.
pub fn walk_parent(normalized: &NormalizedPath) -> VfsResult<ResolvedParent> {
    let path = normalized.as_bytes();
    if path == b"/" {
        return Err(VfsError::InvalidArgument);
    }

    // Split off the final component.
    let split = path
        .iter()
        .rposition(|&b| b == b'/')
        .ok_or(VfsError::InvalidPath)?;
    let name = &path[split + 1..];
    if name.is_empty() {
        return Err(VfsError::InvalidPath);
    }
    if name.len() > crate::MAX_NAME_LEN {
        return Err(VfsError::NameTooLong);
    }

    let parent_path = if split == 0 { b"/" as &[u8] } else { &path[..split] };
    let parent_norm = normalize(b"/", parent_path)?;
    let parent = walk(&parent_norm, true)?;
    if parent.stat.file_type != FileType::Directory {
        return Err(VfsError::NotDirectory);
    }

    let mut out = ResolvedParent {
        fs: parent.fs,
        dir_inode: parent.inode,
        name: [0; crate::MAX_NAME_LEN],
        name_len: name.len(),
    };
    out.name[..name.len()].copy_from_slice(name);
    Ok(out)
}
