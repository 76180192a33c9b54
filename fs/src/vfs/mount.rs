//! The mount table: an ordered map from absolute path prefixes to
//! filesystem roots, resolved by longest matching prefix. `/` is always
//! mounted first; mount points must resolve to directories in the parent
//! filesystem (checked by the caller in `vfs::ops`).

use ferrite_lib::IrqRwLock;

use crate::MAX_PATH_LEN;
use crate::vfs::traits::{FileSystem, VfsError, VfsResult};

const MAX_MOUNTS: usize = 8;

struct MountPoint {
    path: [u8; MAX_PATH_LEN],
    path_len: usize,
    fs: Option<&'static dyn FileSystem>,
}

impl MountPoint {
    const fn empty() -> Self {
        Self {
            path: [0; MAX_PATH_LEN],
            path_len: 0,
            fs: None,
        }
    }

    fn is_active(&self) -> bool {
        self.fs.is_some()
    }

    fn path_bytes(&self) -> &[u8] {
        &self.path[..self.path_len]
    }
}

pub struct MountTable {
    mounts: [MountPoint; MAX_MOUNTS],
    count: usize,
}

impl MountTable {
    const fn new() -> Self {
        Self {
            mounts: [const { MountPoint::empty() }; MAX_MOUNTS],
            count: 0,
        }
    }

    pub fn mount(&mut self, path: &[u8], fs: &'static dyn FileSystem) -> VfsResult<()> {
        if path.is_empty() || path[0] != b'/' {
            return Err(VfsError::InvalidPath);
        }
        if path.len() > MAX_PATH_LEN {
            return Err(VfsError::NameTooLong);
        }
        for mp in self.mounts.iter() {
            if mp.is_active() && mp.path_bytes() == path {
                return Err(VfsError::AlreadyExists);
            }
        }
        let slot = self
            .mounts
            .iter_mut()
            .find(|m| !m.is_active())
            .ok_or(VfsError::NoSpace)?;
        slot.path[..path.len()].copy_from_slice(path);
        slot.path_len = path.len();
        slot.fs = Some(fs);
        self.count += 1;
        Ok(())
    }

    pub fn unmount(&mut self, path: &[u8]) -> VfsResult<()> {
        if path == b"/" {
            // The root never goes away.
            return Err(VfsError::Busy);
        }
        for mp in self.mounts.iter_mut() {
            if mp.is_active() && mp.path_bytes() == path {
                mp.fs = None;
                mp.path_len = 0;
                self.count -= 1;
                return Ok(());
            }
        }
        Err(VfsError::NotFound)
    }

    /// Longest-prefix resolution: returns the owning filesystem and the
    /// path remainder relative to that mount (always starting with `/`).
    pub fn resolve<'a>(&self, path: &'a [u8]) -> VfsResult<(&'static dyn FileSystem, &'a [u8])> {
        if path.is_empty() || path[0] != b'/' {
            return Err(VfsError::InvalidPath);
        }

        let mut best: Option<(&MountPoint, usize)> = None;
        for mp in self.mounts.iter() {
            if !mp.is_active() {
                continue;
            }
            let mp_path = mp.path_bytes();
            let matches = if mp_path == b"/" {
                true
            } else if path.len() >= mp_path.len() {
                // A prefix only matches on a component boundary.
                &path[..mp_path.len()] == mp_path
                    && (path.len() == mp_path.len() || path[mp_path.len()] == b'/')
            } else {
                false
            };
            if matches && best.is_none_or(|(_, len)| mp_path.len() > len) {
                best = Some((mp, mp_path.len()));
            }
        }

        let (mp, match_len) = best.ok_or(VfsError::NotFound)?;
        let fs = mp.fs.ok_or(VfsError::NotFound)?;
        let relative = if match_len >= path.len() || mp.path_bytes() == b"/" {
            if match_len >= path.len() {
                b"/" as &[u8]
            } else {
                path
            }
        } else {
            &path[match_len..]
        };
        Ok((fs, relative))
    }

    pub fn mount_count(&self) -> usize {
        self.count
    }
}

static MOUNT_TABLE: IrqRwLock<MountTable> = IrqRwLock::new(MountTable::new());

pub fn mount(path: &[u8], fs: &'static dyn FileSystem) -> VfsResult<()> {
    MOUNT_TABLE.write().mount(path, fs)
}

pub fn unmount(path: &[u8]) -> VfsResult<()> {
    MOUNT_TABLE.write().unmount(path)
}

pub fn with_mount_table<R>(f: impl FnOnce(&MountTable) -> R) -> R {
    let guard = MOUNT_TABLE.read();
    f(&guard)
}

pub fn resolve_mount(path: &[u8]) -> VfsResult<(&'static dyn FileSystem, &'static [u8])> {
    let guard = MOUNT_TABLE.read();
    let (fs, relative) = guard.resolve(path)?;
    // The relative slice borrows from the caller's buffer, which outlives
    // this call; re-borrow it unbound from the guard lifetime.
    let relative_static: &'static [u8] =
        unsafe { core::slice::from_raw_parts(relative.as_ptr(), relative.len()) };
    Ok((fs, relative_static))
}
