//! In-memory filesystem backing the root hierarchy.
//!
//! Fixed inode and per-directory entry tables; files live in fixed-size
//! data arrays. Supports the full node contract the syscall surface needs:
//! create/unlink/rmdir, rename (inode preserved), truncate, symlinks, and
//! hard links.

use ferrite_lib::IrqMutex;

use crate::vfs::{FileStat, FileSystem, FileType, InodeId, VfsError, VfsResult};
use crate::{MAX_NAME_LEN, MAX_PATH_LEN};

const MAX_INODES: usize = 128;
const RAMFS_MAX_FILE_SIZE: usize = 16384;
const MAX_DIR_ENTRIES: usize = 32;

const ROOT_INODE: InodeId = 1;

#[derive(Clone, Copy)]
struct DirEntry {
    name: [u8; MAX_NAME_LEN],
    name_len: usize,
    inode: InodeId,
}

impl DirEntry {
    const fn empty() -> Self {
        Self {
            name: [0; MAX_NAME_LEN],
            name_len: 0,
            inode: 0,
        }
    }

    fn matches(&self, name: &[u8]) -> bool {
        self.name_len == name.len() && &self.name[..self.name_len] == name
    }
}

struct RamInode {
    in_use: bool,
    file_type: FileType,
    data: [u8; RAMFS_MAX_FILE_SIZE],
    data_len: usize,
    dir_entries: [DirEntry; MAX_DIR_ENTRIES],
    dir_entry_count: usize,
    symlink_target: [u8; MAX_PATH_LEN],
    symlink_len: usize,
    parent: InodeId,
    mode: u16,
    nlink: u32,
}

impl RamInode {
    const fn empty() -> Self {
        Self {
            in_use: false,
            file_type: FileType::Regular,
            data: [0; RAMFS_MAX_FILE_SIZE],
            data_len: 0,
            dir_entries: [const { DirEntry::empty() }; MAX_DIR_ENTRIES],
            dir_entry_count: 0,
            symlink_target: [0; MAX_PATH_LEN],
            symlink_len: 0,
            parent: 0,
            mode: 0o644,
            nlink: 1,
        }
    }

    fn add_dir_entry(&mut self, name: &[u8], inode: InodeId) -> VfsResult<()> {
        if name.len() > MAX_NAME_LEN {
            return Err(VfsError::NameTooLong);
        }
        if self.dir_entry_count >= MAX_DIR_ENTRIES {
            return Err(VfsError::NoSpace);
        }
        if self.dir_entries[..self.dir_entry_count]
            .iter()
            .any(|e| e.matches(name))
        {
            return Err(VfsError::AlreadyExists);
        }

        let entry = &mut self.dir_entries[self.dir_entry_count];
        entry.name[..name.len()].copy_from_slice(name);
        entry.name_len = name.len();
        entry.inode = inode;
        self.dir_entry_count += 1;
        Ok(())
    }

    fn remove_dir_entry(&mut self, name: &[u8]) -> VfsResult<InodeId> {
        for i in 0..self.dir_entry_count {
            if self.dir_entries[i].matches(name) {
                let inode = self.dir_entries[i].inode;
                self.dir_entries[i] = self.dir_entries[self.dir_entry_count - 1];
                self.dir_entries[self.dir_entry_count - 1] = DirEntry::empty();
                self.dir_entry_count -= 1;
                return Ok(inode);
            }
        }
        Err(VfsError::NotFound)
    }

    fn lookup_entry(&self, name: &[u8]) -> VfsResult<InodeId> {
        self.dir_entries[..self.dir_entry_count]
            .iter()
            .find(|e| e.matches(name))
            .map(|e| e.inode)
            .ok_or(VfsError::NotFound)
    }
}

struct RamFsInner {
    inodes: [RamInode; MAX_INODES],
    initialized: bool,
}

impl RamFsInner {
    const fn new() -> Self {
        Self {
            inodes: [const { RamInode::empty() }; MAX_INODES],
            initialized: false,
        }
    }

    fn ensure_initialized(&mut self) {
        if self.initialized {
            return;
        }
        self.initialized = true;

        let root = &mut self.inodes[ROOT_INODE as usize];
        root.in_use = true;
        root.file_type = FileType::Directory;
        root.mode = 0o755;
        root.nlink = 2;
        root.parent = ROOT_INODE;
        root.add_dir_entry(b".", ROOT_INODE).ok();
        root.add_dir_entry(b"..", ROOT_INODE).ok();
    }

    fn alloc_inode(&mut self) -> VfsResult<InodeId> {
        for id in (ROOT_INODE as usize + 1)..MAX_INODES {
            if !self.inodes[id].in_use {
                return Ok(id as InodeId);
            }
        }
        Err(VfsError::NoSpace)
    }

    fn inode(&self, id: InodeId) -> VfsResult<&RamInode> {
        let node = self
            .inodes
            .get(id as usize)
            .ok_or(VfsError::NotFound)?;
        if !node.in_use {
            return Err(VfsError::NotFound);
        }
        Ok(node)
    }

    fn inode_mut(&mut self, id: InodeId) -> VfsResult<&mut RamInode> {
        let node = self
            .inodes
            .get_mut(id as usize)
            .ok_or(VfsError::NotFound)?;
        if !node.in_use {
            return Err(VfsError::NotFound);
        }
        Ok(node)
    }
}

pub struct RamFs {
    inner: IrqMutex<RamFsInner>,
}

impl RamFs {
    pub const fn new() -> Self {
        Self {
            inner: IrqMutex::new(RamFsInner::new()),
        }
    }

    fn with_inner<R>(&self, f: impl FnOnce(&mut RamFsInner) -> R) -> R {
        let mut inner = self.inner.lock();
        inner.ensure_initialized();
        f(&mut inner)
    }

    /// Write a whole file in one go (initrd unpacking).
    pub fn write_file(&self, parent: InodeId, name: &[u8], contents: &[u8]) -> VfsResult<InodeId> {
        let inode = self.create(parent, name, FileType::Regular)?;
        self.write(inode, 0, contents)?;
        Ok(inode)
    }

    /// Create a symlink node pointing at `target`.
    pub fn symlink(&self, parent: InodeId, name: &[u8], target: &[u8]) -> VfsResult<InodeId> {
        if target.len() > MAX_PATH_LEN {
            return Err(VfsError::NameTooLong);
        }
        let inode = self.create(parent, name, FileType::Symlink)?;
        self.with_inner(|inner| {
            let node = inner.inode_mut(inode)?;
            node.symlink_target[..target.len()].copy_from_slice(target);
            node.symlink_len = target.len();
            Ok(inode)
        })
    }
}

impl Default for RamFs {
    fn default() -> Self {
        Self::new()
    }
}

static RAMFS: RamFs = RamFs::new();

pub fn ramfs_instance() -> &'static RamFs {
    &RAMFS
}

impl FileSystem for RamFs {
    fn name(&self) -> &'static str {
        "ramfs"
    }

    fn root_inode(&self) -> InodeId {
        ROOT_INODE
    }

    fn lookup(&self, parent: InodeId, name: &[u8]) -> VfsResult<InodeId> {
        self.with_inner(|inner| {
            let dir = inner.inode(parent)?;
            if dir.file_type != FileType::Directory {
                return Err(VfsError::NotDirectory);
            }
            dir.lookup_entry(name)
        })
    }

    fn stat(&self, inode: InodeId) -> VfsResult<FileStat> {
        self.with_inner(|inner| {
            let node = inner.inode(inode)?;
            Ok(FileStat {
                inode,
                file_type: node.file_type,
                size: match node.file_type {
                    FileType::Symlink => node.symlink_len as u64,
                    _ => node.data_len as u64,
                },
                mode: node.mode,
                nlink: node.nlink,
                uid: 0,
                gid: 0,
                dev_major: 0,
                dev_minor: 0,
            })
        })
    }

    fn read(&self, inode: InodeId, offset: u64, buf: &mut [u8]) -> VfsResult<usize> {
        self.with_inner(|inner| {
            let node = inner.inode(inode)?;
            if node.file_type == FileType::Directory {
                return Err(VfsError::IsDirectory);
            }
            let offset = offset as usize;
            if offset >= node.data_len {
                return Ok(0);
            }
            let to_read = buf.len().min(node.data_len - offset);
            buf[..to_read].copy_from_slice(&node.data[offset..offset + to_read]);
            Ok(to_read)
        })
    }

    fn write(&self, inode: InodeId, offset: u64, buf: &[u8]) -> VfsResult<usize> {
        self.with_inner(|inner| {
            let node = inner.inode_mut(inode)?;
            if node.file_type == FileType::Directory {
                return Err(VfsError::IsDirectory);
            }
            let offset = offset as usize;
            let end = offset.checked_add(buf.len()).ok_or(VfsError::NoSpace)?;
            if end > RAMFS_MAX_FILE_SIZE {
                return Err(VfsError::NoSpace);
            }
            // A seek past EOF leaves a zero-filled gap.
            if offset > node.data_len {
                node.data[node.data_len..offset].fill(0);
            }
            node.data[offset..end].copy_from_slice(buf);
            node.data_len = node.data_len.max(end);
            Ok(buf.len())
        })
    }

    fn create(&self, parent: InodeId, name: &[u8], file_type: FileType) -> VfsResult<InodeId> {
        if name.is_empty() || name == b"." || name == b".." {
            return Err(VfsError::InvalidArgument);
        }
        self.with_inner(|inner| {
            {
                let dir = inner.inode(parent)?;
                if dir.file_type != FileType::Directory {
                    return Err(VfsError::NotDirectory);
                }
                if dir.lookup_entry(name).is_ok() {
                    return Err(VfsError::AlreadyExists);
                }
            }

            let new_id = inner.alloc_inode()?;
            {
                let node = &mut inner.inodes[new_id as usize];
                *node = RamInode::empty();
                node.in_use = true;
                node.file_type = file_type;
                node.parent = parent;
                match file_type {
                    FileType::Directory => {
                        node.mode = 0o755;
                        node.nlink = 2;
                        node.add_dir_entry(b".", new_id)?;
                        node.add_dir_entry(b"..", parent)?;
                    }
                    FileType::Symlink => {
                        node.mode = 0o777;
                    }
                    _ => {
                        node.mode = 0o644;
                    }
                }
            }

            inner.inode_mut(parent)?.add_dir_entry(name, new_id)?;
            if file_type == FileType::Directory {
                inner.inode_mut(parent)?.nlink += 1;
            }
            Ok(new_id)
        })
    }

    fn unlink(&self, parent: InodeId, name: &[u8]) -> VfsResult<()> {
        self.with_inner(|inner| {
            let target_id = {
                let dir = inner.inode(parent)?;
                if dir.file_type != FileType::Directory {
                    return Err(VfsError::NotDirectory);
                }
                dir.lookup_entry(name)?
            };
            if inner.inode(target_id)?.file_type == FileType::Directory {
                return Err(VfsError::IsDirectory);
            }

            inner.inode_mut(parent)?.remove_dir_entry(name)?;
            let target = inner.inode_mut(target_id)?;
            target.nlink = target.nlink.saturating_sub(1);
            if target.nlink == 0 {
                *target = RamInode::empty();
            }
            Ok(())
        })
    }

    fn rmdir(&self, parent: InodeId, name: &[u8]) -> VfsResult<()> {
        self.with_inner(|inner| {
            let target_id = {
                let dir = inner.inode(parent)?;
                if dir.file_type != FileType::Directory {
                    return Err(VfsError::NotDirectory);
                }
                dir.lookup_entry(name)?
            };
            {
                let target = inner.inode(target_id)?;
                if target.file_type != FileType::Directory {
                    return Err(VfsError::NotDirectory);
                }
                // Only `.` and `..` may remain.
                if target.dir_entry_count > 2 {
                    return Err(VfsError::NotEmpty);
                }
            }

            inner.inode_mut(parent)?.remove_dir_entry(name)?;
            inner.inode_mut(parent)?.nlink -= 1;
            inner.inodes[target_id as usize] = RamInode::empty();
            Ok(())
        })
    }

    fn readdir(
        &self,
        inode: InodeId,
        offset: usize,
        callback: &mut dyn FnMut(&[u8], InodeId, FileType) -> bool,
    ) -> VfsResult<usize> {
        self.with_inner(|inner| {
            let dir = inner.inode(inode)?;
            if dir.file_type != FileType::Directory {
                return Err(VfsError::NotDirectory);
            }

            let mut count = 0;
            for i in offset..dir.dir_entry_count {
                let entry = &dir.dir_entries[i];
                let entry_type = match inner.inode(entry.inode) {
                    Ok(n) => n.file_type,
                    Err(_) => continue,
                };
                count += 1;
                if !callback(&entry.name[..entry.name_len], entry.inode, entry_type) {
                    break;
                }
            }
            Ok(count)
        })
    }

    fn truncate(&self, inode: InodeId, size: u64) -> VfsResult<()> {
        self.with_inner(|inner| {
            let node = inner.inode_mut(inode)?;
            if node.file_type == FileType::Directory {
                return Err(VfsError::IsDirectory);
            }
            let new_len = (size as usize).min(RAMFS_MAX_FILE_SIZE);
            if new_len > node.data_len {
                node.data[node.data_len..new_len].fill(0);
            } else {
                node.data[new_len..node.data_len].fill(0);
            }
            node.data_len = new_len;
            Ok(())
        })
    }

    fn rename(
        &self,
        old_parent: InodeId,
        old_name: &[u8],
        new_parent: InodeId,
        new_name: &[u8],
    ) -> VfsResult<()> {
        self.with_inner(|inner| {
            {
                let dst = inner.inode(new_parent)?;
                if dst.file_type != FileType::Directory {
                    return Err(VfsError::NotDirectory);
                }
                if dst.lookup_entry(new_name).is_ok() {
                    return Err(VfsError::AlreadyExists);
                }
            }

            let moved = inner.inode_mut(old_parent)?.remove_dir_entry(old_name)?;
            if let Err(err) = inner.inode_mut(new_parent)?.add_dir_entry(new_name, moved) {
                // Roll the entry back so the node is not lost.
                inner.inode_mut(old_parent)?.add_dir_entry(old_name, moved)?;
                return Err(err);
            }

            let is_dir = inner.inode(moved)?.file_type == FileType::Directory;
            if is_dir && old_parent != new_parent {
                inner.inode_mut(moved)?.parent = new_parent;
                inner.inode_mut(old_parent)?.nlink -= 1;
                inner.inode_mut(new_parent)?.nlink += 1;
            }
            Ok(())
        })
    }

    fn link(&self, inode: InodeId, new_parent: InodeId, new_name: &[u8]) -> VfsResult<()> {
        self.with_inner(|inner| {
            if inner.inode(inode)?.file_type == FileType::Directory {
                return Err(VfsError::IsDirectory);
            }
            inner.inode_mut(new_parent)?.add_dir_entry(new_name, inode)?;
            inner.inode_mut(inode)?.nlink += 1;
            Ok(())
        })
    }

    fn readlink(&self, inode: InodeId, buf: &mut [u8]) -> VfsResult<usize> {
        self.with_inner(|inner| {
            let node = inner.inode(inode)?;
            if node.file_type != FileType::Symlink {
                return Err(VfsError::InvalidArgument);
            }
            let len = node.symlink_len.min(buf.len());
            buf[..len].copy_from_slice(&node.symlink_target[..len]);
            Ok(len)
        })
    }
}
