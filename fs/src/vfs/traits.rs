//! VFS trait definitions.
//!
//! Every backend — in-memory, device, synthetic, or a disk-format parser
//! living outside this tree — implements [`FileSystem`]. Operations are
//! inode-based; path walking, mount crossing, and symlink chasing happen
//! in the VFS layer above. All operations beyond the lookup/stat core are
//! optional with conservative defaults, mirroring a C operations table
//! with null slots.

/// Unique identifier for an inode within one filesystem.
pub type InodeId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FileType {
    Regular = 1,
    Directory = 2,
    CharDevice = 3,
    BlockDevice = 4,
    Symlink = 5,
    Pipe = 6,
}

impl FileType {
    pub const fn dirent_type(self) -> u8 {
        use ferrite_abi::fs::*;
        match self {
            FileType::Regular => DT_REG,
            FileType::Directory => DT_DIR,
            FileType::CharDevice => DT_CHR,
            FileType::BlockDevice => DT_BLK,
            FileType::Symlink => DT_LNK,
            FileType::Pipe => DT_FIFO,
        }
    }

    pub const fn mode_bits(self) -> u32 {
        use ferrite_abi::fs::*;
        match self {
            FileType::Regular => S_IFREG,
            FileType::Directory => S_IFDIR,
            FileType::CharDevice => S_IFCHR,
            FileType::BlockDevice => S_IFBLK,
            FileType::Symlink => S_IFLNK,
            FileType::Pipe => S_IFIFO,
        }
    }
}

/// Metadata returned by stat operations.
#[derive(Debug, Clone)]
pub struct FileStat {
    pub inode: InodeId,
    pub file_type: FileType,
    pub size: u64,
    pub mode: u16,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub dev_major: u32,
    pub dev_minor: u32,
}

impl FileStat {
    pub const fn new_file(inode: InodeId, size: u64) -> Self {
        Self {
            inode,
            file_type: FileType::Regular,
            size,
            mode: 0o644,
            nlink: 1,
            uid: 0,
            gid: 0,
            dev_major: 0,
            dev_minor: 0,
        }
    }

    pub const fn new_directory(inode: InodeId) -> Self {
        Self {
            inode,
            file_type: FileType::Directory,
            size: 0,
            mode: 0o755,
            nlink: 2,
            uid: 0,
            gid: 0,
            dev_major: 0,
            dev_minor: 0,
        }
    }

    pub const fn new_char_device(inode: InodeId, major: u32, minor: u32) -> Self {
        Self {
            inode,
            file_type: FileType::CharDevice,
            size: 0,
            mode: 0o666,
            nlink: 1,
            uid: 0,
            gid: 0,
            dev_major: major,
            dev_minor: minor,
        }
    }
}

pub type VfsResult<T> = Result<T, VfsError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VfsError {
    NotFound,
    NotDirectory,
    IsDirectory,
    PermissionDenied,
    ReadOnly,
    NoSpace,
    IoError,
    InvalidPath,
    AlreadyExists,
    NotEmpty,
    CrossDevice,
    NotSupported,
    TooManyLinks,
    NameTooLong,
    InvalidArgument,
    BadFileDescriptor,
    Busy,
    NotTty,
    BrokenPipe,
    WouldBlock,
    Interrupted,
}

impl VfsError {
    pub const fn to_errno(self) -> i32 {
        use ferrite_abi::errno::*;
        match self {
            VfsError::NotFound => ENOENT,
            VfsError::NotDirectory => ENOTDIR,
            VfsError::IsDirectory => EISDIR,
            VfsError::PermissionDenied => EACCES,
            VfsError::ReadOnly => EACCES,
            VfsError::NoSpace => ENOSPC,
            VfsError::IoError => EIO,
            VfsError::InvalidPath => EINVAL,
            VfsError::AlreadyExists => EEXIST,
            VfsError::NotEmpty => ENOTEMPTY,
            VfsError::CrossDevice => EINVAL,
            VfsError::NotSupported => ENOSYS,
            VfsError::TooManyLinks => ELOOP,
            VfsError::NameTooLong => ENAMETOOLONG,
            VfsError::InvalidArgument => EINVAL,
            VfsError::BadFileDescriptor => EBADF,
            VfsError::Busy => EBUSY,
            VfsError::NotTty => ENOTTY,
            VfsError::BrokenPipe => EPIPE,
            VfsError::WouldBlock => EAGAIN,
            VfsError::Interrupted => EINTR,
        }
    }
}

/// A filesystem backend.
///
/// Contract: a directory never supports `read`/`write`; a file or device
/// never supports `lookup`. The defaults return `NotSupported` so a
/// backend only implements what it has.
pub trait FileSystem: Send + Sync {
    fn name(&self) -> &'static str;

    /// Entry inode for path traversal within this mount.
    fn root_inode(&self) -> InodeId;

    /// Look up `name` in directory `parent`.
    fn lookup(&self, parent: InodeId, name: &[u8]) -> VfsResult<InodeId>;

    fn stat(&self, inode: InodeId) -> VfsResult<FileStat>;

    /// Read from a file or device; returns bytes read (short at EOF).
    fn read(&self, inode: InodeId, offset: u64, buf: &mut [u8]) -> VfsResult<usize>;

    /// Write to a file or device; returns bytes written.
    fn write(&self, inode: InodeId, offset: u64, buf: &[u8]) -> VfsResult<usize>;

    /// Create a file or directory entry under `parent`.
    fn create(&self, parent: InodeId, name: &[u8], file_type: FileType) -> VfsResult<InodeId> {
        let _ = (parent, name, file_type);
        Err(VfsError::ReadOnly)
    }

    /// Remove a non-directory entry.
    fn unlink(&self, parent: InodeId, name: &[u8]) -> VfsResult<()> {
        let _ = (parent, name);
        Err(VfsError::ReadOnly)
    }

    /// Remove an empty directory.
    fn rmdir(&self, parent: InodeId, name: &[u8]) -> VfsResult<()> {
        let _ = (parent, name);
        Err(VfsError::ReadOnly)
    }

    /// Iterate directory entries starting at entry index `offset`; the
    /// callback returns false to stop. Returns entries visited.
    fn readdir(
        &self,
        inode: InodeId,
        offset: usize,
        callback: &mut dyn FnMut(&[u8], InodeId, FileType) -> bool,
    ) -> VfsResult<usize>;

    fn truncate(&self, inode: InodeId, size: u64) -> VfsResult<()> {
        let _ = (inode, size);
        Err(VfsError::NotSupported)
    }

    /// Rename within this filesystem. Inode numbers are preserved.
    fn rename(
        &self,
        old_parent: InodeId,
        old_name: &[u8],
        new_parent: InodeId,
        new_name: &[u8],
    ) -> VfsResult<()> {
        let _ = (old_parent, old_name, new_parent, new_name);
        Err(VfsError::NotSupported)
    }

    /// Add a hard link to an existing inode.
    fn link(&self, inode: InodeId, new_parent: InodeId, new_name: &[u8]) -> VfsResult<()> {
        let _ = (inode, new_parent, new_name);
        Err(VfsError::NotSupported)
    }

    /// Read a symlink target into `buf`; returns target length.
    fn readlink(&self, inode: InodeId, buf: &mut [u8]) -> VfsResult<usize> {
        let _ = (inode, buf);
        Err(VfsError::InvalidArgument)
    }

    /// Poll readiness mask (POLLIN/POLLOUT). Nodes without a poll
    /// operation report "always ready".
    fn poll(&self, inode: InodeId, events: u16) -> VfsResult<u16> {
        let _ = inode;
        Ok(events)
    }

    /// Device control. Only devices answer; everything else is ENOTTY.
    fn ioctl(&self, inode: InodeId, cmd: u32, arg: u64) -> VfsResult<u64> {
        let _ = (inode, cmd, arg);
        Err(VfsError::NotTty)
    }
}
