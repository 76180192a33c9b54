//! `/proc`: a read-only synthetic filesystem over the live process table.
//!
//! Nodes: `cmdline`, `uptime`, `meminfo`, `self` (symlink to the calling
//! process), and one directory per live pid holding `status` and `maps`.
//! The process core registers a [`ProcHooks`] table; every read generates
//! its content fresh from it.

use ferrite_lib::OnceLock;

use crate::vfs::{FileStat, FileSystem, FileType, InodeId, VfsError, VfsResult};

/// Providers registered by the process core.
pub struct ProcHooks {
    pub for_each_pid: fn(&mut dyn FnMut(u32)),
    pub pid_exists: fn(u32) -> bool,
    pub current_pid: fn() -> u32,
    /// Writers fill `buf` and return the byte count.
    pub write_status: fn(u32, &mut [u8]) -> usize,
    pub write_maps: fn(u32, &mut [u8]) -> usize,
    pub write_meminfo: fn(&mut [u8]) -> usize,
    pub write_uptime: fn(&mut [u8]) -> usize,
    pub write_cmdline: fn(&mut [u8]) -> usize,
}

static HOOKS: OnceLock<ProcHooks> = OnceLock::new();

pub fn register_proc_hooks(hooks: ProcHooks) {
    let _ = HOOKS.set(hooks);
}

fn hooks() -> VfsResult<&'static ProcHooks> {
    HOOKS.get().ok_or(VfsError::IoError)
}

const ROOT_INODE: InodeId = 1;
const CMDLINE_INODE: InodeId = 2;
const UPTIME_INODE: InodeId = 3;
const MEMINFO_INODE: InodeId = 4;
const SELF_INODE: InodeId = 5;

const PID_INODE_BASE: InodeId = 0x1000;

const fn pid_dir_inode(pid: u32) -> InodeId {
    PID_INODE_BASE + (pid as InodeId) * 4
}

const fn pid_status_inode(pid: u32) -> InodeId {
    pid_dir_inode(pid) + 1
}

const fn pid_maps_inode(pid: u32) -> InodeId {
    pid_dir_inode(pid) + 2
}

fn decode_pid(inode: InodeId) -> Option<(u32, u64)> {
    if inode < PID_INODE_BASE {
        return None;
    }
    let rel = inode - PID_INODE_BASE;
    Some(((rel / 4) as u32, rel % 4))
}

/// Render `value` in decimal into `buf`; returns the digit count.
fn fmt_u32(value: u32, buf: &mut [u8]) -> usize {
    let mut digits = [0u8; 10];
    let mut n = value;
    let mut count = 0;
    loop {
        digits[count] = b'0' + (n % 10) as u8;
        n /= 10;
        count += 1;
        if n == 0 {
            break;
        }
    }
    for i in 0..count.min(buf.len()) {
        buf[i] = digits[count - 1 - i];
    }
    count.min(buf.len())
}

fn parse_pid(name: &[u8]) -> Option<u32> {
    if name.is_empty() || name.len() > 10 {
        return None;
    }
    let mut acc: u64 = 0;
    for &b in name {
        if !b.is_ascii_digit() {
            return None;
        }
        acc = acc * 10 + (b - b'0') as u64;
    }
    u32::try_from(acc).ok()
}

const PROC_BUF_SIZE: usize = 1024;

fn read_generated(
    generate: impl FnOnce(&mut [u8]) -> usize,
    offset: u64,
    out: &mut [u8],
) -> VfsResult<usize> {
    let mut content = [0u8; PROC_BUF_SIZE];
    let len = generate(&mut content);
    let offset = offset as usize;
    if offset >= len {
        return Ok(0);
    }
    let to_copy = out.len().min(len - offset);
    out[..to_copy].copy_from_slice(&content[offset..offset + to_copy]);
    Ok(to_copy)
}

pub struct ProcFs;

static PROCFS: ProcFs = ProcFs;

pub fn procfs_instance() -> &'static ProcFs {
    &PROCFS
}

impl FileSystem for ProcFs {
    fn name(&self) -> &'static str {
        "procfs"
    }

    fn root_inode(&self) -> InodeId {
        ROOT_INODE
    }

    fn lookup(&self, parent: InodeId, name: &[u8]) -> VfsResult<InodeId> {
        let hooks = hooks()?;

        if parent == ROOT_INODE {
            if name == b"." || name == b".." {
                return Ok(ROOT_INODE);
            }
            return match name {
                b"cmdline" => Ok(CMDLINE_INODE),
                b"uptime" => Ok(UPTIME_INODE),
                b"meminfo" => Ok(MEMINFO_INODE),
                b"self" => Ok(SELF_INODE),
                _ => match parse_pid(name) {
                    Some(pid) if (hooks.pid_exists)(pid) => Ok(pid_dir_inode(pid)),
                    _ => Err(VfsError::NotFound),
                },
            };
        }

        if let Some((pid, kind)) = decode_pid(parent) {
            if kind != 0 || !(hooks.pid_exists)(pid) {
                return Err(VfsError::NotDirectory);
            }
            return match name {
                b"." => Ok(parent),
                b".." => Ok(ROOT_INODE),
                b"status" => Ok(pid_status_inode(pid)),
                b"maps" => Ok(pid_maps_inode(pid)),
                _ => Err(VfsError::NotFound),
            };
        }

        Err(VfsError::NotDirectory)
    }

    fn stat(&self, inode: InodeId) -> VfsResult<FileStat> {
        match inode {
            ROOT_INODE => Ok(FileStat::new_directory(ROOT_INODE)),
            CMDLINE_INODE | UPTIME_INODE | MEMINFO_INODE => {
                let mut stat = FileStat::new_file(inode, 0);
                stat.mode = 0o444;
                Ok(stat)
            }
            SELF_INODE => Ok(FileStat {
                inode,
                file_type: FileType::Symlink,
                size: 0,
                mode: 0o777,
                nlink: 1,
                uid: 0,
                gid: 0,
                dev_major: 0,
                dev_minor: 0,
            }),
            other => match decode_pid(other) {
                Some((pid, 0)) => {
                    let hooks = hooks()?;
                    if !(hooks.pid_exists)(pid) {
                        return Err(VfsError::NotFound);
                    }
                    Ok(FileStat::new_directory(other))
                }
                Some((pid, 1 | 2)) => {
                    let hooks = hooks()?;
                    if !(hooks.pid_exists)(pid) {
                        return Err(VfsError::NotFound);
                    }
                    let mut stat = FileStat::new_file(other, 0);
                    stat.mode = 0o444;
                    Ok(stat)
                }
                _ => Err(VfsError::NotFound),
            },
        }
    }

    fn read(&self, inode: InodeId, offset: u64, buf: &mut [u8]) -> VfsResult<usize> {
        let hooks = hooks()?;
        match inode {
            CMDLINE_INODE => read_generated(hooks.write_cmdline, offset, buf),
            UPTIME_INODE => read_generated(hooks.write_uptime, offset, buf),
            MEMINFO_INODE => read_generated(hooks.write_meminfo, offset, buf),
            other => match decode_pid(other) {
                Some((pid, 1)) => read_generated(|b| (hooks.write_status)(pid, b), offset, buf),
                Some((pid, 2)) => read_generated(|b| (hooks.write_maps)(pid, b), offset, buf),
                Some((_, 0)) => Err(VfsError::IsDirectory),
                _ => Err(VfsError::NotFound),
            },
        }
    }

    fn write(&self, _inode: InodeId, _offset: u64, _buf: &[u8]) -> VfsResult<usize> {
        Err(VfsError::ReadOnly)
    }

    fn readdir(
        &self,
        inode: InodeId,
        offset: usize,
        callback: &mut dyn FnMut(&[u8], InodeId, FileType) -> bool,
    ) -> VfsResult<usize> {
        let hooks = hooks()?;

        if inode == ROOT_INODE {
            let mut index = 0usize;
            let mut emitted = 0usize;
            let mut stopped = false;

            let fixed: [(&[u8], InodeId, FileType); 6] = [
                (b".", ROOT_INODE, FileType::Directory),
                (b"..", ROOT_INODE, FileType::Directory),
                (b"cmdline", CMDLINE_INODE, FileType::Regular),
                (b"uptime", UPTIME_INODE, FileType::Regular),
                (b"meminfo", MEMINFO_INODE, FileType::Regular),
                (b"self", SELF_INODE, FileType::Symlink),
            ];
            for (name, node, kind) in fixed {
                if index >= offset && !stopped {
                    emitted += 1;
                    if !callback(name, node, kind) {
                        stopped = true;
                    }
                }
                index += 1;
            }

            if !stopped {
                (hooks.for_each_pid)(&mut |pid| {
                    if stopped {
                        return;
                    }
                    if index >= offset {
                        let mut name = [0u8; 10];
                        let len = fmt_u32(pid, &mut name);
                        emitted += 1;
                        if !callback(&name[..len], pid_dir_inode(pid), FileType::Directory) {
                            stopped = true;
                        }
                    }
                    index += 1;
                });
            }
            return Ok(emitted);
        }

        if let Some((pid, 0)) = decode_pid(inode) {
            if !(hooks.pid_exists)(pid) {
                return Err(VfsError::NotFound);
            }
            let entries: [(&[u8], InodeId, FileType); 4] = [
                (b".", inode, FileType::Directory),
                (b"..", ROOT_INODE, FileType::Directory),
                (b"status", pid_status_inode(pid), FileType::Regular),
                (b"maps", pid_maps_inode(pid), FileType::Regular),
            ];
            let mut emitted = 0usize;
            for (index, (name, node, kind)) in entries.iter().enumerate() {
                if index >= offset {
                    emitted += 1;
                    if !callback(name, *node, *kind) {
                        break;
                    }
                }
            }
            return Ok(emitted);
        }

        Err(VfsError::NotDirectory)
    }

    fn readlink(&self, inode: InodeId, buf: &mut [u8]) -> VfsResult<usize> {
        if inode != SELF_INODE {
            return Err(VfsError::InvalidArgument);
        }
        let hooks = hooks()?;
        let pid = (hooks.current_pid)();
        // Relative target: "self" lives in /proc, so "<pid>" resolves to
        // /proc/<pid>.
        let len = fmt_u32(pid, buf);
        Ok(len)
    }
}
