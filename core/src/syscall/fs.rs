//! File and directory syscalls.

use ferrite_abi::errno::{self, EBADF, EFAULT, EINVAL, ESPIPE};
use ferrite_abi::fs::{
    AT_FDCWD, O_CLOEXEC, PIPE2_FLAGS_MASK, UserStat,
};
use ferrite_abi::signal::SIGPIPE;
use ferrite_lib::InterruptFrame;
use ferrite_mm::user_copy::{copy_bytes_from_user, copy_bytes_to_user, copy_from_user, copy_to_user};
use ferrite_mm::user_ptr::{UserBytes, UserPtr};

use ferrite_fs::devfs::{TIOCGPGRP, TIOCGWINSZ, TIOCSPGRP};
use ferrite_fs::vfs::{FileStat, VfsError};

use crate::sched::task_struct::Task;
use crate::signal::send_signal;
use crate::syscall::context::{SysResult, SyscallArgs, copy_path, user_err};

const IO_CHUNK: usize = 512;
const PATH_BUF: usize = 256;

/// `unlinkat` flag selecting rmdir semantics.
const AT_REMOVEDIR: u32 = 0x200;

fn vfs_err(err: VfsError) -> SysResult {
    SysResult::Err(err.to_errno())
}

fn stat_to_user(stat: &FileStat) -> UserStat {
    UserStat {
        st_ino: stat.inode,
        st_mode: stat.file_type.mode_bits() | stat.mode as u32,
        st_nlink: stat.nlink,
        st_uid: stat.uid,
        st_gid: stat.gid,
        st_size: stat.size,
        st_rdev_major: stat.dev_major,
        st_rdev_minor: stat.dev_minor,
        st_atime: 0,
        st_mtime: 0,
        st_ctime: 0,
    }
}

fn open_common(task: &Task, path_ptr: u64, flags: u32) -> SysResult {
    let mut path = [0u8; PATH_BUF];
    let len = match copy_path(path_ptr, &mut path) {
        Ok(len) => len,
        Err(e) => return SysResult::Err(e),
    };
    match ferrite_fs::fd_open(task.process_id, &path[..len], flags) {
        Ok(fd) => SysResult::Ok(fd as u64),
        Err(err) => vfs_err(err),
    }
}

pub fn sys_open(task: &mut Task, frame: &mut InterruptFrame) -> SysResult {
    let args = SyscallArgs::from_frame(frame);
    open_common(task, args.arg0, args.arg1 as u32)
}

/// `openat` with the one dirfd this kernel supports: AT_FDCWD.
pub fn sys_openat(task: &mut Task, frame: &mut InterruptFrame) -> SysResult {
    let args = SyscallArgs::from_frame(frame);
    if args.fd(0) != AT_FDCWD {
        return SysResult::Err(EINVAL);
    }
    open_common(task, args.arg1, args.arg2 as u32)
}

pub fn sys_close(task: &mut Task, frame: &mut InterruptFrame) -> SysResult {
    let args = SyscallArgs::from_frame(frame);
    match ferrite_fs::fd_close(task.process_id, args.fd(0)) {
        Ok(()) => SysResult::Ok(0),
        Err(err) => vfs_err(err),
    }
}

pub fn sys_read(task: &mut Task, frame: &mut InterruptFrame) -> SysResult {
    let args = SyscallArgs::from_frame(frame);
    let fd = args.fd(0);
    let user_buf = args.arg1;
    let len = args.arg2 as usize;
    if len == 0 {
        return SysResult::Ok(0);
    }

    let mut chunk = [0u8; IO_CHUNK];
    let mut done = 0usize;
    while done < len {
        let want = (len - done).min(IO_CHUNK);
        let n = match ferrite_fs::fd_read(task.process_id, fd, &mut chunk[..want]) {
            Ok(n) => n,
            Err(err) if done > 0 => {
                let _ = err;
                break;
            }
            Err(err) => return vfs_err(err),
        };
        if n == 0 {
            break;
        }
        let dest = match UserBytes::try_new(user_buf + done as u64, n) {
            Ok(d) => d,
            Err(e) => return SysResult::Err(user_err(e)),
        };
        if copy_bytes_to_user(dest, &chunk[..n]).is_err() {
            return SysResult::Err(EFAULT);
        }
        done += n;
        if n < want {
            break;
        }
    }
    SysResult::Ok(done as u64)
}

pub fn sys_write(task: &mut Task, frame: &mut InterruptFrame) -> SysResult {
    let args = SyscallArgs::from_frame(frame);
    let fd = args.fd(0);
    let user_buf = args.arg1;
    let len = args.arg2 as usize;
    if len == 0 {
        return SysResult::Ok(0);
    }

    let mut chunk = [0u8; IO_CHUNK];
    let mut done = 0usize;
    while done < len {
        let want = (len - done).min(IO_CHUNK);
        let src = match UserBytes::try_new(user_buf + done as u64, want) {
            Ok(s) => s,
            Err(e) => return SysResult::Err(user_err(e)),
        };
        if copy_bytes_from_user(src, &mut chunk[..want]).is_err() {
            return SysResult::Err(EFAULT);
        }
        let n = match ferrite_fs::fd_write(task.process_id, fd, &chunk[..want]) {
            Ok(n) => n,
            Err(VfsError::BrokenPipe) => {
                // EPIPE comes with SIGPIPE to self.
                let _ = send_signal(task as *mut Task, SIGPIPE);
                if done > 0 {
                    break;
                }
                return SysResult::Err(errno::EPIPE);
            }
            Err(err) if done > 0 => {
                let _ = err;
                break;
            }
            Err(err) => return vfs_err(err),
        };
        done += n;
        if n < want {
            break;
        }
    }
    SysResult::Ok(done as u64)
}

pub fn sys_lseek(task: &mut Task, frame: &mut InterruptFrame) -> SysResult {
    let args = SyscallArgs::from_frame(frame);
    let fd = args.fd(0);
    if !ferrite_fs::fd_is_seekable(task.process_id, fd) {
        // Bad fd vs non-seekable object.
        return match ferrite_fs::fd_fstat(task.process_id, fd) {
            Ok(_) => SysResult::Err(ESPIPE),
            Err(_) => SysResult::Err(EBADF),
        };
    }
    match ferrite_fs::fd_lseek(task.process_id, fd, args.arg1 as i64, args.arg2 as u32) {
        Ok(pos) => SysResult::Ok(pos),
        Err(err) => vfs_err(err),
    }
}

fn write_stat(user_ptr: u64, stat: &FileStat) -> SysResult {
    let out = stat_to_user(stat);
    let dest = match UserPtr::<UserStat>::try_new(user_ptr) {
        Ok(d) => d,
        Err(e) => return SysResult::Err(user_err(e)),
    };
    match copy_to_user(dest, &out) {
        Ok(()) => SysResult::Ok(0),
        Err(_) => SysResult::Err(EFAULT),
    }
}

pub fn sys_fstat(task: &mut Task, frame: &mut InterruptFrame) -> SysResult {
    let args = SyscallArgs::from_frame(frame);
    match ferrite_fs::fd_fstat(task.process_id, args.fd(0)) {
        Ok(stat) => write_stat(args.arg1, &stat),
        Err(err) => vfs_err(err),
    }
}

fn stat_path(task: &Task, path_ptr: u64, stat_ptr: u64) -> SysResult {
    let mut path = [0u8; PATH_BUF];
    let len = match copy_path(path_ptr, &mut path) {
        Ok(len) => len,
        Err(e) => return SysResult::Err(e),
    };
    let mut cwd = [0u8; PATH_BUF];
    let cwd_len = ferrite_fs::fileio_cwd(task.process_id, &mut cwd).unwrap_or(1);
    match ferrite_fs::vfs::vfs_stat(&cwd[..cwd_len.max(1)], &path[..len]) {
        Ok(node) => write_stat(stat_ptr, &node.stat),
        Err(err) => vfs_err(err),
    }
}

pub fn sys_stat(task: &mut Task, frame: &mut InterruptFrame) -> SysResult {
    let args = SyscallArgs::from_frame(frame);
    stat_path(task, args.arg0, args.arg1)
}

pub fn sys_fstatat(task: &mut Task, frame: &mut InterruptFrame) -> SysResult {
    let args = SyscallArgs::from_frame(frame);
    if args.fd(0) != AT_FDCWD {
        return SysResult::Err(EINVAL);
    }
    stat_path(task, args.arg1, args.arg2)
}

pub fn sys_getdents(task: &mut Task, frame: &mut InterruptFrame) -> SysResult {
    let args = SyscallArgs::from_frame(frame);
    let fd = args.fd(0);
    let user_buf = args.arg1;
    let len = (args.arg2 as usize).min(1024);
    if len < ferrite_abi::fs::DIRENT_HEADER_SIZE {
        return SysResult::Err(EINVAL);
    }

    let mut kbuf = [0u8; 1024];
    let written = match ferrite_fs::fd_getdents(task.process_id, fd, &mut kbuf[..len]) {
        Ok(n) => n,
        Err(err) => return vfs_err(err),
    };
    if written == 0 {
        return SysResult::Ok(0);
    }
    let dest = match UserBytes::try_new(user_buf, written) {
        Ok(d) => d,
        Err(e) => return SysResult::Err(user_err(e)),
    };
    match copy_bytes_to_user(dest, &kbuf[..written]) {
        Ok(_) => SysResult::Ok(written as u64),
        Err(_) => SysResult::Err(EFAULT),
    }
}

fn path_op(
    task: &Task,
    path_ptr: u64,
    op: impl FnOnce(&[u8], &[u8]) -> Result<(), VfsError>,
) -> SysResult {
    let mut path = [0u8; PATH_BUF];
    let len = match copy_path(path_ptr, &mut path) {
        Ok(len) => len,
        Err(e) => return SysResult::Err(e),
    };
    let mut cwd = [0u8; PATH_BUF];
    let cwd_len = ferrite_fs::fileio_cwd(task.process_id, &mut cwd).unwrap_or(1);
    match op(&cwd[..cwd_len.max(1)], &path[..len]) {
        Ok(()) => SysResult::Ok(0),
        Err(err) => vfs_err(err),
    }
}

pub fn sys_mkdir(task: &mut Task, frame: &mut InterruptFrame) -> SysResult {
    let args = SyscallArgs::from_frame(frame);
    path_op(task, args.arg0, ferrite_fs::vfs::vfs_mkdir)
}

pub fn sys_rmdir(task: &mut Task, frame: &mut InterruptFrame) -> SysResult {
    let args = SyscallArgs::from_frame(frame);
    path_op(task, args.arg0, ferrite_fs::vfs::vfs_rmdir)
}

pub fn sys_unlink(task: &mut Task, frame: &mut InterruptFrame) -> SysResult {
    let args = SyscallArgs::from_frame(frame);
    path_op(task, args.arg0, ferrite_fs::vfs::vfs_unlink)
}

pub fn sys_unlinkat(task: &mut Task, frame: &mut InterruptFrame) -> SysResult {
    let args = SyscallArgs::from_frame(frame);
    if args.fd(0) != AT_FDCWD {
        return SysResult::Err(EINVAL);
    }
    let op: fn(&[u8], &[u8]) -> Result<(), VfsError> = if args.arg2 as u32 & AT_REMOVEDIR != 0 {
        ferrite_fs::vfs::vfs_rmdir
    } else {
        ferrite_fs::vfs::vfs_unlink
    };
    path_op(task, args.arg1, op)
}

pub fn sys_rename(task: &mut Task, frame: &mut InterruptFrame) -> SysResult {
    let args = SyscallArgs::from_frame(frame);
    let mut old_path = [0u8; PATH_BUF];
    let old_len = match copy_path(args.arg0, &mut old_path) {
        Ok(len) => len,
        Err(e) => return SysResult::Err(e),
    };
    let mut new_path = [0u8; PATH_BUF];
    let new_len = match copy_path(args.arg1, &mut new_path) {
        Ok(len) => len,
        Err(e) => return SysResult::Err(e),
    };
    let mut cwd = [0u8; PATH_BUF];
    let cwd_len = ferrite_fs::fileio_cwd(task.process_id, &mut cwd).unwrap_or(1);
    match ferrite_fs::vfs::vfs_rename(
        &cwd[..cwd_len.max(1)],
        &old_path[..old_len],
        &new_path[..new_len],
    ) {
        Ok(()) => SysResult::Ok(0),
        Err(err) => vfs_err(err),
    }
}

pub fn sys_chdir(task: &mut Task, frame: &mut InterruptFrame) -> SysResult {
    let args = SyscallArgs::from_frame(frame);
    let mut path = [0u8; PATH_BUF];
    let len = match copy_path(args.arg0, &mut path) {
        Ok(len) => len,
        Err(e) => return SysResult::Err(e),
    };
    let mut cwd = [0u8; PATH_BUF];
    let cwd_len = ferrite_fs::fileio_cwd(task.process_id, &mut cwd).unwrap_or(1);
    match ferrite_fs::vfs::vfs_resolve_dir(&cwd[..cwd_len.max(1)], &path[..len]) {
        Ok(resolved) => {
            match ferrite_fs::fileio_set_cwd(task.process_id, resolved.as_bytes()) {
                Ok(()) => SysResult::Ok(0),
                Err(err) => vfs_err(err),
            }
        }
        Err(err) => vfs_err(err),
    }
}

pub fn sys_getcwd(task: &mut Task, frame: &mut InterruptFrame) -> SysResult {
    let args = SyscallArgs::from_frame(frame);
    let user_buf = args.arg0;
    let cap = args.arg1 as usize;

    let mut cwd = [0u8; PATH_BUF];
    let len = match ferrite_fs::fileio_cwd(task.process_id, &mut cwd) {
        Ok(len) => len,
        Err(err) => return vfs_err(err),
    };
    if cap < len + 1 {
        return SysResult::Err(errno::ERANGE);
    }
    cwd[len] = 0;
    let dest = match UserBytes::try_new(user_buf, len + 1) {
        Ok(d) => d,
        Err(e) => return SysResult::Err(user_err(e)),
    };
    match copy_bytes_to_user(dest, &cwd[..len + 1]) {
        Ok(_) => SysResult::Ok(len as u64 + 1),
        Err(_) => SysResult::Err(EFAULT),
    }
}

pub fn sys_dup(task: &mut Task, frame: &mut InterruptFrame) -> SysResult {
    let args = SyscallArgs::from_frame(frame);
    match ferrite_fs::fd_dup(task.process_id, args.fd(0), 0) {
        Ok(fd) => SysResult::Ok(fd as u64),
        Err(err) => vfs_err(err),
    }
}

pub fn sys_dup2(task: &mut Task, frame: &mut InterruptFrame) -> SysResult {
    let args = SyscallArgs::from_frame(frame);
    match ferrite_fs::fd_dup2(task.process_id, args.fd(0), args.fd(1), false) {
        Ok(fd) => SysResult::Ok(fd as u64),
        Err(err) => vfs_err(err),
    }
}

pub fn sys_dup3(task: &mut Task, frame: &mut InterruptFrame) -> SysResult {
    let args = SyscallArgs::from_frame(frame);
    if args.fd(0) == args.fd(1) {
        // dup3 alone refuses equal descriptors.
        return SysResult::Err(EINVAL);
    }
    let cloexec = args.arg2 as u32 & O_CLOEXEC != 0;
    match ferrite_fs::fd_dup2(task.process_id, args.fd(0), args.fd(1), cloexec) {
        Ok(fd) => SysResult::Ok(fd as u64),
        Err(err) => vfs_err(err),
    }
}

fn pipe_common(task: &Task, user_fds: u64, flags: u32) -> SysResult {
    match ferrite_fs::fd_pipe(task.process_id, flags) {
        Ok((read_fd, write_fd)) => {
            let pair = [read_fd, write_fd];
            let dest = match UserPtr::<[i32; 2]>::try_new(user_fds) {
                Ok(d) => d,
                Err(e) => {
                    let _ = ferrite_fs::fd_close(task.process_id, read_fd);
                    let _ = ferrite_fs::fd_close(task.process_id, write_fd);
                    return SysResult::Err(user_err(e));
                }
            };
            if copy_to_user(dest, &pair).is_err() {
                let _ = ferrite_fs::fd_close(task.process_id, read_fd);
                let _ = ferrite_fs::fd_close(task.process_id, write_fd);
                return SysResult::Err(EFAULT);
            }
            SysResult::Ok(0)
        }
        Err(err) => vfs_err(err),
    }
}

pub fn sys_pipe(task: &mut Task, frame: &mut InterruptFrame) -> SysResult {
    let args = SyscallArgs::from_frame(frame);
    pipe_common(task, args.arg0, 0)
}

pub fn sys_pipe2(task: &mut Task, frame: &mut InterruptFrame) -> SysResult {
    let args = SyscallArgs::from_frame(frame);
    let flags = args.arg1 as u32;
    if flags & !PIPE2_FLAGS_MASK != 0 {
        return SysResult::Err(EINVAL);
    }
    pipe_common(task, args.arg0, flags)
}

pub fn sys_fcntl(task: &mut Task, frame: &mut InterruptFrame) -> SysResult {
    let args = SyscallArgs::from_frame(frame);
    match ferrite_fs::fd_fcntl(task.process_id, args.fd(0), args.arg1 as u32, args.arg2) {
        Ok(value) => SysResult::Ok(value),
        Err(err) => vfs_err(err),
    }
}

/// ioctl marshalling: pointer-typed terminal ioctls have their argument
/// copied here; the device sees plain values.
pub fn sys_ioctl(task: &mut Task, frame: &mut InterruptFrame) -> SysResult {
    let args = SyscallArgs::from_frame(frame);
    let fd = args.fd(0);
    let cmd = args.arg1 as u32;
    let arg = args.arg2;

    match cmd {
        TIOCSPGRP => {
            let ptr = match UserPtr::<u32>::try_new(arg) {
                Ok(p) => p,
                Err(e) => return SysResult::Err(user_err(e)),
            };
            let pgid = match copy_from_user(ptr) {
                Ok(v) => v,
                Err(_) => return SysResult::Err(EFAULT),
            };
            match ferrite_fs::fd_ioctl(task.process_id, fd, cmd, pgid as u64) {
                Ok(_) => SysResult::Ok(0),
                Err(err) => vfs_err(err),
            }
        }
        TIOCGPGRP => match ferrite_fs::fd_ioctl(task.process_id, fd, cmd, 0) {
            Ok(pgid) => {
                let ptr = match UserPtr::<u32>::try_new(arg) {
                    Ok(p) => p,
                    Err(e) => return SysResult::Err(user_err(e)),
                };
                match copy_to_user(ptr, &(pgid as u32)) {
                    Ok(()) => SysResult::Ok(0),
                    Err(_) => SysResult::Err(EFAULT),
                }
            }
            Err(err) => vfs_err(err),
        },
        TIOCGWINSZ => match ferrite_fs::fd_ioctl(task.process_id, fd, cmd, 0) {
            Ok(packed) => {
                // struct winsize { ws_row, ws_col, ws_xpixel, ws_ypixel }
                let winsize: [u16; 4] = [(packed >> 16) as u16, packed as u16, 0, 0];
                let ptr = match UserPtr::<[u16; 4]>::try_new(arg) {
                    Ok(p) => p,
                    Err(e) => return SysResult::Err(user_err(e)),
                };
                match copy_to_user(ptr, &winsize) {
                    Ok(()) => SysResult::Ok(0),
                    Err(_) => SysResult::Err(EFAULT),
                }
            }
            Err(err) => vfs_err(err),
        },
        _ => match ferrite_fs::fd_ioctl(task.process_id, fd, cmd, arg) {
            Ok(value) => SysResult::Ok(value),
            Err(err) => vfs_err(err),
        },
    }
}
