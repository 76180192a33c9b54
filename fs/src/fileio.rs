//! File objects, per-process descriptor tables, and pipes.
//!
//! The system-wide open-file table holds `{node, offset, status flags,
//! refcount}` records; descriptor tables map small integers to them with a
//! per-slot close-on-exec flag. `dup`/`fork` bump the file refcount so
//! duplicated descriptors share one offset. Descriptor and cwd tables can
//! be shared outright (CLONE_FILES / CLONE_FS) through owner counts.
//!
//! Pipes are pairs of open files over a bounded ring with reader/writer
//! counts: writes block while full as long as a reader exists, reads block
//! while empty as long as a writer exists, the last writer closing wakes
//! readers with EOF, and writing with no readers is EPIPE. Writes no
//! larger than the ring are atomic with respect to concurrent writers.

use ferrite_abi::fs::{
    DIRENT_HEADER_SIZE, F_DUPFD, F_GETFD, F_GETFL, F_SETFD, F_SETFL, FD_CLOEXEC, FD_SETSIZE,
    O_ACCMODE, O_APPEND, O_CLOEXEC, O_NONBLOCK, O_RDONLY, O_WRONLY, POLLERR, POLLHUP, POLLIN,
    POLLNVAL, POLLOUT, SEEK_CUR, SEEK_END, SEEK_SET, UserDirentHeader, dirent_reclen,
};
use ferrite_abi::task::INVALID_PROCESS_ID;
use ferrite_lib::{IrqMutex, RingBuffer, WaitQueue, klog_debug};

use crate::MAX_PATH_LEN;
use crate::devfs;
use crate::vfs::{self, FileStat, FileSystem, FileType, InodeId, VfsError, VfsResult};

pub const MAX_OPEN_FILES: usize = 128;
pub const FD_TABLE_SIZE: usize = FD_SETSIZE;
const MAX_PROC_TABLES: usize = 32;

const MAX_PIPES: usize = 32;
pub const PIPE_BUFFER_SIZE: usize = 4096;

const INVALID_FILE: u32 = u32::MAX;
const INVALID_PIPE: u32 = u32::MAX;

// =============================================================================
// Pipes
// =============================================================================

struct PipeSlot {
    valid: bool,
    ring: RingBuffer<PIPE_BUFFER_SIZE>,
    readers: u16,
    writers: u16,
}

impl PipeSlot {
    const fn new() -> Self {
        Self {
            valid: false,
            ring: RingBuffer::new(),
            readers: 0,
            writers: 0,
        }
    }
}

static PIPES: IrqMutex<[PipeSlot; MAX_PIPES]> =
    IrqMutex::new([const { PipeSlot::new() }; MAX_PIPES]);
static PIPE_READ_WQ: [WaitQueue; MAX_PIPES] = [const { WaitQueue::new() }; MAX_PIPES];
static PIPE_WRITE_WQ: [WaitQueue; MAX_PIPES] = [const { WaitQueue::new() }; MAX_PIPES];

/// Poll sleepers park here; every readiness change pokes it.
static POLL_WQ: WaitQueue = WaitQueue::new();

pub fn poll_wakeup() {
    POLL_WQ.wake_all();
}

/// Block until `condition` is true or `timeout_ms` passes (0 = forever).
pub fn poll_wait<F: Fn() -> bool>(condition: F, timeout_ms: u64) -> ferrite_lib::WaitOutcome {
    POLL_WQ.wait_event_timeout(condition, timeout_ms)
}

fn alloc_pipe() -> Option<u32> {
    let mut pipes = PIPES.lock();
    for (id, slot) in pipes.iter_mut().enumerate() {
        if !slot.valid {
            *slot = PipeSlot::new();
            slot.valid = true;
            slot.readers = 1;
            slot.writers = 1;
            return Some(id as u32);
        }
    }
    None
}

fn pipe_add_ref(pipe_id: u32, write_end: bool) {
    let mut pipes = PIPES.lock();
    if let Some(slot) = pipes.get_mut(pipe_id as usize) {
        if slot.valid {
            if write_end {
                slot.writers = slot.writers.saturating_add(1);
            } else {
                slot.readers = slot.readers.saturating_add(1);
            }
        }
    }
}

fn pipe_drop_ref(pipe_id: u32, write_end: bool) {
    let mut pipes = PIPES.lock();
    let Some(slot) = pipes.get_mut(pipe_id as usize) else {
        return;
    };
    if !slot.valid {
        return;
    }
    if write_end {
        slot.writers = slot.writers.saturating_sub(1);
    } else {
        slot.readers = slot.readers.saturating_sub(1);
    }
    if slot.readers == 0 && slot.writers == 0 {
        *slot = PipeSlot::new();
    }
    drop(pipes);

    // A closed end changes readiness on the other side.
    PIPE_READ_WQ[pipe_id as usize].wake_all();
    PIPE_WRITE_WQ[pipe_id as usize].wake_all();
    poll_wakeup();
}

fn pipe_read(pipe_id: u32, status_flags: u32, buf: &mut [u8]) -> VfsResult<usize> {
    if buf.is_empty() {
        return Ok(0);
    }
    let idx = pipe_id as usize;
    loop {
        {
            let mut pipes = PIPES.lock();
            let slot = pipes.get_mut(idx).ok_or(VfsError::BadFileDescriptor)?;
            if !slot.valid {
                return Err(VfsError::BadFileDescriptor);
            }
            if !slot.ring.is_empty() {
                let n = slot.ring.pop_slice(buf);
                drop(pipes);
                PIPE_WRITE_WQ[idx].wake_all();
                poll_wakeup();
                return Ok(n);
            }
            if slot.writers == 0 {
                // All writers gone: EOF.
                return Ok(0);
            }
        }

        if status_flags & O_NONBLOCK != 0 {
            return Err(VfsError::WouldBlock);
        }
        let outcome = PIPE_READ_WQ[idx].wait_event(|| {
            let pipes = PIPES.lock();
            match pipes.get(idx) {
                Some(slot) => !slot.valid || !slot.ring.is_empty() || slot.writers == 0,
                None => true,
            }
        });
        if outcome == ferrite_lib::WaitOutcome::Interrupted {
            return Err(VfsError::Interrupted);
        }
    }
}

fn pipe_write(pipe_id: u32, status_flags: u32, buf: &[u8]) -> VfsResult<usize> {
    if buf.is_empty() {
        return Ok(0);
    }
    let idx = pipe_id as usize;
    // Writes within the buffer capacity go in whole or not at all, which
    // keeps small concurrent writes atomic.
    let atomic = buf.len() <= PIPE_BUFFER_SIZE;
    let mut written = 0usize;

    loop {
        {
            let mut pipes = PIPES.lock();
            let slot = pipes.get_mut(idx).ok_or(VfsError::BadFileDescriptor)?;
            if !slot.valid {
                return Err(VfsError::BadFileDescriptor);
            }
            if slot.readers == 0 {
                return Err(VfsError::BrokenPipe);
            }

            let room = slot.ring.free_space();
            let need = buf.len() - written;
            if (atomic && room >= need) || (!atomic && room > 0) {
                written += slot.ring.push_slice(&buf[written..]);
                drop(pipes);
                PIPE_READ_WQ[idx].wake_all();
                poll_wakeup();
                if written == buf.len() {
                    return Ok(written);
                }
                continue;
            }
        }

        if status_flags & O_NONBLOCK != 0 {
            return if written > 0 {
                Ok(written)
            } else {
                Err(VfsError::WouldBlock)
            };
        }
        let outcome = PIPE_WRITE_WQ[idx].wait_event(|| {
            let pipes = PIPES.lock();
            match pipes.get(idx) {
                Some(slot) => !slot.valid || slot.readers == 0 || slot.ring.free_space() > 0,
                None => true,
            }
        });
        if outcome == ferrite_lib::WaitOutcome::Interrupted {
            return Err(VfsError::Interrupted);
        }
    }
}

fn pipe_revents(pipe_id: u32, write_end: bool, events: u16) -> u16 {
    let pipes = PIPES.lock();
    let Some(slot) = pipes.get(pipe_id as usize) else {
        return POLLNVAL;
    };
    if !slot.valid {
        return POLLNVAL;
    }

    let mut revents = 0u16;
    if !write_end {
        if !slot.ring.is_empty() {
            revents |= events & POLLIN;
        }
        if slot.writers == 0 {
            revents |= POLLHUP;
            if !slot.ring.is_empty() {
                revents |= events & POLLIN;
            }
        }
    } else {
        if slot.readers == 0 {
            revents |= POLLERR | POLLHUP;
        } else if !slot.ring.is_full() {
            revents |= events & POLLOUT;
        }
    }
    revents
}

// =============================================================================
// Open-file table
// =============================================================================

#[derive(Clone, Copy, PartialEq, Eq)]
enum OpenKind {
    File,
    Directory,
    Device,
    PipeRead,
    PipeWrite,
}

#[derive(Clone, Copy)]
struct OpenFile {
    in_use: bool,
    refs: u32,
    kind: OpenKind,
    fs: Option<&'static dyn FileSystem>,
    inode: InodeId,
    offset: u64,
    status_flags: u32,
    pipe_id: u32,
}

impl OpenFile {
    const fn empty() -> Self {
        Self {
            in_use: false,
            refs: 0,
            kind: OpenKind::File,
            fs: None,
            inode: 0,
            offset: 0,
            status_flags: 0,
            pipe_id: INVALID_PIPE,
        }
    }
}

unsafe impl Send for OpenFile {}

static OPEN_FILES: IrqMutex<[OpenFile; MAX_OPEN_FILES]> =
    IrqMutex::new([OpenFile::empty(); MAX_OPEN_FILES]);

fn install_open_file(file: OpenFile) -> VfsResult<u32> {
    let mut files = OPEN_FILES.lock();
    for (idx, slot) in files.iter_mut().enumerate() {
        if !slot.in_use {
            *slot = file;
            slot.in_use = true;
            slot.refs = 1;
            return Ok(idx as u32);
        }
    }
    Err(VfsError::NoSpace)
}

fn file_add_ref(file_idx: u32) {
    let mut files = OPEN_FILES.lock();
    if let Some(slot) = files.get_mut(file_idx as usize) {
        if slot.in_use {
            slot.refs = slot.refs.saturating_add(1);
            if slot.pipe_id != INVALID_PIPE {
                pipe_ref_for_kind(slot.pipe_id, slot.kind, true);
            }
        }
    }
}

fn pipe_ref_for_kind(pipe_id: u32, kind: OpenKind, add: bool) {
    let write_end = kind == OpenKind::PipeWrite;
    if add {
        pipe_add_ref(pipe_id, write_end);
    } else {
        pipe_drop_ref(pipe_id, write_end);
    }
}

/// Drop one reference; the file object dies with the last one.
fn file_drop_ref(file_idx: u32) {
    let released = {
        let mut files = OPEN_FILES.lock();
        match files.get_mut(file_idx as usize) {
            Some(slot) if slot.in_use => {
                slot.refs = slot.refs.saturating_sub(1);
                if slot.refs == 0 {
                    let copy = *slot;
                    *slot = OpenFile::empty();
                    Some(copy)
                } else {
                    Some(*slot).filter(|s| s.pipe_id != INVALID_PIPE && s.refs > 0)
                }
            }
            _ => None,
        }
    };

    if let Some(file) = released {
        if file.pipe_id != INVALID_PIPE {
            pipe_ref_for_kind(file.pipe_id, file.kind, false);
        }
    }
}

fn file_snapshot(file_idx: u32) -> VfsResult<OpenFile> {
    let files = OPEN_FILES.lock();
    let slot = files
        .get(file_idx as usize)
        .ok_or(VfsError::BadFileDescriptor)?;
    if !slot.in_use {
        return Err(VfsError::BadFileDescriptor);
    }
    Ok(*slot)
}

fn file_set_offset(file_idx: u32, offset: u64) {
    let mut files = OPEN_FILES.lock();
    if let Some(slot) = files.get_mut(file_idx as usize) {
        if slot.in_use {
            slot.offset = offset;
        }
    }
}

fn file_set_status_flags(file_idx: u32, flags: u32) {
    let mut files = OPEN_FILES.lock();
    if let Some(slot) = files.get_mut(file_idx as usize) {
        if slot.in_use {
            slot.status_flags = (slot.status_flags & O_ACCMODE) | (flags & !O_ACCMODE);
        }
    }
}

// =============================================================================
// Per-process descriptor and cwd tables
// =============================================================================

#[derive(Clone, Copy)]
struct FdEntry {
    file: u32,
    cloexec: bool,
}

impl FdEntry {
    const fn empty() -> Self {
        Self {
            file: INVALID_FILE,
            cloexec: false,
        }
    }

    fn is_open(&self) -> bool {
        self.file != INVALID_FILE
    }
}

struct FdTable {
    in_use: bool,
    owner_count: u32,
    entries: [FdEntry; FD_TABLE_SIZE],
}

impl FdTable {
    const fn new() -> Self {
        Self {
            in_use: false,
            owner_count: 0,
            entries: [FdEntry::empty(); FD_TABLE_SIZE],
        }
    }
}

struct FsInfo {
    in_use: bool,
    owner_count: u32,
    cwd: [u8; MAX_PATH_LEN],
    cwd_len: usize,
}

impl FsInfo {
    const fn new() -> Self {
        Self {
            in_use: false,
            owner_count: 0,
            cwd: [0; MAX_PATH_LEN],
            cwd_len: 0,
        }
    }
}

#[derive(Clone, Copy)]
struct ProcBinding {
    pid: u32,
    fd_table: u16,
    fs_info: u16,
}

impl ProcBinding {
    const fn empty() -> Self {
        Self {
            pid: INVALID_PROCESS_ID,
            fd_table: u16::MAX,
            fs_info: u16::MAX,
        }
    }
}

struct FileioState {
    fd_tables: [FdTable; MAX_PROC_TABLES],
    fs_infos: [FsInfo; MAX_PROC_TABLES],
    bindings: [ProcBinding; MAX_PROC_TABLES],
}

static FILEIO: IrqMutex<FileioState> = IrqMutex::new(FileioState {
    fd_tables: [const { FdTable::new() }; MAX_PROC_TABLES],
    fs_infos: [const { FsInfo::new() }; MAX_PROC_TABLES],
    bindings: [ProcBinding::empty(); MAX_PROC_TABLES],
});

fn binding_index(state: &FileioState, pid: u32) -> Option<usize> {
    state.bindings.iter().position(|b| b.pid == pid)
}

fn console_open_file() -> VfsResult<OpenFile> {
    let inode = devfs::console_inode()?;
    Ok(OpenFile {
        in_use: true,
        refs: 1,
        kind: OpenKind::Device,
        fs: Some(devfs::devfs_instance()),
        inode,
        offset: 0,
        status_flags: ferrite_abi::fs::O_RDWR,
        pipe_id: INVALID_PIPE,
    })
}

/// Give `pid` fresh descriptor and cwd tables. Descriptors 0/1/2 are the
/// controlling terminal.
pub fn fileio_create_for_process(pid: u32) -> VfsResult<()> {
    let mut state = FILEIO.lock();
    if binding_index(&state, pid).is_some() {
        return Ok(());
    }

    let Some(fd_idx) = state.fd_tables.iter().position(|t| !t.in_use) else {
        return Err(VfsError::NoSpace);
    };
    let Some(fs_idx) = state.fs_infos.iter().position(|t| !t.in_use) else {
        return Err(VfsError::NoSpace);
    };
    let Some(binding_idx) = state
        .bindings
        .iter()
        .position(|b| b.pid == INVALID_PROCESS_ID)
    else {
        return Err(VfsError::NoSpace);
    };

    // stdin/stdout/stderr share one console file object (three refs).
    let console = install_open_file(console_open_file()?)?;
    file_add_ref(console);
    file_add_ref(console);

    let table = &mut state.fd_tables[fd_idx];
    table.in_use = true;
    table.owner_count = 1;
    table.entries = [FdEntry::empty(); FD_TABLE_SIZE];
    for fd in 0..3 {
        table.entries[fd] = FdEntry {
            file: console,
            cloexec: false,
        };
    }

    let info = &mut state.fs_infos[fs_idx];
    info.in_use = true;
    info.owner_count = 1;
    info.cwd[0] = b'/';
    info.cwd_len = 1;

    state.bindings[binding_idx] = ProcBinding {
        pid,
        fd_table: fd_idx as u16,
        fs_info: fs_idx as u16,
    };
    Ok(())
}

/// Bind `child` to `parent`'s tables: shared outright or copied, per the
/// clone share flags.
pub fn fileio_clone_for_process(
    parent: u32,
    child: u32,
    share_files: bool,
    share_fs: bool,
) -> VfsResult<()> {
    let mut state = FILEIO.lock();
    let parent_binding = binding_index(&state, parent).ok_or(VfsError::BadFileDescriptor)?;
    let parent_fd = state.bindings[parent_binding].fd_table as usize;
    let parent_fs = state.bindings[parent_binding].fs_info as usize;

    let fd_idx = if share_files {
        state.fd_tables[parent_fd].owner_count += 1;
        parent_fd
    } else {
        let Some(idx) = state.fd_tables.iter().position(|t| !t.in_use) else {
            return Err(VfsError::NoSpace);
        };
        let entries = state.fd_tables[parent_fd].entries;
        let table = &mut state.fd_tables[idx];
        table.in_use = true;
        table.owner_count = 1;
        table.entries = entries;
        // Every inherited descriptor is one more reference on its file.
        for entry in entries.iter() {
            if entry.is_open() {
                file_add_ref(entry.file);
            }
        }
        idx
    };

    let fs_idx = if share_fs {
        state.fs_infos[parent_fs].owner_count += 1;
        parent_fs
    } else {
        let Some(idx) = state.fs_infos.iter().position(|t| !t.in_use) else {
            return Err(VfsError::NoSpace);
        };
        let (cwd, cwd_len) = (state.fs_infos[parent_fs].cwd, state.fs_infos[parent_fs].cwd_len);
        let info = &mut state.fs_infos[idx];
        info.in_use = true;
        info.owner_count = 1;
        info.cwd = cwd;
        info.cwd_len = cwd_len;
        idx
    };

    let Some(binding_idx) = state
        .bindings
        .iter()
        .position(|b| b.pid == INVALID_PROCESS_ID)
    else {
        return Err(VfsError::NoSpace);
    };
    state.bindings[binding_idx] = ProcBinding {
        pid: child,
        fd_table: fd_idx as u16,
        fs_info: fs_idx as u16,
    };
    Ok(())
}

/// Exit path: close every descriptor the process still owns.
pub fn fileio_destroy_for_process(pid: u32) {
    let mut to_close: [u32; FD_TABLE_SIZE] = [INVALID_FILE; FD_TABLE_SIZE];
    {
        let mut state = FILEIO.lock();
        let Some(binding_idx) = binding_index(&state, pid) else {
            return;
        };
        let binding = state.bindings[binding_idx];
        state.bindings[binding_idx] = ProcBinding::empty();

        let fd_idx = binding.fd_table as usize;
        let table = &mut state.fd_tables[fd_idx];
        table.owner_count = table.owner_count.saturating_sub(1);
        if table.owner_count == 0 {
            for (fd, entry) in table.entries.iter().enumerate() {
                if entry.is_open() {
                    to_close[fd] = entry.file;
                }
            }
            *table = FdTable::new();
        }

        let fs_idx = binding.fs_info as usize;
        let info = &mut state.fs_infos[fs_idx];
        info.owner_count = info.owner_count.saturating_sub(1);
        if info.owner_count == 0 {
            *info = FsInfo::new();
        }
    }

    for file in to_close.iter() {
        if *file != INVALID_FILE {
            file_drop_ref(*file);
        }
    }
}

fn with_fd_table<R>(pid: u32, f: impl FnOnce(&mut FdTable) -> R) -> VfsResult<R> {
    let mut state = FILEIO.lock();
    let binding_idx = binding_index(&state, pid).ok_or(VfsError::BadFileDescriptor)?;
    let fd_idx = state.bindings[binding_idx].fd_table as usize;
    Ok(f(&mut state.fd_tables[fd_idx]))
}

fn lookup_fd(pid: u32, fd: i32) -> VfsResult<u32> {
    if fd < 0 || fd as usize >= FD_TABLE_SIZE {
        return Err(VfsError::BadFileDescriptor);
    }
    with_fd_table(pid, |table| {
        let entry = table.entries[fd as usize];
        if entry.is_open() {
            Ok(entry.file)
        } else {
            Err(VfsError::BadFileDescriptor)
        }
    })?
}

fn alloc_fd_slot(table: &mut FdTable, min_fd: usize) -> VfsResult<usize> {
    // Slots 0..3 are handed out only when explicitly freed; regular
    // allocation starts at 3.
    for fd in min_fd.max(3)..FD_TABLE_SIZE {
        if !table.entries[fd].is_open() {
            return Ok(fd);
        }
    }
    Err(VfsError::NoSpace)
}

// =============================================================================
// Descriptor operations
// =============================================================================

pub fn fileio_cwd(pid: u32, out: &mut [u8]) -> VfsResult<usize> {
    let state = FILEIO.lock();
    let binding_idx = binding_index(&state, pid).ok_or(VfsError::BadFileDescriptor)?;
    let info = &state.fs_infos[state.bindings[binding_idx].fs_info as usize];
    if out.len() < info.cwd_len {
        return Err(VfsError::NameTooLong);
    }
    out[..info.cwd_len].copy_from_slice(&info.cwd[..info.cwd_len]);
    Ok(info.cwd_len)
}

pub fn fileio_set_cwd(pid: u32, cwd: &[u8]) -> VfsResult<()> {
    if cwd.len() > MAX_PATH_LEN {
        return Err(VfsError::NameTooLong);
    }
    let mut state = FILEIO.lock();
    let binding_idx = binding_index(&state, pid).ok_or(VfsError::BadFileDescriptor)?;
    let fs_idx = state.bindings[binding_idx].fs_info as usize;
    let info = &mut state.fs_infos[fs_idx];
    info.cwd[..cwd.len()].copy_from_slice(cwd);
    info.cwd_len = cwd.len();
    Ok(())
}

fn cwd_copy(pid: u32) -> VfsResult<([u8; MAX_PATH_LEN], usize)> {
    let mut buf = [0u8; MAX_PATH_LEN];
    let len = fileio_cwd(pid, &mut buf)?;
    Ok((buf, len))
}

pub fn fd_open(pid: u32, path: &[u8], flags: u32) -> VfsResult<i32> {
    let (cwd, cwd_len) = cwd_copy(pid)?;
    let node = vfs::vfs_open(&cwd[..cwd_len], path, flags)?;

    let kind = match node.stat.file_type {
        FileType::Directory => OpenKind::Directory,
        FileType::CharDevice | FileType::BlockDevice => OpenKind::Device,
        FileType::Symlink => return Err(VfsError::TooManyLinks),
        _ => OpenKind::File,
    };
    if kind == OpenKind::Directory && flags & O_ACCMODE != O_RDONLY {
        return Err(VfsError::IsDirectory);
    }

    let offset = if flags & O_APPEND != 0 { node.stat.size } else { 0 };
    let file_idx = install_open_file(OpenFile {
        in_use: true,
        refs: 1,
        kind,
        fs: Some(node.fs),
        inode: node.inode,
        offset,
        status_flags: flags & !O_CLOEXEC,
        pipe_id: INVALID_PIPE,
    })?;

    let result = with_fd_table(pid, |table| {
        let fd = alloc_fd_slot(table, 0)?;
        table.entries[fd] = FdEntry {
            file: file_idx,
            cloexec: flags & O_CLOEXEC != 0,
        };
        Ok(fd as i32)
    })?;
    if result.is_err() {
        file_drop_ref(file_idx);
    }
    result
}

pub fn fd_close(pid: u32, fd: i32) -> VfsResult<()> {
    if fd < 0 || fd as usize >= FD_TABLE_SIZE {
        return Err(VfsError::BadFileDescriptor);
    }
    let file_idx = with_fd_table(pid, |table| {
        let entry = table.entries[fd as usize];
        if !entry.is_open() {
            return Err(VfsError::BadFileDescriptor);
        }
        table.entries[fd as usize] = FdEntry::empty();
        Ok(entry.file)
    })??;
    file_drop_ref(file_idx);
    Ok(())
}

pub fn fd_read(pid: u32, fd: i32, buf: &mut [u8]) -> VfsResult<usize> {
    let file_idx = lookup_fd(pid, fd)?;
    let file = file_snapshot(file_idx)?;

    if file.status_flags & O_ACCMODE == O_WRONLY && file.kind != OpenKind::PipeWrite {
        return Err(VfsError::PermissionDenied);
    }

    match file.kind {
        OpenKind::Directory => Err(VfsError::IsDirectory),
        OpenKind::PipeWrite => Err(VfsError::BadFileDescriptor),
        OpenKind::PipeRead => pipe_read(file.pipe_id, file.status_flags, buf),
        OpenKind::Device => {
            let fs = file.fs.ok_or(VfsError::BadFileDescriptor)?;
            fs.read(file.inode, 0, buf)
        }
        OpenKind::File => {
            let fs = file.fs.ok_or(VfsError::BadFileDescriptor)?;
            let n = fs.read(file.inode, file.offset, buf)?;
            file_set_offset(file_idx, file.offset + n as u64);
            Ok(n)
        }
    }
}

pub fn fd_write(pid: u32, fd: i32, buf: &[u8]) -> VfsResult<usize> {
    let file_idx = lookup_fd(pid, fd)?;
    let file = file_snapshot(file_idx)?;

    if file.status_flags & O_ACCMODE == O_RDONLY
        && !matches!(file.kind, OpenKind::Device | OpenKind::PipeRead)
    {
        return Err(VfsError::PermissionDenied);
    }

    match file.kind {
        OpenKind::Directory => Err(VfsError::IsDirectory),
        OpenKind::PipeRead => Err(VfsError::BadFileDescriptor),
        OpenKind::PipeWrite => pipe_write(file.pipe_id, file.status_flags, buf),
        OpenKind::Device => {
            let fs = file.fs.ok_or(VfsError::BadFileDescriptor)?;
            fs.write(file.inode, 0, buf)
        }
        OpenKind::File => {
            let fs = file.fs.ok_or(VfsError::BadFileDescriptor)?;
            let offset = if file.status_flags & O_APPEND != 0 {
                fs.stat(file.inode)?.size
            } else {
                file.offset
            };
            let n = fs.write(file.inode, offset, buf)?;
            file_set_offset(file_idx, offset + n as u64);
            Ok(n)
        }
    }
}

/// lseek: regular files and directories only; pipes and devices ESPIPE.
pub fn fd_lseek(pid: u32, fd: i32, offset: i64, whence: u32) -> VfsResult<u64> {
    let file_idx = lookup_fd(pid, fd)?;
    let file = file_snapshot(file_idx)?;

    let base: i64 = match file.kind {
        OpenKind::File | OpenKind::Directory => match whence {
            SEEK_SET => 0,
            SEEK_CUR => file.offset as i64,
            SEEK_END => {
                let fs = file.fs.ok_or(VfsError::BadFileDescriptor)?;
                fs.stat(file.inode)?.size as i64
            }
            _ => return Err(VfsError::InvalidArgument),
        },
        _ => return Err(VfsError::InvalidArgument), // ESPIPE at the syscall layer
    };

    let target = base.checked_add(offset).ok_or(VfsError::InvalidArgument)?;
    if target < 0 {
        return Err(VfsError::InvalidArgument);
    }
    file_set_offset(file_idx, target as u64);
    Ok(target as u64)
}

/// True if the fd names a seekable object (drives ESPIPE vs EINVAL).
pub fn fd_is_seekable(pid: u32, fd: i32) -> bool {
    match lookup_fd(pid, fd).and_then(file_snapshot) {
        Ok(file) => matches!(file.kind, OpenKind::File | OpenKind::Directory),
        Err(_) => false,
    }
}

pub fn fd_fstat(pid: u32, fd: i32) -> VfsResult<FileStat> {
    let file_idx = lookup_fd(pid, fd)?;
    let file = file_snapshot(file_idx)?;

    match file.kind {
        OpenKind::PipeRead | OpenKind::PipeWrite => {
            let mut stat = FileStat::new_file(0, 0);
            stat.file_type = FileType::Pipe;
            stat.mode = 0o600;
            Ok(stat)
        }
        _ => {
            let fs = file.fs.ok_or(VfsError::BadFileDescriptor)?;
            fs.stat(file.inode)
        }
    }
}

/// Pack directory entries into `out` as `{ino, reclen, type, name}`
/// records. The open file's offset is the entry index.
pub fn fd_getdents(pid: u32, fd: i32, out: &mut [u8]) -> VfsResult<usize> {
    let file_idx = lookup_fd(pid, fd)?;
    let file = file_snapshot(file_idx)?;
    if file.kind != OpenKind::Directory {
        return Err(VfsError::NotDirectory);
    }
    let fs = file.fs.ok_or(VfsError::BadFileDescriptor)?;

    let mut written = 0usize;
    let mut consumed = 0usize;
    fs.readdir(file.inode, file.offset as usize, &mut |name, inode, ftype| {
        let reclen = dirent_reclen(name.len());
        if written + reclen > out.len() {
            return false;
        }
        let header = UserDirentHeader {
            d_ino: inode,
            d_reclen: reclen as u16,
            d_type: ftype.dirent_type(),
            _pad: [0; 5],
        };
        // SAFETY: bounds checked above; header is plain bytes.
        unsafe {
            core::ptr::copy_nonoverlapping(
                &header as *const UserDirentHeader as *const u8,
                out.as_mut_ptr().add(written),
                DIRENT_HEADER_SIZE,
            );
        }
        let name_off = written + DIRENT_HEADER_SIZE;
        out[name_off..name_off + name.len()].copy_from_slice(name);
        out[name_off + name.len()] = 0;
        for pad in name_off + name.len() + 1..written + reclen {
            out[pad] = 0;
        }
        written += reclen;
        consumed += 1;
        true
    })?;

    file_set_offset(file_idx, file.offset + consumed as u64);
    Ok(written)
}

pub fn fd_dup(pid: u32, fd: i32, min_fd: i32) -> VfsResult<i32> {
    if min_fd < 0 {
        return Err(VfsError::InvalidArgument);
    }
    let file_idx = lookup_fd(pid, fd)?;
    let new_fd = with_fd_table(pid, |table| {
        let new_fd = alloc_fd_slot(table, min_fd as usize)?;
        table.entries[new_fd] = FdEntry {
            file: file_idx,
            cloexec: false,
        };
        Ok(new_fd as i32)
    })??;
    file_add_ref(file_idx);
    Ok(new_fd)
}

pub fn fd_dup2(pid: u32, old_fd: i32, new_fd: i32, cloexec: bool) -> VfsResult<i32> {
    if new_fd < 0 || new_fd as usize >= FD_TABLE_SIZE {
        return Err(VfsError::BadFileDescriptor);
    }
    let file_idx = lookup_fd(pid, old_fd)?;
    if old_fd == new_fd {
        return Ok(new_fd);
    }

    let closed = with_fd_table(pid, |table| {
        let previous = table.entries[new_fd as usize];
        table.entries[new_fd as usize] = FdEntry {
            file: file_idx,
            cloexec,
        };
        previous
    })?;
    file_add_ref(file_idx);
    if closed.is_open() {
        file_drop_ref(closed.file);
    }
    Ok(new_fd)
}

pub fn fd_fcntl(pid: u32, fd: i32, cmd: u32, arg: u64) -> VfsResult<u64> {
    let file_idx = lookup_fd(pid, fd)?;
    match cmd {
        F_DUPFD => fd_dup(pid, fd, arg as i32).map(|fd| fd as u64),
        F_GETFD => with_fd_table(pid, |table| {
            Ok(if table.entries[fd as usize].cloexec {
                FD_CLOEXEC as u64
            } else {
                0
            })
        })?,
        F_SETFD => with_fd_table(pid, |table| {
            table.entries[fd as usize].cloexec = arg as u32 & FD_CLOEXEC != 0;
            Ok(0)
        })?,
        F_GETFL => Ok(file_snapshot(file_idx)?.status_flags as u64),
        F_SETFL => {
            file_set_status_flags(file_idx, arg as u32);
            Ok(0)
        }
        _ => Err(VfsError::InvalidArgument),
    }
}

pub fn fd_ioctl(pid: u32, fd: i32, cmd: u32, arg: u64) -> VfsResult<u64> {
    let file_idx = lookup_fd(pid, fd)?;
    let file = file_snapshot(file_idx)?;
    match file.kind {
        OpenKind::Device => {
            let fs = file.fs.ok_or(VfsError::BadFileDescriptor)?;
            fs.ioctl(file.inode, cmd, arg)
        }
        _ => Err(VfsError::NotTty),
    }
}

/// Create a pipe; returns `(read_fd, write_fd)`. `flags` accepts
/// O_CLOEXEC and O_NONBLOCK.
pub fn fd_pipe(pid: u32, flags: u32) -> VfsResult<(i32, i32)> {
    let pipe_id = alloc_pipe().ok_or(VfsError::NoSpace)?;
    let status = flags & O_NONBLOCK;
    let cloexec = flags & O_CLOEXEC != 0;

    let read_file = install_open_file(OpenFile {
        in_use: true,
        refs: 1,
        kind: OpenKind::PipeRead,
        fs: None,
        inode: 0,
        offset: 0,
        status_flags: O_RDONLY | status,
        pipe_id,
    });
    let read_file = match read_file {
        Ok(idx) => idx,
        Err(err) => {
            pipe_drop_ref(pipe_id, false);
            pipe_drop_ref(pipe_id, true);
            return Err(err);
        }
    };
    let write_file = install_open_file(OpenFile {
        in_use: true,
        refs: 1,
        kind: OpenKind::PipeWrite,
        fs: None,
        inode: 0,
        offset: 0,
        status_flags: O_WRONLY | status,
        pipe_id,
    });
    let write_file = match write_file {
        Ok(idx) => idx,
        Err(err) => {
            file_drop_ref(read_file);
            pipe_drop_ref(pipe_id, true);
            return Err(err);
        }
    };

    let fds = with_fd_table(pid, |table| {
        let read_fd = alloc_fd_slot(table, 0)?;
        table.entries[read_fd] = FdEntry {
            file: read_file,
            cloexec,
        };
        let write_fd = match alloc_fd_slot(table, 0) {
            Ok(fd) => fd,
            Err(err) => {
                table.entries[read_fd] = FdEntry::empty();
                return Err(err);
            }
        };
        table.entries[write_fd] = FdEntry {
            file: write_file,
            cloexec,
        };
        Ok((read_fd as i32, write_fd as i32))
    })?;

    match fds {
        Ok(pair) => Ok(pair),
        Err(err) => {
            file_drop_ref(read_file);
            file_drop_ref(write_file);
            Err(err)
        }
    }
}

/// Poll readiness of one descriptor. Invalid fds report POLLNVAL.
pub fn fd_poll_revents(pid: u32, fd: i32, events: u16) -> u16 {
    let Ok(file_idx) = lookup_fd(pid, fd) else {
        return POLLNVAL;
    };
    let Ok(file) = file_snapshot(file_idx) else {
        return POLLNVAL;
    };

    match file.kind {
        OpenKind::PipeRead => pipe_revents(file.pipe_id, false, events),
        OpenKind::PipeWrite => pipe_revents(file.pipe_id, true, events),
        OpenKind::Device => {
            let Some(fs) = file.fs else {
                return POLLNVAL;
            };
            fs.poll(file.inode, events).unwrap_or(POLLERR)
        }
        // Regular files and directories are always ready.
        _ => events & (POLLIN | POLLOUT),
    }
}

/// exec: close every descriptor whose close-on-exec flag is set.
pub fn fileio_close_cloexec(pid: u32) {
    let mut to_close: [u32; FD_TABLE_SIZE] = [INVALID_FILE; FD_TABLE_SIZE];
    let _ = with_fd_table(pid, |table| {
        for (fd, entry) in table.entries.iter_mut().enumerate() {
            if entry.is_open() && entry.cloexec {
                to_close[fd] = entry.file;
                *entry = FdEntry::empty();
            }
        }
    });
    for file in to_close.iter() {
        if *file != INVALID_FILE {
            file_drop_ref(*file);
        }
    }
    klog_debug!("fileio: cloexec sweep for pid {}", pid);
}
