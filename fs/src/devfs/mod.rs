//! Device filesystem.
//!
//! Char/block device nodes behind the uniform node interface. The concrete
//! drivers live outside the core and register a [`DeviceOps`] table here;
//! `null`, `zero`, and the serial `console` are built in. The console node
//! carries the line input ring, the foreground process group, and raises
//! the job-control signals on Ctrl-C / Ctrl-Z / Ctrl-\.

use core::sync::atomic::{AtomicU32, Ordering};

use ferrite_abi::fs::{POLLIN, POLLOUT};
use ferrite_abi::signal::{SIGINT, SIGQUIT, SIGTSTP};
use ferrite_lib::{IrqMutex, OnceLock, RingBuffer, WaitQueue};

use crate::MAX_NAME_LEN;
use crate::vfs::{FileStat, FileSystem, FileType, InodeId, VfsError, VfsResult};

// Terminal ioctls: the only way to reach terminal parameters.
pub const TIOCGPGRP: u32 = 0x540F;
pub const TIOCSPGRP: u32 = 0x5410;
pub const TIOCGWINSZ: u32 = 0x5413;

/// Winsize packed as `rows << 16 | cols` in the ioctl return value.
pub const CONSOLE_ROWS: u16 = 25;
pub const CONSOLE_COLS: u16 = 80;

/// Operations a driver provides for its device nodes.
pub struct DeviceOps {
    pub read: Option<fn(minor: u32, offset: u64, buf: &mut [u8]) -> VfsResult<usize>>,
    pub write: Option<fn(minor: u32, offset: u64, buf: &[u8]) -> VfsResult<usize>>,
    pub poll: Option<fn(minor: u32, events: u16) -> u16>,
    /// `arg` semantics are per-ioctl plain values; pointer-typed ioctls are
    /// marshalled by the syscall layer before and after this call.
    pub ioctl: Option<fn(minor: u32, cmd: u32, arg: u64) -> VfsResult<u64>>,
}

#[derive(Clone, Copy)]
struct DevNode {
    in_use: bool,
    name: [u8; MAX_NAME_LEN],
    name_len: usize,
    kind: FileType,
    major: u32,
    minor: u32,
    ops: Option<&'static DeviceOps>,
}

impl DevNode {
    const fn empty() -> Self {
        Self {
            in_use: false,
            name: [0; MAX_NAME_LEN],
            name_len: 0,
            kind: FileType::CharDevice,
            major: 0,
            minor: 0,
            ops: None,
        }
    }
}

const MAX_DEV_NODES: usize = 16;
const ROOT_INODE: InodeId = 1;
const NODE_INODE_BASE: InodeId = 2;

pub struct DevFs {
    nodes: IrqMutex<[DevNode; MAX_DEV_NODES]>,
}

static DEVFS: DevFs = DevFs {
    nodes: IrqMutex::new([DevNode::empty(); MAX_DEV_NODES]),
};

pub fn devfs_instance() -> &'static DevFs {
    &DEVFS
}

impl DevFs {
    /// Register a device node. Drivers call this during probe.
    pub fn register(
        &self,
        name: &[u8],
        kind: FileType,
        major: u32,
        minor: u32,
        ops: &'static DeviceOps,
    ) -> VfsResult<()> {
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return Err(VfsError::NameTooLong);
        }
        if kind != FileType::CharDevice && kind != FileType::BlockDevice {
            return Err(VfsError::InvalidArgument);
        }
        let mut nodes = self.nodes.lock();
        if nodes
            .iter()
            .any(|n| n.in_use && &n.name[..n.name_len] == name)
        {
            return Err(VfsError::AlreadyExists);
        }
        let slot = nodes
            .iter_mut()
            .find(|n| !n.in_use)
            .ok_or(VfsError::NoSpace)?;
        slot.in_use = true;
        slot.name[..name.len()].copy_from_slice(name);
        slot.name_len = name.len();
        slot.kind = kind;
        slot.major = major;
        slot.minor = minor;
        slot.ops = Some(ops);
        Ok(())
    }

    fn node(&self, inode: InodeId) -> VfsResult<DevNode> {
        if inode < NODE_INODE_BASE {
            return Err(VfsError::NotFound);
        }
        let idx = (inode - NODE_INODE_BASE) as usize;
        let nodes = self.nodes.lock();
        let node = nodes.get(idx).ok_or(VfsError::NotFound)?;
        if !node.in_use {
            return Err(VfsError::NotFound);
        }
        Ok(*node)
    }
}

impl FileSystem for DevFs {
    fn name(&self) -> &'static str {
        "devfs"
    }

    fn root_inode(&self) -> InodeId {
        ROOT_INODE
    }

    fn lookup(&self, parent: InodeId, name: &[u8]) -> VfsResult<InodeId> {
        if parent != ROOT_INODE {
            return Err(VfsError::NotDirectory);
        }
        if name == b"." || name == b".." {
            return Ok(ROOT_INODE);
        }
        let nodes = self.nodes.lock();
        for (idx, node) in nodes.iter().enumerate() {
            if node.in_use && &node.name[..node.name_len] == name {
                return Ok(NODE_INODE_BASE + idx as InodeId);
            }
        }
        Err(VfsError::NotFound)
    }

    fn stat(&self, inode: InodeId) -> VfsResult<FileStat> {
        if inode == ROOT_INODE {
            return Ok(FileStat::new_directory(ROOT_INODE));
        }
        let node = self.node(inode)?;
        let mut stat = FileStat::new_char_device(inode, node.major, node.minor);
        stat.file_type = node.kind;
        Ok(stat)
    }

    fn read(&self, inode: InodeId, offset: u64, buf: &mut [u8]) -> VfsResult<usize> {
        let node = self.node(inode)?;
        let ops = node.ops.ok_or(VfsError::NotSupported)?;
        match ops.read {
            Some(read) => read(node.minor, offset, buf),
            None => Err(VfsError::NotSupported),
        }
    }

    fn write(&self, inode: InodeId, offset: u64, buf: &[u8]) -> VfsResult<usize> {
        let node = self.node(inode)?;
        let ops = node.ops.ok_or(VfsError::NotSupported)?;
        match ops.write {
            Some(write) => write(node.minor, offset, buf),
            None => Err(VfsError::NotSupported),
        }
    }

    fn readdir(
        &self,
        inode: InodeId,
        offset: usize,
        callback: &mut dyn FnMut(&[u8], InodeId, FileType) -> bool,
    ) -> VfsResult<usize> {
        if inode != ROOT_INODE {
            return Err(VfsError::NotDirectory);
        }

        // Synthesise `.` and `..` ahead of the registered nodes.
        let nodes = self.nodes.lock();
        let mut emitted = 0usize;
        let mut index = 0usize;

        for (name, node_inode) in [(b".".as_slice(), ROOT_INODE), (b"..".as_slice(), ROOT_INODE)] {
            if index >= offset {
                emitted += 1;
                if !callback(name, node_inode, FileType::Directory) {
                    return Ok(emitted);
                }
            }
            index += 1;
        }

        for (idx, node) in nodes.iter().enumerate() {
            if !node.in_use {
                continue;
            }
            if index >= offset {
                emitted += 1;
                if !callback(
                    &node.name[..node.name_len],
                    NODE_INODE_BASE + idx as InodeId,
                    node.kind,
                ) {
                    break;
                }
            }
            index += 1;
        }
        Ok(emitted)
    }

    fn poll(&self, inode: InodeId, events: u16) -> VfsResult<u16> {
        let node = self.node(inode)?;
        let ops = node.ops.ok_or(VfsError::NotSupported)?;
        Ok(match ops.poll {
            Some(poll) => poll(node.minor, events),
            // No poll op: always ready.
            None => events,
        })
    }

    fn ioctl(&self, inode: InodeId, cmd: u32, arg: u64) -> VfsResult<u64> {
        let node = self.node(inode)?;
        let ops = node.ops.ok_or(VfsError::NotTty)?;
        match ops.ioctl {
            Some(ioctl) => ioctl(node.minor, cmd, arg),
            None => Err(VfsError::NotTty),
        }
    }
}

// =============================================================================
// Built-in devices
// =============================================================================

fn null_read(_minor: u32, _offset: u64, _buf: &mut [u8]) -> VfsResult<usize> {
    Ok(0)
}

fn null_write(_minor: u32, _offset: u64, buf: &[u8]) -> VfsResult<usize> {
    Ok(buf.len())
}

static NULL_OPS: DeviceOps = DeviceOps {
    read: Some(null_read),
    write: Some(null_write),
    poll: None,
    ioctl: None,
};

fn zero_read(_minor: u32, _offset: u64, buf: &mut [u8]) -> VfsResult<usize> {
    buf.fill(0);
    Ok(buf.len())
}

static ZERO_OPS: DeviceOps = DeviceOps {
    read: Some(zero_read),
    write: Some(null_write),
    poll: None,
    ioctl: None,
};

// --- console ---------------------------------------------------------------

const CONSOLE_INPUT_CAPACITY: usize = 256;

static CONSOLE_INPUT: IrqMutex<RingBuffer<CONSOLE_INPUT_CAPACITY>> =
    IrqMutex::new(RingBuffer::new());
static CONSOLE_WQ: WaitQueue = WaitQueue::new();
static FOREGROUND_PGRP: AtomicU32 = AtomicU32::new(0);

/// Registered by the process core; used for Ctrl-C style group signals.
static TTY_SIGNAL_HOOK: OnceLock<fn(pgid: u32, signum: u8)> = OnceLock::new();

pub fn register_tty_signal_hook(hook: fn(u32, u8)) {
    let _ = TTY_SIGNAL_HOOK.set(hook);
}

/// Entry point for the (out-of-scope) keyboard/serial driver: feed one
/// input byte to the console. Control characters turn into signals for
/// the foreground process group.
pub fn console_input_push(byte: u8) {
    let signal = match byte {
        0x03 => Some(SIGINT),  // Ctrl-C
        0x1A => Some(SIGTSTP), // Ctrl-Z
        0x1C => Some(SIGQUIT), // Ctrl-\
        _ => None,
    };
    if let Some(signum) = signal {
        let pgid = FOREGROUND_PGRP.load(Ordering::Acquire);
        if pgid != 0 {
            if let Some(hook) = TTY_SIGNAL_HOOK.get() {
                hook(pgid, signum);
            }
        }
        return;
    }

    CONSOLE_INPUT.lock().push_byte(byte);
    CONSOLE_WQ.wake_all();
    crate::fileio::poll_wakeup();
}

pub fn console_input_available() -> bool {
    !CONSOLE_INPUT.lock().is_empty()
}

pub fn console_foreground_pgrp() -> u32 {
    FOREGROUND_PGRP.load(Ordering::Acquire)
}

fn console_read(_minor: u32, _offset: u64, buf: &mut [u8]) -> VfsResult<usize> {
    if buf.is_empty() {
        return Ok(0);
    }
    let outcome = CONSOLE_WQ.wait_event(console_input_available);
    if outcome == ferrite_lib::WaitOutcome::Interrupted {
        return Err(VfsError::Interrupted);
    }
    Ok(CONSOLE_INPUT.lock().pop_slice(buf))
}

fn console_write(_minor: u32, _offset: u64, buf: &[u8]) -> VfsResult<usize> {
    ferrite_lib::serial::write_bytes(buf);
    Ok(buf.len())
}

fn console_poll(_minor: u32, events: u16) -> u16 {
    let mut revents = events & POLLOUT;
    if events & POLLIN != 0 && console_input_available() {
        revents |= POLLIN;
    }
    revents
}

fn console_ioctl(_minor: u32, cmd: u32, arg: u64) -> VfsResult<u64> {
    match cmd {
        TIOCGPGRP => Ok(FOREGROUND_PGRP.load(Ordering::Acquire) as u64),
        TIOCSPGRP => {
            FOREGROUND_PGRP.store(arg as u32, Ordering::Release);
            Ok(0)
        }
        TIOCGWINSZ => Ok(((CONSOLE_ROWS as u64) << 16) | CONSOLE_COLS as u64),
        _ => Err(VfsError::NotTty),
    }
}

static CONSOLE_OPS: DeviceOps = DeviceOps {
    read: Some(console_read),
    write: Some(console_write),
    poll: Some(console_poll),
    ioctl: Some(console_ioctl),
};

/// Register the built-in nodes. Called once from VFS init.
pub fn devfs_register_builtin() {
    let devfs = devfs_instance();
    let _ = devfs.register(b"null", FileType::CharDevice, 1, 3, &NULL_OPS);
    let _ = devfs.register(b"zero", FileType::CharDevice, 1, 5, &ZERO_OPS);
    let _ = devfs.register(b"console", FileType::CharDevice, 5, 1, &CONSOLE_OPS);
}

/// Inode of the console node, used to wire fds 0/1/2.
pub fn console_inode() -> VfsResult<InodeId> {
    devfs_instance().lookup(ROOT_INODE, b"console")
}
