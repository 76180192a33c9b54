//! Filesystem test suites: path normalisation, mount resolution, ramfs
//! semantics, descriptor-layer behaviour.

use ferrite_lib::testing::TestResult;
use ferrite_lib::{define_test_suite, fail, pass, test_expect};

use crate::ramfs::ramfs_instance;
use crate::vfs::path::normalize;
use crate::vfs::{FileSystem, FileType, VfsError};

// =============================================================================
// Path normalisation
// =============================================================================

fn test_normalize_collapses_dots_and_slashes() -> TestResult {
    let n = match normalize(b"/", b"/a//b/./c") {
        Ok(n) => n,
        Err(_) => return fail!("normalize failed"),
    };
    test_expect!(n.as_bytes() == b"/a/b/c");
    pass!()
}

fn test_normalize_resolves_dotdot() -> TestResult {
    let n = match normalize(b"/", b"/a/b/../c") {
        Ok(n) => n,
        Err(_) => return fail!("normalize failed"),
    };
    test_expect!(n.as_bytes() == b"/a/c");
    pass!()
}

fn test_normalize_clamps_dotdot_at_root() -> TestResult {
    let n = match normalize(b"/", b"/../../etc") {
        Ok(n) => n,
        Err(_) => return fail!("normalize failed"),
    };
    test_expect!(n.as_bytes() == b"/etc");
    pass!()
}

fn test_normalize_relative_uses_cwd() -> TestResult {
    let n = match normalize(b"/home/user", b"docs/file.txt") {
        Ok(n) => n,
        Err(_) => return fail!("normalize failed"),
    };
    test_expect!(n.as_bytes() == b"/home/user/docs/file.txt");

    let up = match normalize(b"/home/user", b"../other") {
        Ok(n) => n,
        Err(_) => return fail!("normalize failed"),
    };
    test_expect!(up.as_bytes() == b"/home/other");
    pass!()
}

// =============================================================================
// ramfs
// =============================================================================

fn test_ramfs_create_write_read() -> TestResult {
    let fs = ramfs_instance();
    let root = fs.root_inode();

    let inode = match fs.create(root, b"notes.txt", FileType::Regular) {
        Ok(i) => i,
        Err(_) => return fail!("create failed"),
    };
    test_expect!(fs.write(inode, 0, b"hello world") == Ok(11));

    let mut buf = [0u8; 32];
    test_expect!(fs.read(inode, 0, &mut buf) == Ok(11));
    test_expect!(&buf[..11] == b"hello world");

    // Offset read hits the tail.
    test_expect!(fs.read(inode, 6, &mut buf) == Ok(5));
    test_expect!(&buf[..5] == b"world");

    test_expect!(fs.unlink(root, b"notes.txt").is_ok());
    test_expect!(fs.lookup(root, b"notes.txt") == Err(VfsError::NotFound));
    pass!()
}

fn test_ramfs_write_gap_zero_fills() -> TestResult {
    let fs = ramfs_instance();
    let root = fs.root_inode();
    let inode = match fs.create(root, b"gap.bin", FileType::Regular) {
        Ok(i) => i,
        Err(_) => return fail!("create failed"),
    };

    test_expect!(fs.write(inode, 0, b"ab") == Ok(2));
    // Write past EOF: the gap reads back as zeroes.
    test_expect!(fs.write(inode, 10, b"cd") == Ok(2));

    let mut buf = [0xFFu8; 12];
    test_expect!(fs.read(inode, 0, &mut buf) == Ok(12));
    test_expect!(&buf[..2] == b"ab");
    test_expect!(buf[2..10].iter().all(|&b| b == 0));
    test_expect!(&buf[10..12] == b"cd");

    let _ = fs.unlink(root, b"gap.bin");
    pass!()
}

fn test_ramfs_mkdir_rmdir_roundtrip() -> TestResult {
    let fs = ramfs_instance();
    let root = fs.root_inode();

    let dir = match fs.create(root, b"testdir", FileType::Directory) {
        Ok(i) => i,
        Err(_) => return fail!("mkdir failed"),
    };
    // A fresh directory holds exactly `.` and `..`, pointing right.
    test_expect!(fs.lookup(dir, b".") == Ok(dir));
    test_expect!(fs.lookup(dir, b"..") == Ok(root));

    // Non-empty directories refuse to die.
    let child = match fs.create(dir, b"inner", FileType::Regular) {
        Ok(i) => i,
        Err(_) => return fail!("create in dir failed"),
    };
    let _ = child;
    test_expect!(fs.rmdir(root, b"testdir") == Err(VfsError::NotEmpty));

    test_expect!(fs.unlink(dir, b"inner").is_ok());
    test_expect!(fs.rmdir(root, b"testdir").is_ok());
    test_expect!(fs.lookup(root, b"testdir") == Err(VfsError::NotFound));
    pass!()
}

fn test_ramfs_rename_preserves_inode() -> TestResult {
    let fs = ramfs_instance();
    let root = fs.root_inode();

    let inode = match fs.create(root, b"before", FileType::Regular) {
        Ok(i) => i,
        Err(_) => return fail!("create failed"),
    };
    test_expect!(fs.write(inode, 0, b"payload") == Ok(7));

    test_expect!(fs.rename(root, b"before", root, b"after").is_ok());
    test_expect!(fs.lookup(root, b"before") == Err(VfsError::NotFound));
    test_expect!(fs.lookup(root, b"after") == Ok(inode));

    let mut buf = [0u8; 8];
    test_expect!(fs.read(inode, 0, &mut buf) == Ok(7));
    test_expect!(&buf[..7] == b"payload");

    let _ = fs.unlink(root, b"after");
    pass!()
}

fn test_ramfs_readdir_visits_each_entry_once() -> TestResult {
    let fs = ramfs_instance();
    let root = fs.root_inode();
    let dir = match fs.create(root, b"lsdir", FileType::Directory) {
        Ok(i) => i,
        Err(_) => return fail!("mkdir failed"),
    };
    for name in [b"one".as_slice(), b"two".as_slice(), b"three".as_slice()] {
        if fs.create(dir, name, FileType::Regular).is_err() {
            return fail!("create failed");
        }
    }

    // Walk in two batches using the entry-index offset; every entry must
    // show up exactly once, including `.` and `..`.
    let mut seen_dot = 0;
    let mut seen_dotdot = 0;
    let mut seen_files = 0;
    let mut offset = 0usize;
    loop {
        let mut batch = 0usize;
        let visited = fs
            .readdir(dir, offset, &mut |name, _inode, _t| {
                match name {
                    b"." => seen_dot += 1,
                    b".." => seen_dotdot += 1,
                    _ => seen_files += 1,
                }
                batch += 1;
                batch < 2
            })
            .unwrap_or(0);
        if visited == 0 {
            break;
        }
        offset += visited;
    }
    test_expect!(seen_dot == 1, "`.` seen {} times", seen_dot);
    test_expect!(seen_dotdot == 1);
    test_expect!(seen_files == 3);

    for name in [b"one".as_slice(), b"two".as_slice(), b"three".as_slice()] {
        let _ = fs.unlink(dir, name);
    }
    let _ = fs.rmdir(root, b"lsdir");
    pass!()
}

fn test_ramfs_symlink_readlink() -> TestResult {
    let fs = ramfs_instance();
    let root = fs.root_inode();

    let link = match fs.symlink(root, b"lnk", b"/tmp") {
        Ok(i) => i,
        Err(_) => return fail!("symlink failed"),
    };
    let mut target = [0u8; 16];
    test_expect!(fs.readlink(link, &mut target) == Ok(4));
    test_expect!(&target[..4] == b"/tmp");

    let _ = fs.unlink(root, b"lnk");
    pass!()
}

fn test_ramfs_truncate() -> TestResult {
    let fs = ramfs_instance();
    let root = fs.root_inode();
    let inode = match fs.create(root, b"trunc", FileType::Regular) {
        Ok(i) => i,
        Err(_) => return fail!("create failed"),
    };
    test_expect!(fs.write(inode, 0, b"0123456789") == Ok(10));
    test_expect!(fs.truncate(inode, 4).is_ok());
    match fs.stat(inode) {
        Ok(stat) => test_expect!(stat.size == 4),
        Err(_) => return fail!("stat failed"),
    }
    let mut buf = [0u8; 10];
    test_expect!(fs.read(inode, 0, &mut buf) == Ok(4));
    test_expect!(&buf[..4] == b"0123");

    let _ = fs.unlink(root, b"trunc");
    pass!()
}

// =============================================================================
// devfs
// =============================================================================

fn test_devfs_null_and_zero() -> TestResult {
    use crate::devfs::devfs_instance;
    let devfs = devfs_instance();
    let root = devfs.root_inode();

    let null = match devfs.lookup(root, b"null") {
        Ok(i) => i,
        Err(_) => return fail!("null missing"),
    };
    let mut buf = [0xAAu8; 8];
    test_expect!(devfs.read(null, 0, &mut buf) == Ok(0));
    test_expect!(devfs.write(null, 0, b"discard") == Ok(7));

    let zero = match devfs.lookup(root, b"zero") {
        Ok(i) => i,
        Err(_) => return fail!("zero missing"),
    };
    test_expect!(devfs.read(zero, 0, &mut buf) == Ok(8));
    test_expect!(buf.iter().all(|&b| b == 0));
    pass!()
}

fn test_devfs_console_ioctl() -> TestResult {
    use crate::devfs::{TIOCGPGRP, TIOCGWINSZ, TIOCSPGRP, devfs_instance};
    let devfs = devfs_instance();
    let root = devfs.root_inode();
    let console = match devfs.lookup(root, b"console") {
        Ok(i) => i,
        Err(_) => return fail!("console missing"),
    };

    test_expect!(devfs.ioctl(console, TIOCSPGRP, 42).is_ok());
    test_expect!(devfs.ioctl(console, TIOCGPGRP, 0) == Ok(42));

    match devfs.ioctl(console, TIOCGWINSZ, 0) {
        Ok(packed) => {
            test_expect!((packed >> 16) as u16 > 0);
            test_expect!(packed as u16 > 0);
        }
        Err(_) => return fail!("winsize ioctl failed"),
    }
    // Unknown ioctl on a tty is still ENOTTY.
    test_expect!(devfs.ioctl(console, 0xDEAD, 0) == Err(VfsError::NotTty));
    pass!()
}

define_test_suite!(
    fs_paths,
    [
        test_normalize_collapses_dots_and_slashes,
        test_normalize_resolves_dotdot,
        test_normalize_clamps_dotdot_at_root,
        test_normalize_relative_uses_cwd,
    ]
);

define_test_suite!(
    fs_ramfs,
    [
        test_ramfs_create_write_read,
        test_ramfs_write_gap_zero_fills,
        test_ramfs_mkdir_rmdir_roundtrip,
        test_ramfs_rename_preserves_inode,
        test_ramfs_readdir_visits_each_entry_once,
        test_ramfs_symlink_readlink,
        test_ramfs_truncate,
    ]
);

define_test_suite!(fs_devfs, [test_devfs_null_and_zero, test_devfs_console_ioctl]);
