//! Unit suites for the pure-logic pieces of this crate.

use crate::cmdline::BootCommandLine;
use crate::define_test_suite;
use crate::ring_buffer::RingBuffer;
use crate::testing::TestResult;
use crate::{pass, test_expect};

fn test_cmdline_keys_and_flags() -> TestResult {
    let cl = BootCommandLine::parse(b"/boot/kernel init=/sbin/init loglevel=3 quiet nosmp");
    test_expect!(cl.init_path() == b"/sbin/init");
    test_expect!(cl.loglevel() == Some(3));
    test_expect!(cl.quiet);
    test_expect!(cl.nosmp);
    test_expect!(!cl.single);
    pass!()
}

fn test_cmdline_unknown_tokens_route_to_init() -> TestResult {
    let cl = BootCommandLine::parse(b"kernel FOO=bar rescue root=/dev/hda1");
    test_expect!(cl.root() == Some(b"/dev/hda1".as_slice()));
    // Unknown key=value goes to the environment, unknown plain to argv.
    test_expect!(cl.init_env_count() == 1);
    test_expect!(cl.init_env().next() == Some(b"FOO=bar".as_slice()));
    test_expect!(cl.init_argv_count() == 1);
    test_expect!(cl.init_argv().next() == Some(b"rescue".as_slice()));
    pass!()
}

fn test_cmdline_separator_forwards_everything() -> TestResult {
    let cl = BootCommandLine::parse(b"kernel single -- --verbose loglevel=9");
    test_expect!(cl.single);
    // After `--` even a recognised-looking key is forwarded untouched.
    test_expect!(cl.loglevel().is_none());
    let mut argv = cl.init_argv();
    test_expect!(argv.next() == Some(b"--verbose".as_slice()));
    test_expect!(argv.next() == Some(b"loglevel=9".as_slice()));
    pass!()
}

fn test_cmdline_first_token_skipped() -> TestResult {
    let cl = BootCommandLine::parse(b"quiet");
    // The lone token is the kernel path, not the quiet flag.
    test_expect!(!cl.quiet);
    pass!()
}

fn test_ring_buffer_wraps() -> TestResult {
    let mut ring: RingBuffer<8> = RingBuffer::new();
    test_expect!(ring.push_slice(b"abcdef") == 6);
    let mut out = [0u8; 4];
    test_expect!(ring.pop_slice(&mut out) == 4);
    test_expect!(&out == b"abcd");
    // Wrap around the end of the backing array.
    test_expect!(ring.push_slice(b"ghijkl") == 6);
    test_expect!(ring.is_full());
    let mut rest = [0u8; 8];
    test_expect!(ring.pop_slice(&mut rest) == 8);
    test_expect!(&rest == b"efghijkl");
    test_expect!(ring.is_empty());
    pass!()
}

fn test_ring_buffer_partial_push() -> TestResult {
    let mut ring: RingBuffer<4> = RingBuffer::new();
    test_expect!(ring.push_slice(b"abcdef") == 4);
    test_expect!(ring.free_space() == 0);
    pass!()
}

fn test_align_helpers() -> TestResult {
    use crate::align::{align_down_u64, align_up_u64};
    test_expect!(align_up_u64(0x1001, 0x1000) == 0x2000);
    test_expect!(align_up_u64(0x1000, 0x1000) == 0x1000);
    test_expect!(align_down_u64(0x1FFF, 0x1000) == 0x1000);
    pass!()
}

fn test_errno_encoding() -> TestResult {
    use ferrite_abi::errno::{EINTR, errno_from_ret, errno_ret, is_errno_ret};
    let raw = errno_ret(EINTR);
    test_expect!(is_errno_ret(raw));
    test_expect!(errno_from_ret(raw) == Some(EINTR));
    test_expect!(!is_errno_ret(0));
    test_expect!(!is_errno_ret(0x7fff_0000));
    pass!()
}

define_test_suite!(
    lib_units,
    [
        test_cmdline_keys_and_flags,
        test_cmdline_unknown_tokens_route_to_init,
        test_cmdline_separator_forwards_everything,
        test_cmdline_first_token_skipped,
        test_ring_buffer_wraps,
        test_ring_buffer_partial_push,
        test_align_helpers,
        test_errno_encoding,
    ]
);
