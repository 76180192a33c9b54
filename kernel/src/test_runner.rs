//! Built-in test runner.
//!
//! Suites self-register into the `.test_registry` link section through
//! `define_test_suite!`; the linker brackets the section with
//! `__start_test_registry`/`__stop_test_registry`. A kernel thread walks
//! the array once the scheduler is up, so suites may block, sleep, and
//! spawn helper threads.

#![cfg_attr(not(feature = "builtin-tests"), allow(dead_code))]

use core::ffi::{CStr, c_void};

use ferrite_core::sched::task::task_create_kernel;
use ferrite_lib::testing::{TestRunSummary, TestSuiteDesc, TestSuiteResult};
use ferrite_lib::{klog_error, klog_info};

#[allow(improper_ctypes)]
unsafe extern "C" {
    static __start_test_registry: TestSuiteDesc;
    static __stop_test_registry: TestSuiteDesc;
}

fn registered_suites() -> &'static [TestSuiteDesc] {
    unsafe {
        let start = &__start_test_registry as *const TestSuiteDesc;
        let stop = &__stop_test_registry as *const TestSuiteDesc;
        let count = stop.offset_from(start).max(0) as usize;
        core::slice::from_raw_parts(start, count)
    }
}

fn suite_name(desc: &TestSuiteDesc) -> &'static str {
    if desc.name.is_null() {
        return "<unnamed>";
    }
    unsafe { CStr::from_ptr(desc.name) }
        .to_str()
        .unwrap_or("<bad-utf8>")
}

fn test_task_entry(_arg: *mut c_void) {
    let suites = registered_suites();
    klog_info!("tests: running {} suites", suites.len());

    let mut summary = TestRunSummary::default();
    for desc in suites {
        let Some(run) = desc.run else { continue };
        let mut result = TestSuiteResult::default();
        let rc = run(core::ptr::null(), &mut result);
        summary.add_suite_result(&result);
        if rc == 0 {
            klog_info!(
                "tests: {} ... {}/{} ok ({} ms)",
                suite_name(desc),
                result.passed,
                result.total,
                result.elapsed_ms
            );
        } else {
            klog_error!(
                "tests: {} ... {} FAILED of {}",
                suite_name(desc),
                result.failed,
                result.total
            );
        }
    }

    if summary.all_passed() {
        klog_info!(
            "tests: PASS — {} tests across {} suites",
            summary.total_tests,
            suites.len()
        );
    } else {
        klog_error!(
            "tests: FAIL — {}/{} tests failed",
            summary.failed,
            summary.total_tests
        );
    }
}

/// Launch the suite walker on its own kernel thread.
pub fn spawn_test_task() {
    let tid = task_create_kernel(b"ktests", test_task_entry, core::ptr::null_mut(), 18);
    if tid == ferrite_abi::task::INVALID_TASK_ID {
        klog_error!("tests: cannot spawn the test task");
    }
}
