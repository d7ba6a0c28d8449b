//! Test harness types and the registry walker.
//!
//! Suites registered through `define_test_suite!` land in the
//! `test_registry` link section; the linker provides
//! `__start_test_registry`/`__stop_test_registry` bounds for it.

use crate::{klog_error, klog_info};

/// Maximum number of test suites a run summary can hold.
pub const HARNESS_MAX_SUITES: usize = 24;

/// Result of executing a single test suite.
#[derive(Clone, Copy)]
pub struct TestSuiteResult {
    pub name: &'static str,
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
}

impl TestSuiteResult {
    pub const fn empty() -> Self {
        Self {
            name: "",
            total: 0,
            passed: 0,
            failed: 0,
        }
    }

    pub fn all_passed(&self) -> bool {
        self.failed == 0
    }
}

pub type SuiteRunnerFn = fn(&mut TestSuiteResult) -> i32;

#[derive(Clone, Copy)]
pub struct TestSuiteDesc {
    pub name: &'static str,
    pub run: Option<SuiteRunnerFn>,
}

// SAFETY: contains only a static string and a function pointer.
unsafe impl Sync for TestSuiteDesc {}

/// Aggregated results from running all registered suites.
pub struct TestRunSummary {
    pub suites: [TestSuiteResult; HARNESS_MAX_SUITES],
    pub suite_count: usize,
    pub total_tests: u32,
    pub passed: u32,
    pub failed: u32,
}

impl TestRunSummary {
    pub const fn new() -> Self {
        Self {
            suites: [TestSuiteResult::empty(); HARNESS_MAX_SUITES],
            suite_count: 0,
            total_tests: 0,
            passed: 0,
            failed: 0,
        }
    }

    fn add_suite_result(&mut self, result: &TestSuiteResult) {
        if self.suite_count < HARNESS_MAX_SUITES {
            self.suites[self.suite_count] = *result;
            self.suite_count += 1;
        }
        self.total_tests = self.total_tests.saturating_add(result.total);
        self.passed = self.passed.saturating_add(result.passed);
        self.failed = self.failed.saturating_add(result.failed);
    }

    pub fn all_passed(&self) -> bool {
        self.failed == 0
    }
}

impl Default for TestRunSummary {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_arch = "x86")]
fn registered_suites() -> &'static [TestSuiteDesc] {
    unsafe extern "C" {
        static __start_test_registry: TestSuiteDesc;
        static __stop_test_registry: TestSuiteDesc;
    }
    unsafe {
        let start = &raw const __start_test_registry;
        let stop = &raw const __stop_test_registry;
        let count = stop.offset_from(start) as usize;
        core::slice::from_raw_parts(start, count)
    }
}

#[cfg(not(target_arch = "x86"))]
fn registered_suites() -> &'static [TestSuiteDesc] {
    &[]
}

/// Run every registered suite and return the aggregated summary.
pub fn run_registered_suites() -> TestRunSummary {
    let mut summary = TestRunSummary::new();

    for desc in registered_suites() {
        let Some(run) = desc.run else {
            continue;
        };
        klog_info!("==== suite: {} ====", desc.name);
        let mut result = TestSuiteResult::empty();
        run(&mut result);
        if result.all_passed() {
            klog_info!("==== {}: {}/{} passed ====", desc.name, result.passed, result.total);
        } else {
            klog_error!(
                "==== {}: {} of {} tests FAILED ====",
                desc.name,
                result.failed,
                result.total
            );
        }
        summary.add_suite_result(&result);
    }

    if summary.all_passed() {
        klog_info!("all suites passed ({} tests)", summary.total_tests);
    } else {
        klog_error!("{} of {} tests failed", summary.failed, summary.total_tests);
    }
    summary
}
