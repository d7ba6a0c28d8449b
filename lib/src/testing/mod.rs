//! In-kernel test harness.
//!
//! Suites are defined with [`define_test_suite!`] and auto-registered via
//! `#[link_section = "test_registry"]`; the kernel runs them all with
//! [`run_registered_suites`] when built with the `builtin-tests` feature.
//! Individual tests are plain functions returning [`TestResult`] and use
//! the `assert_*` macros, which log and return `Fail` on violation.

pub mod harness;
mod runner;

pub mod assertions;

pub use harness::{TestRunSummary, TestSuiteDesc, TestSuiteResult, run_registered_suites};
pub use runner::run_single_test;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TestResult {
    Pass,
    Fail,
    Skipped,
}

impl TestResult {
    #[inline]
    pub fn is_pass(&self) -> bool {
        matches!(self, Self::Pass | Self::Skipped)
    }
}

#[macro_export]
macro_rules! pass {
    () => {
        $crate::testing::TestResult::Pass
    };
}

#[macro_export]
macro_rules! fail {
    () => {
        $crate::testing::TestResult::Fail
    };
    ($msg:expr) => {{
        $crate::klog_info!("TEST FAIL: {}", $msg);
        $crate::testing::TestResult::Fail
    }};
    ($fmt:expr, $($arg:tt)*) => {{
        $crate::klog_info!(concat!("TEST FAIL: ", $fmt), $($arg)*);
        $crate::testing::TestResult::Fail
    }};
}

#[macro_export]
macro_rules! run_test {
    ($passed:expr, $total:expr, $test_fn:expr) => {{
        $total += 1;
        let result = $crate::testing::run_single_test(stringify!($test_fn), || $test_fn());
        if result.is_pass() {
            $passed += 1;
        }
        result
    }};
}

/// Define a test suite from a list of `fn() -> TestResult` items and
/// register it for [`run_registered_suites`].
#[macro_export]
macro_rules! define_test_suite {
    ($suite_name:ident, [$($test_fn:path),* $(,)?]) => {
        $crate::paste::paste! {
            fn [<run_ $suite_name _suite>](
                out: &mut $crate::testing::TestSuiteResult,
            ) -> i32 {
                let mut passed = 0u32;
                let mut total = 0u32;

                $(
                    $crate::run_test!(passed, total, $test_fn);
                )*

                out.name = stringify!($suite_name);
                out.total = total;
                out.passed = passed;
                out.failed = total.saturating_sub(passed);

                if passed == total { 0 } else { -1 }
            }

            #[used]
            #[unsafe(link_section = "test_registry")]
            pub static [<$suite_name:upper _SUITE_DESC>]: $crate::testing::TestSuiteDesc =
                $crate::testing::TestSuiteDesc {
                    name: stringify!($suite_name),
                    run: Some([<run_ $suite_name _suite>]),
                };
        }
    };
}
