use super::TestResult;
use crate::{klog_error, klog_info};

/// Run a single test function, logging its name and outcome.
pub fn run_single_test(name: &str, test: impl FnOnce() -> TestResult) -> TestResult {
    klog_info!("[test] {}", name);
    let result = test();
    match result {
        TestResult::Pass => {}
        TestResult::Skipped => klog_info!("[test] {} skipped", name),
        TestResult::Fail => klog_error!("[test] {} FAILED", name),
    }
    result
}
