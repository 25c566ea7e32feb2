//! In-tree test harness.
//!
//! Test functions return [`TestResult`] instead of panicking, so the same
//! suites can run inside a kernel (where unwinding does not exist) and under
//! `cargo test` on a hosted target.  [`define_test_suite!`] generates both: a
//! plain suite-runner function for the kernel, and a `#[cfg(test)]` harness
//! that drives the suite from libtest.

use crate::klog_info;

mod assertions;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TestResult {
    Pass,
    Fail,
    Panic,
    Skipped,
}

impl TestResult {
    #[inline]
    pub fn is_pass(&self) -> bool {
        matches!(self, Self::Pass | Self::Skipped)
    }

    #[inline]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Fail | Self::Panic)
    }
}

/// Outcome of one suite run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TestSuiteResult {
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
}

/// Run one test function, logging its name and outcome.
pub fn run_single_test(name: &str, test: impl FnOnce() -> TestResult) -> TestResult {
    let result = test();
    match result {
        TestResult::Pass => klog_info!("TEST {name} ... ok"),
        TestResult::Skipped => klog_info!("TEST {name} ... skipped"),
        _ => klog_info!("TEST {name} ... FAILED"),
    }
    result
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

    ($test_fn:expr) => {{ $crate::testing::run_single_test(stringify!($test_fn), || $test_fn()) }};
}

/// Declare a named suite over a list of `fn() -> TestResult` tests.
///
/// Expands to `run_<name>_suite()` for kernel-side harnesses plus a
/// `#[cfg(test)]` libtest entry that fails if any member fails.
#[macro_export]
macro_rules! define_test_suite {
    ($suite_name:ident, [$($test_fn:path),* $(,)?]) => {
        $crate::paste::paste! {
            /// Run every test in this suite, logging each result.
            pub fn [<run_ $suite_name _suite>]() -> $crate::testing::TestSuiteResult {
                let mut passed = 0u32;
                let mut total = 0u32;

                $(
                    $crate::run_test!(passed, total, $test_fn);
                )*

                $crate::testing::TestSuiteResult {
                    total,
                    passed,
                    failed: total - passed,
                }
            }

            #[cfg(test)]
            mod [<$suite_name _suite_harness>] {
                #[test]
                fn [<$suite_name _suite>]() {
                    let result = super::[<run_ $suite_name _suite>]();
                    assert_eq!(
                        result.failed, 0,
                        "{}/{} tests failed in suite `{}`",
                        result.failed,
                        result.total,
                        stringify!($suite_name),
                    );
                }
            }
        }
    };
}
