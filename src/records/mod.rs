//! Execution records produced by the test harness.
//!
//! Records use camelCase on the wire so harness payloads deserialize as-is.
//! Coverage components are percentages on a 0-100 scale; durations are
//! milliseconds; memory figures are bytes.

pub mod validate;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use validate::validate_suite_record;

/// Outcome of a single test case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Passed,
    Failed,
    Skipped,
}

impl TestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestStatus::Passed => "passed",
            TestStatus::Failed => "failed",
            TestStatus::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "passed" => Some(TestStatus::Passed),
            "failed" => Some(TestStatus::Failed),
            "skipped" => Some(TestStatus::Skipped),
            _ => None,
        }
    }
}

impl std::fmt::Display for TestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CoverageSnapshot {
    pub statements: f64,
    pub branches: f64,
    pub functions: f64,
    pub lines: f64,
}

impl CoverageSnapshot {
    pub fn uniform(value: f64) -> Self {
        Self {
            statements: value,
            branches: value,
            functions: value,
            lines: value,
        }
    }

    /// Mean of the four coverage components.
    pub fn overall(&self) -> f64 {
        (self.statements + self.branches + self.functions + self.lines) / 4.0
    }

    pub fn components(&self) -> [(&'static str, f64); 4] {
        [
            ("statements", self.statements),
            ("branches", self.branches),
            ("functions", self.functions),
            ("lines", self.lines),
        ]
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceSnapshot {
    pub total_memory: f64,
    pub peak_memory: f64,
    pub average_execution_time: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Environment {
    pub platform: String,
    pub ci: bool,
    pub branch: String,
    pub commit: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestError {
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

/// One test case run, derived from its parent suite record at store time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCaseExecutionRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub file: String,
    pub name: String,
    pub status: TestStatus,
    pub duration: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TestError>,
    #[serde(default)]
    pub coverage: CoverageSnapshot,
    #[serde(default)]
    pub performance: PerformanceSnapshot,
    #[serde(default)]
    pub environment: Environment,
}

impl TestCaseExecutionRecord {
    /// Series key for the per-test history.
    pub fn test_key(&self) -> String {
        format!("{}::{}", self.file, self.name)
    }
}

/// Aggregate result of one suite execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestSuiteExecutionRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub suite_name: String,
    pub total_tests: u32,
    pub passed_tests: u32,
    pub failed_tests: u32,
    pub skipped_tests: u32,
    pub duration: f64,
    pub coverage: CoverageSnapshot,
    pub performance: PerformanceSnapshot,
    pub environment: Environment,
    #[serde(default)]
    pub tests: Vec<TestCaseExecutionRecord>,
}

impl TestSuiteExecutionRecord {
    /// Share of tests that passed, in [0, 1]. Empty runs count as fully passing.
    pub fn pass_rate(&self) -> f64 {
        if self.total_tests == 0 {
            return 1.0;
        }
        self.passed_tests as f64 / self.total_tests as f64
    }

    pub fn failure_rate(&self) -> f64 {
        if self.total_tests == 0 {
            return 0.0;
        }
        self.failed_tests as f64 / self.total_tests as f64
    }

    /// Suite-level status: failed when any test failed, skipped when every
    /// test was skipped, passed otherwise.
    pub fn status(&self) -> TestStatus {
        if self.failed_tests > 0 {
            TestStatus::Failed
        } else if self.total_tests > 0 && self.skipped_tests == self.total_tests {
            TestStatus::Skipped
        } else {
            TestStatus::Passed
        }
    }
}
