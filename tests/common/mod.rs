//! Record builders shared by the integration tests.
#![allow(dead_code)]

use chrono::{DateTime, Duration, Utc};
use testsight::records::{
    CoverageSnapshot, Environment, PerformanceSnapshot, TestCaseExecutionRecord, TestError, TestStatus,
    TestSuiteExecutionRecord,
};

/// A healthy 10-test CI run `days_ago` days in the past.
pub fn suite_run(id: &str, days_ago: i64) -> TestSuiteExecutionRecord {
    suite_run_at(id, Utc::now() - Duration::days(days_ago))
}

pub fn suite_run_at(id: &str, timestamp: DateTime<Utc>) -> TestSuiteExecutionRecord {
    TestSuiteExecutionRecord {
        id: id.to_string(),
        timestamp,
        suite_name: "unit".to_string(),
        total_tests: 10,
        passed_tests: 10,
        failed_tests: 0,
        skipped_tests: 0,
        duration: 30.0,
        coverage: CoverageSnapshot::uniform(80.0),
        performance: PerformanceSnapshot {
            total_memory: 64.0 * 1024.0 * 1024.0,
            peak_memory: 96.0 * 1024.0 * 1024.0,
            average_execution_time: 3.0,
        },
        environment: Environment {
            platform: "linux".to_string(),
            ci: true,
            branch: "main".to_string(),
            commit: format!("c{id}"),
        },
        tests: Vec::new(),
    }
}

pub fn test_case(
    suite: &TestSuiteExecutionRecord,
    file: &str,
    name: &str,
    status: TestStatus,
) -> TestCaseExecutionRecord {
    TestCaseExecutionRecord {
        id: format!("{}-{}-{}", suite.id, file, name),
        timestamp: suite.timestamp,
        file: file.to_string(),
        name: name.to_string(),
        status,
        duration: 3.0,
        error: (status == TestStatus::Failed).then(|| TestError {
            error_type: "AssertionError".to_string(),
            message: "expected true".to_string(),
            stack: None,
        }),
        coverage: suite.coverage,
        performance: suite.performance,
        environment: suite.environment.clone(),
    }
}

/// Deterministic jitter in [-1, 1].
pub fn jitter(i: usize) -> f64 {
    ((i * 7919) % 21) as f64 / 10.0 - 1.0
}
