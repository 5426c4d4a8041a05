//! Synchronous validation of incoming records. A record that fails here is
//! never stored.

use super::{CoverageSnapshot, TestCaseExecutionRecord, TestSuiteExecutionRecord};
use crate::error::{AnalyticsError, Result};

pub fn validate_suite_record(record: &TestSuiteExecutionRecord) -> Result<()> {
    require_non_empty("id", &record.id)?;
    require_non_empty("suiteName", &record.suite_name)?;

    let counted = record.passed_tests as u64 + record.failed_tests as u64 + record.skipped_tests as u64;
    if counted > record.total_tests as u64 {
        return Err(AnalyticsError::Validation(format!(
            "suite '{}': passed+failed+skipped ({}) exceeds totalTests ({})",
            record.suite_name, counted, record.total_tests
        )));
    }

    require_duration("duration", record.duration)?;
    validate_coverage(&record.coverage)?;
    for (name, value) in [
        ("performance.totalMemory", record.performance.total_memory),
        ("performance.peakMemory", record.performance.peak_memory),
        ("performance.averageExecutionTime", record.performance.average_execution_time),
    ] {
        if !value.is_finite() || value < 0.0 {
            return Err(AnalyticsError::Validation(format!("{name} must be a non-negative number, got {value}")));
        }
    }

    for test in &record.tests {
        validate_test_record(test)?;
    }
    Ok(())
}

fn validate_test_record(test: &TestCaseExecutionRecord) -> Result<()> {
    require_non_empty("tests[].id", &test.id)?;
    require_non_empty("tests[].file", &test.file)?;
    require_non_empty("tests[].name", &test.name)?;
    require_duration("tests[].duration", test.duration)?;
    validate_coverage(&test.coverage)
}

fn validate_coverage(coverage: &CoverageSnapshot) -> Result<()> {
    for (name, value) in coverage.components() {
        if !(0.0..=100.0).contains(&value) {
            return Err(AnalyticsError::Validation(format!(
                "coverage.{name} must lie in [0, 100], got {value}"
            )));
        }
    }
    Ok(())
}

fn require_non_empty(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(AnalyticsError::Validation(format!("missing required field '{field}'")));
    }
    Ok(())
}

fn require_duration(field: &str, value: f64) -> Result<()> {
    if !value.is_finite() || value < 0.0 {
        return Err(AnalyticsError::Validation(format!("{field} must be a non-negative number, got {value}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{Environment, PerformanceSnapshot, TestStatus};
    use chrono::Utc;

    fn valid() -> TestSuiteExecutionRecord {
        TestSuiteExecutionRecord {
            id: "s1".into(),
            timestamp: Utc::now(),
            suite_name: "api".into(),
            total_tests: 2,
            passed_tests: 1,
            failed_tests: 1,
            skipped_tests: 0,
            duration: 50.0,
            coverage: CoverageSnapshot::uniform(75.0),
            performance: PerformanceSnapshot::default(),
            environment: Environment::default(),
            tests: vec![TestCaseExecutionRecord {
                id: "t1".into(),
                timestamp: Utc::now(),
                file: "api.test.ts".into(),
                name: "returns 200".into(),
                status: TestStatus::Passed,
                duration: 12.0,
                error: None,
                coverage: CoverageSnapshot::default(),
                performance: PerformanceSnapshot::default(),
                environment: Environment::default(),
            }],
        }
    }

    #[test]
    fn test_valid_record_passes() {
        assert!(validate_suite_record(&valid()).is_ok());
    }

    #[test]
    fn test_missing_suite_name_rejected() {
        let mut r = valid();
        r.suite_name = "  ".into();
        let err = validate_suite_record(&r).unwrap_err();
        assert!(matches!(err, AnalyticsError::Validation(_)));
        assert!(err.to_string().contains("suiteName"));
    }

    #[test]
    fn test_coverage_out_of_range_rejected() {
        let mut r = valid();
        r.coverage.branches = 101.0;
        assert!(validate_suite_record(&r).is_err());
        let mut r = valid();
        r.tests[0].coverage.lines = -1.0;
        assert!(validate_suite_record(&r).is_err());
    }

    #[test]
    fn test_counts_exceeding_total_rejected() {
        let mut r = valid();
        r.total_tests = 1;
        assert!(validate_suite_record(&r).is_err());
    }

    #[test]
    fn test_negative_duration_rejected() {
        let mut r = valid();
        r.tests[0].duration = -3.0;
        assert!(validate_suite_record(&r).is_err());
    }
}
