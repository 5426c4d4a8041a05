//! Sliding-window z-score anomaly detection.
//!
//! Each suite is its own series. A point is compared against the up to
//! [`ANOMALY_WINDOW`] runs of the same suite that precede it; it is flagged
//! when |z| exceeds the caller's sensitivity. Flagged points stay in later
//! baselines, so the z-scores are independent of the sensitivity.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::analysis::stats::TimeSeries;
use crate::analysis::{RunMetric, Severity};
use crate::records::TestSuiteExecutionRecord;

/// Baseline length (runs before the point under test).
pub const ANOMALY_WINDOW: usize = 20;
/// Points with a shorter history are not scored.
pub const MIN_ANOMALY_BASELINE: usize = 5;
pub const DEFAULT_SENSITIVITY: f64 = 2.0;

const HIGH_Z: f64 = 3.0;
const MEDIUM_Z: f64 = 2.0;
/// Reported z-scores are capped so constant baselines serialize.
const Z_CAP: f64 = 1_000.0;

const METRICS: [RunMetric; 4] = [
    RunMetric::ExecutionTime,
    RunMetric::Coverage,
    RunMetric::PassRate,
    RunMetric::MemoryUsage,
];

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Anomaly {
    pub timestamp: DateTime<Utc>,
    pub metric: String,
    pub suite_name: String,
    pub record_id: String,
    pub expected_value: f64,
    pub actual_value: f64,
    pub z_score: f64,
    pub severity: Severity,
    pub possible_causes: Vec<String>,
}

pub fn severity_for(z: f64) -> Severity {
    let z = z.abs();
    if z > HIGH_Z {
        Severity::High
    } else if z > MEDIUM_Z {
        Severity::Medium
    } else {
        Severity::Low
    }
}

/// Anomalies across all suites in `records` (any order), newest first.
pub fn detect(records: &[TestSuiteExecutionRecord], sensitivity: f64) -> Vec<Anomaly> {
    let mut by_suite: BTreeMap<&str, Vec<&TestSuiteExecutionRecord>> = BTreeMap::new();
    for r in records {
        by_suite.entry(r.suite_name.as_str()).or_default().push(r);
    }

    let mut found = Vec::new();
    for runs in by_suite.values_mut() {
        runs.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        for metric in METRICS {
            let values: Vec<f64> = runs.iter().map(|r| metric.value(r)).collect();
            for i in MIN_ANOMALY_BASELINE..values.len() {
                let baseline = &values[i.saturating_sub(ANOMALY_WINDOW)..i];
                let ts = TimeSeries::new(baseline);
                let Ok(z) = ts.z_score(values[i]) else {
                    continue;
                };
                if z.abs() <= sensitivity {
                    continue;
                }
                let run = runs[i];
                found.push(Anomaly {
                    timestamp: run.timestamp,
                    metric: metric.name().to_string(),
                    suite_name: run.suite_name.clone(),
                    record_id: run.id.clone(),
                    expected_value: ts.mean(),
                    actual_value: values[i],
                    z_score: z.clamp(-Z_CAP, Z_CAP),
                    severity: severity_for(z),
                    possible_causes: possible_causes(metric, z > 0.0),
                });
            }
        }
    }

    found.sort_by(|a, b| {
        b.timestamp
            .cmp(&a.timestamp)
            .then_with(|| b.z_score.abs().total_cmp(&a.z_score.abs()))
    });
    found
}

fn possible_causes(metric: RunMetric, above: bool) -> Vec<String> {
    let causes: &[&str] = match (metric, above) {
        (RunMetric::ExecutionTime, true) => &[
            "Slow or newly added tests",
            "CI runner resource contention",
            "External service or network latency",
        ],
        (RunMetric::ExecutionTime, false) => &["Tests skipped or removed", "Test selection or caching changed"],
        (RunMetric::Coverage, false) => &[
            "Untested code merged",
            "Coverage instrumentation misconfigured",
            "Test files excluded from the run",
        ],
        (RunMetric::Coverage, true) => &["Large test addition", "Code removed from instrumented paths"],
        (RunMetric::PassRate, false) => &[
            "Regression introduced by a recent commit",
            "Flaky tests failing together",
            "Environment or dependency change",
        ],
        (RunMetric::PassRate, true) => &["Previously failing tests fixed or skipped"],
        (RunMetric::MemoryUsage, true) => &["Memory leak in fixtures or teardown", "Larger test data sets"],
        (RunMetric::MemoryUsage, false) => &["Tests removed", "Reduced parallelism"],
        _ => &["Unusual run"],
    };
    causes.iter().map(|c| c.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{CoverageSnapshot, Environment, PerformanceSnapshot};
    use chrono::Duration;

    fn run(i: i64, duration: f64) -> TestSuiteExecutionRecord {
        TestSuiteExecutionRecord {
            id: format!("run-{i}"),
            timestamp: Utc::now() - Duration::days(30) + Duration::hours(i),
            suite_name: "unit".into(),
            total_tests: 10,
            passed_tests: 10,
            failed_tests: 0,
            skipped_tests: 0,
            duration,
            coverage: CoverageSnapshot::uniform(80.0),
            performance: PerformanceSnapshot::default(),
            environment: Environment::default(),
            tests: Vec::new(),
        }
    }

    fn with_spike() -> Vec<TestSuiteExecutionRecord> {
        let noise = [0.0, 3.0, -2.0, 4.0, -5.0, 1.0, -1.0, 2.0, -3.0, 5.0];
        let mut runs: Vec<_> = (0..20).map(|i| run(i, 30.0 + noise[i as usize % 10])).collect();
        runs.push(run(20, 120.0));
        runs
    }

    #[test]
    fn test_spike_is_high_severity() {
        let found = detect(&with_spike(), DEFAULT_SENSITIVITY);
        let spike = found
            .iter()
            .find(|a| a.metric == "execution_time" && a.actual_value == 120.0)
            .unwrap();
        assert_eq!(spike.severity, Severity::High);
        assert!(spike.expected_value > 25.0 && spike.expected_value < 35.0);
        assert!(!spike.possible_causes.is_empty());
        // Newest first.
        assert_eq!(found[0].record_id, "run-20");
    }

    #[test]
    fn test_lower_sensitivity_never_reports_fewer() {
        let runs = with_spike();
        let mut last = usize::MAX;
        for s in [0.5, 1.0, 1.5, 2.0, 3.0, 5.0] {
            let n = detect(&runs, s).len();
            assert!(n <= last);
            last = n;
        }
    }

    #[test]
    fn test_severity_tiers() {
        assert_eq!(severity_for(3.5), Severity::High);
        assert_eq!(severity_for(-3.5), Severity::High);
        assert_eq!(severity_for(2.5), Severity::Medium);
        assert_eq!(severity_for(1.2), Severity::Low);
    }

    #[test]
    fn test_short_history_not_scored() {
        let runs: Vec<_> = (0..5).map(|i| run(i, if i == 4 { 500.0 } else { 30.0 })).collect();
        assert!(detect(&runs, DEFAULT_SENSITIVITY).is_empty());
    }
}
