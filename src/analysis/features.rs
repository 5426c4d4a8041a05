//! Feature extraction for the quality models.
//!
//! Levels are per-run values of the seven canonical quality metrics in
//! natural units. Features summarise the newest [`FEATURE_WINDOW`] runs up to
//! a given run and are normalized so every model sees comparable scales.

use std::ops::Range;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::analysis::stats::{linear_regression, TimeSeries};
use crate::analysis::trend::{run_consistency, suite_churn};
use crate::records::TestSuiteExecutionRecord;

/// Runs summarised per feature vector.
pub const FEATURE_WINDOW: usize = 30;

/// Execution time (ms) mapped to 0.5 by the bounded transform.
const EXECUTION_REFERENCE_MS: f64 = 60_000.0;
/// Memory (bytes) mapped to 0.5 by the bounded transform.
const MEMORY_REFERENCE_BYTES: f64 = 512.0 * 1024.0 * 1024.0;

const MS_PER_DAY: f64 = 86_400_000.0;

pub const FEATURE_NAMES: [&str; 13] = [
    "avg_coverage",
    "avg_pass_rate",
    "avg_execution_time",
    "avg_memory_usage",
    "coverage_slope",
    "pass_rate_slope",
    "execution_time_slope",
    "memory_usage_slope",
    "coverage_volatility",
    "pass_rate_volatility",
    "execution_time_volatility",
    "code_churn",
    "ci_failure_rate",
];

/// Model inputs lead with the metric's own level and expected change.
pub const LEVEL_FEATURE: &str = "current_level";
pub const MOMENTUM_FEATURE: &str = "momentum";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityMetric {
    Coverage,
    PassRate,
    ExecutionTime,
    MemoryUsage,
    Flakiness,
    Stability,
    Maintainability,
}

impl QualityMetric {
    pub const ALL: [QualityMetric; 7] = [
        QualityMetric::Coverage,
        QualityMetric::PassRate,
        QualityMetric::ExecutionTime,
        QualityMetric::MemoryUsage,
        QualityMetric::Flakiness,
        QualityMetric::Stability,
        QualityMetric::Maintainability,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            QualityMetric::Coverage => "coverage",
            QualityMetric::PassRate => "pass_rate",
            QualityMetric::ExecutionTime => "execution_time",
            QualityMetric::MemoryUsage => "memory_usage",
            QualityMetric::Flakiness => "flakiness",
            QualityMetric::Stability => "stability",
            QualityMetric::Maintainability => "maintainability",
        }
    }

    pub fn higher_is_better(&self) -> bool {
        crate::analysis::higher_is_better(self.name())
    }

    /// Divisor mapping a level into [0, 1] for the given window of levels.
    pub fn scale(&self, window: &[f64]) -> f64 {
        match self {
            QualityMetric::Coverage => 100.0,
            QualityMetric::ExecutionTime | QualityMetric::MemoryUsage => {
                let mean = TimeSeries::new(window).mean();
                if mean > f64::EPSILON {
                    2.0 * mean
                } else {
                    1.0
                }
            }
            _ => 1.0,
        }
    }
}

impl std::fmt::Display for QualityMetric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Per-run metric levels, oldest first.
#[derive(Debug, Clone, Default)]
pub struct MetricLevels {
    pub timestamps: Vec<DateTime<Utc>>,
    pub coverage: Vec<f64>,
    pub pass_rate: Vec<f64>,
    pub execution_time: Vec<f64>,
    pub memory_usage: Vec<f64>,
    pub flakiness: Vec<f64>,
    pub stability: Vec<f64>,
    pub maintainability: Vec<f64>,
    pub churn: Vec<f64>,
    /// `Some(failed)` for CI runs.
    pub ci_failed: Vec<Option<bool>>,
}

impl MetricLevels {
    /// `records` must be oldest first.
    pub fn compute(records: &[TestSuiteExecutionRecord]) -> Self {
        let consistency = run_consistency(records);
        let churn = suite_churn(records);
        let mut levels = MetricLevels::default();

        for (i, r) in records.iter().enumerate() {
            let coverage = r.coverage.overall();
            let pass_rate = r.pass_rate();
            let churn = churn[i].unwrap_or(0.0);
            let (flakiness, stability) = consistency[i].unwrap_or((0.0, pass_rate));

            levels.timestamps.push(r.timestamp);
            levels.coverage.push(coverage);
            levels.pass_rate.push(pass_rate);
            levels.execution_time.push(r.duration);
            levels.memory_usage.push(r.performance.peak_memory);
            levels.flakiness.push(flakiness);
            levels.stability.push(stability);
            levels
                .maintainability
                .push(0.4 * coverage / 100.0 + 0.4 * pass_rate + 0.2 * (1.0 - churn.min(1.0)));
            levels.churn.push(churn);
            levels.ci_failed.push(r.environment.ci.then_some(r.failed_tests > 0));
        }
        levels
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    pub fn series(&self, metric: QualityMetric) -> &[f64] {
        match metric {
            QualityMetric::Coverage => &self.coverage,
            QualityMetric::PassRate => &self.pass_rate,
            QualityMetric::ExecutionTime => &self.execution_time,
            QualityMetric::MemoryUsage => &self.memory_usage,
            QualityMetric::Flakiness => &self.flakiness,
            QualityMetric::Stability => &self.stability,
            QualityMetric::Maintainability => &self.maintainability,
        }
    }

    pub fn points(&self, metric: QualityMetric) -> Vec<(DateTime<Utc>, f64)> {
        self.timestamps.iter().copied().zip(self.series(metric).iter().copied()).collect()
    }

    /// Feature window ending at run `end` (inclusive).
    pub fn window(&self, end: usize) -> Range<usize> {
        (end + 1).saturating_sub(FEATURE_WINDOW)..end + 1
    }

    /// Least-squares slope of `metric` in natural units per day over `range`.
    pub fn slope_per_day(&self, metric: QualityMetric, range: Range<usize>) -> f64 {
        let values = &self.series(metric)[range.clone()];
        let times = &self.timestamps[range];
        let Some(origin) = times.first() else {
            return 0.0;
        };
        let xy: Vec<(f64, f64)> = times
            .iter()
            .zip(values)
            .map(|(t, v)| ((*t - *origin).num_milliseconds() as f64 / MS_PER_DAY, *v))
            .collect();
        linear_regression(&xy).map(|r| r.slope).unwrap_or(0.0)
    }
}

/// Summary of a run window.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityFeatures {
    /// Percent.
    pub avg_coverage: f64,
    pub avg_pass_rate: f64,
    /// Milliseconds.
    pub avg_execution_time: f64,
    /// Bytes.
    pub avg_memory_usage: f64,
    /// Relative change per run.
    pub coverage_slope: f64,
    pub pass_rate_slope: f64,
    pub execution_time_slope: f64,
    pub memory_usage_slope: f64,
    /// Coefficients of variation.
    pub coverage_volatility: f64,
    pub pass_rate_volatility: f64,
    pub execution_time_volatility: f64,
    pub code_churn: f64,
    pub ci_failure_rate: f64,
}

impl QualityFeatures {
    pub fn from_levels(levels: &MetricLevels, end: usize) -> Self {
        let w = levels.window(end);
        let coverage = &levels.coverage[w.clone()];
        let pass_rate = &levels.pass_rate[w.clone()];
        let execution = &levels.execution_time[w.clone()];
        let memory = &levels.memory_usage[w.clone()];

        let ci: Vec<bool> = levels.ci_failed[w.clone()].iter().flatten().copied().collect();
        let ci_failure_rate = if ci.is_empty() {
            0.0
        } else {
            ci.iter().filter(|f| **f).count() as f64 / ci.len() as f64
        };

        Self {
            avg_coverage: TimeSeries::new(coverage).mean(),
            avg_pass_rate: TimeSeries::new(pass_rate).mean(),
            avg_execution_time: TimeSeries::new(execution).mean(),
            avg_memory_usage: TimeSeries::new(memory).mean(),
            coverage_slope: relative_slope(coverage),
            pass_rate_slope: relative_slope(pass_rate),
            execution_time_slope: relative_slope(execution),
            memory_usage_slope: relative_slope(memory),
            coverage_volatility: TimeSeries::new(coverage).coefficient_of_variation(),
            pass_rate_volatility: TimeSeries::new(pass_rate).coefficient_of_variation(),
            execution_time_volatility: TimeSeries::new(execution).coefficient_of_variation(),
            code_churn: TimeSeries::new(&levels.churn[w]).mean(),
            ci_failure_rate,
        }
    }

    /// Normalized vector in [`FEATURE_NAMES`] order.
    pub fn to_vector(&self) -> Vec<f64> {
        vec![
            self.avg_coverage / 100.0,
            self.avg_pass_rate,
            bounded(self.avg_execution_time, EXECUTION_REFERENCE_MS),
            bounded(self.avg_memory_usage, MEMORY_REFERENCE_BYTES),
            self.coverage_slope,
            self.pass_rate_slope,
            self.execution_time_slope,
            self.memory_usage_slope,
            self.coverage_volatility,
            self.pass_rate_volatility,
            self.execution_time_volatility,
            self.code_churn.min(1.0),
            self.ci_failure_rate,
        ]
    }
}

/// Input names for a per-metric model, in [`model_inputs`] order.
pub fn model_feature_names() -> Vec<String> {
    [LEVEL_FEATURE, MOMENTUM_FEATURE]
        .into_iter()
        .chain(FEATURE_NAMES)
        .map(String::from)
        .collect()
}

/// Inputs for `metric`'s model at run `end`, forecasting `horizon_days` ahead:
/// normalized current level, normalized expected change, then the window
/// features.
pub fn model_inputs(levels: &MetricLevels, end: usize, metric: QualityMetric, horizon_days: f64) -> Vec<f64> {
    let w = levels.window(end);
    let scale = metric.scale(&levels.series(metric)[w.clone()]);
    let level = levels.series(metric)[end] / scale;
    let momentum = levels.slope_per_day(metric, w) * horizon_days / scale;

    let mut x = vec![level, momentum];
    x.extend(QualityFeatures::from_levels(levels, end).to_vector());
    x
}

fn bounded(value: f64, reference: f64) -> f64 {
    let v = value.max(0.0);
    v / (v + reference)
}

/// Slope per run divided by the mean magnitude.
fn relative_slope(values: &[f64]) -> f64 {
    let xy: Vec<(f64, f64)> = values.iter().enumerate().map(|(i, v)| (i as f64, *v)).collect();
    let Some(reg) = linear_regression(&xy) else {
        return 0.0;
    };
    let mean = TimeSeries::new(values).mean().abs();
    if mean < f64::EPSILON {
        reg.slope
    } else {
        reg.slope / mean
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{CoverageSnapshot, Environment, PerformanceSnapshot, TestCaseExecutionRecord, TestStatus};
    use chrono::Duration;

    fn run(i: i64, coverage: f64, status: TestStatus, total: u32) -> TestSuiteExecutionRecord {
        let timestamp = Utc::now() - Duration::days(40) + Duration::days(i);
        let failed = u32::from(status == TestStatus::Failed);
        TestSuiteExecutionRecord {
            id: format!("run-{i}"),
            timestamp,
            suite_name: "unit".into(),
            total_tests: total,
            passed_tests: total - failed,
            failed_tests: failed,
            skipped_tests: 0,
            duration: 1000.0 + 10.0 * i as f64,
            coverage: CoverageSnapshot::uniform(coverage),
            performance: PerformanceSnapshot {
                total_memory: 1e6,
                peak_memory: 5e5,
                average_execution_time: 10.0,
            },
            environment: Environment {
                ci: i % 2 == 0,
                ..Default::default()
            },
            tests: vec![TestCaseExecutionRecord {
                id: format!("t-{i}"),
                timestamp,
                file: "a.test".into(),
                name: "works".into(),
                status,
                duration: 5.0,
                error: None,
                coverage: CoverageSnapshot::default(),
                performance: PerformanceSnapshot::default(),
                environment: Environment::default(),
            }],
        }
    }

    #[test]
    fn test_levels_track_flips_and_churn() {
        let records = vec![
            run(0, 80.0, TestStatus::Passed, 10),
            run(1, 80.0, TestStatus::Failed, 10),
            run(2, 80.0, TestStatus::Failed, 12),
        ];
        let levels = MetricLevels::compute(&records);
        assert_eq!(levels.len(), 3);
        assert_eq!(levels.flakiness, vec![0.0, 1.0, 0.0]);
        // First run has no history, so stability falls back to its pass rate.
        assert_eq!(levels.stability[0], 1.0);
        assert_eq!(levels.stability[2], 0.0);
        assert_eq!(levels.churn, vec![0.0, 0.0, 0.2]);
        assert_eq!(levels.ci_failed, vec![Some(false), None, Some(true)]);
    }

    #[test]
    fn test_features_and_inputs() {
        let records: Vec<_> = (0..40).map(|i| run(i, 70.0 + 0.25 * i as f64, TestStatus::Passed, 10)).collect();
        let levels = MetricLevels::compute(&records);
        let end = levels.len() - 1;
        assert_eq!(levels.window(end), 10..40);
        assert_eq!(levels.window(3), 0..4);

        let f = QualityFeatures::from_levels(&levels, end);
        assert!(f.coverage_slope > 0.0);
        assert_eq!(f.avg_pass_rate, 1.0);
        assert_eq!(f.pass_rate_volatility, 0.0);
        assert_eq!(f.to_vector().len(), FEATURE_NAMES.len());

        let x = model_inputs(&levels, end, QualityMetric::Coverage, 4.0);
        assert_eq!(x.len(), model_feature_names().len());
        assert!((x[0] - 0.7975).abs() < 1e-9);
        // 0.25 points per day over 4 days, on a 0-100 scale.
        assert!((x[1] - 0.01).abs() < 1e-6);
    }

    #[test]
    fn test_scales() {
        assert_eq!(QualityMetric::Coverage.scale(&[50.0]), 100.0);
        assert_eq!(QualityMetric::ExecutionTime.scale(&[10.0, 30.0]), 40.0);
        assert_eq!(QualityMetric::MemoryUsage.scale(&[]), 1.0);
        assert_eq!(QualityMetric::PassRate.scale(&[0.5]), 1.0);
    }
}
