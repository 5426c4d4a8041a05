//! Statistical analysis over stored runs: trends, seasonality, anomalies,
//! insights, and the predictive layer built on top of them.

pub mod anomaly;
pub mod features;
pub mod insight;
pub mod model;
pub mod predictor;
pub mod seasonal;
pub mod stats;
pub mod trend;

use serde::{Deserialize, Serialize};

use crate::records::TestSuiteExecutionRecord;

pub use anomaly::Anomaly;
pub use insight::{InsightType, TrendInsight};
pub use predictor::{QualityPrediction, QualityPredictor, RiskAssessment};
pub use seasonal::SeasonalPattern;
pub use trend::{CoverageTrends, PerformanceTrends, QualityTrends, TrendAnalyzer, TrendDirection, TrendStatistic};

/// Severity shared by anomalies and insights. Ordered low to high.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
        }
    }
}

/// Per-run metrics extracted from suite records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMetric {
    Coverage,
    PassRate,
    ExecutionTime,
    MemoryUsage,
    TestCount,
    FailureRate,
}

impl RunMetric {
    pub fn name(&self) -> &'static str {
        match self {
            RunMetric::Coverage => "coverage",
            RunMetric::PassRate => "pass_rate",
            RunMetric::ExecutionTime => "execution_time",
            RunMetric::MemoryUsage => "memory_usage",
            RunMetric::TestCount => "test_count",
            RunMetric::FailureRate => "failure_rate",
        }
    }

    pub fn value(&self, record: &TestSuiteExecutionRecord) -> f64 {
        match self {
            RunMetric::Coverage => record.coverage.overall(),
            RunMetric::PassRate => record.pass_rate(),
            RunMetric::ExecutionTime => record.duration,
            RunMetric::MemoryUsage => record.performance.peak_memory,
            RunMetric::TestCount => record.total_tests as f64,
            RunMetric::FailureRate => record.failure_rate(),
        }
    }
}

/// Whether a rising value is good news for the named metric.
pub fn higher_is_better(metric: &str) -> bool {
    matches!(
        metric,
        "coverage" | "statements" | "branches" | "functions" | "lines" | "pass_rate" | "test_count" | "test_stability"
            | "stability" | "maintainability"
    )
}

/// Sort runs oldest first.
pub(crate) fn chronological(mut records: Vec<TestSuiteExecutionRecord>) -> Vec<TestSuiteExecutionRecord> {
    records.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
    records
}
