//! Least-squares trend fitting and the TrendAnalyzer.
//!
//! A trend is classified in this order: `volatile` when the fit explains
//! little of a noisy series, `stable` when the fitted change is small relative
//! to the series mean, otherwise `increasing`/`decreasing` by slope sign.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::analysis::anomaly::{self, Anomaly, DEFAULT_SENSITIVITY};
use crate::analysis::insight::{self, TrendInsight};
use crate::analysis::seasonal::{self, SeasonalPattern};
use crate::analysis::stats::{linear_regression, Regression, TimeSeries};
use crate::analysis::{chronological, RunMetric};
use crate::cache::{AnalysisCache, CacheKey};
use crate::error::Result;
use crate::records::{TestStatus, TestSuiteExecutionRecord};
use crate::storage::DataStore;

/// Fitted change below this fraction of the mean is `stable`.
pub const STABLE_EPSILON: f64 = 0.02;
/// Fits weaker than this on a noisy series are `volatile`.
pub const VOLATILE_CORRELATION: f64 = 0.3;
/// Coefficient of variation above which a weak fit counts as noise.
pub const VOLATILE_CV: f64 = 0.1;
/// Trends below this confidence get no prediction.
pub const PREDICTION_MIN_CONFIDENCE: f64 = 0.5;
/// Per-step confidence decay for forecasts.
const PREDICTION_DECAY: f64 = 0.1;

const REVERSAL_MIN_POINTS: usize = 10;
const REVERSAL_MIN_SEGMENT: usize = 5;
const REVERSAL_MIN_CORRELATION: f64 = 0.7;

/// Coverage percentage below which a recommendation is always emitted.
const COVERAGE_TARGET: f64 = 80.0;

const MS_PER_DAY: f64 = 86_400_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendDirection {
    Increasing,
    Decreasing,
    Stable,
    Volatile,
}

impl TrendDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrendDirection::Increasing => "increasing",
            TrendDirection::Decreasing => "decreasing",
            TrendDirection::Stable => "stable",
            TrendDirection::Volatile => "volatile",
        }
    }

    pub fn is_directional(&self) -> bool {
        matches!(self, TrendDirection::Increasing | TrendDirection::Decreasing)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrendPrediction {
    pub horizon_days: f64,
    pub value: f64,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrendStatistic {
    pub metric: String,
    pub trend: TrendDirection,
    /// Units per day.
    pub slope: f64,
    pub correlation: f64,
    pub confidence: f64,
    pub samples: usize,
    pub current_value: Option<f64>,
    /// Fitted change across the analysed span.
    pub change: f64,
    /// The recent segment departs from the full-window fit and is reported instead.
    pub reversal: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prediction: Option<TrendPrediction>,
    #[serde(skip)]
    fitted_last: f64,
    #[serde(skip)]
    step_days: f64,
}

impl TrendStatistic {
    /// A statistic for a series too short to fit.
    pub fn flat(metric: &str, samples: usize, current_value: Option<f64>) -> Self {
        Self {
            metric: metric.to_string(),
            trend: TrendDirection::Stable,
            slope: 0.0,
            correlation: 0.0,
            confidence: 0.0,
            samples,
            current_value,
            change: 0.0,
            reversal: false,
            prediction: None,
            fitted_last: current_value.unwrap_or(0.0),
            step_days: 0.0,
        }
    }

    /// Change relative to the current value's magnitude.
    pub fn relative_change(&self) -> f64 {
        let base = self.current_value.unwrap_or(0.0).abs();
        if base < f64::EPSILON {
            return self.change.abs();
        }
        self.change.abs() / base
    }
}

/// Fit a trend over `(timestamp, value)` points, in any order.
///
/// With at least ten points the newest quarter (minimum five) is fitted on
/// its own; a strong recent fit that disagrees with the full window replaces
/// it, flagged as a reversal.
pub fn fit_trend(metric: &str, points: &[(DateTime<Utc>, f64)]) -> TrendStatistic {
    let mut sorted = points.to_vec();
    sorted.sort_by(|a, b| a.0.cmp(&b.0));

    let full = fit_segment(metric, &sorted);
    if sorted.len() < REVERSAL_MIN_POINTS || full.trend == TrendDirection::Volatile {
        return full;
    }

    let k = (sorted.len() / 4).max(REVERSAL_MIN_SEGMENT);
    let recent = fit_segment(metric, &sorted[sorted.len() - k..]);
    if recent.trend.is_directional()
        && recent.trend != full.trend
        && recent.correlation.abs() >= REVERSAL_MIN_CORRELATION
    {
        debug!(metric, from = full.trend.as_str(), to = recent.trend.as_str(), "Trend reversal");
        return TrendStatistic {
            reversal: true,
            ..recent
        };
    }
    full
}

fn fit_segment(metric: &str, points: &[(DateTime<Utc>, f64)]) -> TrendStatistic {
    let values: Vec<f64> = points.iter().map(|p| p.1).collect();
    let current = values.last().copied();
    let Some(origin) = points.first().map(|p| p.0) else {
        return TrendStatistic::flat(metric, 0, None);
    };

    let xy: Vec<(f64, f64)> = points
        .iter()
        .map(|(t, v)| ((*t - origin).num_milliseconds() as f64 / MS_PER_DAY, *v))
        .collect();
    let Some(reg) = linear_regression(&xy) else {
        return TrendStatistic::flat(metric, values.len(), current);
    };

    let last_x = xy.last().map(|p| p.0).unwrap_or(0.0);
    let change = reg.slope * last_x;
    let n = values.len() as f64;

    let mut stat = TrendStatistic {
        metric: metric.to_string(),
        trend: classify(&reg, &TimeSeries::new(&values), change),
        slope: reg.slope,
        correlation: reg.correlation,
        confidence: reg.correlation.abs() * (1.0 - (-n / 10.0).exp()),
        samples: values.len(),
        current_value: current,
        change,
        reversal: false,
        prediction: None,
        fitted_last: reg.at(last_x),
        step_days: last_x / (n - 1.0),
    };
    stat.prediction = forecast(&stat, 1).into_iter().next();
    stat
}

fn classify(reg: &Regression, series: &TimeSeries<'_>, change: f64) -> TrendDirection {
    if reg.correlation.abs() < VOLATILE_CORRELATION && series.coefficient_of_variation() > VOLATILE_CV {
        return TrendDirection::Volatile;
    }
    let scale = series.mean().abs().max(f64::EPSILON);
    if (change / scale).abs() < STABLE_EPSILON {
        return TrendDirection::Stable;
    }
    if reg.slope > 0.0 {
        TrendDirection::Increasing
    } else {
        TrendDirection::Decreasing
    }
}

/// Project `steps` run intervals ahead. Empty for weak trends; confidence
/// strictly decreases with distance.
pub fn forecast(stat: &TrendStatistic, steps: usize) -> Vec<TrendPrediction> {
    if stat.confidence < PREDICTION_MIN_CONFIDENCE || stat.step_days <= 0.0 {
        return Vec::new();
    }
    (1..=steps)
        .map(|h| {
            let horizon_days = stat.step_days * h as f64;
            TrendPrediction {
                horizon_days,
                value: stat.fitted_last + stat.slope * horizon_days,
                confidence: stat.confidence / (1.0 + PREDICTION_DECAY * h as f64),
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Composite trends
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CoverageTrends {
    pub statements: TrendStatistic,
    pub branches: TrendStatistic,
    pub functions: TrendStatistic,
    pub lines: TrendStatistic,
    pub overall: TrendStatistic,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceTrends {
    pub execution_time: TrendStatistic,
    pub memory_usage: TrendStatistic,
    pub test_count: TrendStatistic,
    pub failure_rate: TrendStatistic,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityTrends {
    pub pass_rate: TrendStatistic,
    pub flakiness: TrendStatistic,
    pub test_stability: TrendStatistic,
    pub code_churn: TrendStatistic,
    pub recommendations: Vec<String>,
}

type Points = Vec<(DateTime<Utc>, f64)>;

fn points(records: &[TestSuiteExecutionRecord], f: impl Fn(&TestSuiteExecutionRecord) -> f64) -> Points {
    records.iter().map(|r| (r.timestamp, f(r))).collect()
}

pub fn coverage_trends(records: &[TestSuiteExecutionRecord]) -> CoverageTrends {
    let statements = fit_trend("statements", &points(records, |r| r.coverage.statements));
    let branches = fit_trend("branches", &points(records, |r| r.coverage.branches));
    let functions = fit_trend("functions", &points(records, |r| r.coverage.functions));
    let lines = fit_trend("lines", &points(records, |r| r.coverage.lines));
    let overall = fit_trend("coverage", &points(records, |r| r.coverage.overall()));

    let mut recs = Vec::new();
    match overall.trend {
        TrendDirection::Decreasing => recs.push(format!(
            "Coverage is declining ({:+.1} points over the window); add tests for recently changed code",
            overall.change
        )),
        TrendDirection::Increasing => {
            recs.push("Coverage is improving; keep coverage gates on new code to hold the gain".to_string())
        }
        TrendDirection::Volatile => recs
            .push("Coverage fluctuates between runs; check for non-deterministic test selection".to_string()),
        TrendDirection::Stable => {}
    }
    if overall.trend != TrendDirection::Decreasing {
        for component in [&statements, &branches, &functions, &lines] {
            if component.trend == TrendDirection::Decreasing {
                recs.push(format!(
                    "Coverage is declining for {} ({:+.1} points over the window)",
                    component.metric, component.change
                ));
            }
        }
    }
    if let Some(current) = overall.current_value.filter(|v| *v < COVERAGE_TARGET) {
        recs.push(format!(
            "Overall coverage {current:.1}% is below the {COVERAGE_TARGET:.0}% target"
        ));
    }

    CoverageTrends {
        statements,
        branches,
        functions,
        lines,
        overall,
        recommendations: recs,
    }
}

pub fn performance_trends(records: &[TestSuiteExecutionRecord]) -> PerformanceTrends {
    let execution_time = fit_trend("execution_time", &points(records, |r| RunMetric::ExecutionTime.value(r)));
    let memory_usage = fit_trend("memory_usage", &points(records, |r| RunMetric::MemoryUsage.value(r)));
    let test_count = fit_trend("test_count", &points(records, |r| RunMetric::TestCount.value(r)));
    let failure_rate = fit_trend("failure_rate", &points(records, |r| RunMetric::FailureRate.value(r)));

    let mut recs = Vec::new();
    if execution_time.trend == TrendDirection::Increasing {
        recs.push("Suite execution time is growing; profile the slowest tests and parallelize".to_string());
    }
    if memory_usage.trend == TrendDirection::Increasing {
        recs.push("Memory usage is trending up; look for leaks in fixtures and teardown".to_string());
    }
    if failure_rate.trend == TrendDirection::Increasing {
        recs.push("Failure rate is rising; triage new failures before they accumulate".to_string());
    }
    if test_count.trend == TrendDirection::Decreasing {
        recs.push("Test count is shrinking; confirm tests are not being deleted or disabled".to_string());
    }

    PerformanceTrends {
        execution_time,
        memory_usage,
        test_count,
        failure_rate,
        recommendations: recs,
    }
}

/// Status consistency of each run against the previous run of the same
/// tests: `(flip rate, steady-pass share)`. `None` when no non-skipped test
/// has an earlier run. `records` must be oldest first.
pub(crate) fn run_consistency(records: &[TestSuiteExecutionRecord]) -> Vec<Option<(f64, f64)>> {
    let mut last_status: HashMap<String, TestStatus> = HashMap::new();
    records
        .iter()
        .map(|r| {
            let (mut compared, mut flips, mut steady) = (0usize, 0usize, 0usize);
            for t in r.tests.iter().filter(|t| t.status != TestStatus::Skipped) {
                if let Some(prev) = last_status.insert(t.test_key(), t.status) {
                    compared += 1;
                    if prev != t.status {
                        flips += 1;
                    } else if t.status == TestStatus::Passed {
                        steady += 1;
                    }
                }
            }
            (compared > 0).then(|| (flips as f64 / compared as f64, steady as f64 / compared as f64))
        })
        .collect()
}

/// Relative test-count change against the previous run of the same suite.
/// `records` must be oldest first.
pub(crate) fn suite_churn(records: &[TestSuiteExecutionRecord]) -> Vec<Option<f64>> {
    let mut last_total: HashMap<&str, u32> = HashMap::new();
    records
        .iter()
        .map(|r| {
            last_total.insert(r.suite_name.as_str(), r.total_tests).map(|prev| {
                let delta = (r.total_tests as f64 - prev as f64).abs();
                delta / prev.max(1) as f64
            })
        })
        .collect()
}

/// `records` must be oldest first.
pub fn quality_trends(records: &[TestSuiteExecutionRecord]) -> QualityTrends {
    let consistency = run_consistency(records);
    let churn = suite_churn(records);
    let mut flakiness_pts = Vec::new();
    let mut stability_pts = Vec::new();
    let mut churn_pts = Vec::new();
    for (i, r) in records.iter().enumerate() {
        if let Some((flips, steady)) = consistency[i] {
            flakiness_pts.push((r.timestamp, flips));
            stability_pts.push((r.timestamp, steady));
        }
        if let Some(c) = churn[i] {
            churn_pts.push((r.timestamp, c));
        }
    }

    let pass_rate = fit_trend("pass_rate", &points(records, |r| r.pass_rate()));
    let flakiness = fit_trend("flakiness", &flakiness_pts);
    let test_stability = fit_trend("test_stability", &stability_pts);
    let code_churn = fit_trend("code_churn", &churn_pts);

    let mut recs = Vec::new();
    match pass_rate.trend {
        TrendDirection::Decreasing => {
            recs.push("Pass rate is declining; bisect recent commits for regressions".to_string())
        }
        TrendDirection::Volatile => {
            recs.push("Pass rate is volatile; quarantine and fix flaky tests".to_string())
        }
        _ => {}
    }
    if flakiness.trend == TrendDirection::Increasing {
        recs.push("Test flakiness is increasing; audit shared state, timing and ordering dependencies".to_string());
    }
    if test_stability.trend == TrendDirection::Decreasing {
        recs.push("Fewer tests pass consistently run to run; review recently failing tests".to_string());
    }
    if matches!(code_churn.trend, TrendDirection::Increasing | TrendDirection::Volatile) {
        recs.push("Test suite churn is high; keep test changes reviewed alongside code changes".to_string());
    }

    QualityTrends {
        pass_rate,
        flakiness,
        test_stability,
        code_churn,
        recommendations: recs,
    }
}

// ---------------------------------------------------------------------------
// TrendAnalyzer
// ---------------------------------------------------------------------------

/// Memoized trend, pattern, anomaly and insight analysis over a [`DataStore`].
pub struct TrendAnalyzer {
    store: Arc<DataStore>,
    cache: AnalysisCache,
    sensitivity: f64,
}

impl TrendAnalyzer {
    pub fn new(store: Arc<DataStore>, cache_ttl: StdDuration) -> Self {
        Self {
            store,
            cache: AnalysisCache::new(cache_ttl),
            sensitivity: DEFAULT_SENSITIVITY,
        }
    }

    /// Default z-score cutoff for anomalies feeding insights.
    pub fn with_sensitivity(mut self, sensitivity: f64) -> Self {
        self.sensitivity = sensitivity;
        self
    }

    pub fn store(&self) -> &Arc<DataStore> {
        &self.store
    }

    pub fn sensitivity(&self) -> f64 {
        self.sensitivity
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    fn key(&self, analysis: &'static str, window_days: u32) -> CacheKey {
        CacheKey::new(analysis, window_days as i64, self.store.generation())
    }

    /// Runs in the window, oldest first.
    fn runs(&self, window_days: u32) -> Result<Vec<TestSuiteExecutionRecord>> {
        Ok(chronological(self.store.recent_suite_records(window_days)?))
    }

    pub fn coverage_trends(&self, window_days: u32) -> Result<CoverageTrends> {
        self.cache
            .get_or_try_insert(self.key("coverage_trends", window_days), || {
                Ok(coverage_trends(&self.runs(window_days)?))
            })
    }

    pub fn performance_trends(&self, window_days: u32) -> Result<PerformanceTrends> {
        self.cache
            .get_or_try_insert(self.key("performance_trends", window_days), || {
                Ok(performance_trends(&self.runs(window_days)?))
            })
    }

    pub fn quality_trends(&self, window_days: u32) -> Result<QualityTrends> {
        self.cache
            .get_or_try_insert(self.key("quality_trends", window_days), || {
                Ok(quality_trends(&self.runs(window_days)?))
            })
    }

    /// Daily and weekly patterns in execution time and pass rate.
    pub fn seasonal_patterns(&self, window_days: u32) -> Result<Vec<SeasonalPattern>> {
        self.cache
            .get_or_try_insert(self.key("seasonal_patterns", window_days), || {
                let runs = self.runs(window_days)?;
                let mut patterns = Vec::new();
                for metric in [RunMetric::ExecutionTime, RunMetric::PassRate] {
                    let pts = points(&runs, |r| metric.value(r));
                    patterns.extend(seasonal::detect_patterns(metric.name(), &pts));
                }
                Ok(patterns)
            })
    }

    /// Points whose windowed |z| exceeds `sensitivity`, newest first.
    pub fn detect_anomalies(&self, window_days: u32, sensitivity: f64) -> Result<Vec<Anomaly>> {
        let key = self.key("anomalies", window_days).with_param(sensitivity.to_bits());
        self.cache.get_or_try_insert(key, || {
            let runs = self.runs(window_days)?;
            Ok(anomaly::detect(&runs, sensitivity))
        })
    }

    /// Trend classifications, patterns and anomalies merged into insights,
    /// most severe first.
    pub fn generate_insights(&self, window_days: u32) -> Result<Vec<TrendInsight>> {
        self.cache
            .get_or_try_insert(self.key("insights", window_days), || {
                let coverage = self.coverage_trends(window_days)?;
                let performance = self.performance_trends(window_days)?;
                let quality = self.quality_trends(window_days)?;
                let anomalies = self.detect_anomalies(window_days, self.sensitivity)?;
                let patterns = self.seasonal_patterns(window_days)?;

                let stats = [
                    &coverage.overall,
                    &performance.execution_time,
                    &performance.memory_usage,
                    &performance.test_count,
                    &performance.failure_rate,
                    &quality.pass_rate,
                    &quality.flakiness,
                    &quality.test_stability,
                    &quality.code_churn,
                ];
                let insights = insight::synthesize(&stats, &anomalies, &patterns);
                debug!(window_days, insights = insights.len(), "Generated insights");
                Ok(insights)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn daily(values: &[f64]) -> Points {
        let start = Utc::now() - Duration::days(values.len() as i64);
        values
            .iter()
            .enumerate()
            .map(|(i, v)| (start + Duration::days(i as i64), *v))
            .collect()
    }

    #[test]
    fn test_rising_series_is_increasing() {
        let values: Vec<f64> = (0..20).map(|i| 80.0 + 8.0 * i as f64 / 19.0).collect();
        let stat = fit_trend("statements", &daily(&values));
        assert_eq!(stat.trend, TrendDirection::Increasing);
        assert!(stat.slope > 0.0);
        assert!(stat.correlation > 0.99);
        assert!(!stat.reversal);
        assert!(stat.prediction.is_some());
    }

    #[test]
    fn test_recent_drop_is_reported_as_reversal() {
        let mut values: Vec<f64> = (0..20).map(|i| 80.0 + 8.0 * i as f64 / 19.0).collect();
        values.extend([86.0, 84.0, 82.0]);
        let stat = fit_trend("statements", &daily(&values));
        assert_eq!(stat.trend, TrendDirection::Decreasing);
        assert!(stat.reversal);
        assert!(stat.slope < 0.0);
    }

    #[test]
    fn test_flat_series_is_stable() {
        let stat = fit_trend("coverage", &daily(&[75.0; 12]));
        assert_eq!(stat.trend, TrendDirection::Stable);
        assert_eq!(stat.slope, 0.0);
    }

    #[test]
    fn test_bouncing_ratio_is_volatile() {
        let values: Vec<f64> = (0..16).map(|i| if i % 2 == 0 { 1.0 } else { 0.5 }).collect();
        let stat = fit_trend("pass_rate", &daily(&values));
        assert_eq!(stat.trend, TrendDirection::Volatile);
    }

    #[test]
    fn test_short_series_is_flat() {
        let stat = fit_trend("coverage", &daily(&[50.0]));
        assert_eq!(stat.trend, TrendDirection::Stable);
        assert_eq!(stat.samples, 1);
        assert_eq!(stat.current_value, Some(50.0));
        assert!(fit_trend("coverage", &[]).current_value.is_none());
    }

    #[test]
    fn test_forecast_confidence_strictly_decreases() {
        let values: Vec<f64> = (0..30).map(|i| 10.0 + i as f64).collect();
        let stat = fit_trend("execution_time", &daily(&values));
        let steps = forecast(&stat, 5);
        assert_eq!(steps.len(), 5);
        for pair in steps.windows(2) {
            assert!(pair[1].confidence < pair[0].confidence);
            assert!(pair[1].horizon_days > pair[0].horizon_days);
        }
        assert!(steps.iter().all(|p| p.confidence > 0.0 && p.confidence <= 1.0));
        assert!((steps[0].value - 40.0).abs() < 1e-6);
    }

    #[test]
    fn test_weak_trend_has_no_forecast() {
        let stat = fit_trend("execution_time", &daily(&[1.0, 2.0]));
        assert!(stat.confidence < PREDICTION_MIN_CONFIDENCE);
        assert!(forecast(&stat, 3).is_empty());
    }
}
