//! Quality forecasting and risk assessment.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::analysis::features::{model_inputs, MetricLevels, QualityMetric, FEATURE_WINDOW, LEVEL_FEATURE};
use crate::analysis::model::{FeatureImportance, LinearModel};
use crate::analysis::trend::{fit_trend, TrendAnalyzer, TrendDirection};
use crate::analysis::chronological;
use crate::cache::{AnalysisCache, CacheKey};
use crate::error::{AnalyticsError, Result};
use crate::events::EngineEvent;
use crate::storage::DataStore;

/// Runs required before models can be trained.
pub const MIN_TRAINING_RECORDS: usize = 30;
/// Runs of history needed before a run can serve as a training input.
const MIN_SAMPLE_HISTORY: usize = 5;
/// Days granted when nothing is at high risk.
pub const DEFAULT_TIME_TO_ACTION: u32 = 30;
/// Factors reported per prediction.
const TOP_FACTORS: usize = 3;
/// Per-day confidence decay of a forecast.
const HORIZON_DECAY: f64 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn score(&self) -> f64 {
        match self {
            RiskLevel::Low => 20.0,
            RiskLevel::Medium => 50.0,
            RiskLevel::High => 80.0,
        }
    }

    pub fn from_score(score: f64) -> Self {
        if score > 70.0 {
            RiskLevel::High
        } else if score > 40.0 {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }
}

/// Relative-change thresholds `(low, medium)` and the magnitude floor used
/// when the current value is near zero.
fn risk_thresholds(metric: QualityMetric) -> (f64, f64, f64) {
    match metric {
        QualityMetric::Coverage | QualityMetric::PassRate => (0.02, 0.05, 0.01),
        QualityMetric::ExecutionTime | QualityMetric::MemoryUsage => (0.10, 0.25, f64::EPSILON),
        QualityMetric::Flakiness => (0.20, 0.50, 0.05),
        QualityMetric::Stability | QualityMetric::Maintainability => (0.05, 0.10, 0.01),
    }
}

/// Risk grows with the forecast change, but only for a degrading trend.
pub fn risk_level(metric: QualityMetric, current: f64, predicted: f64, degrading: bool) -> RiskLevel {
    if !degrading {
        return RiskLevel::Low;
    }
    let (low, medium, floor) = risk_thresholds(metric);
    let rel = (predicted - current).abs() / current.abs().max(floor);
    if rel < low {
        RiskLevel::Low
    } else if rel < medium {
        RiskLevel::Medium
    } else {
        RiskLevel::High
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityFactor {
    pub name: String,
    /// Signed contribution to the normalized prediction.
    pub impact: f64,
    pub importance: f64,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityPrediction {
    pub metric: QualityMetric,
    pub current_value: f64,
    pub predicted_value: f64,
    pub horizon_days: u32,
    pub confidence: f64,
    pub trend: TrendDirection,
    /// The trend moves in the harmful direction for this metric.
    pub degrading: bool,
    pub risk_level: RiskLevel,
    pub factors: Vec<QualityFactor>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskAssessment {
    pub overall_risk: RiskLevel,
    pub risk_score: f64,
    pub critical_areas: Vec<String>,
    pub predictions: Vec<QualityPrediction>,
    pub recommendations: Vec<String>,
    pub time_to_action: u32,
}

/// Template the recommendation engine turns into a recommendation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecommendationSeed {
    pub metric: QualityMetric,
    pub title: String,
    pub description: String,
    pub action_items: Vec<String>,
    /// High risk: the recommendation is critical.
    pub critical: bool,
    pub risk_level: RiskLevel,
    pub confidence: f64,
    pub estimated_impact: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelStats {
    pub metric: QualityMetric,
    pub accuracy: f64,
    pub trained_at: Option<DateTime<Utc>>,
    pub samples: usize,
    pub feature_importance: Vec<FeatureImportance>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelValidation {
    pub metric: QualityMetric,
    pub accuracy: f64,
    pub samples: usize,
}

pub struct QualityPredictor {
    store: Arc<DataStore>,
    analyzer: Arc<TrendAnalyzer>,
    models: RwLock<BTreeMap<QualityMetric, LinearModel>>,
    model_version: AtomicU64,
    cache: AnalysisCache,
    history_days: u32,
}

impl QualityPredictor {
    /// `history_days` is the window trend classification looks back over.
    /// Models saved by an earlier training run are loaded; metrics without a
    /// saved model start from the priors.
    pub fn new(analyzer: Arc<TrendAnalyzer>, cache_ttl: StdDuration, history_days: u32) -> Self {
        let mut models: BTreeMap<QualityMetric, LinearModel> = QualityMetric::ALL
            .into_iter()
            .map(|m| (m, LinearModel::with_priors(m)))
            .collect();
        match analyzer.store().load_models::<LinearModel>() {
            Ok(saved) => {
                if !saved.is_empty() {
                    debug!(models = saved.len(), "Loaded saved quality models");
                }
                for model in saved {
                    models.insert(model.metric, model);
                }
            }
            Err(e) => warn!(error = %e, "Saved quality models could not be loaded, using priors"),
        }
        Self {
            store: analyzer.store().clone(),
            analyzer,
            models: RwLock::new(models),
            model_version: AtomicU64::new(0),
            cache: AnalysisCache::new(cache_ttl),
            history_days,
        }
    }

    fn key(&self, analysis: &'static str, days: u32) -> CacheKey {
        CacheKey::new(analysis, days as i64, self.store.generation())
            .with_param(self.model_version.load(Ordering::Acquire))
    }

    fn model(&self, metric: QualityMetric) -> LinearModel {
        let models = self.models.read().unwrap_or_else(|e| e.into_inner());
        models.get(&metric).cloned().unwrap_or_else(|| LinearModel::with_priors(metric))
    }

    /// Forecast the seven quality metrics `days` ahead from the newest runs.
    pub fn predict_quality_metrics(&self, days: u32) -> Result<Vec<QualityPrediction>> {
        self.cache
            .get_or_try_insert(self.key("quality_predictions", days), || self.compute_predictions(days))
    }

    fn compute_predictions(&self, days: u32) -> Result<Vec<QualityPrediction>> {
        let records = chronological(self.store.latest_suite_records(FEATURE_WINDOW)?);
        if records.is_empty() {
            return Err(AnalyticsError::insufficient("quality predictions", 1, 0));
        }
        let levels = MetricLevels::compute(&records);
        let end = levels.len() - 1;
        let trends = self.trend_directions(&levels)?;
        let data_factor = 1.0 - (-(levels.len() as f64) / 10.0).exp();

        let predictions: Vec<QualityPrediction> = QualityMetric::ALL
            .into_iter()
            .map(|metric| {
                let model = self.model(metric);
                let x = model_inputs(&levels, end, metric, days as f64);
                let scale = metric.scale(&levels.series(metric)[levels.window(end)]);
                let current = levels.series(metric)[end];
                let predicted = model.predict(&x) * scale;

                let trend = trends.get(&metric).copied().unwrap_or(TrendDirection::Stable);
                let degrading = match trend {
                    TrendDirection::Decreasing => metric.higher_is_better(),
                    TrendDirection::Increasing => !metric.higher_is_better(),
                    _ => false,
                };
                let confidence =
                    (model.accuracy * data_factor / (1.0 + HORIZON_DECAY * days as f64)).clamp(0.01, 1.0);

                QualityPrediction {
                    metric,
                    current_value: current,
                    predicted_value: predicted,
                    horizon_days: days,
                    confidence,
                    trend,
                    degrading,
                    risk_level: risk_level(metric, current, predicted, degrading),
                    factors: top_factors(&model, &x),
                }
            })
            .collect();

        debug!(days, runs = levels.len(), "Computed quality predictions");
        Ok(predictions)
    }

    /// Trend direction per metric, from the analyzer's memoized trends where
    /// it tracks the metric.
    fn trend_directions(&self, levels: &MetricLevels) -> Result<BTreeMap<QualityMetric, TrendDirection>> {
        let window = self.history_days;
        let coverage = self.analyzer.coverage_trends(window)?;
        let performance = self.analyzer.performance_trends(window)?;
        let quality = self.analyzer.quality_trends(window)?;
        let maintainability = fit_trend("maintainability", &levels.points(QualityMetric::Maintainability));

        Ok(BTreeMap::from([
            (QualityMetric::Coverage, coverage.overall.trend),
            (QualityMetric::PassRate, quality.pass_rate.trend),
            (QualityMetric::ExecutionTime, performance.execution_time.trend),
            (QualityMetric::MemoryUsage, performance.memory_usage.trend),
            (QualityMetric::Flakiness, quality.flakiness.trend),
            (QualityMetric::Stability, quality.test_stability.trend),
            (QualityMetric::Maintainability, maintainability.trend),
        ]))
    }

    pub fn assess_quality_risk(&self, days: u32) -> Result<RiskAssessment> {
        self.cache.get_or_try_insert(self.key("risk_assessment", days), || {
            let predictions = self.predict_quality_metrics(days)?;
            Ok(assess(predictions))
        })
    }

    /// Refit every model on runs from the last `days` days.
    pub fn train_models(&self, days: u32) -> Result<Vec<ModelStats>> {
        let records = chronological(self.store.recent_suite_records(days)?);
        if records.len() < MIN_TRAINING_RECORDS {
            return Err(AnalyticsError::insufficient("model training", MIN_TRAINING_RECORDS, records.len()));
        }
        let levels = MetricLevels::compute(&records);

        let mut trained = BTreeMap::new();
        for metric in QualityMetric::ALL {
            let (xs, ys) = training_samples(&levels, metric, 0..levels.len());
            let split = xs.len() * 4 / 5;

            let mut probe = LinearModel::with_priors(metric);
            probe.fit(&xs[..split], &ys[..split])?;
            let holdout = probe.evaluate(&xs[split..], &ys[split..]);

            let mut model = LinearModel::with_priors(metric);
            model.fit(&xs, &ys)?;
            if let Some(accuracy) = holdout {
                model.accuracy = accuracy;
            }
            trained.insert(metric, model);
        }

        let saved = trained
            .iter()
            .map(|(metric, model)| -> Result<(&str, String)> { Ok((metric.name(), serde_json::to_string(model)?)) })
            .collect::<Result<Vec<_>>>()?;
        self.store.save_models(&saved)?;

        *self.models.write().unwrap_or_else(|e| e.into_inner()) = trained;
        self.model_version.fetch_add(1, Ordering::AcqRel);
        self.cache.clear();

        info!(days, samples = records.len(), "Quality models retrained");
        self.store.events().publish(EngineEvent::ModelsRetrained {
            metrics: QualityMetric::ALL.iter().map(|m| m.name().to_string()).collect(),
            samples: records.len(),
        });
        Ok(self.model_stats())
    }

    /// Accuracy of the current models on runs from the last `test_days` days.
    pub fn validate_models(&self, test_days: u32) -> Result<Vec<ModelValidation>> {
        let records = chronological(self.store.recent_suite_records(test_days.saturating_add(self.history_days))?);
        let levels = MetricLevels::compute(&records);
        let cutoff = Utc::now() - chrono::Duration::days(test_days as i64);
        let first_target = levels.timestamps.iter().position(|t| *t >= cutoff).unwrap_or(levels.len());

        let mut out = Vec::new();
        for metric in QualityMetric::ALL {
            let (xs, ys) = training_samples(&levels, metric, first_target..levels.len());
            let Some(accuracy) = self.model(metric).evaluate(&xs, &ys) else {
                return Err(AnalyticsError::insufficient(
                    "model validation",
                    MIN_SAMPLE_HISTORY + 1,
                    records.len(),
                ));
            };
            out.push(ModelValidation {
                metric,
                accuracy,
                samples: xs.len(),
            });
        }
        Ok(out)
    }

    pub fn model_stats(&self) -> Vec<ModelStats> {
        let models = self.models.read().unwrap_or_else(|e| e.into_inner());
        models
            .values()
            .map(|m| ModelStats {
                metric: m.metric,
                accuracy: m.accuracy,
                trained_at: m.trained_at,
                samples: m.samples,
                feature_importance: m.importance(),
            })
            .collect()
    }

    /// Seeds for metrics at high risk or trending the wrong way.
    pub fn recommendation_seeds(&self, days: u32) -> Result<Vec<RecommendationSeed>> {
        Ok(recommendation_seeds(&self.predict_quality_metrics(days)?))
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }
}

/// `(inputs, target)` pairs whose target run index falls in `targets`.
fn training_samples(
    levels: &MetricLevels,
    metric: QualityMetric,
    targets: std::ops::Range<usize>,
) -> (Vec<Vec<f64>>, Vec<f64>) {
    let mut xs = Vec::new();
    let mut ys = Vec::new();
    for target in targets.start.max(MIN_SAMPLE_HISTORY)..targets.end {
        let end = target - 1;
        let horizon = (levels.timestamps[target] - levels.timestamps[end]).num_milliseconds() as f64 / 86_400_000.0;
        let scale = metric.scale(&levels.series(metric)[levels.window(end)]);
        xs.push(model_inputs(levels, end, metric, horizon));
        ys.push((levels.series(metric)[target] / scale).clamp(0.0, 1.0));
    }
    (xs, ys)
}

fn top_factors(model: &LinearModel, x: &[f64]) -> Vec<QualityFactor> {
    let importance: BTreeMap<String, f64> = model
        .importance()
        .into_iter()
        .map(|f| (f.feature, f.importance))
        .collect();
    let mut factors: Vec<QualityFactor> = model
        .contributions(x)
        .into_iter()
        .filter(|(name, impact)| name != LEVEL_FEATURE && impact.abs() > f64::EPSILON)
        .map(|(name, impact)| QualityFactor {
            importance: importance.get(&name).copied().unwrap_or(0.0),
            description: format!(
                "{} {} the forecast",
                name.replace('_', " "),
                if impact >= 0.0 { "raises" } else { "lowers" }
            ),
            name,
            impact,
        })
        .collect();
    factors.sort_by(|a, b| b.impact.abs().total_cmp(&a.impact.abs()));
    factors.truncate(TOP_FACTORS);
    factors
}

/// Weighted risk over all predictions.
pub fn assess(predictions: Vec<QualityPrediction>) -> RiskAssessment {
    let risk_score = if predictions.is_empty() {
        0.0
    } else {
        predictions.iter().map(|p| p.risk_level.score()).sum::<f64>() / predictions.len() as f64
    };
    let high: Vec<&QualityPrediction> = predictions.iter().filter(|p| p.risk_level == RiskLevel::High).collect();
    let critical_areas = high.iter().map(|p| p.metric.name().to_string()).collect();
    let time_to_action = high.iter().map(|p| p.horizon_days).min().unwrap_or(DEFAULT_TIME_TO_ACTION);
    let recommendations = recommendation_seeds(&predictions).into_iter().map(|s| s.title).collect();

    RiskAssessment {
        overall_risk: RiskLevel::from_score(risk_score),
        risk_score,
        critical_areas,
        predictions,
        recommendations,
        time_to_action,
    }
}

pub fn recommendation_seeds(predictions: &[QualityPrediction]) -> Vec<RecommendationSeed> {
    predictions
        .iter()
        .filter(|p| p.risk_level == RiskLevel::High || p.degrading)
        .filter_map(|p| {
            let (title, description, actions, impact): (&str, String, Vec<&str>, f64) = match p.metric {
                QualityMetric::Coverage => (
                    "Improve test coverage",
                    format!("Coverage is forecast to move from {:.1}% to {:.1}%", p.current_value, p.predicted_value),
                    vec![
                        "Identify changed files without tests",
                        "Add tests for uncovered branches",
                        "Gate merges on coverage deltas",
                    ],
                    70.0,
                ),
                QualityMetric::PassRate => (
                    "Stabilize failing tests",
                    format!(
                        "Pass rate is forecast to move from {:.1}% to {:.1}%",
                        p.current_value * 100.0,
                        p.predicted_value * 100.0
                    ),
                    vec![
                        "Triage the most frequent failures",
                        "Quarantine flaky tests",
                        "Fix regressions before new feature work",
                    ],
                    80.0,
                ),
                QualityMetric::ExecutionTime => (
                    "Reduce test execution time",
                    format!(
                        "Suite duration is forecast to move from {:.0} ms to {:.0} ms",
                        p.current_value, p.predicted_value
                    ),
                    vec![
                        "Profile the slowest tests",
                        "Parallelize independent suites",
                        "Replace slow integration setups with fakes",
                    ],
                    60.0,
                ),
                QualityMetric::MemoryUsage => (
                    "Reduce test memory usage",
                    format!(
                        "Peak memory is forecast to move from {:.0} to {:.0} bytes",
                        p.current_value, p.predicted_value
                    ),
                    vec!["Check fixtures for leaks", "Release large test data after use"],
                    50.0,
                ),
                _ => return None,
            };
            Some(RecommendationSeed {
                metric: p.metric,
                title: title.to_string(),
                description,
                action_items: actions.iter().map(|a| a.to_string()).collect(),
                critical: p.risk_level == RiskLevel::High,
                risk_level: p.risk_level,
                confidence: p.confidence,
                estimated_impact: impact,
            })
        })
        .collect()
}
