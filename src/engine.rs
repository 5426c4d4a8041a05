//! Engine orchestrator.
//!
//! Owns the store, analyzer, predictor and recommendation engine, wires them
//! together through constructors, and exposes the reporting surface. Storage
//! writes never wait on analysis: a stored run enqueues an [`AnalysisTask`]
//! for the background worker, whose failures become
//! [`EngineEvent::AnalysisFailed`] instead of errors on the write path.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::analysis::{
    Anomaly, CoverageTrends, PerformanceTrends, QualityPrediction, QualityPredictor, QualityTrends, RiskAssessment,
    Severity, TrendAnalyzer, TrendInsight,
};
use crate::analysis::predictor::{ModelStats, ModelValidation, RiskLevel};
use crate::config::AppConfig;
use crate::error::{AnalyticsError, Result};
use crate::events::{EngineEvent, EventBus};
use crate::recommend::export::{export_recommendations, RecommendationFormat};
use crate::recommend::{Priority, Recommendation, RecommendationEngine};
use crate::records::{validate_suite_record, TestSuiteExecutionRecord};
use crate::storage::retention::spawn_retention_loop;
use crate::storage::{DataStore, ExportFormat, StorageStats};

/// Pending post-store analyses before new ones are dropped.
const TASK_QUEUE_CAP: usize = 64;
/// Recommendations shown on the dashboard.
const DASHBOARD_RECOMMENDATIONS: usize = 5;
/// Newest run older than this puts storage into warning.
const STALE_DATA_DAYS: i64 = 7;
/// Average model accuracy below this puts the predictor into warning.
const MIN_MODEL_ACCURACY: f64 = 0.5;

/// Post-store analysis request for the background worker.
#[derive(Debug, Clone)]
pub struct AnalysisTask {
    pub record_id: String,
    pub suite_name: String,
}

// ---------------------------------------------------------------------------
// Report types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportTrends {
    pub coverage: Option<CoverageTrends>,
    pub performance: Option<PerformanceTrends>,
    pub quality: Option<QualityTrends>,
}

/// A stage that failed while building a report.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageError {
    pub stage: String,
    pub message: String,
    pub insufficient_data: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisReport {
    pub window_days: u32,
    pub generated_at: DateTime<Utc>,
    pub trends: ReportTrends,
    pub predictions: Option<Vec<QualityPrediction>>,
    pub risk: Option<RiskAssessment>,
    pub recommendations: Vec<Recommendation>,
    pub insights: Vec<TrendInsight>,
    pub anomalies: Vec<Anomaly>,
    pub errors: Vec<StageError>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeRange {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardSummary {
    pub total_records: usize,
    pub time_range: TimeRange,
    pub storage_size: u64,
}

/// Change over the window for the headline metric of each trend group.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentTrends {
    pub coverage: f64,
    pub performance: f64,
    pub quality: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Alerts {
    pub critical: Vec<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardData {
    pub summary: DashboardSummary,
    pub recent_trends: RecentTrends,
    pub alerts: Alerts,
    pub top_recommendations: Vec<Recommendation>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisExport {
    pub export_date: DateTime<Utc>,
    pub historical_data: serde_json::Value,
    pub recommendations: Vec<Recommendation>,
    pub model_stats: Vec<ModelStats>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Warning => "warning",
            HealthStatus::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub status: HealthStatus,
    pub detail: String,
}

impl ComponentHealth {
    fn new(status: HealthStatus, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthMetrics {
    pub total_records: usize,
    pub total_test_records: usize,
    pub storage_size_bytes: u64,
    pub tracked_recommendations: usize,
    pub trained_models: usize,
    pub average_model_accuracy: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemHealth {
    pub status: HealthStatus,
    pub components: BTreeMap<String, ComponentHealth>,
    pub metrics: HealthMetrics,
    pub version: &'static str,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct Engine {
    config: AppConfig,
    store: Arc<DataStore>,
    analyzer: Arc<TrendAnalyzer>,
    predictor: Arc<QualityPredictor>,
    recommender: Arc<RecommendationEngine>,
    tasks: mpsc::Sender<AnalysisTask>,
    task_rx: Mutex<Option<mpsc::Receiver<AnalysisTask>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Open the configured database, creating its directory if needed, and
    /// build every component.
    pub fn open(config: AppConfig) -> Result<Self> {
        let store = DataStore::open(&config.storage.db_path, config.retention, EventBus::new())?;
        Ok(Self::with_store(config, store))
    }

    /// Same components over a private in-memory database.
    pub fn in_memory(config: AppConfig) -> Result<Self> {
        let store = DataStore::in_memory(config.retention, EventBus::new())?;
        Ok(Self::with_store(config, store))
    }

    fn with_store(config: AppConfig, store: DataStore) -> Self {
        let ttl = config.analysis.cache_ttl();
        let store = Arc::new(store);
        let analyzer = Arc::new(
            TrendAnalyzer::new(store.clone(), ttl).with_sensitivity(config.analysis.anomaly_sensitivity),
        );
        let predictor = Arc::new(QualityPredictor::new(
            analyzer.clone(),
            ttl,
            config.analysis.default_window_days,
        ));
        let recommender = Arc::new(RecommendationEngine::new(
            analyzer.clone(),
            predictor.clone(),
            config.recommendations.context,
            config.recommendations.max_recommendations,
        ));
        let (tasks, task_rx) = mpsc::channel(TASK_QUEUE_CAP);
        Self {
            config,
            store,
            analyzer,
            predictor,
            recommender,
            tasks,
            task_rx: Mutex::new(Some(task_rx)),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<DataStore> {
        &self.store
    }

    pub fn analyzer(&self) -> &Arc<TrendAnalyzer> {
        &self.analyzer
    }

    pub fn predictor(&self) -> &Arc<QualityPredictor> {
        &self.predictor
    }

    pub fn recommender(&self) -> &Arc<RecommendationEngine> {
        &self.recommender
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.store.events().subscribe()
    }

    /// Spawn the analysis worker and the retention sweeper. Must run inside a
    /// tokio runtime. Calling it twice is a no-op for the worker.
    pub fn start(&self) -> Result<()> {
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(rx) = self.task_rx.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handles.push(tokio::spawn(run_analysis_worker(
                rx,
                self.analyzer.clone(),
                self.config.analysis.default_window_days,
            )));
        }
        handles.push(spawn_retention_loop(self.store.clone(), &self.config.storage.sweep_schedule)?);
        info!("Engine started");
        Ok(())
    }

    pub fn shutdown(&self) {
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        for handle in handles.drain(..) {
            handle.abort();
        }
        info!("Engine stopped");
    }

    /// Validate and persist a run, then queue its follow-up analysis.
    ///
    /// Validation errors come back synchronously and nothing is stored.
    /// Analysis failures are reported on the event channel only.
    pub async fn store_execution(&self, record: TestSuiteExecutionRecord) -> Result<()> {
        validate_suite_record(&record)?;

        let task = AnalysisTask {
            record_id: record.id.clone(),
            suite_name: record.suite_name.clone(),
        };
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.store_suite_record(&record))
            .await
            .map_err(|e| AnalyticsError::analysis("store", e))??;

        if let Err(e) = self.tasks.try_send(task) {
            warn!("Analysis queue full or closed; skipping post-store analysis: {}", e);
        }
        Ok(())
    }

    /// Every analysis for the window, computed concurrently. A failing stage
    /// is recorded in `errors` and does not abort the others.
    pub async fn analysis_report(&self, window_days: u32) -> AnalysisReport {
        let horizon = self.config.analysis.prediction_horizon_days;
        let sensitivity = self.analyzer.sensitivity();

        let (coverage, performance, quality, predictions, risk, insights, anomalies, recommendations) = tokio::join!(
            blocking(self.analyzer.clone(), move |a| a.coverage_trends(window_days)),
            blocking(self.analyzer.clone(), move |a| a.performance_trends(window_days)),
            blocking(self.analyzer.clone(), move |a| a.quality_trends(window_days)),
            blocking(self.predictor.clone(), move |p| p.predict_quality_metrics(horizon)),
            blocking(self.predictor.clone(), move |p| p.assess_quality_risk(horizon)),
            blocking(self.analyzer.clone(), move |a| a.generate_insights(window_days)),
            blocking(self.analyzer.clone(), move |a| a.detect_anomalies(window_days, sensitivity)),
            blocking(self.recommender.clone(), move |r| r.generate_recommendations(window_days, horizon)),
        );

        let mut errors = Vec::new();
        let trends = ReportTrends {
            coverage: self.settle("coverage_trends", coverage, &mut errors),
            performance: self.settle("performance_trends", performance, &mut errors),
            quality: self.settle("quality_trends", quality, &mut errors),
        };
        let predictions = self.settle("predictions", predictions, &mut errors);
        let risk = self.settle("risk_assessment", risk, &mut errors);
        let insights = self.settle("insights", insights, &mut errors).unwrap_or_default();
        let anomalies = self.settle("anomalies", anomalies, &mut errors).unwrap_or_default();
        let recommendations = self
            .settle("recommendations", recommendations, &mut errors)
            .unwrap_or_default();

        info!(window_days, failed_stages = errors.len(), "Analysis report generated");
        AnalysisReport {
            window_days,
            generated_at: Utc::now(),
            trends,
            predictions,
            risk,
            recommendations,
            insights,
            anomalies,
            errors,
        }
    }

    fn settle<T>(&self, stage: &str, result: Result<T>, errors: &mut Vec<StageError>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                let insufficient_data = e.is_insufficient_data();
                if insufficient_data {
                    debug!(stage, "Stage skipped: {}", e);
                } else {
                    error!(stage, "Analysis stage failed: {}", e);
                    self.store.events().publish(EngineEvent::AnalysisFailed {
                        stage: stage.to_string(),
                        message: e.to_string(),
                    });
                }
                errors.push(StageError {
                    stage: stage.to_string(),
                    message: e.to_string(),
                    insufficient_data,
                });
                None
            }
        }
    }

    pub async fn dashboard_data(&self) -> Result<DashboardData> {
        let window = self.config.analysis.default_window_days;
        let horizon = self.config.analysis.prediction_horizon_days;
        let store = self.store.clone();
        let analyzer = self.analyzer.clone();
        let predictor = self.predictor.clone();
        let recommender = self.recommender.clone();

        tokio::task::spawn_blocking(move || -> Result<DashboardData> {
            let stats = store.storage_stats()?;
            let coverage = analyzer.coverage_trends(window)?;
            let performance = analyzer.performance_trends(window)?;
            let quality = analyzer.quality_trends(window)?;
            let anomalies = analyzer.detect_anomalies(window, analyzer.sensitivity())?;
            let risk = match predictor.assess_quality_risk(horizon) {
                Ok(risk) => Some(risk),
                Err(e) if e.is_insufficient_data() => None,
                Err(e) => return Err(e),
            };
            let mut top = recommender.generate_recommendations(window, horizon)?;
            top.retain(|r| !r.status.is_terminal());
            top.truncate(DASHBOARD_RECOMMENDATIONS);

            Ok(DashboardData {
                summary: DashboardSummary {
                    total_records: stats.total_suite_records,
                    time_range: TimeRange {
                        start: stats.oldest_record,
                        end: stats.newest_record,
                    },
                    storage_size: stats.storage_size_bytes,
                },
                recent_trends: RecentTrends {
                    coverage: coverage.overall.change,
                    performance: performance.execution_time.change,
                    quality: quality.pass_rate.change,
                },
                alerts: alerts(&anomalies, risk.as_ref(), &top),
                top_recommendations: top,
            })
        })
        .await
        .map_err(|e| AnalyticsError::analysis("dashboard", e))?
    }

    /// Stored history, tracked recommendations and model statistics.
    ///
    /// JSON yields one envelope; CSV yields the suite-record table, a blank
    /// line, then the recommendation table.
    pub async fn export_analysis_data(&self, format: ExportFormat) -> Result<String> {
        let store = self.store.clone();
        let recommender = self.recommender.clone();
        let predictor = self.predictor.clone();

        tokio::task::spawn_blocking(move || -> Result<String> {
            let history = store.export_data(format)?;
            let recommendations = recommender.recommendations();
            match format {
                ExportFormat::Json => {
                    let export = AnalysisExport {
                        export_date: Utc::now(),
                        historical_data: serde_json::from_str(&history)?,
                        recommendations,
                        model_stats: predictor.model_stats(),
                    };
                    Ok(serde_json::to_string_pretty(&export)?)
                }
                ExportFormat::Csv => {
                    let recs = export_recommendations(&recommendations, RecommendationFormat::Csv)?;
                    Ok(format!("{history}\n{recs}"))
                }
            }
        })
        .await
        .map_err(|e| AnalyticsError::analysis("export", e))?
    }

    pub async fn system_health(&self) -> SystemHealth {
        let store = self.store.clone();
        let analyzer = self.analyzer.clone();
        let predictor = self.predictor.clone();
        let recommender = self.recommender.clone();
        let window = self.config.analysis.default_window_days;

        let result = tokio::task::spawn_blocking(move || {
            let stats = store.storage_stats();
            let insights = analyzer.generate_insights(window).map(|i| i.len());
            health(stats, insights, &predictor.model_stats(), &recommender.recommendations())
        })
        .await;

        match result {
            Ok(health) => health,
            Err(e) => {
                error!("Health check task failed: {}", e);
                let mut components = BTreeMap::new();
                components.insert(
                    "engine".to_string(),
                    ComponentHealth::new(HealthStatus::Critical, format!("health check failed: {e}")),
                );
                SystemHealth {
                    status: HealthStatus::Critical,
                    components,
                    metrics: HealthMetrics {
                        total_records: 0,
                        total_test_records: 0,
                        storage_size_bytes: 0,
                        tracked_recommendations: 0,
                        trained_models: 0,
                        average_model_accuracy: 0.0,
                    },
                    version: env!("CARGO_PKG_VERSION"),
                }
            }
        }
    }

    pub async fn train_models(&self, days: u32) -> Result<Vec<ModelStats>> {
        blocking(self.predictor.clone(), move |p| p.train_models(days)).await
    }

    pub async fn validate_models(&self, test_days: u32) -> Result<Vec<ModelValidation>> {
        blocking(self.predictor.clone(), move |p| p.validate_models(test_days)).await
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let handles = self.handles.get_mut().unwrap_or_else(|e| e.into_inner());
        for handle in handles.drain(..) {
            handle.abort();
        }
    }
}

/// Run a blocking analysis on the blocking pool.
async fn blocking<C, T, F>(component: Arc<C>, f: F) -> Result<T>
where
    C: Send + Sync + 'static,
    T: Send + 'static,
    F: FnOnce(&C) -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(move || f(&component))
        .await
        .map_err(|e| AnalyticsError::analysis("blocking task", e))?
}

/// Drain queued tasks, run one insight pass per batch, and publish the
/// outcome. Runs until every sender is dropped.
async fn run_analysis_worker(mut rx: mpsc::Receiver<AnalysisTask>, analyzer: Arc<TrendAnalyzer>, window_days: u32) {
    info!("Analysis worker started");
    while let Some(task) = rx.recv().await {
        let mut batch = 1;
        while rx.try_recv().is_ok() {
            batch += 1;
        }
        debug!(record = %task.record_id, suite = %task.suite_name, batch, "Running post-store analysis");

        let events = analyzer.store().events().clone();
        let a = analyzer.clone();
        match tokio::task::spawn_blocking(move || a.generate_insights(window_days)).await {
            Ok(Ok(insights)) => events.publish(EngineEvent::InsightsReady { count: insights.len() }),
            Ok(Err(e)) if e.is_insufficient_data() => debug!("Post-store analysis skipped: {}", e),
            Ok(Err(e)) => {
                warn!(record = %task.record_id, "Post-store analysis failed: {}", e);
                events.publish(EngineEvent::AnalysisFailed {
                    stage: "insights".to_string(),
                    message: e.to_string(),
                });
            }
            Err(e) => {
                error!("Post-store analysis task panicked: {}", e);
                events.publish(EngineEvent::AnalysisFailed {
                    stage: "insights".to_string(),
                    message: e.to_string(),
                });
            }
        }
    }
    info!("Analysis worker stopped");
}

fn alerts(anomalies: &[Anomaly], risk: Option<&RiskAssessment>, recs: &[Recommendation]) -> Alerts {
    let mut out = Alerts::default();
    for a in anomalies {
        let line = format!(
            "{} {} anomaly in {} ({:.1} vs expected {:.1})",
            a.severity.as_str(),
            a.metric,
            a.suite_name,
            a.actual_value,
            a.expected_value
        );
        match a.severity {
            Severity::High => out.critical.push(line),
            Severity::Medium => out.warnings.push(line),
            Severity::Low => {}
        }
    }
    if let Some(risk) = risk {
        for area in &risk.critical_areas {
            out.critical.push(format!("{area} is at high risk"));
        }
        if risk.overall_risk == RiskLevel::Medium {
            out.warnings.push(format!("Overall quality risk is medium ({:.0})", risk.risk_score));
        }
    }
    for r in recs.iter().filter(|r| r.priority == Priority::Critical) {
        out.critical.push(r.title.clone());
    }
    out
}

fn health(
    stats: Result<StorageStats>,
    insights: Result<usize>,
    models: &[ModelStats],
    recs: &[Recommendation],
) -> SystemHealth {
    let mut components = BTreeMap::new();

    let storage = match &stats {
        Err(e) => ComponentHealth::new(HealthStatus::Critical, format!("storage unavailable: {e}")),
        Ok(s) if s.total_suite_records == 0 => ComponentHealth::new(HealthStatus::Warning, "no runs recorded"),
        Ok(s) => match s.newest_record {
            Some(newest) if newest < Utc::now() - chrono::Duration::days(STALE_DATA_DAYS) => ComponentHealth::new(
                HealthStatus::Warning,
                format!("no runs recorded since {}", newest.format("%Y-%m-%d")),
            ),
            _ => ComponentHealth::new(HealthStatus::Healthy, format!("{} runs stored", s.total_suite_records)),
        },
    };
    components.insert("storage".to_string(), storage);

    let analyzer = match insights {
        Ok(n) => ComponentHealth::new(HealthStatus::Healthy, format!("{n} insights")),
        Err(e) if e.is_insufficient_data() => ComponentHealth::new(HealthStatus::Warning, e.to_string()),
        Err(e) => ComponentHealth::new(HealthStatus::Critical, e.to_string()),
    };
    components.insert("analyzer".to_string(), analyzer);

    let trained: Vec<&ModelStats> = models.iter().filter(|m| m.trained_at.is_some()).collect();
    let average_model_accuracy = if models.is_empty() {
        0.0
    } else {
        models.iter().map(|m| m.accuracy).sum::<f64>() / models.len() as f64
    };
    let predictor = if trained.is_empty() {
        ComponentHealth::new(HealthStatus::Warning, "models have not been trained; using priors")
    } else if average_model_accuracy < MIN_MODEL_ACCURACY {
        ComponentHealth::new(
            HealthStatus::Warning,
            format!("average model accuracy {average_model_accuracy:.2}"),
        )
    } else {
        ComponentHealth::new(HealthStatus::Healthy, format!("{} models trained", trained.len()))
    };
    components.insert("predictor".to_string(), predictor);

    let open_critical = recs
        .iter()
        .filter(|r| !r.status.is_terminal() && r.priority == Priority::Critical)
        .count();
    let recommender = if open_critical > 0 {
        ComponentHealth::new(HealthStatus::Warning, format!("{open_critical} critical recommendations open"))
    } else {
        ComponentHealth::new(HealthStatus::Healthy, format!("{} recommendations tracked", recs.len()))
    };
    components.insert("recommendations".to_string(), recommender);

    let status = components
        .values()
        .map(|c| c.status)
        .max()
        .unwrap_or(HealthStatus::Healthy);
    let stats = stats.ok();

    SystemHealth {
        status,
        components,
        metrics: HealthMetrics {
            total_records: stats.as_ref().map_or(0, |s| s.total_suite_records),
            total_test_records: stats.as_ref().map_or(0, |s| s.total_test_records),
            storage_size_bytes: stats.as_ref().map_or(0, |s| s.storage_size_bytes),
            tracked_recommendations: recs.len(),
            trained_models: trained.len(),
            average_model_accuracy,
        },
        version: env!("CARGO_PKG_VERSION"),
    }
}
