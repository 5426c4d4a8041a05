//! Recommendation synthesis, deduplication, prioritization and tracking.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{Duration, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::analysis::anomaly::Anomaly;
use crate::analysis::insight::{InsightType, TrendInsight};
use crate::analysis::predictor::{QualityPredictor, RecommendationSeed, RiskLevel};
use crate::analysis::{Severity, TrendAnalyzer};
use crate::error::{AnalyticsError, Result};
use crate::events::EngineEvent;
use crate::recommend::{
    Category, Effort, Level, ProjectPhase, Priority, Recommendation, RecommendationContext, RecommendationType, Role,
    Status, TestingMaturity,
};
use crate::storage::DataStore;

pub const DEFAULT_MAX_RECOMMENDATIONS: usize = 20;
/// Flakiness at or above which a test is reported.
const FLAKY_THRESHOLD: f64 = 0.2;
/// Flakiness that makes the flaky-test recommendation high priority.
const SEVERE_FLAKINESS: f64 = 0.3;
/// A failure signature seen this often is worth investigating.
const RECURRING_FAILURES: usize = 3;
/// Fewer runs than this in a week is an infrequent cadence.
const MIN_WEEKLY_RUNS: usize = 3;
/// Completed and dismissed recommendations kept for the effectiveness report.
pub const MAX_TERMINAL_HISTORY: usize = 500;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EffectivenessReport {
    pub total: usize,
    pub completed: usize,
    pub dismissed: usize,
    pub completion_rate: f64,
    pub average_days_to_complete: Option<f64>,
    pub impact_realized: f64,
    /// Most frequent categories among completed recommendations.
    pub top_categories: Vec<(Category, usize)>,
}

pub struct RecommendationEngine {
    store: Arc<DataStore>,
    analyzer: Arc<TrendAnalyzer>,
    predictor: Arc<QualityPredictor>,
    context: RwLock<RecommendationContext>,
    max_recommendations: usize,
    tracked: RwLock<HashMap<String, Recommendation>>,
}

impl RecommendationEngine {
    pub fn new(
        analyzer: Arc<TrendAnalyzer>,
        predictor: Arc<QualityPredictor>,
        context: RecommendationContext,
        max_recommendations: usize,
    ) -> Self {
        Self {
            store: analyzer.store().clone(),
            analyzer,
            predictor,
            context: RwLock::new(context),
            max_recommendations,
            tracked: RwLock::new(HashMap::new()),
        }
    }

    pub fn context(&self) -> RecommendationContext {
        *self.context.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_context(&self, context: RecommendationContext) {
        *self.context.write().unwrap_or_else(|e| e.into_inner()) = context;
    }

    /// Build the current recommendation list from every source, then track it.
    pub fn generate_recommendations(&self, window_days: u32, horizon_days: u32) -> Result<Vec<Recommendation>> {
        let mut candidates = Vec::new();

        let insights = self.analyzer.generate_insights(window_days)?;
        candidates.extend(insights.iter().filter(|i| i.severity == Severity::High).filter_map(from_insight));

        match self.predictor.recommendation_seeds(horizon_days) {
            Ok(seeds) => candidates.extend(seeds.into_iter().map(from_seed)),
            Err(e) if e.is_insufficient_data() => debug!("Skipping prediction-based recommendations: {}", e),
            Err(e) => return Err(e),
        }

        let anomalies = self.analyzer.detect_anomalies(window_days, self.analyzer.sensitivity())?;
        candidates.extend(anomalies.iter().filter(|a| a.severity == Severity::High).map(from_anomaly));

        candidates.extend(self.maintenance_triggers(window_days)?);
        candidates.extend(self.process_triggers(window_days)?);

        let context = self.context();
        for rec in &mut candidates {
            customize(rec, &context);
        }

        let mut list = deduplicate(candidates);
        prioritize(&mut list);
        list.truncate(self.max_recommendations);

        let list = self.track(list);
        info!(count = list.len(), window_days, "Generated recommendations");
        self.store
            .events()
            .publish(EngineEvent::RecommendationsReady { count: list.len() });
        Ok(list)
    }

    /// Reuse the id and status of an open tracked recommendation with the
    /// same title key. Open recommendations missing from `list` no longer
    /// have a firing trigger and are retired; terminal ones stay as history,
    /// newest [`MAX_TERMINAL_HISTORY`] only.
    fn track(&self, list: Vec<Recommendation>) -> Vec<Recommendation> {
        let mut tracked = self.tracked.write().unwrap_or_else(|e| e.into_inner());
        let open: HashMap<String, (String, Status, chrono::DateTime<Utc>)> = tracked
            .values()
            .filter(|r| !r.status.is_terminal())
            .map(|r| (r.title_key(), (r.id.clone(), r.status, r.created_at)))
            .collect();

        tracked.retain(|_, r| r.status.is_terminal());

        let list: Vec<Recommendation> = list
            .into_iter()
            .map(|mut rec| {
                if let Some((id, status, created_at)) = open.get(&rec.title_key()) {
                    rec.id = id.clone();
                    rec.status = *status;
                    rec.created_at = *created_at;
                }
                tracked.insert(rec.id.clone(), rec.clone());
                rec
            })
            .collect();

        let retired = open.values().filter(|(id, _, _)| !tracked.contains_key(id)).count();
        if retired > 0 {
            debug!(retired, "Retired recommendations whose triggers no longer fire");
        }
        trim_history(&mut tracked);
        list
    }

    fn maintenance_triggers(&self, window_days: u32) -> Result<Vec<Recommendation>> {
        let mut out = Vec::new();

        let stats = self.store.storage_stats()?;
        let archive_days = self.store.retention_policy().archive_threshold_days;
        if let Some(oldest) = stats.oldest_record {
            if oldest < Utc::now() - Duration::days(archive_days as i64) {
                out.push(
                    Recommendation::new(
                        RecommendationType::Maintenance,
                        Category::Maintenance,
                        Priority::Low,
                        "Archive stale test history",
                        format!(
                            "{} runs are older than the {archive_days}-day archive threshold",
                            stats.archivable_records
                        ),
                    )
                    .rationale("Old runs slow every analysis pass and rarely change conclusions")
                    .actions(["Export the history", "Tighten the retention policy"])
                    .impact(20.0)
                    .effort(Effort::Low)
                    .confidence(0.9),
                );
            }
        }

        let flaky = self.store.flaky_tests(window_days, FLAKY_THRESHOLD)?;
        if let Some(worst) = flaky.first() {
            let priority = if worst.flakiness >= SEVERE_FLAKINESS { Priority::High } else { Priority::Medium };
            out.push(
                Recommendation::new(
                    RecommendationType::Maintenance,
                    Category::Reliability,
                    priority,
                    "Fix flaky tests",
                    format!(
                        "{} tests fail intermittently; worst is {}::{} at {:.0}%",
                        flaky.len(),
                        worst.file,
                        worst.name,
                        worst.flakiness * 100.0
                    ),
                )
                .rationale("Intermittent failures erode trust in the suite and hide real regressions")
                .actions(flaky.iter().take(5).map(|t| format!("Stabilize {}::{}", t.file, t.name)))
                .impact(70.0)
                .effort(Effort::Medium)
                .confidence(0.8),
            );
        }

        let patterns = self.store.failure_patterns(window_days)?;
        if let Some(top) = patterns.first().filter(|p| p.count >= RECURRING_FAILURES) {
            out.push(
                Recommendation::new(
                    RecommendationType::Investigation,
                    Category::Reliability,
                    Priority::Medium,
                    format!("Investigate recurring {} failures", top.error_type),
                    format!(
                        "'{}' occurred {} times across {} tests",
                        top.message, top.count, top.affected_tests
                    ),
                )
                .rationale("A single root cause is often behind a repeated failure signature")
                .actions(["Reproduce the failure locally", "Add a regression test for the root cause"])
                .impact(55.0)
                .effort(Effort::Medium)
                .confidence(0.7),
            );
        }
        Ok(out)
    }

    fn process_triggers(&self, window_days: u32) -> Result<Vec<Recommendation>> {
        let mut out = Vec::new();
        let runs = self.store.recent_suite_records(window_days)?;
        if runs.is_empty() {
            return Ok(out);
        }

        let week_ago = Utc::now() - Duration::days(7);
        let this_week = runs.iter().filter(|r| r.timestamp >= week_ago).count();
        if this_week < MIN_WEEKLY_RUNS {
            out.push(
                Recommendation::new(
                    RecommendationType::Process,
                    Category::Process,
                    Priority::Medium,
                    "Run tests more frequently",
                    format!("Only {this_week} runs in the last 7 days"),
                )
                .rationale("Infrequent runs let regressions pile up between feedback cycles")
                .actions(["Run the suite on every push", "Add a nightly scheduled run"])
                .impact(45.0)
                .effort(Effort::Low)
                .confidence(0.8),
            );
        }

        if !runs.iter().any(|r| r.environment.ci) {
            out.push(
                Recommendation::new(
                    RecommendationType::Process,
                    Category::Process,
                    Priority::Medium,
                    "Run tests in continuous integration",
                    format!("None of the {} runs in the window came from CI", runs.len()),
                )
                .rationale("Local-only runs depend on each developer remembering to test")
                .actions(["Add a CI job for the suite", "Block merges on a failing suite"])
                .impact(60.0)
                .effort(Effort::Medium)
                .confidence(0.8),
            );
        }
        Ok(out)
    }

    /// Tracked, open recommendations for `role`, in priority order.
    pub fn get_personalized_recommendations(&self, role: Role, limit: usize) -> Vec<Recommendation> {
        let tracked = self.tracked.read().unwrap_or_else(|e| e.into_inner());
        let mut list: Vec<Recommendation> = tracked
            .values()
            .filter(|r| !r.status.is_terminal() && r.target_audience.contains(&role))
            .cloned()
            .collect();
        prioritize(&mut list);
        list.truncate(limit);
        list
    }

    /// Every tracked recommendation, in priority order.
    pub fn recommendations(&self) -> Vec<Recommendation> {
        let tracked = self.tracked.read().unwrap_or_else(|e| e.into_inner());
        let mut list: Vec<Recommendation> = tracked.values().cloned().collect();
        prioritize(&mut list);
        list
    }

    pub fn get(&self, id: &str) -> Result<Recommendation> {
        let tracked = self.tracked.read().unwrap_or_else(|e| e.into_inner());
        tracked.get(id).cloned().ok_or_else(|| AnalyticsError::NotFound {
            kind: "recommendation",
            id: id.to_string(),
        })
    }

    pub fn update_status(&self, id: &str, status: Status) -> Result<Recommendation> {
        let mut tracked = self.tracked.write().unwrap_or_else(|e| e.into_inner());
        let rec = tracked.get_mut(id).ok_or_else(|| AnalyticsError::NotFound {
            kind: "recommendation",
            id: id.to_string(),
        })?;
        if !rec.status.can_transition_to(status) {
            return Err(AnalyticsError::Validation(format!(
                "recommendation {id} cannot move from {} to {}",
                rec.status.as_str(),
                status.as_str()
            )));
        }
        if rec.status != status {
            let now = Utc::now();
            rec.status = status;
            rec.updated_at = now;
            if status == Status::Completed {
                rec.completed_at = Some(now);
            }
            info!(%id, status = status.as_str(), "Recommendation status updated");
        }
        Ok(rec.clone())
    }

    pub fn effectiveness_report(&self) -> EffectivenessReport {
        let tracked = self.tracked.read().unwrap_or_else(|e| e.into_inner());
        effectiveness(tracked.values())
    }
}

fn effectiveness<'a>(recs: impl Iterator<Item = &'a Recommendation>) -> EffectivenessReport {
    let all: Vec<&Recommendation> = recs.collect();
    let completed: Vec<&&Recommendation> = all.iter().filter(|r| r.status == Status::Completed).collect();
    let dismissed = all.iter().filter(|r| r.status == Status::Dismissed).count();

    let durations: Vec<f64> = completed
        .iter()
        .filter_map(|r| r.completed_at.map(|c| (c - r.created_at).num_seconds() as f64 / 86_400.0))
        .collect();
    let average_days_to_complete =
        (!durations.is_empty()).then(|| durations.iter().sum::<f64>() / durations.len() as f64);

    let mut counts: HashMap<Category, usize> = HashMap::new();
    for r in &completed {
        *counts.entry(r.category).or_default() += 1;
    }
    let mut top_categories: Vec<(Category, usize)> = counts.into_iter().collect();
    top_categories.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    top_categories.truncate(3);

    EffectivenessReport {
        total: all.len(),
        completed: completed.len(),
        dismissed,
        completion_rate: if all.is_empty() { 0.0 } else { completed.len() as f64 / all.len() as f64 },
        average_days_to_complete,
        impact_realized: completed.iter().map(|r| r.estimated_impact).sum(),
        top_categories,
    }
}

/// Drop the oldest terminal recommendations beyond [`MAX_TERMINAL_HISTORY`].
fn trim_history(tracked: &mut HashMap<String, Recommendation>) {
    let mut terminal: Vec<(chrono::DateTime<Utc>, String)> = tracked
        .values()
        .filter(|r| r.status.is_terminal())
        .map(|r| (r.completed_at.unwrap_or(r.created_at), r.id.clone()))
        .collect();
    if terminal.len() <= MAX_TERMINAL_HISTORY {
        return;
    }
    terminal.sort();
    let excess = terminal.len() - MAX_TERMINAL_HISTORY;
    for (_, id) in terminal.into_iter().take(excess) {
        tracked.remove(&id);
    }
}

/// Collapse candidates sharing a title key, keeping the higher priority
/// (then higher impact). First-seen order is preserved.
pub fn deduplicate(candidates: Vec<Recommendation>) -> Vec<Recommendation> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut out: Vec<Recommendation> = Vec::new();
    for rec in candidates {
        match index.get(&rec.title_key()) {
            Some(&i) => {
                let kept = &out[i];
                if (rec.priority, rec.estimated_impact) > (kept.priority, kept.estimated_impact) {
                    out[i] = rec;
                }
            }
            None => {
                index.insert(rec.title_key(), out.len());
                out.push(rec);
            }
        }
    }
    out
}

/// Priority descending, then estimated impact descending.
pub fn prioritize(list: &mut [Recommendation]) {
    list.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| b.estimated_impact.total_cmp(&a.estimated_impact))
            .then_with(|| a.title.cmp(&b.title))
    });
}

/// Adjust effort and wording for the team. Priority and triggers are untouched.
fn customize(rec: &mut Recommendation, ctx: &RecommendationContext) {
    if ctx.team_size < 3 || ctx.available_resources == Level::Low {
        rec.estimated_effort = rec.estimated_effort.raised();
    } else if ctx.team_size >= 10 && ctx.available_resources == Level::High {
        rec.estimated_effort = rec.estimated_effort.lowered();
    }

    let mut notes = Vec::new();
    if ctx.time_constraints == Level::High {
        notes.push("Time is tight: start with the first action item only.");
    }
    match ctx.project_phase {
        ProjectPhase::Startup => notes.push("Favour quick wins while the codebase is young."),
        ProjectPhase::Maintenance => notes.push("Prefer low-risk changes in maintenance mode."),
        _ => {}
    }
    if ctx.testing_maturity == TestingMaturity::Beginner {
        notes.push("Pair with an experienced tester on the first step.");
    }
    if ctx.risk_tolerance == Level::Low && rec.priority >= Priority::High {
        notes.push("Low risk tolerance: schedule this before new feature work.");
    }
    for note in notes {
        if !rec.rationale.is_empty() {
            rec.rationale.push(' ');
        }
        rec.rationale.push_str(note);
    }
}

/// Title, category and impact for a metric named in an insight.
fn metric_template(metric: &str) -> Option<(&'static str, Category, f64)> {
    Some(match metric {
        "coverage" | "statements" | "branches" | "functions" | "lines" => ("Improve test coverage", Category::Coverage, 70.0),
        "pass_rate" | "failure_rate" | "test_stability" => ("Stabilize failing tests", Category::Reliability, 80.0),
        "flakiness" => ("Fix flaky tests", Category::Reliability, 70.0),
        "execution_time" => ("Reduce test execution time", Category::Performance, 60.0),
        "memory_usage" => ("Reduce test memory usage", Category::Performance, 50.0),
        "test_count" => ("Restore shrinking test suite", Category::Coverage, 55.0),
        "code_churn" => ("Review test suite churn", Category::Maintenance, 35.0),
        _ => return None,
    })
}

fn from_insight(insight: &TrendInsight) -> Option<Recommendation> {
    let metric = insight.metrics.first()?;
    match insight.insight_type {
        InsightType::Degradation => {
            let (title, category, impact) = metric_template(metric)?;
            Some(
                Recommendation::new(RecommendationType::Improvement, category, Priority::High, title, insight.description.clone())
                    .rationale(format!("Trend analysis: {}", insight.title))
                    .actions(insight.action_items.clone())
                    .impact(impact)
                    .confidence(insight.confidence),
            )
        }
        InsightType::Anomaly => Some(
            investigate(metric)
                .rationale(insight.description.clone())
                .actions(insight.action_items.clone())
                .confidence(insight.confidence),
        ),
        _ => None,
    }
}

fn investigate(metric: &str) -> Recommendation {
    let category = metric_template(metric).map(|t| t.1).unwrap_or(Category::Reliability);
    let label = metric.replace('_', " ");
    Recommendation::new(
        RecommendationType::Investigation,
        category,
        Priority::High,
        format!("Investigate {label} anomalies"),
        format!("Recent runs show {label} far outside its usual range"),
    )
    .impact(60.0)
    .effort(Effort::Low)
}

fn from_anomaly(anomaly: &Anomaly) -> Recommendation {
    investigate(&anomaly.metric)
        .rationale(format!(
            "{} run {} measured {:.1} against an expected {:.1}",
            anomaly.suite_name, anomaly.record_id, anomaly.actual_value, anomaly.expected_value
        ))
        .actions(anomaly.possible_causes.iter().map(|c| format!("Check: {c}")))
        .confidence(0.9)
}

fn from_seed(seed: RecommendationSeed) -> Recommendation {
    let priority = if seed.critical {
        Priority::Critical
    } else if seed.risk_level == RiskLevel::Medium {
        Priority::High
    } else {
        Priority::Medium
    };
    let category = metric_template(seed.metric.name()).map(|t| t.1).unwrap_or(Category::Reliability);
    Recommendation::new(RecommendationType::Improvement, category, priority, seed.title, seed.description)
        .rationale(format!("Forecast risk for {} is {:?}", seed.metric, seed.risk_level).to_lowercase())
        .actions(seed.action_items)
        .impact(seed.estimated_impact)
        .confidence(seed.confidence)
}
