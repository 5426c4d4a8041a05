//! Merge trend classifications, anomalies and seasonal patterns into insights.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::analysis::anomaly::Anomaly;
use crate::analysis::seasonal::SeasonalPattern;
use crate::analysis::trend::{TrendDirection, TrendStatistic};
use crate::analysis::{higher_is_better, Severity};

/// Directional trends below this confidence are not reported.
pub const INSIGHT_MIN_CONFIDENCE: f64 = 0.4;
const HIGH_CHANGE: f64 = 0.10;
const MEDIUM_CHANGE: f64 = 0.05;
const VOLATILE_CONFIDENCE: f64 = 0.6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InsightType {
    Improvement,
    Degradation,
    Anomaly,
    Pattern,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrendInsight {
    pub id: String,
    #[serde(rename = "type")]
    pub insight_type: InsightType,
    pub title: String,
    pub description: String,
    pub severity: Severity,
    pub confidence: f64,
    pub action_items: Vec<String>,
    pub metrics: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl TrendInsight {
    fn new(insight_type: InsightType, title: String, description: String, severity: Severity, confidence: f64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            insight_type,
            title,
            description,
            severity,
            confidence: confidence.clamp(0.0, 1.0),
            action_items: Vec::new(),
            metrics: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    fn with_actions(mut self, items: &[&str]) -> Self {
        self.action_items = items.iter().map(|s| s.to_string()).collect();
        self
    }

    fn with_metric(mut self, metric: &str) -> Self {
        self.metrics.push(metric.to_string());
        self
    }
}

/// Sorted by severity, then confidence, both descending.
pub fn synthesize(stats: &[&TrendStatistic], anomalies: &[Anomaly], patterns: &[SeasonalPattern]) -> Vec<TrendInsight> {
    let mut out: Vec<TrendInsight> = stats.iter().filter_map(|s| from_trend(s)).collect();
    out.extend(from_anomalies(anomalies));
    out.extend(patterns.iter().map(from_pattern));

    out.sort_by(|a, b| {
        b.severity
            .cmp(&a.severity)
            .then_with(|| b.confidence.total_cmp(&a.confidence))
    });
    out
}

fn from_trend(stat: &TrendStatistic) -> Option<TrendInsight> {
    let label = stat.metric.replace('_', " ");
    match stat.trend {
        TrendDirection::Stable => None,
        TrendDirection::Volatile => Some(
            TrendInsight::new(
                InsightType::Pattern,
                format!("{label} is volatile"),
                format!("{label} swings between runs without a clear direction ({} samples)", stat.samples),
                Severity::Medium,
                VOLATILE_CONFIDENCE,
            )
            .with_actions(&["Look for non-deterministic tests or environments", "Compare runs on different CI agents"])
            .with_metric(&stat.metric),
        ),
        direction => {
            if stat.confidence < INSIGHT_MIN_CONFIDENCE {
                return None;
            }
            let rising = direction == TrendDirection::Increasing;
            let improving = rising == higher_is_better(&stat.metric);
            let verb = if rising { "rising" } else { "falling" };
            let rel = stat.relative_change();
            let reversal = if stat.reversal { " after a reversal" } else { "" };

            let insight = if improving {
                TrendInsight::new(
                    InsightType::Improvement,
                    format!("{label} is improving"),
                    format!("{label} is {verb}{reversal} ({:.1}% over the window)", rel * 100.0),
                    Severity::Low,
                    stat.confidence,
                )
                .with_actions(&["Record what changed so the improvement sticks"])
            } else {
                let severity = if rel > HIGH_CHANGE {
                    Severity::High
                } else if rel > MEDIUM_CHANGE {
                    Severity::Medium
                } else {
                    Severity::Low
                };
                TrendInsight::new(
                    InsightType::Degradation,
                    format!("{label} is degrading"),
                    format!("{label} is {verb}{reversal} ({:.1}% over the window)", rel * 100.0),
                    severity,
                    stat.confidence,
                )
                .with_actions(&[
                    "Review commits merged during the window",
                    "Add a quality gate on this metric",
                ])
            };
            Some(insight.with_metric(&stat.metric))
        }
    }
}

/// One insight per metric, carrying the worst severity seen.
fn from_anomalies(anomalies: &[Anomaly]) -> Vec<TrendInsight> {
    let mut by_metric: BTreeMap<&str, Vec<&Anomaly>> = BTreeMap::new();
    for a in anomalies {
        by_metric.entry(a.metric.as_str()).or_default().push(a);
    }

    by_metric
        .into_iter()
        .map(|(metric, group)| {
            let severity = group.iter().map(|a| a.severity).max().unwrap_or(Severity::Low);
            let max_z = group.iter().map(|a| a.z_score.abs()).fold(0.0, f64::max);
            let label = metric.replace('_', " ");
            let mut insight = TrendInsight::new(
                InsightType::Anomaly,
                format!("{} {label} anomal{} detected", group.len(), if group.len() == 1 { "y" } else { "ies" }),
                format!("Largest deviation is {max_z:.1} standard deviations from the recent baseline"),
                severity,
                (max_z / (2.0 * 3.0)).min(1.0),
            )
            .with_metric(metric);
            let mut causes: Vec<String> = group.iter().flat_map(|a| a.possible_causes.iter().cloned()).collect();
            causes.dedup();
            insight.action_items = causes.into_iter().map(|c| format!("Check: {c}")).collect();
            insight
        })
        .collect()
}

fn from_pattern(p: &SeasonalPattern) -> TrendInsight {
    TrendInsight::new(
        InsightType::Pattern,
        format!("{} has a recurring cycle", p.metric.replace('_', " ")),
        p.description.clone(),
        Severity::Low,
        p.strength,
    )
    .with_actions(&["Schedule heavy suites away from peak periods"])
    .with_metric(&p.metric)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::trend::fit_trend;
    use chrono::Duration;

    fn stat(metric: &str, values: &[f64]) -> TrendStatistic {
        let start = Utc::now() - Duration::days(values.len() as i64);
        let pts: Vec<_> = values
            .iter()
            .enumerate()
            .map(|(i, v)| (start + Duration::days(i as i64), *v))
            .collect();
        fit_trend(metric, &pts)
    }

    fn anomaly(z: f64, severity: Severity) -> Anomaly {
        Anomaly {
            timestamp: Utc::now(),
            metric: "execution_time".into(),
            suite_name: "unit".into(),
            record_id: "r".into(),
            expected_value: 30.0,
            actual_value: 120.0,
            z_score: z,
            severity,
            possible_causes: vec!["Slow or newly added tests".into()],
        }
    }

    #[test]
    fn test_polarity_decides_type() {
        let rising: Vec<f64> = (0..20).map(|i| 100.0 + 10.0 * i as f64).collect();
        let slow = stat("execution_time", &rising);
        let cov = stat("coverage", &rising);
        let insights = synthesize(&[&slow, &cov], &[], &[]);
        let by_metric = |m: &str| insights.iter().find(|i| i.metrics == vec![m.to_string()]).unwrap();
        assert_eq!(by_metric("execution_time").insight_type, InsightType::Degradation);
        assert_eq!(by_metric("execution_time").severity, Severity::High);
        assert_eq!(by_metric("coverage").insight_type, InsightType::Improvement);
    }

    #[test]
    fn test_sorted_by_severity_then_confidence() {
        let flat = stat("coverage", &[80.0; 10]);
        let anomalies = [anomaly(30.0, Severity::High), anomaly(2.5, Severity::Medium)];
        let rising: Vec<f64> = (0..20).map(|i| 50.0 + i as f64).collect();
        let better = stat("pass_rate", &rising);
        let insights = synthesize(&[&flat, &better], &anomalies, &[]);

        assert_eq!(insights.len(), 2);
        assert_eq!(insights[0].insight_type, InsightType::Anomaly);
        assert_eq!(insights[0].severity, Severity::High);
        assert!(insights[0].title.starts_with("2 execution time anomalies"));
        for pair in insights.windows(2) {
            assert!(
                pair[0].severity > pair[1].severity
                    || (pair[0].severity == pair[1].severity && pair[0].confidence >= pair[1].confidence)
            );
        }
    }
}
