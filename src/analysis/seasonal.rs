//! Hour-of-day and day-of-week pattern detection.

use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::analysis::stats::TimeSeries;

/// Fewer populated buckets than this cannot show a pattern.
pub const MIN_PATTERN_BUCKETS: usize = 3;
/// Weaker patterns are not reported.
pub const MIN_PATTERN_STRENGTH: f64 = 0.1;

const DAY_NAMES: [&str; 7] = ["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatternKind {
    Daily,
    Weekly,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SeasonalPattern {
    pub metric: String,
    pub pattern: PatternKind,
    /// Spread of bucket means relative to the grand mean, in [0, 1].
    pub strength: f64,
    /// Hours (0-23) or weekdays (0 = Monday).
    pub peaks: Vec<u32>,
    pub valleys: Vec<u32>,
    pub description: String,
}

/// Daily and weekly patterns in `points` strong enough to report.
pub fn detect_patterns(metric: &str, points: &[(DateTime<Utc>, f64)]) -> Vec<SeasonalPattern> {
    [PatternKind::Daily, PatternKind::Weekly]
        .into_iter()
        .filter_map(|kind| bucket_pattern(metric, kind, points))
        .filter(|p| p.strength >= MIN_PATTERN_STRENGTH)
        .collect()
}

/// Bucket `points` and measure the spread of bucket means. `None` when too
/// few buckets are populated.
pub fn bucket_pattern(metric: &str, kind: PatternKind, points: &[(DateTime<Utc>, f64)]) -> Option<SeasonalPattern> {
    let mut buckets: BTreeMap<u32, Vec<f64>> = BTreeMap::new();
    for (t, v) in points {
        let bucket = match kind {
            PatternKind::Daily => t.hour(),
            PatternKind::Weekly => t.weekday().num_days_from_monday(),
        };
        buckets.entry(bucket).or_default().push(*v);
    }
    if buckets.len() < MIN_PATTERN_BUCKETS {
        return None;
    }

    let means: Vec<(u32, f64)> = buckets
        .iter()
        .map(|(b, vs)| (*b, TimeSeries::new(vs).mean()))
        .collect();
    let all: Vec<f64> = points.iter().map(|p| p.1).collect();
    let grand_mean = TimeSeries::new(&all).mean();

    let bucket_means: Vec<f64> = means.iter().map(|m| m.1).collect();
    let spread = TimeSeries::new(&bucket_means);
    let (center, sd) = (spread.mean(), spread.std_dev());
    let strength = if grand_mean.abs() < f64::EPSILON {
        sd.min(1.0)
    } else {
        (sd / grand_mean.abs()).min(1.0)
    };

    let peaks: Vec<u32> = means.iter().filter(|m| m.1 > center + sd).map(|m| m.0).collect();
    let valleys: Vec<u32> = means.iter().filter(|m| m.1 < center - sd).map(|m| m.0).collect();
    let description = describe(metric, kind, &peaks, &valleys);

    Some(SeasonalPattern {
        metric: metric.to_string(),
        pattern: kind,
        strength,
        peaks,
        valleys,
        description,
    })
}

fn label(kind: PatternKind, bucket: u32) -> String {
    match kind {
        PatternKind::Daily => format!("{bucket:02}:00 UTC"),
        PatternKind::Weekly => DAY_NAMES.get(bucket as usize).copied().unwrap_or("?").to_string(),
    }
}

fn describe(metric: &str, kind: PatternKind, peaks: &[u32], valleys: &[u32]) -> String {
    let span = match kind {
        PatternKind::Daily => "daily",
        PatternKind::Weekly => "weekly",
    };
    let join = |bs: &[u32]| bs.iter().map(|b| label(kind, *b)).collect::<Vec<_>>().join(", ");
    match (peaks.is_empty(), valleys.is_empty()) {
        (false, false) => format!("{metric} follows a {span} cycle: high at {}, low at {}", join(peaks), join(valleys)),
        (false, true) => format!("{metric} follows a {span} cycle: high at {}", join(peaks)),
        (true, false) => format!("{metric} follows a {span} cycle: low at {}", join(valleys)),
        (true, true) => format!("{metric} varies on a {span} cycle without a single dominant period"),
    }
}
