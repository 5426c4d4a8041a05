//! Recommendation export as JSON, CSV or a Markdown report.

use std::fmt::Write as _;
use std::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{AnalyticsError, Result};
use crate::recommend::{Priority, Recommendation, Status};
use crate::storage::transfer::escape;

pub const RECOMMENDATION_CSV_HEADER: &str = "ID,Title,Priority,Category,Status,Impact,Effort,Created";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecommendationFormat {
    Json,
    Csv,
    Markdown,
}

impl FromStr for RecommendationFormat {
    type Err = AnalyticsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(RecommendationFormat::Json),
            "csv" => Ok(RecommendationFormat::Csv),
            "markdown" | "md" => Ok(RecommendationFormat::Markdown),
            other => Err(AnalyticsError::Validation(format!(
                "unsupported recommendation format '{other}'"
            ))),
        }
    }
}

pub fn export_recommendations(recs: &[Recommendation], format: RecommendationFormat) -> Result<String> {
    match format {
        RecommendationFormat::Json => Ok(serde_json::to_string_pretty(recs)?),
        RecommendationFormat::Csv => Ok(to_csv(recs)),
        RecommendationFormat::Markdown => Ok(to_markdown(recs)),
    }
}

fn to_csv(recs: &[Recommendation]) -> String {
    let mut out = String::from(RECOMMENDATION_CSV_HEADER);
    out.push('\n');
    for r in recs {
        let row = [
            escape(&r.id),
            escape(&r.title),
            r.priority.as_str().to_string(),
            r.category.as_str().to_string(),
            r.status.as_str().to_string(),
            format!("{:.0}", r.estimated_impact),
            r.estimated_effort.as_str().to_string(),
            r.created_at.to_rfc3339(),
        ];
        out.push_str(&row.join(","));
        out.push('\n');
    }
    out
}

fn to_markdown(recs: &[Recommendation]) -> String {
    let mut out = String::from("# Test Quality Recommendations\n\n");
    let _ = writeln!(out, "Generated {}\n", Utc::now().format("%Y-%m-%d %H:%M UTC"));

    out.push_str("## Summary\n\n");
    let open = recs.iter().filter(|r| !r.status.is_terminal()).count();
    let done = recs.iter().filter(|r| r.status == Status::Completed).count();
    let _ = writeln!(out, "- Total: {}", recs.len());
    let _ = writeln!(out, "- Open: {open}");
    let _ = writeln!(out, "- Completed: {done}");
    out.push('\n');

    for priority in [Priority::Critical, Priority::High, Priority::Medium, Priority::Low] {
        let group: Vec<&Recommendation> = recs.iter().filter(|r| r.priority == priority).collect();
        if group.is_empty() {
            continue;
        }
        let _ = writeln!(out, "## {} priority\n", capitalize(priority.as_str()));
        for r in group {
            let _ = writeln!(out, "### {}\n", r.title);
            let _ = writeln!(
                out,
                "*{}* | impact {:.0} | effort {} | {}\n",
                r.category.as_str(),
                r.estimated_impact,
                r.estimated_effort.as_str(),
                r.status.as_str()
            );
            let _ = writeln!(out, "{}\n", r.description);
            if !r.rationale.is_empty() {
                let _ = writeln!(out, "{}\n", r.rationale);
            }
            if !r.action_items.is_empty() {
                for item in &r.action_items {
                    let _ = writeln!(out, "- [ ] {item}");
                }
                out.push('\n');
            }
        }
    }
    out
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
