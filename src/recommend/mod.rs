//! Recommendation model, team context and lifecycle.

pub mod engine;
pub mod export;

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AnalyticsError;

pub use engine::{EffectivenessReport, RecommendationEngine};
pub use export::RecommendationFormat;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationType {
    Improvement,
    Investigation,
    Maintenance,
    Process,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Coverage,
    Reliability,
    Performance,
    Maintenance,
    Process,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Coverage => "coverage",
            Category::Reliability => "reliability",
            Category::Performance => "performance",
            Category::Maintenance => "maintenance",
            Category::Process => "process",
        }
    }

    /// Default audience for recommendations in this category.
    pub fn audience(&self) -> Vec<Role> {
        match self {
            Category::Coverage => vec![Role::Developer, Role::QaEngineer],
            Category::Reliability => vec![Role::Developer, Role::QaEngineer, Role::TeamLead],
            Category::Performance => vec![Role::Developer, Role::DevOps],
            Category::Maintenance => vec![Role::DevOps, Role::TeamLead],
            Category::Process => vec![Role::TeamLead, Role::Manager],
        }
    }
}

/// Ordered low to critical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Effort {
    Low,
    Medium,
    High,
}

impl Effort {
    pub fn as_str(&self) -> &'static str {
        match self {
            Effort::Low => "low",
            Effort::Medium => "medium",
            Effort::High => "high",
        }
    }

    pub fn raised(self) -> Self {
        match self {
            Effort::Low => Effort::Medium,
            _ => Effort::High,
        }
    }

    pub fn lowered(self) -> Self {
        match self {
            Effort::High => Effort::Medium,
            _ => Effort::Low,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    New,
    Acknowledged,
    InProgress,
    Completed,
    Dismissed,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::New => "new",
            Status::Acknowledged => "acknowledged",
            Status::InProgress => "in_progress",
            Status::Completed => "completed",
            Status::Dismissed => "dismissed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Completed | Status::Dismissed)
    }

    fn stage(&self) -> u8 {
        match self {
            Status::New => 0,
            Status::Acknowledged => 1,
            Status::InProgress => 2,
            Status::Completed | Status::Dismissed => 3,
        }
    }

    /// Forward moves only; terminal states are final. Re-applying the
    /// current status is allowed.
    pub fn can_transition_to(&self, next: Status) -> bool {
        *self == next || (!self.is_terminal() && next.stage() > self.stage())
    }
}

impl FromStr for Status {
    type Err = AnalyticsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(Status::New),
            "acknowledged" => Ok(Status::Acknowledged),
            "in_progress" => Ok(Status::InProgress),
            "completed" => Ok(Status::Completed),
            "dismissed" => Ok(Status::Dismissed),
            other => Err(AnalyticsError::Validation(format!("unknown recommendation status '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Developer,
    QaEngineer,
    TeamLead,
    Manager,
    DevOps,
}

impl FromStr for Role {
    type Err = AnalyticsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "developer" => Ok(Role::Developer),
            "qa_engineer" | "qa" => Ok(Role::QaEngineer),
            "team_lead" | "lead" => Ok(Role::TeamLead),
            "manager" => Ok(Role::Manager),
            "devops" | "dev_ops" => Ok(Role::DevOps),
            other => Err(AnalyticsError::Validation(format!("unknown role '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectPhase {
    Startup,
    #[default]
    Growth,
    Mature,
    Maintenance,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestingMaturity {
    Beginner,
    #[default]
    Intermediate,
    Advanced,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Low,
    #[default]
    Medium,
    High,
}

/// Team circumstances. Shapes effort estimates and wording only; it never
/// decides which triggers fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RecommendationContext {
    #[serde(alias = "team_size")]
    pub team_size: u32,
    #[serde(alias = "project_phase")]
    pub project_phase: ProjectPhase,
    #[serde(alias = "testing_maturity")]
    pub testing_maturity: TestingMaturity,
    #[serde(alias = "available_resources")]
    pub available_resources: Level,
    /// How much schedule pressure the team is under.
    #[serde(alias = "time_constraints")]
    pub time_constraints: Level,
    #[serde(alias = "risk_tolerance")]
    pub risk_tolerance: Level,
}

impl Default for RecommendationContext {
    fn default() -> Self {
        Self {
            team_size: 5,
            project_phase: ProjectPhase::default(),
            testing_maturity: TestingMaturity::default(),
            available_resources: Level::default(),
            time_constraints: Level::default(),
            risk_tolerance: Level::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recommendation {
    pub id: String,
    #[serde(rename = "type")]
    pub recommendation_type: RecommendationType,
    pub priority: Priority,
    pub category: Category,
    pub title: String,
    pub description: String,
    pub rationale: String,
    pub action_items: Vec<String>,
    /// 0-100.
    pub estimated_impact: f64,
    pub estimated_effort: Effort,
    pub target_audience: Vec<Role>,
    pub confidence: f64,
    pub status: Status,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Recommendation {
    pub fn new(
        recommendation_type: RecommendationType,
        category: Category,
        priority: Priority,
        title: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            recommendation_type,
            priority,
            category,
            title: title.into(),
            description: description.into(),
            rationale: String::new(),
            action_items: Vec::new(),
            estimated_impact: 50.0,
            estimated_effort: Effort::Medium,
            target_audience: category.audience(),
            confidence: 0.5,
            status: Status::New,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn rationale(mut self, rationale: impl Into<String>) -> Self {
        self.rationale = rationale.into();
        self
    }

    pub fn actions<I, S>(mut self, items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.action_items = items.into_iter().map(Into::into).collect();
        self
    }

    pub fn impact(mut self, impact: f64) -> Self {
        self.estimated_impact = impact.clamp(0.0, 100.0);
        self
    }

    pub fn effort(mut self, effort: Effort) -> Self {
        self.estimated_effort = effort;
        self
    }

    pub fn confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }

    pub fn title_key(&self) -> String {
        normalize_title(&self.title)
    }
}

/// Dedup key: lowercase, each whitespace run becomes one `_`. Leading and
/// trailing whitespace is dropped, so titles differing only in spacing
/// collide.
pub fn normalize_title(title: &str) -> String {
    title
        .split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join("_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_title() {
        assert_eq!(normalize_title("Improve  Test\tCoverage "), "improve_test_coverage");
        assert_eq!(normalize_title("improve test coverage"), "improve_test_coverage");
    }

    #[test]
    fn test_normalize_title_ignores_edge_and_repeated_spacing() {
        assert_eq!(normalize_title("  Fix flaky tests\n"), normalize_title("fix flaky tests"));
        assert_eq!(normalize_title("a \t\n b"), "a_b");
        assert_eq!(normalize_title("   "), "");
    }

    #[test]
    fn test_status_transitions() {
        assert!(Status::New.can_transition_to(Status::Acknowledged));
        assert!(Status::Acknowledged.can_transition_to(Status::InProgress));
        assert!(Status::InProgress.can_transition_to(Status::Completed));
        assert!(Status::New.can_transition_to(Status::Dismissed));
        assert!(!Status::InProgress.can_transition_to(Status::New));
        assert!(!Status::Completed.can_transition_to(Status::InProgress));
        assert!(!Status::Dismissed.can_transition_to(Status::Completed));
        assert!(Status::Completed.can_transition_to(Status::Completed));
    }

    #[test]
    fn test_priority_order() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::Medium > Priority::Low);
    }

    #[test]
    fn test_parse_role_and_status() {
        assert_eq!("qa-engineer".parse::<Role>().unwrap(), Role::QaEngineer);
        assert_eq!("DevOps".parse::<Role>().unwrap(), Role::DevOps);
        assert!("ceo".parse::<Role>().is_err());
        assert_eq!("in_progress".parse::<Status>().unwrap(), Status::InProgress);
    }

    #[test]
    fn test_context_from_toml() {
        let ctx: RecommendationContext = toml::from_str("team_size = 2\nproject_phase = \"startup\"").unwrap();
        assert_eq!(ctx.team_size, 2);
        assert_eq!(ctx.project_phase, ProjectPhase::Startup);
        assert_eq!(ctx.risk_tolerance, Level::Medium);
    }

    #[test]
    fn test_builder() {
        let r = Recommendation::new(
            RecommendationType::Improvement,
            Category::Coverage,
            Priority::High,
            "Improve test coverage",
            "Coverage is falling",
        )
        .impact(150.0)
        .actions(["Add tests"]);
        assert_eq!(r.estimated_impact, 100.0);
        assert_eq!(r.status, Status::New);
        assert_eq!(r.target_audience, vec![Role::Developer, Role::QaEngineer]);
        assert_eq!(r.action_items, vec!["Add tests".to_string()]);
    }
}
