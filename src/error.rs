//! Error taxonomy shared by the store, the analyzers and the recommendation engine.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AnalyticsError {
    /// Too few historical runs for the requested computation.
    #[error("insufficient data: need {} more runs before {operation} is available (have {have}, need {needed})", missing_runs(.needed, .have))]
    InsufficientData {
        operation: &'static str,
        needed: usize,
        have: usize,
    },

    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    #[error("invalid record: {0}")]
    Validation(String),

    /// A derived computation failed; `stage` names the analysis.
    #[error("analysis stage '{stage}' failed: {message}")]
    Analysis { stage: String, message: String },

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl AnalyticsError {
    pub fn insufficient(operation: &'static str, needed: usize, have: usize) -> Self {
        AnalyticsError::InsufficientData {
            operation,
            needed,
            have,
        }
    }

    pub fn analysis(stage: impl Into<String>, message: impl std::fmt::Display) -> Self {
        AnalyticsError::Analysis {
            stage: stage.into(),
            message: message.to_string(),
        }
    }

    pub fn is_insufficient_data(&self) -> bool {
        matches!(self, AnalyticsError::InsufficientData { .. })
    }
}

fn missing_runs(needed: &usize, have: &usize) -> usize {
    needed.saturating_sub(*have)
}

pub type Result<T> = std::result::Result<T, AnalyticsError>;
