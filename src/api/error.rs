//! Mapping from [`AnalyticsError`] to HTTP responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::error::AnalyticsError;

pub struct ApiError(pub AnalyticsError);

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            AnalyticsError::Validation(_) => StatusCode::BAD_REQUEST,
            AnalyticsError::NotFound { .. } => StatusCode::NOT_FOUND,
            AnalyticsError::InsufficientData { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> &'static str {
        match &self.0 {
            AnalyticsError::Validation(_) => "validation",
            AnalyticsError::NotFound { .. } => "not_found",
            AnalyticsError::InsufficientData { .. } => "insufficient_data",
            AnalyticsError::Analysis { .. } => "analysis",
            _ => "internal",
        }
    }
}

impl From<AnalyticsError> for ApiError {
    fn from(e: AnalyticsError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self.0, "Request failed");
        } else {
            tracing::debug!(error = %self.0, "Request rejected");
        }
        let body = json!({
            "error": {
                "kind": self.kind(),
                "message": self.0.to_string(),
            },
            "meta": {
                "timestamp": chrono::Utc::now().to_rfc3339(),
                "version": env!("CARGO_PKG_VERSION"),
            }
        });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ApiError(AnalyticsError::Validation("x".into())).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError(AnalyticsError::NotFound { kind: "recommendation", id: "x".into() }).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError(AnalyticsError::insufficient("predictions", 1, 0)).status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            ApiError(AnalyticsError::analysis("trend", "boom")).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
