//! API route definitions.

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::error::ApiError;
use super::state::AppState;
use crate::error::{AnalyticsError, Result};
use crate::recommend::export::export_recommendations;
use crate::recommend::{RecommendationFormat, Role, Status};
use crate::records::TestSuiteExecutionRecord;
use crate::storage::{ExportFormat, QueryFilter};

type ApiResult<T> = std::result::Result<T, ApiError>;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/report", get(report))
        .route("/dashboard", get(dashboard))
        .route("/executions", post(store_execution))
        .route("/records", get(list_records))
        .route("/records/{id}", get(get_record))
        .route("/flaky-tests", get(flaky_tests))
        .route("/recommendations", get(list_recommendations))
        .route("/recommendations/effectiveness", get(effectiveness))
        .route("/recommendations/export", get(export_recs))
        .route("/recommendations/{id}/status", post(update_status))
        .route("/models/train", post(train_models))
        .route("/export", get(export))
}

fn envelope<T: Serialize>(data: T) -> Json<Value> {
    Json(json!({
        "data": data,
        "meta": {
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "version": env!("CARGO_PKG_VERSION")
        }
    }))
}

/// Run a blocking store or engine call off the async workers.
async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| AnalyticsError::analysis("request", e))?
}

#[derive(Debug, Default, Deserialize)]
struct WindowParams {
    window_days: Option<u32>,
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    envelope(state.engine.system_health().await)
}

async fn report(State(state): State<AppState>, Query(params): Query<WindowParams>) -> Json<Value> {
    let window = params
        .window_days
        .unwrap_or(state.engine.config().analysis.default_window_days);
    envelope(state.engine.analysis_report(window).await)
}

async fn dashboard(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    Ok(envelope(state.engine.dashboard_data().await?))
}

async fn store_execution(
    State(state): State<AppState>,
    Json(record): Json<TestSuiteExecutionRecord>,
) -> ApiResult<impl IntoResponse> {
    let id = record.id.clone();
    state.engine.store_execution(record).await?;
    Ok((StatusCode::CREATED, envelope(json!({ "id": id }))))
}

async fn list_records(State(state): State<AppState>, Query(filter): Query<QueryFilter>) -> ApiResult<Json<Value>> {
    let store = state.engine.store().clone();
    let records = blocking(move || store.query_records(&filter)).await?;
    Ok(envelope(records))
}

async fn get_record(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Json<Value>> {
    let store = state.engine.store().clone();
    Ok(envelope(blocking(move || store.get_suite_record(&id)).await?))
}

#[derive(Debug, Deserialize)]
struct FlakyParams {
    window_days: Option<u32>,
    threshold: Option<f64>,
}

async fn flaky_tests(State(state): State<AppState>, Query(params): Query<FlakyParams>) -> ApiResult<Json<Value>> {
    let store = state.engine.store().clone();
    let window = params
        .window_days
        .unwrap_or(state.engine.config().analysis.default_window_days);
    let threshold = params.threshold.unwrap_or(0.1);
    Ok(envelope(blocking(move || store.flaky_tests(window, threshold)).await?))
}

#[derive(Debug, Deserialize)]
struct RecommendationParams {
    role: Option<String>,
    limit: Option<usize>,
}

async fn list_recommendations(
    State(state): State<AppState>,
    Query(params): Query<RecommendationParams>,
) -> ApiResult<Json<Value>> {
    let role = params.role.as_deref().map(str::parse::<Role>).transpose()?;
    let analysis = &state.engine.config().analysis;
    let (window, horizon) = (analysis.default_window_days, analysis.prediction_horizon_days);
    let recommender = state.engine.recommender().clone();

    let list = blocking(move || {
        let mut list = recommender.generate_recommendations(window, horizon)?;
        if let Some(role) = role {
            list = recommender.get_personalized_recommendations(role, params.limit.unwrap_or(usize::MAX));
        } else if let Some(limit) = params.limit {
            list.truncate(limit);
        }
        Ok(list)
    })
    .await?;
    Ok(envelope(list))
}

#[derive(Debug, Deserialize)]
struct StatusUpdate {
    status: Status,
}

async fn update_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(update): Json<StatusUpdate>,
) -> ApiResult<Json<Value>> {
    Ok(envelope(state.engine.recommender().update_status(&id, update.status)?))
}

async fn effectiveness(State(state): State<AppState>) -> Json<Value> {
    envelope(state.engine.recommender().effectiveness_report())
}

#[derive(Debug, Deserialize)]
struct FormatParams {
    format: Option<String>,
}

fn content_type(format: &str) -> &'static str {
    match format {
        "csv" => "text/csv",
        "markdown" | "md" => "text/markdown",
        _ => "application/json",
    }
}

async fn export(State(state): State<AppState>, Query(params): Query<FormatParams>) -> ApiResult<impl IntoResponse> {
    let name = params.format.unwrap_or_else(|| "json".to_string()).to_ascii_lowercase();
    let format: ExportFormat = name.parse()?;
    let body = state.engine.export_analysis_data(format).await?;
    Ok(([(header::CONTENT_TYPE, content_type(&name))], body))
}

async fn export_recs(State(state): State<AppState>, Query(params): Query<FormatParams>) -> ApiResult<impl IntoResponse> {
    let name = params.format.unwrap_or_else(|| "json".to_string()).to_ascii_lowercase();
    let format: RecommendationFormat = name.parse()?;
    let body = export_recommendations(&state.engine.recommender().recommendations(), format)?;
    Ok(([(header::CONTENT_TYPE, content_type(&name))], body))
}

#[derive(Debug, Deserialize)]
struct TrainParams {
    days: Option<u32>,
}

async fn train_models(State(state): State<AppState>, Query(params): Query<TrainParams>) -> ApiResult<Json<Value>> {
    let engine = state.engine.clone();
    let days = params.days.unwrap_or(engine.config().analysis.default_window_days);
    Ok(envelope(engine.train_models(days).await?))
}
