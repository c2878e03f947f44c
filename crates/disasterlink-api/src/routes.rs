use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::{Json, Router};
use chrono::Utc;
use disasterlink_core::sync::{AlertPage, PushOutcome, PushRequest};
use disasterlink_core::{AlertRecord, InMemoryAuthority, QueuedMessage, RemoteAuthority};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::ApiConfig;
use crate::error::AppError;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ApiConfig>,
    authority: Arc<InMemoryAuthority>,
}

impl AppState {
    pub fn from_config(config: Arc<ApiConfig>) -> Self {
        let authority = InMemoryAuthority::new();
        authority.set_latency(config.latency);
        Self {
            config,
            authority: Arc::new(authority),
        }
    }
}

pub fn app_router(state: AppState) -> Router {
    let sync_routes = Router::new()
        .route("/alerts/since", get(alerts_since))
        .route("/alerts/{id}", put(put_alert))
        .route("/messages/{id}", put(put_message));

    Router::new()
        .route("/healthz", get(healthz))
        .nest("/v1", sync_routes)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_headers(Any)
                .allow_methods(Any),
        )
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: i64,
    alerts: usize,
    messages: usize,
}

async fn healthz(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: Utc::now().timestamp(),
        alerts: state.authority.alert_count(),
        messages: state.authority.message_count(),
    })
}

async fn put_alert(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<PushRequest<AlertRecord>>,
) -> Result<Response, AppError> {
    ensure_path_matches(&id, &request.record.id.to_string())?;
    let sequence = request.causal_stamp.sequence;
    let outcome = state.authority.put_alert(request).await?;
    log_outcome("alert", &id, sequence, &outcome);
    Ok(push_response(outcome))
}

async fn put_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<PushRequest<QueuedMessage>>,
) -> Result<Response, AppError> {
    ensure_path_matches(&id, &request.record.id.to_string())?;
    let sequence = request.causal_stamp.sequence;
    let outcome = state.authority.put_message(request).await?;
    log_outcome("message", &id, sequence, &outcome);
    Ok(push_response(outcome))
}

#[derive(Debug, Deserialize)]
struct SinceQuery {
    cursor: Option<String>,
    limit: Option<usize>,
}

async fn alerts_since(
    State(state): State<AppState>,
    Query(query): Query<SinceQuery>,
) -> Result<Json<AlertPage>, AppError> {
    let max = state.config.max_page_size;
    let limit = query.limit.unwrap_or(max).clamp(1, max);
    let page = state.authority.alerts_since(query.cursor, limit).await?;
    Ok(Json(page))
}

fn ensure_path_matches(path_id: &str, record_id: &str) -> Result<(), AppError> {
    if path_id.trim().eq_ignore_ascii_case(record_id) {
        Ok(())
    } else {
        Err(AppError::bad_request(format!(
            "path id {path_id} does not match record id {record_id}"
        )))
    }
}

fn push_response<T: Serialize>(outcome: PushOutcome<T>) -> Response {
    match outcome {
        PushOutcome::Accepted(stored) => (StatusCode::OK, Json(stored)).into_response(),
        PushOutcome::Conflict(current) => (StatusCode::CONFLICT, Json(current)).into_response(),
    }
}

fn log_outcome<T>(kind: &'static str, id: &str, sequence: i64, outcome: &PushOutcome<T>) {
    match outcome {
        PushOutcome::Accepted(stored) => tracing::info!(
            kind,
            id,
            sequence,
            version = stored.version,
            "Accepted push"
        ),
        PushOutcome::Conflict(current) => tracing::info!(
            kind,
            id,
            sequence,
            version = current.version,
            "Push conflicts with a newer version"
        ),
    }
}
