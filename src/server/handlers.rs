use axum::extract::{Path, Query, State};
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

use crate::lookup::fields::parse_request;
use crate::lookup::{FieldSet, LookupError, ResponseOptions};
use crate::metrics::RequestTimer;

use super::state::AppState;

// ─── Error response ──────────────────────────────────────────────

#[derive(Serialize)]
struct ApiErrorBody {
    error: String,
    code: u16,
}

#[derive(Debug)]
pub struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorBody {
            error: self.1,
            code: self.0.as_u16(),
        };
        (self.0, Json(body)).into_response()
    }
}

impl From<LookupError> for ApiError {
    fn from(e: LookupError) -> Self {
        let status = match e {
            LookupError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::BAD_GATEWAY,
        };
        ApiError(status, e.to_string())
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(e: tokio::task::JoinError) -> Self {
        ApiError(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    }
}

// ─── Field selection ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct FieldsQuery {
    pub fields: Option<String>,
}

fn requested_fields(state: &AppState, params: &FieldsQuery) -> (FieldSet, ResponseOptions) {
    parse_request(params.fields.as_deref(), state.collected_fields.as_deref())
}

// ─── GET|POST /json/{host} ───────────────────────────────────────

/// POST bypasses the cache.
pub async fn lookup_single(
    State(state): State<Arc<AppState>>,
    method: Method,
    Path(host): Path<String>,
    Query(params): Query<FieldsQuery>,
) -> Result<Json<Value>, ApiError> {
    let timer = RequestTimer::start(state.metrics.clone(), "/json");
    let (fields, opts) = requested_fields(&state, &params);
    let skip_cache = method == Method::POST;

    let engine = state.engine.clone();
    let query = host.clone();
    let outcome = tokio::task::spawn_blocking(move || engine.resolve(&query, &fields, skip_cache)).await??;

    info!(
        "{} /json/{} -> {} ({:.1}ms)",
        method,
        host,
        outcome.status(),
        timer.elapsed().as_secs_f64() * 1000.0,
    );

    Ok(Json(outcome.to_json(opts)))
}

// ─── POST /batch ─────────────────────────────────────────────────

pub async fn lookup_batch(
    State(state): State<Arc<AppState>>,
    Query(params): Query<FieldsQuery>,
    Json(hosts): Json<Vec<String>>,
) -> Result<Json<Vec<Value>>, ApiError> {
    let timer = RequestTimer::start(state.metrics.clone(), "/batch");
    let (fields, opts) = requested_fields(&state, &params);
    let count = hosts.len();

    let engine = state.engine.clone();
    let outcomes = tokio::task::spawn_blocking(move || engine.resolve_many(&hosts, &fields, false)).await??;

    info!(
        "POST /batch hosts={} -> {} results ({:.1}ms)",
        count,
        outcomes.len(),
        timer.elapsed().as_secs_f64() * 1000.0,
    );

    Ok(Json(outcomes.iter().map(|o| o.to_json(opts)).collect()))
}

// ─── GET /metrics ────────────────────────────────────────────────

pub async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
        .into_response()
}
