//! HTTP API: config upload/removal, atom ingress, report queries and
//! diagnostics.
//!
//! - `PUT    /v1/configs/:uid/:id`  stats config as YAML or JSON
//! - `DELETE /v1/configs/:uid/:id`
//! - `GET    /v1/configs`
//! - `POST   /v1/atoms`             protobuf `AtomBatch` or JSON array
//! - `GET    /v1/reports/:uid/:id?clear=true|false`
//! - `GET    /health`, `GET /v1/stats`

use crate::core::clock::elapsed_realtime_ns;
use crate::core::error::AtomdError;
use crate::core::types::{Atom, ConfigKey};
use crate::engine::{StatsConfig, StatsEngine};
use crate::receiver::proto;
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer};

/// HTTP server state.
#[derive(Clone)]
pub struct HttpState {
    pub engine: Arc<StatsEngine>,
}

/// Create the HTTP router.
pub fn create_router(engine: Arc<StatsEngine>, request_timeout: Duration) -> Router {
    let state = HttpState { engine };

    Router::new()
        .route("/v1/configs", get(list_configs))
        .route("/v1/configs/:uid/:id", put(upload_config).delete(remove_config))
        .route("/v1/atoms", post(ingest_atoms))
        .route("/v1/reports/:uid/:id", get(query_report))
        .route("/v1/stats", get(engine_stats))
        .route("/health", get(health_check))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(TimeoutLayer::new(request_timeout))
                .layer(
                    CorsLayer::new()
                        .allow_origin(tower_http::cors::Any)
                        .allow_methods(tower_http::cors::Any)
                        .allow_headers(tower_http::cors::Any),
                ),
        )
        .with_state(state)
}

async fn upload_config(
    State(state): State<HttpState>,
    Path((uid, id)): Path<(i32, i64)>,
    body: Bytes,
) -> Result<impl IntoResponse, HttpError> {
    let key = ConfigKey::new(uid, id);
    let text = std::str::from_utf8(&body)
        .map_err(|e| HttpError::BadRequest(format!("Config is not UTF-8: {}", e)))?;
    let config = StatsConfig::from_yaml(text)?;
    state.engine.upload(key, &config, elapsed_realtime_ns())?;
    Ok(Json(serde_json::json!({
        "config_key": key,
        "metrics": config.metric_count(),
    })))
}

async fn remove_config(
    State(state): State<HttpState>,
    Path((uid, id)): Path<(i32, i64)>,
) -> Result<StatusCode, HttpError> {
    state.engine.remove(ConfigKey::new(uid, id))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_configs(State(state): State<HttpState>) -> impl IntoResponse {
    Json(state.engine.config_keys())
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct IngestResponse {
    pub accepted: usize,
    pub dropped: usize,
}

async fn ingest_atoms(
    State(state): State<HttpState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<IngestResponse>, HttpError> {
    let content_type = headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/json");
    tracing::debug!("Received {} byte atom batch ({})", body.len(), content_type);

    let (atoms, rejected) = if content_type.contains("application/x-protobuf")
        || content_type.contains("application/octet-stream")
    {
        proto::decode_batch(&body)?
    } else {
        parse_json_atoms(&body)?
    };

    let monitor = state.engine.monitor();
    for error in &rejected {
        monitor.record_atom_dropped(&error.to_string());
    }
    let mut response = IngestResponse {
        accepted: 0,
        dropped: rejected.len(),
    };
    for atom in &atoms {
        if state.engine.log_event(atom).await {
            response.accepted += 1;
        } else {
            response.dropped += 1;
        }
    }
    Ok(Json(response))
}

/// Parses a JSON array of atoms. Entries that do not parse are dropped
/// individually; a body that is not an array fails as a whole.
fn parse_json_atoms(body: &[u8]) -> Result<(Vec<Atom>, Vec<AtomdError>), HttpError> {
    let values: Vec<serde_json::Value> = serde_json::from_slice(body)
        .map_err(|e| HttpError::BadRequest(format!("Expected a JSON array of atoms: {}", e)))?;
    let mut atoms = Vec::with_capacity(values.len());
    let mut rejected = Vec::new();
    for value in values {
        match serde_json::from_value::<Atom>(value) {
            Ok(atom) => atoms.push(atom),
            Err(e) => rejected.push(AtomdError::malformed(e.to_string())),
        }
    }
    Ok((atoms, rejected))
}

#[derive(Debug, Default, Deserialize)]
struct ReportParams {
    #[serde(default)]
    clear: bool,
}

async fn query_report(
    State(state): State<HttpState>,
    Path((uid, id)): Path<(i32, i64)>,
    Query(params): Query<ReportParams>,
) -> Result<impl IntoResponse, HttpError> {
    let report = state.engine.query(
        ConfigKey::new(uid, id),
        elapsed_realtime_ns(),
        params.clear,
    )?;
    Ok(Json(report))
}

async fn engine_stats(State(state): State<HttpState>) -> impl IntoResponse {
    Json(state.engine.stats())
}

/// Health check endpoint.
async fn health_check(State(state): State<HttpState>) -> impl IntoResponse {
    let stats = state.engine.stats();
    Json(serde_json::json!({
        "status": stats.health,
        "service": "atomd",
        "version": env!("CARGO_PKG_VERSION"),
        "configs": stats.active_configs,
        "uptime_seconds": stats.uptime_seconds,
    }))
}

/// HTTP-specific error type.
#[derive(Debug)]
pub enum HttpError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Internal(String),
}

impl From<AtomdError> for HttpError {
    fn from(err: AtomdError) -> Self {
        let message = err.to_string();
        match err {
            AtomdError::InvalidStatsConfig(_)
            | AtomdError::Parse { .. }
            | AtomdError::MalformedAtom(_)
            | AtomdError::Decode(_)
            | AtomdError::Serialization(_) => HttpError::BadRequest(message),
            AtomdError::ConfigNotFound(_) => HttpError::NotFound(message),
            AtomdError::TooManyConfigs { .. } => HttpError::Conflict(message),
            _ => HttpError::Internal(message),
        }
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            HttpError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            HttpError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            HttpError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            HttpError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(serde_json::json!({
            "error": error_message,
            "status": status.as_u16()
        }));

        (status, body).into_response()
    }
}

impl std::fmt::Display for HttpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HttpError::BadRequest(msg) => write!(f, "Bad Request: {}", msg),
            HttpError::NotFound(msg) => write!(f, "Not Found: {}", msg),
            HttpError::Conflict(msg) => write!(f, "Conflict: {}", msg),
            HttpError::Internal(msg) => write!(f, "Internal Error: {}", msg),
        }
    }
}

impl std::error::Error for HttpError {}
