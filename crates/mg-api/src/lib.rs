//! meshgate REST API
//!
//! JSON control surface over the rule engine and device shadow: rule
//! CRUD and toggling, trace queries, the per-device attribute/command
//! catalogs rule-building clients need, and the attribute-report
//! ingestion seam the backplane bridge posts into.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use mg_core::{AttrValue, AttributeDescriptor, CommandDescriptor, Ieee};
use mg_rules::{RuleConfig, RuleEngine, RuleError, RuleView, TraceEntry};
use mg_shadow::DeviceShadow;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::debug;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<RuleEngine>,
    pub shadow: Arc<DeviceShadow>,
}

/// Build the API router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/rules", get(list_rules).post(create_rule))
        .route(
            "/api/rules/:id",
            get(get_rule).put(update_rule).delete(delete_rule),
        )
        .route("/api/rules/:id/toggle", post(toggle_rule))
        .route("/api/trace", get(query_trace))
        .route("/api/devices", get(list_devices))
        .route("/api/devices/:ieee/attributes", get(attribute_catalog))
        .route("/api/devices/:ieee/commands", get(command_catalog))
        .route("/api/devices/:ieee/report", post(ingest_report))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Engine errors mapped onto HTTP statuses
struct ApiError(RuleError);

impl From<RuleError> for ApiError {
    fn from(e: RuleError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            RuleError::NotFound(_) => StatusCode::NOT_FOUND,
            RuleError::Invalid(_) => StatusCode::BAD_REQUEST,
            RuleError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(serde_json::json!({ "error": self.0.to_string() }));
        (status, body).into_response()
    }
}

// --- Rule handlers ---

async fn list_rules(State(state): State<AppState>) -> Json<Vec<RuleView>> {
    Json(state.engine.list())
}

#[derive(Serialize)]
struct CreatedResponse {
    id: String,
}

async fn create_rule(
    State(state): State<AppState>,
    Json(config): Json<RuleConfig>,
) -> Result<(StatusCode, Json<CreatedResponse>), ApiError> {
    let id = state.engine.create(config).await?;
    Ok((StatusCode::CREATED, Json(CreatedResponse { id })))
}

async fn get_rule(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<RuleView>, ApiError> {
    Ok(Json(state.engine.get(&id)?))
}

async fn update_rule(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(config): Json<RuleConfig>,
) -> Result<Json<RuleView>, ApiError> {
    state.engine.update(&id, config).await?;
    Ok(Json(state.engine.get(&id)?))
}

async fn delete_rule(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.engine.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Serialize)]
struct ToggleResponse {
    enabled: bool,
}

async fn toggle_rule(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ToggleResponse>, ApiError> {
    let enabled = state.engine.toggle(&id).await?;
    Ok(Json(ToggleResponse { enabled }))
}

// --- Trace handlers ---

#[derive(Deserialize)]
struct TraceQuery {
    /// Filter to one rule; the sentinel id selects engine-level entries
    rule_id: Option<String>,
}

async fn query_trace(
    State(state): State<AppState>,
    Query(query): Query<TraceQuery>,
) -> Json<Vec<TraceEntry>> {
    Json(state.engine.trace().query(query.rule_id.as_deref()))
}

// --- Device handlers ---

async fn list_devices(State(state): State<AppState>) -> Json<Vec<Ieee>> {
    Json(state.shadow.device_ids())
}

async fn attribute_catalog(
    State(state): State<AppState>,
    Path(ieee): Path<Ieee>,
) -> Json<Vec<AttributeDescriptor>> {
    Json(state.shadow.attribute_catalog(ieee))
}

async fn command_catalog(
    State(state): State<AppState>,
    Path(ieee): Path<Ieee>,
) -> Json<Vec<CommandDescriptor>> {
    Json(state.shadow.command_catalog(ieee))
}

async fn ingest_report(
    State(state): State<AppState>,
    Path(ieee): Path<Ieee>,
    Json(report): Json<HashMap<String, AttrValue>>,
) -> StatusCode {
    debug!(%ieee, attributes = report.len(), "Ingesting attribute report");
    state.shadow.apply_report(ieee, report);
    StatusCode::ACCEPTED
}
