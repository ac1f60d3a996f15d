//! HTTP surface: dashboard command API, hook callbacks and SSE streams.
//!
//! Every handler returns either a JSON body with `success: true` or the
//! error envelope `{success: false, error, code}` with the status the
//! error maps to.

mod hooks;
mod instances;
mod machines;
mod stream;

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

use tether_core::error::OrchestratorError;

use crate::state::OrchestratorState;

pub type AppState = Arc<OrchestratorState>;

pub type ApiError = (StatusCode, Json<Value>);

pub type ApiResult = Result<Json<Value>, ApiError>;

/// Render an error as the standard envelope
pub fn error_response(err: OrchestratorError) -> ApiError {
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        tracing::error!("{} ({})", err, err.code());
    } else {
        tracing::debug!("{} ({})", err, err.code());
    }
    (
        status,
        Json(json!({
            "success": false,
            "error": err.to_string(),
            "code": err.code(),
        })),
    )
}

/// Unwrap a JSON body, turning malformed input into a validation error
pub(crate) fn body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| error_response(OrchestratorError::validation(rejection.body_text())))
}

pub(crate) fn fail(err: impl Into<OrchestratorError>) -> ApiError {
    error_response(err.into())
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route(
            "/api/instances",
            get(instances::list).post(instances::create),
        )
        .route("/api/instances/reorder", post(instances::reorder))
        .route(
            "/api/instances/:id",
            get(instances::get_one)
                .patch(instances::update)
                .delete(instances::close),
        )
        .route("/api/instances/:id/input", post(instances::input))
        .route("/api/instances/:id/resize", post(instances::resize))
        .route(
            "/api/instances/:id/hooks",
            post(hooks::install).delete(hooks::uninstall),
        )
        .route("/api/instances/:id/output", get(stream::output))
        .route("/api/machines", get(machines::list).post(machines::register))
        .route("/api/machines/:id/test", post(machines::test))
        .route("/api/machines/:id/preflight", post(machines::preflight))
        .route("/api/machines/:id/hooks", get(machines::hooks))
        .route("/api/machines/:id/unlock", post(machines::unlock))
        .route("/api/machines/:id/lock", post(machines::lock))
        .route("/api/hooks/preview", get(hooks::preview))
        .route("/api/hooks/:event", post(hooks::callback))
        .route("/api/tunnels", get(tunnels))
        .route("/api/events", get(stream::events))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn tunnels(State(state): State<AppState>) -> Json<Value> {
    let tunnels = state.tunnels.list().await;
    Json(json!({ "success": true, "tunnels": tunnels }))
}
