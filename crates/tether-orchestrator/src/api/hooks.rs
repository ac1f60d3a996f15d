//! Hook endpoints
//!
//! Install/uninstall act on the machine behind a remote instance. The
//! callback route is what installed hooks on remote machines POST to.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use tether_core::api::{HookCallback, HookEventKind, InstallHooksRequest};
use tether_core::error::OrchestratorError;
use tether_core::types::InstanceId;

use super::{body, fail, ApiResult, AppState};

/// `POST /api/instances/{id}/hooks`
pub async fn install(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<InstallHooksRequest>, JsonRejection>,
) -> ApiResult {
    // A missing body is reported as a missing orchestratorUrl
    let orchestrator_url = payload.ok().and_then(|Json(req)| req.orchestrator_url);
    let response = state
        .controller
        .install_hooks(&InstanceId::new(id), orchestrator_url)
        .await
        .map_err(fail)?;
    Ok(Json(json!(response)))
}

/// `DELETE /api/instances/{id}/hooks`
pub async fn uninstall(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let response = state
        .controller
        .uninstall_hooks(&InstanceId::new(id))
        .await
        .map_err(fail)?;
    Ok(Json(json!(response)))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewQuery {
    orchestrator_url: Option<String>,
}

/// `GET /api/hooks/preview?orchestratorUrl=`
pub async fn preview(State(state): State<AppState>, Query(query): Query<PreviewQuery>) -> ApiResult {
    let url = query
        .orchestrator_url
        .filter(|u| !u.trim().is_empty())
        .unwrap_or_else(|| state.config.local_url());
    Ok(Json(json!({
        "success": true,
        "orchestratorUrl": url,
        "config": state.hooks.config_preview(&url),
    })))
}

/// `POST /api/hooks/{event}` from a remote hook
pub async fn callback(
    State(state): State<AppState>,
    Path(event): Path<String>,
    payload: Result<Json<HookCallback>, JsonRejection>,
) -> ApiResult {
    let kind = HookEventKind::from_slug(&event)
        .ok_or_else(|| fail(OrchestratorError::validation(format!("Unknown hook event: {}", event))))?;
    let callback = body(payload)?;

    tracing::debug!("Hook {} for {}", kind.slug(), callback.instance_id);
    let instance = state
        .controller
        .handle_hook_event(kind, callback)
        .await
        .map_err(fail)?;
    Ok(Json(json!({ "success": true, "status": instance.status })))
}
