//! Machine endpoints: registry, reachability, preflight, hook inspection
//! and keychain unlock.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use tether_core::api::DashboardEvent;
use tether_core::error::OrchestratorError;
use tether_core::types::{MachineId, Reachability, RemoteMachine};

use crate::tunnel::tunnel_url;

use super::{body, fail, ApiError, ApiResult, AppState};

fn known(state: &AppState, id: String) -> Result<MachineId, ApiError> {
    let machine_id = MachineId::new(id);
    if !state.registry.contains(&machine_id) {
        return Err(fail(OrchestratorError::MachineNotFound(machine_id.to_string())));
    }
    Ok(machine_id)
}

pub async fn list(State(state): State<AppState>) -> ApiResult {
    let mut machines = Vec::new();
    for machine in state.registry.list() {
        let keychain = state.keychain.get_status(&machine.id).await;
        let mut value = json!(machine);
        value["keychain"] = json!(keychain);
        machines.push(value);
    }
    Ok(Json(json!({ "success": true, "machines": machines })))
}

pub async fn register(
    State(state): State<AppState>,
    payload: Result<Json<RemoteMachine>, JsonRejection>,
) -> ApiResult {
    let machine = body(payload)?;
    if machine.id.as_str().trim().is_empty() {
        return Err(fail(OrchestratorError::validation("id is required")));
    }
    if machine.hostname.trim().is_empty() {
        return Err(fail(OrchestratorError::validation("hostname is required")));
    }

    state.registry.register(machine.clone());
    Ok(Json(json!({ "success": true, "machine": machine })))
}

/// `POST /api/machines/{id}/test`
pub async fn test(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let machine_id = known(&state, id)?;
    let result = state
        .executor
        .test_connection(&machine_id)
        .await
        .map_err(fail)?;

    let reachability = if result.reachable {
        Reachability::Reachable
    } else {
        Reachability::Unreachable
    };
    // The executor has already recorded it on the registry
    state.events.emit(DashboardEvent::MachineStatus {
        machine_id,
        reachability,
        latency_ms: result.latency_ms,
    });

    Ok(Json(json!({
        "success": true,
        "reachable": result.reachable,
        "latencyMs": result.latency_ms,
        "error": result.error,
    })))
}

/// `POST /api/machines/{id}/preflight`
pub async fn preflight(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let report = state
        .preflight
        .run_all_checks(&MachineId::new(id))
        .await
        .map_err(fail)?;
    Ok(Json(json!({ "success": true, "report": report })))
}

/// `GET /api/machines/{id}/hooks`
///
/// Hooks are verified against the active tunnel's URL, or the local
/// listener when the machine has no tunnel.
pub async fn hooks(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let machine_id = known(&state, id)?;
    let expected_url = match state.tunnels.active_port(&machine_id).await {
        Some(port) => tunnel_url(port),
        None => state.config.local_url(),
    };

    let existing = state
        .hooks
        .check_existing_hooks(&machine_id)
        .await
        .map_err(fail)?;
    let verification = state
        .hooks
        .verify(&machine_id, &expected_url)
        .await
        .map_err(fail)?;
    let tools = state
        .hooks
        .check_required_tools(&machine_id)
        .await
        .map_err(fail)?;

    Ok(Json(json!({
        "success": true,
        "expectedUrl": expected_url,
        "existing": existing,
        "verification": verification,
        "tools": tools,
    })))
}

#[derive(Deserialize)]
pub struct UnlockRequest {
    password: String,
}

/// `POST /api/machines/{id}/unlock`
pub async fn unlock(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<UnlockRequest>, JsonRejection>,
) -> ApiResult {
    let machine_id = known(&state, id)?;
    let req = body(payload)?;

    if !state
        .keychain
        .unlock_with_verification(&machine_id, &req.password)
        .await
    {
        return Err(fail(OrchestratorError::validation("Password rejected")));
    }
    let status = state.keychain.get_status(&machine_id).await;
    Ok(Json(json!({ "success": true, "keychain": status })))
}

/// `POST /api/machines/{id}/lock`
pub async fn lock(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let machine_id = known(&state, id)?;
    state.keychain.mark_locked(&machine_id).await;
    let status = state.keychain.get_status(&machine_id).await;
    Ok(Json(json!({ "success": true, "keychain": status })))
}
