//! Instance endpoints
//!
//! - `GET    /api/instances`              list open instances
//! - `POST   /api/instances`              create
//! - `POST   /api/instances/reorder`      set display order
//! - `GET    /api/instances/{id}`         fetch one
//! - `PATCH  /api/instances/{id}`         rename / pin
//! - `DELETE /api/instances/{id}`         close
//! - `POST   /api/instances/{id}/input`   write to the terminal
//! - `POST   /api/instances/{id}/resize`  resize the terminal

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use bytes::Bytes;
use serde_json::json;

use tether_core::api::{
    CreateInstanceRequest, InputRequest, ReorderRequest, ResizeRequest, UpdateInstanceRequest,
};
use tether_core::types::InstanceId;

use super::{body, fail, ApiError, ApiResult, AppState};

pub async fn list(State(state): State<AppState>) -> ApiResult {
    let instances = state.controller.list_instances().await.map_err(fail)?;
    Ok(Json(json!({ "success": true, "instances": instances })))
}

pub async fn create(
    State(state): State<AppState>,
    payload: Result<Json<CreateInstanceRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let req = body(payload)?;
    let instance = state.controller.create_instance(req).await.map_err(fail)?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "success": true, "instance": instance })),
    ))
}

pub async fn get_one(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let instance = state
        .controller
        .get_instance(&InstanceId::new(id))
        .await
        .map_err(fail)?;
    Ok(Json(json!({ "success": true, "instance": instance })))
}

pub async fn update(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<UpdateInstanceRequest>, JsonRejection>,
) -> ApiResult {
    let req = body(payload)?;
    let instance = state
        .controller
        .update_instance(&InstanceId::new(id), req)
        .await
        .map_err(fail)?;
    Ok(Json(json!({ "success": true, "instance": instance })))
}

pub async fn close(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let instance = state
        .controller
        .close_instance(&InstanceId::new(id))
        .await
        .map_err(fail)?;
    Ok(Json(json!({ "success": true, "instance": instance })))
}

pub async fn reorder(
    State(state): State<AppState>,
    payload: Result<Json<ReorderRequest>, JsonRejection>,
) -> ApiResult {
    let req = body(payload)?;
    state.controller.reorder_instances(req.ids).await.map_err(fail)?;
    Ok(Json(json!({ "success": true })))
}

pub async fn input(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<InputRequest>, JsonRejection>,
) -> ApiResult {
    let req = body(payload)?;
    state
        .controller
        .send_input(&InstanceId::new(id), Bytes::from(req.data.into_bytes()))
        .await
        .map_err(fail)?;
    Ok(Json(json!({ "success": true })))
}

pub async fn resize(
    State(state): State<AppState>,
    Path(id): Path<String>,
    payload: Result<Json<ResizeRequest>, JsonRejection>,
) -> ApiResult {
    let req = body(payload)?;
    state
        .controller
        .resize(&InstanceId::new(id), req.cols, req.rows)
        .await
        .map_err(fail)?;
    Ok(Json(json!({ "success": true })))
}
