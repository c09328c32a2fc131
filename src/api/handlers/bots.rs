use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::json;

use super::super::AppState;
use crate::core::bot::{BotId, BotRecord, NewBot};
use crate::core::error::{StoreError, SupervisorError};
use crate::core::state::BotState;

fn failure(status: StatusCode, error: impl std::fmt::Display) -> Response {
    (
        status,
        Json(json!({ "success": false, "error": error.to_string() })),
    )
        .into_response()
}

fn store_failure(err: StoreError) -> Response {
    let status = match err {
        StoreError::NotFound(_) => StatusCode::NOT_FOUND,
        StoreError::InvalidValue(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    failure(status, err)
}

fn supervisor_failure(err: SupervisorError) -> Response {
    match err {
        SupervisorError::Store(e) => store_failure(e),
        SupervisorError::AlreadyRunning(_)
        | SupervisorError::Cancelled(_)
        | SupervisorError::InvalidState { .. } => failure(StatusCode::CONFLICT, err),
        SupervisorError::SpawnFailure { .. } | SupervisorError::TaskFailed { .. } => {
            failure(StatusCode::INTERNAL_SERVER_ERROR, err)
        }
        SupervisorError::StartFailed {
            ref reason,
            ref stderr_tail,
            ..
        } => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({
                "success": false,
                "error": err.to_string(),
                "reason": reason.to_string(),
                "stderr_tail": stderr_tail,
            })),
        )
            .into_response(),
    }
}

fn not_found(id: &BotId) -> Response {
    store_failure(StoreError::NotFound(id.clone()))
}

/// A stored record merged with what the supervisor currently sees.
fn bot_view(state: &AppState, record: &BotRecord) -> serde_json::Value {
    let snapshot = state.supervisor.snapshot(&record.id);
    let mut view = serde_json::to_value(record).unwrap_or_else(|_| json!({}));
    if let Some(map) = view.as_object_mut() {
        map.insert("state".into(), json!(snapshot.state));
        map.insert("pid".into(), json!(snapshot.pid));
        if !snapshot.stderr_tail.is_empty() {
            map.insert("stderr_tail".into(), json!(snapshot.stderr_tail));
        }
    }
    view
}

pub async fn list_bots(State(state): State<AppState>) -> Response {
    match state.store.list_bots().await {
        Ok(records) => {
            let bots: Vec<serde_json::Value> =
                records.iter().map(|r| bot_view(&state, r)).collect();
            Json(json!({ "success": true, "bots": bots })).into_response()
        }
        Err(e) => store_failure(e),
    }
}

pub async fn create_bot(State(state): State<AppState>, Json(payload): Json<NewBot>) -> Response {
    match state.store.create_bot(payload).await {
        Ok(record) => (
            StatusCode::CREATED,
            Json(json!({ "success": true, "bot": bot_view(&state, &record) })),
        )
            .into_response(),
        Err(e) => store_failure(e),
    }
}

pub async fn running_bots(State(state): State<AppState>) -> Json<serde_json::Value> {
    let running: Vec<BotId> = state.supervisor.get_running_ids().into_iter().collect();
    Json(json!({ "success": true, "running": running }))
}

pub async fn get_bot(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let id = BotId::from(id);
    match state.store.get_bot(&id).await {
        Ok(Some(record)) => {
            Json(json!({ "success": true, "bot": bot_view(&state, &record) })).into_response()
        }
        Ok(None) => not_found(&id),
        Err(e) => store_failure(e),
    }
}

#[derive(Deserialize)]
pub struct UpdateBotRequest {
    name: Option<String>,
    config: Option<serde_json::Value>,
}

pub async fn update_bot(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<UpdateBotRequest>,
) -> Response {
    let id = BotId::from(id);
    if payload.name.is_none() && payload.config.is_none() {
        return failure(StatusCode::BAD_REQUEST, "nothing to update");
    }

    if let Some(name) = &payload.name {
        match state.store.rename_bot(&id, name).await {
            Ok(true) => {}
            Ok(false) => return not_found(&id),
            Err(e) => return store_failure(e),
        }
    }
    if let Some(config) = &payload.config {
        match state.store.update_config(&id, config).await {
            Ok(true) => {}
            Ok(false) => return not_found(&id),
            Err(e) => return store_failure(e),
        }
    }
    get_bot(State(state), Path(id.to_string())).await
}

pub async fn delete_bot(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let id = BotId::from(id);
    match state.supervisor.delete(&id).await {
        Ok(true) => Json(json!({ "success": true, "message": "Bot deleted" })).into_response(),
        Ok(false) => not_found(&id),
        Err(e) => supervisor_failure(e),
    }
}

fn lifecycle_result(id: &BotId, result: Result<BotState, SupervisorError>) -> Response {
    match result {
        Ok(state) => Json(json!({ "success": true, "id": id, "state": state })).into_response(),
        Err(e) => supervisor_failure(e),
    }
}

pub async fn start_bot(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let id = BotId::from(id);
    lifecycle_result(&id, state.supervisor.start(&id).await)
}

pub async fn stop_bot(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let id = BotId::from(id);
    lifecycle_result(&id, state.supervisor.stop(&id).await)
}

pub async fn restart_bot(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let id = BotId::from(id);
    lifecycle_result(&id, state.supervisor.restart(&id).await)
}
