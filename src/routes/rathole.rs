//! Reverse-tunnel endpoints.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{api_error, ok_status, ApiResult};
use crate::rathole::{RatholeError, DEFAULT_LOG_LINES};
use crate::AppState;

fn map_error(e: RatholeError) -> (StatusCode, Json<Value>) {
    match e {
        RatholeError::InvalidArgument(msg) => api_error(StatusCode::BAD_REQUEST, msg),
        RatholeError::NotFound => api_error(StatusCode::NOT_FOUND, "service not found"),
        RatholeError::LimitReached
        | RatholeError::NameExists
        | RatholeError::NoServerAddr
        | RatholeError::NoServices => api_error(StatusCode::BAD_REQUEST, e.to_string()),
        RatholeError::Process(msg) => api_error(StatusCode::INTERNAL_SERVER_ERROR, msg),
        RatholeError::Store(_) => api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// `GET /api/rathole/config`
pub async fn config_get(State(state): State<AppState>) -> ApiResult {
    let config = state.rathole.config().await.map_err(map_error)?;
    Ok(ok_status("", json!(config)))
}

#[derive(Deserialize)]
pub struct ConfigRequest {
    #[serde(default)]
    pub server_addr: String,
    #[serde(default)]
    pub auto_start: bool,
    #[serde(default)]
    pub enabled: bool,
}

/// `POST /api/rathole/config`
pub async fn config_set(
    State(state): State<AppState>,
    Json(payload): Json<ConfigRequest>,
) -> ApiResult {
    state
        .rathole
        .set_config(&payload.server_addr, payload.auto_start, payload.enabled)
        .await
        .map_err(map_error)?;
    Ok(ok_status("configuration saved", Value::Null))
}

#[derive(Deserialize)]
pub struct AutostartRequest {
    pub auto_start: Option<bool>,
}

/// `POST /api/rathole/autostart` — flip autostart alone. Turning it on
/// forces the service enabled.
pub async fn autostart(
    State(state): State<AppState>,
    Json(payload): Json<AutostartRequest>,
) -> ApiResult {
    let Some(auto_start) = payload.auto_start else {
        return Err(api_error(StatusCode::BAD_REQUEST, "auto_start is required"));
    };

    let config = state.rathole.config().await.map_err(map_error)?;
    let enabled = config.enabled || auto_start;
    state
        .rathole
        .set_config(&config.server_addr, auto_start, enabled)
        .await
        .map_err(map_error)?;
    Ok(ok_status("autostart updated", Value::Null))
}

/// `GET /api/rathole/services`
pub async fn services_list(State(state): State<AppState>) -> ApiResult {
    let services = state.rathole.service_list().await.map_err(map_error)?;
    let count = services.len();
    Ok(Json(json!({
        "status": "ok",
        "message": "",
        "data": services,
        "count": count,
    })))
}

#[derive(Deserialize)]
pub struct ServiceRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub local_addr: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// `POST /api/rathole/services` — add, bouncing a running client so the new
/// service takes effect.
pub async fn service_add(
    State(state): State<AppState>,
    Json(payload): Json<ServiceRequest>,
) -> ApiResult {
    let id = state
        .rathole
        .service_add(&payload.name, &payload.token, &payload.local_addr)
        .await
        .map_err(map_error)?;
    state.rathole.restart_if_running().await;
    Ok(ok_status("service added", json!({"id": id})))
}

/// `PUT /api/rathole/services/{id}`
pub async fn service_update(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(payload): Json<ServiceRequest>,
) -> ApiResult {
    state
        .rathole
        .service_update(
            id,
            &payload.name,
            &payload.token,
            &payload.local_addr,
            payload.enabled,
        )
        .await
        .map_err(map_error)?;
    state.rathole.restart_if_running().await;
    Ok(ok_status("service updated", Value::Null))
}

/// `DELETE /api/rathole/services/{id}`
pub async fn service_delete(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult {
    state.rathole.service_delete(id).await.map_err(map_error)?;
    state.rathole.restart_if_running().await;
    Ok(ok_status("service deleted", Value::Null))
}

/// `POST /api/rathole/start`
pub async fn start(State(state): State<AppState>) -> ApiResult {
    let pid = state.rathole.start().await.map_err(map_error)?;
    Ok(ok_status("service started", json!({"pid": pid})))
}

/// `POST /api/rathole/stop`
pub async fn stop(State(state): State<AppState>) -> ApiResult {
    state.rathole.stop().await.map_err(map_error)?;
    Ok(ok_status("service stopped", Value::Null))
}

/// `GET /api/rathole/status`
pub async fn status(State(state): State<AppState>) -> ApiResult {
    let status = state.rathole.status().await.map_err(map_error)?;
    Ok(ok_status("", json!(status)))
}

#[derive(Deserialize)]
pub struct LogsQuery {
    pub lines: Option<usize>,
}

/// `GET /api/rathole/logs?lines=N` — tail of the client log.
pub async fn logs(State(state): State<AppState>, Query(query): Query<LogsQuery>) -> ApiResult {
    let lines = query.lines.unwrap_or(DEFAULT_LOG_LINES);
    let logs = state.rathole.logs(lines).await;
    Ok(ok_status("", json!({"logs": logs, "lines": lines})))
}

/// `GET /api/rathole/server-config` — server-side TOML skeleton.
pub async fn server_config(State(state): State<AppState>) -> ApiResult {
    let toml = state.rathole.generate_server_config().await.map_err(map_error)?;
    let count = state
        .rathole
        .service_list()
        .await
        .map_err(map_error)?
        .iter()
        .filter(|s| s.enabled)
        .count();
    Ok(ok_status(
        "",
        json!({
            "config": toml,
            "service_count": count,
            "download_url": "https://github.com/rathole-org/rathole/releases/tag/v0.5.0",
        }),
    ))
}

/// `GET /api/rathole/install-script` — server bootstrap script, exported
/// verbatim for the operator.
pub async fn install_script(State(state): State<AppState>) -> ApiResult {
    let script = state.rathole.generate_install_script().await.map_err(map_error)?;
    Ok(ok_status("", json!({"script": script})))
}
