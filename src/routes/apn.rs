//! APN template and binding endpoints.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{api_error, ok_status, ApiResult};
use crate::apn::ApnError;
use crate::AppState;

fn map_error(e: ApnError) -> (StatusCode, Json<Value>) {
    match e {
        ApnError::InvalidArgument(msg) => api_error(StatusCode::BAD_REQUEST, msg),
        ApnError::NotFound => api_error(StatusCode::NOT_FOUND, "template not found"),
        ApnError::LimitReached | ApnError::NameExists => {
            api_error(StatusCode::BAD_REQUEST, e.to_string())
        }
        ApnError::Bus(_) => api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        ApnError::Store(_) => api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// `GET /api/apn/templates`
pub async fn templates_list(State(state): State<AppState>) -> ApiResult {
    let templates = state.apn.template_list().await.map_err(map_error)?;
    Ok(ok_status("", json!(templates)))
}

#[derive(Deserialize)]
pub struct TemplateRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub apn: String,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_auth_method")]
    pub auth_method: String,
}

fn default_protocol() -> String {
    "dual".to_string()
}
fn default_auth_method() -> String {
    "chap".to_string()
}

/// `POST /api/apn/templates`
pub async fn templates_create(
    State(state): State<AppState>,
    Json(payload): Json<TemplateRequest>,
) -> ApiResult {
    let id = state
        .apn
        .template_create(
            &payload.name,
            &payload.apn,
            &payload.protocol,
            &payload.username,
            &payload.password,
            &payload.auth_method,
        )
        .await
        .map_err(map_error)?;
    Ok(ok_status("template created", json!({"id": id})))
}

/// `PUT /api/apn/templates/{id}`
pub async fn templates_update(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(payload): Json<TemplateRequest>,
) -> ApiResult {
    state
        .apn
        .template_update(
            id,
            &payload.name,
            &payload.apn,
            &payload.protocol,
            &payload.username,
            &payload.password,
            &payload.auth_method,
        )
        .await
        .map_err(map_error)?;
    Ok(ok_status("template updated", Value::Null))
}

/// `DELETE /api/apn/templates/{id}`
pub async fn templates_delete(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult {
    state.apn.template_delete(id).await.map_err(map_error)?;
    Ok(ok_status("template deleted", Value::Null))
}

/// `GET /api/apn/config` — mode/binding plus, in manual mode, the bound
/// template with its live application status.
pub async fn config_get(State(state): State<AppState>) -> ApiResult {
    let config = state.apn.config().await.map_err(map_error)?;

    let template = if config.mode == 1 && config.template_id > 0 {
        (state.apn.template_status(config.template_id).await).ok()
    } else {
        None
    };

    Ok(ok_status(
        "",
        json!({
            "mode": config.mode,
            "template_id": config.template_id,
            "auto_start": config.auto_start,
            "template": template,
        }),
    ))
}

#[derive(Deserialize)]
pub struct ApnConfigRequest {
    pub mode: Option<i64>,
    #[serde(default)]
    pub template_id: i64,
    #[serde(default)]
    pub auto_start: i64,
}

/// `POST /api/apn/config`
pub async fn config_set(
    State(state): State<AppState>,
    Json(payload): Json<ApnConfigRequest>,
) -> ApiResult {
    let Some(mode) = payload.mode else {
        return Err(api_error(StatusCode::BAD_REQUEST, "missing mode parameter"));
    };
    state
        .apn
        .set_config(mode, payload.template_id, payload.auto_start)
        .await
        .map_err(map_error)?;
    Ok(ok_status("configuration saved", Value::Null))
}

#[derive(Deserialize)]
pub struct ApplyRequest {
    pub template_id: Option<i64>,
}

/// `POST /api/apn/apply` — write the template into the live context.
pub async fn apply(State(state): State<AppState>, Json(payload): Json<ApplyRequest>) -> ApiResult {
    let Some(template_id) = payload.template_id.filter(|id| *id > 0) else {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "missing or invalid template_id parameter",
        ));
    };
    state.apn.apply_template(template_id).await.map_err(map_error)?;
    Ok(ok_status("template applied", Value::Null))
}

/// `POST /api/apn/clear` — reset the context to carrier defaults.
pub async fn clear(State(state): State<AppState>) -> ApiResult {
    state.apn.clear().await.map_err(map_error)?;
    Ok(ok_status("APN configuration cleared", Value::Null))
}
