//! SMS endpoints: inbox, outbox, webhook, caps, CNMI fix.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{Local, TimeZone};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{api_error, ApiResult};
use crate::sms::webhook::WebhookConfig;
use crate::sms::SmsError;
use crate::AppState;

fn map_error(e: SmsError) -> (StatusCode, Json<Value>) {
    match e {
        SmsError::InvalidArgument(msg) => api_error(StatusCode::BAD_REQUEST, msg),
        SmsError::NotFound => api_error(StatusCode::NOT_FOUND, "message not found"),
        SmsError::SendFailed(msg) => api_error(StatusCode::INTERNAL_SERVER_ERROR, msg),
        SmsError::Bus(_) | SmsError::Store(_) => {
            api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

fn format_timestamp(ts: i64) -> String {
    Local
        .timestamp_opt(ts, 0)
        .single()
        .map(|t| t.format("%Y-%m-%dT%H:%M:%S").to_string())
        .unwrap_or_default()
}

/// `GET /api/sms` — inbox, newest first. Bare array, original shape.
pub async fn list(State(state): State<AppState>) -> ApiResult {
    let messages = state.sms.list().await.map_err(map_error)?;
    let rows: Vec<Value> = messages
        .iter()
        .map(|m| {
            json!({
                "id": m.id,
                "sender": m.sender,
                "content": m.content,
                "timestamp": format_timestamp(m.timestamp),
                "read": m.is_read,
            })
        })
        .collect();
    Ok(Json(json!(rows)))
}

#[derive(Deserialize)]
pub struct SendRequest {
    #[serde(default)]
    pub recipient: String,
    #[serde(default)]
    pub content: String,
}

/// `POST /api/sms` — send a message.
pub async fn send(State(state): State<AppState>, Json(payload): Json<SendRequest>) -> ApiResult {
    if payload.recipient.is_empty() || payload.content.is_empty() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "recipient and content must not be empty",
        ));
    }
    let path = state
        .sms
        .send(&payload.recipient, &payload.content)
        .await
        .map_err(map_error)?;
    Ok(Json(json!({
        "status": "success",
        "message": "message sent",
        "path": path,
    })))
}

/// `DELETE /api/sms/{id}`
pub async fn delete(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult {
    if id <= 0 {
        return Err(api_error(StatusCode::BAD_REQUEST, "invalid message id"));
    }
    state.sms.delete(id).await.map_err(map_error)?;
    Ok(Json(json!({"status": "success", "message": "message deleted"})))
}

/// `GET /api/sms/sent` — outbox records, newest first.
pub async fn sent_list(State(state): State<AppState>) -> ApiResult {
    let records = state.sms.sent_list().await.map_err(map_error)?;
    let rows: Vec<Value> = records
        .iter()
        .map(|r| {
            json!({
                "id": r.id,
                "recipient": r.recipient,
                "content": r.content,
                "timestamp": r.timestamp,
                "status": r.status,
            })
        })
        .collect();
    Ok(Json(json!(rows)))
}

/// `DELETE /api/sms/sent/{id}`
pub async fn sent_delete(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult {
    if id <= 0 {
        return Err(api_error(StatusCode::BAD_REQUEST, "invalid record id"));
    }
    state.sms.delete_sent(id).await.map_err(map_error)?;
    Ok(Json(json!({"status": "success"})))
}

/// `GET /api/sms/webhook` — flat config object, original shape.
pub async fn webhook_get(State(state): State<AppState>) -> ApiResult {
    let config = state.sms.webhook_config().await.map_err(map_error)?;
    Ok(Json(json!({
        "enabled": config.enabled,
        "platform": config.platform,
        "url": config.url,
        "body": config.body,
        "headers": config.headers,
    })))
}

#[derive(Deserialize)]
pub struct WebhookRequest {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub headers: String,
}

/// `POST /api/sms/webhook`
pub async fn webhook_save(
    State(state): State<AppState>,
    Json(payload): Json<WebhookRequest>,
) -> ApiResult {
    let config = WebhookConfig {
        enabled: payload.enabled,
        platform: payload.platform,
        url: payload.url,
        body: payload.body,
        headers: payload.headers,
    };
    state.sms.save_webhook_config(&config).await.map_err(map_error)?;
    Ok(Json(json!({"status": "success", "message": "configuration saved"})))
}

/// `POST /api/sms/webhook/test` — force one delivery. The HTTP result
/// reports the dispatch; delivery outcome lands in the log ring.
pub async fn webhook_test(State(state): State<AppState>) -> ApiResult {
    state.sms.test_webhook().await.map_err(map_error)?;
    Ok(Json(json!({"status": "success", "message": "test notification sent"})))
}

/// `GET /api/sms/webhook-logs` — in-memory delivery attempts, newest first.
pub async fn webhook_logs(State(state): State<AppState>) -> ApiResult {
    Ok(Json(json!(state.sms.webhook_log.recent(100))))
}

/// `GET /api/sms/config`
pub async fn config_get(State(state): State<AppState>) -> ApiResult {
    let config = state.sms.config().await.map_err(map_error)?;
    Ok(Json(json!({
        "max_count": config.max_count,
        "max_sent_count": config.max_sent_count,
    })))
}

#[derive(Deserialize)]
pub struct SmsConfigRequest {
    pub max_count: Option<i64>,
    pub max_sent_count: Option<i64>,
}

/// `POST /api/sms/config` — update inbox/outbox caps.
pub async fn config_save(
    State(state): State<AppState>,
    Json(payload): Json<SmsConfigRequest>,
) -> ApiResult {
    let current = state.sms.config().await.map_err(map_error)?;
    let max_count = payload.max_count.unwrap_or(current.max_count);
    let max_sent_count = payload.max_sent_count.unwrap_or(current.max_sent_count);

    state
        .sms
        .set_caps(max_count, max_sent_count)
        .await
        .map_err(map_error)?;
    Ok(Json(json!({
        "status": "success",
        "max_count": max_count,
        "max_sent_count": max_sent_count,
    })))
}

/// `GET /api/sms/fix`
pub async fn fix_get(State(state): State<AppState>) -> ApiResult {
    let config = state.sms.config().await.map_err(map_error)?;
    Ok(Json(json!({"enabled": config.sms_fix_enabled})))
}

#[derive(Deserialize)]
pub struct FixRequest {
    #[serde(default)]
    pub enabled: bool,
}

/// `POST /api/sms/fix` — toggle the CNMI routing fix.
pub async fn fix_set(State(state): State<AppState>, Json(payload): Json<FixRequest>) -> ApiResult {
    state.sms.set_fix_enabled(payload.enabled).await.map_err(map_error)?;
    Ok(Json(json!({
        "status": "success",
        "enabled": payload.enabled,
        "message": if payload.enabled { "SMS fix enabled" } else { "SMS fix disabled" },
    })))
}
