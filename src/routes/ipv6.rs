//! IPv6 port-forwarding endpoints.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{api_error, ok_status, ApiResult};
use crate::ipv6fwd::{Ipv6Config, Ipv6Error};
use crate::AppState;

fn map_error(e: Ipv6Error) -> (StatusCode, Json<Value>) {
    match e {
        Ipv6Error::InvalidArgument(msg) => api_error(StatusCode::BAD_REQUEST, msg),
        Ipv6Error::NotFound => api_error(StatusCode::NOT_FOUND, "rule not found"),
        Ipv6Error::LimitReached => api_error(StatusCode::BAD_REQUEST, e.to_string()),
        Ipv6Error::NoRules => api_error(StatusCode::BAD_REQUEST, e.to_string()),
        Ipv6Error::Store(_) => api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// `GET /api/ipv6-proxy/config`
pub async fn config_get(State(state): State<AppState>) -> ApiResult {
    let config = state.ipv6.config().await.map_err(map_error)?;
    Ok(ok_status("", json!(config)))
}

#[derive(Deserialize)]
pub struct ConfigRequest {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub auto_start: bool,
    #[serde(default)]
    pub send_enabled: bool,
    #[serde(default = "default_interval")]
    pub send_interval: i64,
    #[serde(default)]
    pub webhook_url: String,
    #[serde(default)]
    pub webhook_body: String,
    #[serde(default)]
    pub webhook_headers: String,
}

fn default_interval() -> i64 {
    60
}

/// `POST /api/ipv6-proxy/config` — autostart implies enabled; the saved
/// (possibly coerced) config is echoed back.
pub async fn config_set(
    State(state): State<AppState>,
    Json(payload): Json<ConfigRequest>,
) -> ApiResult {
    let config = Ipv6Config {
        enabled: payload.enabled,
        auto_start: payload.auto_start,
        send_enabled: payload.send_enabled,
        send_interval: payload.send_interval,
        webhook_url: payload.webhook_url,
        webhook_body: payload.webhook_body,
        webhook_headers: payload.webhook_headers,
    };
    let saved = state.ipv6.set_config(config).await.map_err(map_error)?;
    Ok(ok_status("configuration saved", json!(saved)))
}

/// `GET /api/ipv6-proxy/rules`
pub async fn rules_list(State(state): State<AppState>) -> ApiResult {
    let rules = state.ipv6.rule_list().await.map_err(map_error)?;
    Ok(ok_status("", json!(rules)))
}

#[derive(Deserialize)]
pub struct RuleRequest {
    pub local_port: Option<i64>,
    pub ipv6_port: Option<i64>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// `POST /api/ipv6-proxy/rules`
pub async fn rule_add(State(state): State<AppState>, Json(payload): Json<RuleRequest>) -> ApiResult {
    let (Some(local_port), Some(ipv6_port)) = (payload.local_port, payload.ipv6_port) else {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "local_port and ipv6_port are required",
        ));
    };
    let id = state.ipv6.rule_add(local_port, ipv6_port).await.map_err(map_error)?;
    Ok(ok_status("rule added", json!({"id": id})))
}

/// `PUT /api/ipv6-proxy/rules/{id}`
pub async fn rule_update(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(payload): Json<RuleRequest>,
) -> ApiResult {
    let (Some(local_port), Some(ipv6_port)) = (payload.local_port, payload.ipv6_port) else {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "local_port and ipv6_port are required",
        ));
    };
    state
        .ipv6
        .rule_update(id, local_port, ipv6_port, payload.enabled)
        .await
        .map_err(map_error)?;
    Ok(ok_status("rule updated", Value::Null))
}

/// `DELETE /api/ipv6-proxy/rules/{id}`
pub async fn rule_delete(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult {
    state.ipv6.rule_delete(id).await.map_err(map_error)?;
    Ok(ok_status("rule deleted", Value::Null))
}

/// `POST /api/ipv6-proxy/start`
pub async fn start(State(state): State<AppState>) -> ApiResult {
    let count = state.ipv6.start().await.map_err(map_error)?;
    Ok(ok_status("service started", json!({"active_count": count})))
}

/// `POST /api/ipv6-proxy/stop`
pub async fn stop(State(state): State<AppState>) -> ApiResult {
    state.ipv6.stop().await.map_err(map_error)?;
    Ok(ok_status("service stopped", Value::Null))
}

/// `POST /api/ipv6-proxy/restart`
pub async fn restart(State(state): State<AppState>) -> ApiResult {
    let count = state.ipv6.restart().await.map_err(map_error)?;
    Ok(ok_status("service restarted", json!({"active_count": count})))
}

/// `POST /api/ipv6-proxy/send` — kick off a report with the retry ladder;
/// the response acknowledges the dispatch, not the delivery.
pub async fn send_now(State(state): State<AppState>) -> ApiResult {
    let forwarder = std::sync::Arc::clone(&state.ipv6);
    tokio::spawn(async move {
        forwarder.send_report(true).await;
    });
    Ok(ok_status("report dispatched", Value::Null))
}

/// `POST /api/ipv6-proxy/test` — one synchronous attempt, no retry.
pub async fn test_send(State(state): State<AppState>) -> ApiResult {
    let delivered = state.ipv6.send_report(false).await;
    Ok(ok_status(
        if delivered { "delivered" } else { "delivery failed" },
        json!({"delivered": delivered}),
    ))
}

/// `GET /api/ipv6-proxy/status`
pub async fn status(State(state): State<AppState>) -> ApiResult {
    let status = state.ipv6.status().await.map_err(map_error)?;
    Ok(ok_status("", json!(status)))
}

/// `GET /api/ipv6-proxy/send-logs`
pub async fn send_logs(State(state): State<AppState>) -> ApiResult {
    Ok(ok_status("", json!(state.ipv6.send_log.recent(30))))
}
