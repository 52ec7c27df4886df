//! Data-bearer and roaming endpoints.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{api_error, ok_status, soft_error, ApiResult};
use crate::AppState;

/// `GET /api/data` — bearer status.
pub async fn data_get(State(state): State<AppState>) -> Json<Value> {
    match state.bearer.data_status().await {
        Ok(active) => ok_status("Success", json!({"active": active})),
        Err(_) => soft_error("Failed to get data connection status"),
    }
}

#[derive(Deserialize)]
pub struct DataRequest {
    pub active: bool,
}

/// `POST /api/data` — toggle the bearer. Also starts/stops the monitor.
pub async fn data_set(
    State(state): State<AppState>,
    Json(payload): Json<DataRequest>,
) -> ApiResult {
    match state.bearer.set_data_status(payload.active).await {
        Ok(()) => Ok(ok_status(
            format!(
                "Data connection {} successfully",
                if payload.active { "enabled" } else { "disabled" }
            ),
            json!({"active": payload.active}),
        )),
        Err(_) => Ok(soft_error("Failed to set data connection")),
    }
}

/// `GET /api/roaming` — roaming allowance + live roaming state.
pub async fn roaming_get(State(state): State<AppState>) -> Json<Value> {
    match state.bearer.roaming_status().await {
        Ok((allowed, is_roaming)) => ok_status(
            "Success",
            json!({"roaming_allowed": allowed, "is_roaming": is_roaming}),
        ),
        Err(_) => soft_error("Failed to get roaming status"),
    }
}

#[derive(Deserialize)]
pub struct RoamingRequest {
    pub allowed: Option<bool>,
}

/// `POST /api/roaming` — allow/forbid roaming, echoing the re-read state.
pub async fn roaming_set(
    State(state): State<AppState>,
    Json(payload): Json<RoamingRequest>,
) -> ApiResult {
    let Some(allowed) = payload.allowed else {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "Invalid request body, 'allowed' field required",
        ));
    };

    match state.bearer.set_roaming_allowed(allowed).await {
        Ok(()) => {
            let (roaming_allowed, is_roaming) =
                state.bearer.roaming_status().await.unwrap_or((allowed, false));
            Ok(ok_status(
                format!(
                    "Roaming {} successfully",
                    if allowed { "enabled" } else { "disabled" }
                ),
                json!({"roaming_allowed": roaming_allowed, "is_roaming": is_roaming}),
            ))
        }
        Err(_) => Ok(soft_error("Failed to set roaming")),
    }
}
