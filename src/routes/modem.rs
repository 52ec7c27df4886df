//! Radio endpoints: raw AT, network mode, SIM slot, airplane, current band.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{api_error, err_legacy, ok_legacy, ok_status, soft_error, ApiResult};
use crate::modem::{NetworkMode, Slot};
use crate::AppState;

#[derive(Deserialize)]
pub struct AtRequest {
    #[serde(default)]
    pub command: String,
}

/// `POST /api/at` — raw AT command. Legacy envelope; failures stay HTTP 200
/// with a non-zero code.
pub async fn execute_at(State(state): State<AppState>, Json(payload): Json<AtRequest>) -> Json<Value> {
    if payload.command.trim().is_empty() {
        return err_legacy("command must not be empty");
    }
    match state.modem.execute_at(&payload.command).await {
        Ok(result) => ok_legacy(json!(result)),
        Err(e) => err_legacy(e.to_string()),
    }
}

#[derive(Deserialize)]
pub struct SetNetworkRequest {
    #[serde(default)]
    pub mode: String,
    pub slot: Option<String>,
}

/// `POST /api/set_network` — set the technology preference, optionally on a
/// specific slot.
pub async fn set_network(
    State(state): State<AppState>,
    Json(payload): Json<SetNetworkRequest>,
) -> ApiResult {
    let Some(mode) = NetworkMode::from_name(&payload.mode) else {
        return Err(api_error(StatusCode::BAD_REQUEST, "Invalid mode value"));
    };
    let slot = match payload.slot.as_deref() {
        None | Some("") => None,
        Some(s) => Some(Slot::from_name(s).ok_or_else(|| {
            api_error(
                StatusCode::BAD_REQUEST,
                "Invalid slot value. Must be 'slot1' or 'slot2'",
            )
        })?),
    };

    match state.modem.set_network_mode(slot, mode).await {
        Ok(()) => Ok(ok_status("Network mode updated successfully", Value::Null)),
        Err(_) => Ok(soft_error("Failed to update network mode")),
    }
}

#[derive(Deserialize)]
pub struct SwitchRequest {
    #[serde(default)]
    pub slot: String,
}

/// `POST /api/switch` — switch the data card between SIM slots.
pub async fn switch_slot(
    State(state): State<AppState>,
    Json(payload): Json<SwitchRequest>,
) -> ApiResult {
    let Some(slot) = Slot::from_name(&payload.slot) else {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "Invalid slot value. Must be 'slot1' or 'slot2'",
        ));
    };

    match state.modem.switch_slot(slot).await {
        Ok(()) => Ok(ok_status(
            format!("Slot switched to {} successfully", slot.name()),
            Value::Null,
        )),
        Err(_) => Ok(soft_error(format!(
            "Failed to switch slot to {}",
            slot.name()
        ))),
    }
}

#[derive(Deserialize)]
pub struct AirplaneRequest {
    pub enabled: bool,
}

/// `POST /api/airplane_mode` — radio off/on.
pub async fn airplane_mode(
    State(state): State<AppState>,
    Json(payload): Json<AirplaneRequest>,
) -> ApiResult {
    match state.modem.set_airplane(payload.enabled).await {
        Ok(()) => Ok(ok_status("Airplane mode updated successfully", Value::Null)),
        Err(e) => Err(api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to set airplane mode: {e}"),
        )),
    }
}

/// `GET /api/current_band` — decoded serving-band reading. Legacy envelope.
pub async fn current_band(State(state): State<AppState>) -> Json<Value> {
    match state.modem.current_band().await {
        Ok(band) => ok_legacy(json!({
            "network_type": band.network_type,
            "band": band.band,
            "arfcn": band.arfcn,
            "pci": band.pci,
            "rsrp": band.rsrp,
            "rsrq": band.rsrq,
            "sinr": band.sinr,
        })),
        Err(e) => err_legacy(e.to_string()),
    }
}
