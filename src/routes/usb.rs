//! USB gadget mode endpoints.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;

use super::{err_legacy, ok_legacy};
use crate::usbmode::UsbMode;
use crate::AppState;

/// `GET /api/usb/mode` — effective mode plus whether a transient override
/// is active. Legacy envelope.
pub async fn mode_get(State(state): State<AppState>) -> Json<Value> {
    let mode = state.usb.current_mode();
    ok_legacy(json!({
        "mode": mode.name(),
        "mode_value": mode.value(),
        "is_temporary": state.usb.is_temporary(),
    }))
}

#[derive(Deserialize)]
pub struct ModeRequest {
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub permanent: bool,
}

/// `POST /api/usb/mode` — persist the mode choice (takes effect on reboot).
pub async fn mode_set(State(state): State<AppState>, Json(payload): Json<ModeRequest>) -> Json<Value> {
    if payload.mode.is_empty() {
        return err_legacy("mode must not be empty");
    }
    let Some(mode) = UsbMode::from_name(&payload.mode) else {
        return err_legacy("invalid mode, supported: cdc_ncm, cdc_ecm, rndis");
    };

    match state.usb.set_mode(mode, payload.permanent) {
        Ok(()) => ok_legacy(json!({
            "mode": mode.name(),
            "permanent": payload.permanent,
            "message": "mode saved, takes effect after reboot",
        })),
        Err(e) => err_legacy(e.to_string()),
    }
}

#[derive(Deserialize)]
pub struct AdvanceRequest {
    pub mode: Option<i64>,
}

/// `POST /api/usb-advance` — hot switch.
///
/// The response is produced *before* the switch begins: the switch tears
/// down the very USB link carrying it, so the reply must be flushed first.
/// The switch itself starts 200 ms later on a detached task.
pub async fn advance(State(state): State<AppState>, Json(payload): Json<AdvanceRequest>) -> Json<Value> {
    let Some(mode) = payload.mode.and_then(UsbMode::from_value) else {
        return err_legacy("invalid mode, supported: 1=NCM, 2=ECM, 3=RNDIS");
    };

    let usb = Arc::clone(&state.usb);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        if let Err(e) = usb.switch_advanced(mode).await {
            warn!(error = %e, "USB hot switch failed");
        }
    });

    ok_legacy(json!({
        "mode": mode.name(),
        "mode_value": mode.value(),
        "message": "USB mode switching, please wait...",
    }))
}
