//! Device snapshot endpoint.

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::AppState;

/// `GET /api/info` — modem-centric device snapshot plus identity fields the
/// daemon owns. Modem fields degrade to empty strings while the cellular
/// daemon is unreachable; the endpoint itself never fails.
pub async fn info(State(state): State<AppState>) -> Json<Value> {
    let modem = state.modem.info().await.unwrap_or_default();

    Json(json!({
        "serial": state.config.device.serial,
        "version": env!("CARGO_PKG_VERSION"),
        "uptime": state.start_time.elapsed().as_secs(),
        "sim_slot": modem.sim_slot,
        "network_mode": modem.network_mode,
        "network_status": modem.network_status,
        "network_type": modem.technology,
        "signal_strength": modem.signal_pct,
        "signal_dbm": modem.signal_dbm,
        "airplane_mode": modem.airplane_mode,
        "imei": modem.imei,
        "imsi": modem.imsi,
        "iccid": modem.iccid,
        "carrier": modem.carrier,
    }))
}
