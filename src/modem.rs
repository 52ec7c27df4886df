//! Modem control: AT bridge, network mode, SIM slot, signal, cell info.
//!
//! All AT traffic is serialised behind one async mutex — the modem firmware
//! garbles interleaved commands — and the lock is held across the retry so
//! two callers can never be in flight at once. Mode preferences map onto the
//! cellular daemon's `TechnologyPreference` string enum, whose indices are
//! stable firmware contract.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info};
use zbus::zvariant::{OwnedValue, Value};

use crate::bus::{
    self, Bus, BusError, IFACE_MODEM, IFACE_NETWORK_MONITOR, IFACE_NETWORK_REGISTRATION,
    IFACE_RADIO_SETTINGS,
};

const IFACE_SIM_MANAGER: &str = "org.ofono.SimManager";

/// AT command timeout per attempt.
const AT_TIMEOUT: Duration = Duration::from_secs(8);
/// Backoff before retrying a busy modem.
const AT_BUSY_BACKOFF: Duration = Duration::from_millis(500);
/// Snapshot cache lifetime.
const INFO_CACHE_TTL: Duration = Duration::from_secs(1);

/// Cell-table bounds for the `+SPENGMD` reply.
const CELL_MAX_ROWS: usize = 64;
const CELL_MAX_COLS: usize = 16;

/// `TechnologyPreference` values, index-stable.
const TECHNOLOGY_PREFERENCES: [&str; 11] = [
    "WCDMA preferred",          // 0
    "GSM only",                 // 1
    "WCDMA only",               // 2
    "GSM/WCDMA auto",           // 3
    "LTE/GSM/WCDMA auto",       // 4
    "LTE only",                 // 5
    "LTE/WCDMA auto",           // 6
    "NR 5G/LTE/GSM/WCDMA auto", // 7
    "NR 5G only",               // 8
    "NR 5G/LTE auto",           // 9
    "NSA only",                 // 10
];

/// Modem-layer errors.
#[derive(Debug, thiserror::Error)]
pub enum ModemError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Bus(#[from] BusError),
}

/// User-facing network mode preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkMode {
    Auto,
    Nr5gOnly,
    LteOnly,
    NsaOnly,
}

impl NetworkMode {
    pub fn from_name(s: &str) -> Option<Self> {
        match s {
            "auto" => Some(Self::Auto),
            "nr5g_only" => Some(Self::Nr5gOnly),
            "lte_only" => Some(Self::LteOnly),
            "nsa_only" => Some(Self::NsaOnly),
            _ => None,
        }
    }

    /// Index into [`TECHNOLOGY_PREFERENCES`].
    fn preference_index(self) -> usize {
        match self {
            Self::Auto => 7,
            Self::Nr5gOnly => 8,
            Self::LteOnly => 5,
            Self::NsaOnly => 10,
        }
    }

    pub fn preference(self) -> &'static str {
        TECHNOLOGY_PREFERENCES[self.preference_index()]
    }
}

/// SIM slot selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Slot1,
    Slot2,
}

impl Slot {
    pub fn from_name(s: &str) -> Option<Self> {
        match s {
            "slot1" => Some(Self::Slot1),
            "slot2" => Some(Self::Slot2),
            _ => None,
        }
    }

    pub fn modem_path(self) -> &'static str {
        match self {
            Self::Slot1 => "/ril_0",
            Self::Slot2 => "/ril_1",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Slot1 => "slot1",
            Self::Slot2 => "slot2",
        }
    }

    fn from_modem_path(path: &str) -> Option<Self> {
        match path {
            "/ril_0" => Some(Self::Slot1),
            "/ril_1" => Some(Self::Slot2),
            _ => None,
        }
    }
}

/// Live modem snapshot served by `/api/info`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ModemInfo {
    pub sim_slot: String,
    pub network_mode: String,
    pub network_status: String,
    pub technology: String,
    pub signal_pct: u8,
    pub signal_dbm: i32,
    pub airplane_mode: bool,
    pub imei: String,
    pub imsi: String,
    pub iccid: String,
    pub carrier: String,
}

/// Decoded current-band reading from the `+SPENGMD` table.
#[derive(Debug, Clone, Serialize)]
pub struct BandInfo {
    pub network_type: String,
    pub band: String,
    pub arfcn: i32,
    pub pci: i32,
    pub rsrp: f64,
    pub rsrq: f64,
    pub sinr: f64,
}

impl Default for BandInfo {
    fn default() -> Self {
        Self {
            network_type: "N/A".to_string(),
            band: "N/A".to_string(),
            arfcn: 0,
            pci: 0,
            rsrp: 0.0,
            rsrq: 0.0,
            sinr: 0.0,
        }
    }
}

/// Modem component. One per process.
pub struct Modem {
    bus: Arc<Bus>,
    modem_path: String,
    /// Serialisation point for all AT traffic.
    at_lock: Mutex<()>,
    info_cache: Mutex<Option<(Instant, ModemInfo)>>,
}

impl Modem {
    pub fn new(bus: Arc<Bus>, modem_path: String) -> Self {
        Self {
            bus,
            modem_path,
            at_lock: Mutex::new(()),
            info_cache: Mutex::new(None),
        }
    }

    pub fn modem_path(&self) -> &str {
        &self.modem_path
    }

    /// Execute a raw AT command, serialised across all callers.
    ///
    /// The `AT` prefix is enforced case-insensitively (prepended when
    /// missing). One retry: a closed bus connection is reset first, a busy
    /// modem gets a 500 ms backoff.
    pub async fn execute_at(&self, command: &str) -> Result<String, ModemError> {
        let command = normalize_at(command)?;

        let _guard = self.at_lock.lock().await;

        match self.send_at(&command).await {
            Ok(resp) => Ok(resp),
            Err(first) => {
                let msg = first.to_string();
                if matches!(first, BusError::Unavailable(_)) || msg.contains("connection closed") {
                    self.bus.reset().await;
                } else if msg.contains("in progress") || msg.contains("InProgress") {
                    tokio::time::sleep(AT_BUSY_BACKOFF).await;
                }
                debug!(command = %command, error = %msg, "AT retry");
                Ok(self.send_at(&command).await?)
            }
        }
    }

    async fn send_at(&self, command: &str) -> Result<String, BusError> {
        self.bus
            .call(
                &self.modem_path,
                IFACE_MODEM,
                "SendAtcmd",
                &(command,),
                AT_TIMEOUT,
            )
            .await
    }

    /// Set the network mode preference, optionally on a specific slot.
    pub async fn set_network_mode(
        &self,
        slot: Option<Slot>,
        mode: NetworkMode,
    ) -> Result<(), ModemError> {
        let path = match slot {
            Some(slot) => slot.modem_path(),
            None => self.modem_path.as_str(),
        };
        self.bus
            .set_property(
                path,
                IFACE_RADIO_SETTINGS,
                "TechnologyPreference",
                Value::from(mode.preference()),
            )
            .await?;
        info!(path, preference = mode.preference(), "network mode set");
        Ok(())
    }

    /// Read the raw `TechnologyPreference` string.
    pub async fn network_mode(&self) -> Result<String, ModemError> {
        let props = self
            .bus
            .get_properties(&self.modem_path, IFACE_RADIO_SETTINGS)
            .await?;
        Ok(bus::prop_str(&props, "TechnologyPreference").unwrap_or_default())
    }

    /// Switch the data card to the given SIM slot.
    pub async fn switch_slot(&self, slot: Slot) -> Result<(), ModemError> {
        self.bus.set_data_card(slot.modem_path()).await?;
        info!(slot = slot.name(), "SIM slot switched");
        Ok(())
    }

    /// Slot currently carrying data.
    pub async fn current_slot(&self) -> Result<Slot, ModemError> {
        let path = self.bus.get_data_card().await?;
        Ok(Slot::from_modem_path(&path).unwrap_or(Slot::Slot1))
    }

    /// Radio on/off. Airplane mode takes the modem offline.
    pub async fn set_airplane(&self, enabled: bool) -> Result<(), ModemError> {
        self.bus
            .set_property(
                &self.modem_path,
                IFACE_MODEM,
                "Online",
                Value::from(!enabled),
            )
            .await?;
        info!(enabled, "airplane mode set");
        Ok(())
    }

    /// Signal strength as (percent, dBm). dBm follows the 3GPP RSSI mapping.
    pub async fn signal(&self) -> Result<(u8, i32), ModemError> {
        let props = self
            .bus
            .get_properties(&self.modem_path, IFACE_NETWORK_REGISTRATION)
            .await?;
        let strength = bus::prop_byte(&props, "Strength").unwrap_or(0);
        Ok((strength, strength_to_dbm(strength)))
    }

    /// Technology + band of the serving cell, from the network monitor.
    pub async fn serving_cell(&self) -> Result<(String, i32), ModemError> {
        let props: HashMap<String, OwnedValue> = self
            .bus
            .call(
                &self.modem_path,
                IFACE_NETWORK_MONITOR,
                "GetServingCellInformation",
                &(),
                bus::CALL_TIMEOUT,
            )
            .await?;
        let tech = bus::prop_str(&props, "Technology").unwrap_or_default();
        let band = props
            .get("Band")
            .and_then(|v| i32::try_from(v).ok())
            .unwrap_or(0);
        Ok((tech, band))
    }

    /// Whether the serving cell is NR.
    pub async fn is_5g(&self) -> bool {
        match self.serving_cell().await {
            Ok((tech, _)) => tech == "nr",
            Err(e) => {
                debug!(error = %e, "serving cell query failed, assuming 4G");
                false
            }
        }
    }

    /// Live device snapshot, cached for at most one second.
    pub async fn info(&self) -> Result<ModemInfo, ModemError> {
        {
            let cache = self.info_cache.lock().await;
            if let Some((at, info)) = cache.as_ref() {
                if at.elapsed() < INFO_CACHE_TTL {
                    return Ok(info.clone());
                }
            }
        }

        let mut info = ModemInfo::default();

        info.sim_slot = match self.current_slot().await {
            Ok(slot) => slot.name().to_string(),
            Err(_) => String::new(),
        };
        info.network_mode = self.network_mode().await.unwrap_or_default();

        if let Ok(props) = self.bus.get_properties(&self.modem_path, IFACE_MODEM).await {
            info.imei = bus::prop_str(&props, "Serial").unwrap_or_default();
            info.airplane_mode = !bus::prop_bool(&props, "Online").unwrap_or(true);
        }
        if let Ok(props) = self
            .bus
            .get_properties(&self.modem_path, IFACE_SIM_MANAGER)
            .await
        {
            info.iccid = bus::prop_str(&props, "CardIdentifier").unwrap_or_default();
            info.imsi = bus::prop_str(&props, "SubscriberIdentity").unwrap_or_default();
        }
        if let Ok(props) = self
            .bus
            .get_properties(&self.modem_path, IFACE_NETWORK_REGISTRATION)
            .await
        {
            info.network_status = bus::prop_str(&props, "Status").unwrap_or_default();
            info.technology = bus::prop_str(&props, "Technology").unwrap_or_default();
            info.carrier = bus::prop_str(&props, "Name").unwrap_or_default();
            let strength = bus::prop_byte(&props, "Strength").unwrap_or(0);
            info.signal_pct = strength;
            info.signal_dbm = strength_to_dbm(strength);
        }

        *self.info_cache.lock().await = Some((Instant::now(), info.clone()));
        Ok(info)
    }

    /// Query and decode the current serving band via the vendor cell table.
    pub async fn current_band(&self) -> Result<BandInfo, ModemError> {
        if self.is_5g().await {
            let resp = self.execute_at("AT+SPENGMD=0,14,1").await?;
            let rows = parse_cell_table(&resp);
            Ok(decode_band_info(&rows, true))
        } else {
            let resp = self.execute_at("AT+SPENGMD=0,6,0").await?;
            let rows = parse_cell_table(&resp);
            Ok(decode_band_info(&rows, false))
        }
    }
}

/// Enforce the `AT` prefix, case-insensitively, prepending it when absent.
fn normalize_at(command: &str) -> Result<String, ModemError> {
    let command = command.trim();
    if command.is_empty() {
        return Err(ModemError::InvalidArgument("empty AT command".to_string()));
    }
    if command
        .get(..2)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("AT"))
    {
        Ok(command.to_string())
    } else {
        Ok(format!("AT{command}"))
    }
}

/// oFono reports `Strength` as 0..100; the secondary dBm figure follows the
/// 3GPP RSSI mapping.
pub fn strength_to_dbm(strength: u8) -> i32 {
    -113 + 2 * i32::from(strength)
}

/// Tokenise a vendor `+SPENGMD` reply into a row-major string matrix.
///
/// The `-` character is overloaded three ways:
/// 1. a lone `-` terminates the current row;
/// 2. `--` terminates the row and the second `-` opens the next one;
/// 3. `,-` is a negative-sign literal inside the current row.
///
/// Trailing `OK` and all CR/LF are stripped first. Fields are
/// comma-separated with surrounding whitespace trimmed. Output is bounded to
/// 64 rows × 16 columns.
pub fn parse_cell_table(input: &str) -> Vec<Vec<String>> {
    let cleaned: String = match input.find("OK") {
        Some(pos) => &input[..pos],
        None => input,
    }
    .chars()
    .filter(|c| *c != '\r' && *c != '\n')
    .collect();

    let mut rows: Vec<Vec<String>> = Vec::new();
    let mut part = String::new();
    let mut prev: Option<char> = None;

    let flush = |rows: &mut Vec<Vec<String>>, part: &mut String| {
        if !part.is_empty() {
            let cols: Vec<String> = part
                .split(',')
                .take(CELL_MAX_COLS)
                .map(|f| f.trim().to_string())
                .collect();
            rows.push(cols);
            part.clear();
        }
    };

    let chars: Vec<char> = cleaned.chars().collect();
    let mut i = 0;
    while i < chars.len() && rows.len() < CELL_MAX_ROWS {
        let c = chars[i];
        if c == '-' {
            if prev == Some(',') {
                part.push(c);
            } else if chars.get(i + 1) == Some(&'-') {
                flush(&mut rows, &mut part);
                part.push('-');
                i += 1; // consume the second '-'
            } else {
                flush(&mut rows, &mut part);
            }
        } else {
            part.push(c);
        }
        prev = Some(c);
        i += 1;
    }
    if rows.len() < CELL_MAX_ROWS {
        flush(&mut rows, &mut part);
    }

    rows
}

/// First column of a row, if present and non-empty.
fn cell(rows: &[Vec<String>], row: usize) -> Option<&str> {
    rows.get(row)
        .and_then(|r| r.first())
        .map(String::as_str)
        .filter(|s| !s.is_empty())
}

/// Decode the parsed table into a [`BandInfo`]. 4G tables carry SINR at row
/// 33, 5G at row 15; RSRP/RSRQ/SINR arrive scaled by 100.
pub fn decode_band_info(rows: &[Vec<String>], is_5g: bool) -> BandInfo {
    let mut out = BandInfo::default();

    let (min_rows, sinr_row, type_name, band_prefix) = if is_5g {
        (16, 15, "5G NR", "N")
    } else {
        (34, 33, "4G LTE", "B")
    };

    if rows.len() < min_rows {
        return out;
    }

    out.network_type = type_name.to_string();
    if let Some(v) = cell(rows, 0) {
        out.band = format!("{band_prefix}{v}");
    }
    if let Some(v) = cell(rows, 1) {
        out.arfcn = v.parse().unwrap_or(0);
    }
    if let Some(v) = cell(rows, 2) {
        out.pci = v.parse().unwrap_or(0);
    }
    if let Some(v) = cell(rows, 3) {
        out.rsrp = v.parse::<f64>().unwrap_or(0.0) / 100.0;
    }
    if let Some(v) = cell(rows, 4) {
        out.rsrq = v.parse::<f64>().unwrap_or(0.0) / 100.0;
    }
    if let Some(v) = cell(rows, sinr_row) {
        out.sinr = v.parse::<f64>().unwrap_or(0.0) / 100.0;
    }

    out
}

/// Validate a mode string from the API.
pub fn is_valid_network_mode(s: &str) -> bool {
    NetworkMode::from_name(s).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_mapping_is_index_stable() {
        assert_eq!(NetworkMode::Auto.preference(), "NR 5G/LTE/GSM/WCDMA auto");
        assert_eq!(NetworkMode::Nr5gOnly.preference(), "NR 5G only");
        assert_eq!(NetworkMode::LteOnly.preference(), "LTE only");
        assert_eq!(NetworkMode::NsaOnly.preference(), "NSA only");
    }

    #[test]
    fn mode_parsing() {
        assert_eq!(NetworkMode::from_name("auto"), Some(NetworkMode::Auto));
        assert_eq!(NetworkMode::from_name("lte_only"), Some(NetworkMode::LteOnly));
        assert_eq!(NetworkMode::from_name("5g"), None);
    }

    #[test]
    fn slot_paths() {
        assert_eq!(Slot::Slot1.modem_path(), "/ril_0");
        assert_eq!(Slot::Slot2.modem_path(), "/ril_1");
        assert_eq!(Slot::from_name("slot2"), Some(Slot::Slot2));
        assert_eq!(Slot::from_name("slot3"), None);
    }

    #[test]
    fn at_prefix_enforcement() {
        assert_eq!(normalize_at("AT+CSQ").unwrap(), "AT+CSQ");
        assert_eq!(normalize_at("at+csq").unwrap(), "at+csq");
        assert_eq!(normalize_at("+CSQ").unwrap(), "AT+CSQ");
        assert_eq!(normalize_at("  +CSQ \r\n").unwrap(), "AT+CSQ");
        assert!(normalize_at("   ").is_err());
        // Multibyte first characters must not panic the prefix check.
        assert_eq!(normalize_at("中文").unwrap(), "AT中文");
    }

    #[test]
    fn dbm_mapping() {
        assert_eq!(strength_to_dbm(0), -113);
        assert_eq!(strength_to_dbm(15), -83);
        assert_eq!(strength_to_dbm(50), -13);
    }

    #[test]
    fn cell_table_single_dash_terminates_row() {
        let rows = parse_cell_table("1,2,3-4,5,6-OK");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], vec!["1", "2", "3"]);
        assert_eq!(rows[1], vec!["4", "5", "6"]);
    }

    #[test]
    fn cell_table_comma_dash_is_negative_literal() {
        let rows = parse_cell_table("1,-102,3-OK");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0], vec!["1", "-102", "3"]);
    }

    #[test]
    fn cell_table_double_dash_starts_next_row_negative() {
        let rows = parse_cell_table("1,2--103,4-OK");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], vec!["1", "2"]);
        assert_eq!(rows[1], vec!["-103", "4"]);
    }

    #[test]
    fn cell_table_strips_crlf_and_ok() {
        let rows = parse_cell_table("\r\n78\r\n-\r\n504990-161-OK\r\n");
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0], vec!["78"]);
        assert_eq!(rows[1], vec!["504990"]);
        assert_eq!(rows[2], vec!["161"]);
    }

    #[test]
    fn cell_table_trims_field_whitespace() {
        let rows = parse_cell_table(" 3 , 1850 - 261 , 5 -");
        assert_eq!(rows[0], vec!["3", "1850"]);
        assert_eq!(rows[1], vec!["261", "5"]);
    }

    #[test]
    fn cell_table_keeps_trailing_part_without_terminator() {
        let rows = parse_cell_table("1,2-3,4");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1], vec!["3", "4"]);
    }

    #[test]
    fn cell_table_row_bound() {
        let mut input = String::new();
        for i in 0..100 {
            input.push_str(&format!("{i}-"));
        }
        let rows = parse_cell_table(&input);
        assert_eq!(rows.len(), 64);
    }

    fn table_with(rows: usize, sinr_row: usize) -> Vec<Vec<String>> {
        let mut t: Vec<Vec<String>> = (0..rows).map(|i| vec![format!("{}", i + 1)]).collect();
        t[3] = vec!["-10250".to_string()];
        t[4] = vec!["-1175".to_string()];
        t[sinr_row] = vec!["1890".to_string()];
        t
    }

    #[test]
    fn decode_band_info_4g() {
        let rows = table_with(34, 33);
        let info = decode_band_info(&rows, false);
        assert_eq!(info.network_type, "4G LTE");
        assert_eq!(info.band, "B1");
        assert_eq!(info.arfcn, 2);
        assert_eq!(info.pci, 3);
        assert!((info.rsrp - -102.5).abs() < f64::EPSILON);
        assert!((info.rsrq - -11.75).abs() < f64::EPSILON);
        assert!((info.sinr - 18.9).abs() < f64::EPSILON);
    }

    #[test]
    fn decode_band_info_5g() {
        let rows = table_with(16, 15);
        let info = decode_band_info(&rows, true);
        assert_eq!(info.network_type, "5G NR");
        assert_eq!(info.band, "N1");
        assert!((info.sinr - 18.9).abs() < f64::EPSILON);
    }

    #[test]
    fn decode_band_info_too_few_rows() {
        let rows = table_with(10, 5);
        let info = decode_band_info(&rows, false);
        assert_eq!(info.network_type, "N/A");
        assert_eq!(info.band, "N/A");
    }
}
