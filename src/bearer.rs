//! Data-bearer supervision: best-effort "data always on".
//!
//! Two independent mechanisms keep the internet context up:
//!
//! - the **Monitor** reacts to bus signals (context deactivation, network
//!   registration, SIM switch, daemon appear/vanish) and coalesces bursts of
//!   `Active=false` into a single restore attempt per 2 s window;
//! - the **Watchdog** re-checks on a fixed interval regardless of signals,
//!   logging only when the reported status changes.
//!
//! The internet context is resolved on every operation — a SIM swap
//! invalidates context paths between calls.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use zbus::zvariant::{OwnedValue, Value};

use crate::apn::ApnManager;
use crate::bus::{
    self, Bus, BusError, IFACE_CONNECTION_CONTEXT, IFACE_CONNECTION_MANAGER, IFACE_MANAGER,
    IFACE_NETWORK_REGISTRATION, OFONO_SERVICE,
};

/// Coalescing window for context-drop bursts.
const RESTORE_DELAY: Duration = Duration::from_secs(2);
/// Pause before resubscribing after a dropped signal stream.
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(3);

/// Bearer component errors.
#[derive(Debug, thiserror::Error)]
pub enum BearerError {
    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Data-bearer supervisor.
pub struct DataBearer {
    bus: Arc<Bus>,
    apn: Arc<ApnManager>,
    /// Modem path the registration watcher follows; updated on SIM switch.
    current_modem_path: RwLock<String>,
    /// Pending coalesced restore; re-arming aborts the previous one.
    pending_restore: Mutex<Option<JoinHandle<()>>>,
    /// Monitor task handles, present while the monitor runs.
    monitor_tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Last status string the watchdog reported.
    last_status: Mutex<String>,
}

impl DataBearer {
    pub fn new(bus: Arc<Bus>, apn: Arc<ApnManager>, modem_path: String) -> Self {
        Self {
            bus,
            apn,
            current_modem_path: RwLock::new(modem_path),
            pending_restore: Mutex::new(None),
            monitor_tasks: Mutex::new(Vec::new()),
            last_status: Mutex::new(String::new()),
        }
    }

    // ── Status operations ────────────────────────────────────────────

    /// Whether the internet context is active.
    pub async fn data_status(&self) -> Result<bool, BearerError> {
        let ctx = self
            .apn
            .find_internet_context()
            .await
            .map_err(|e| BusError::Call(e.to_string()))?;
        let props = self
            .bus
            .get_properties(&ctx.path, IFACE_CONNECTION_CONTEXT)
            .await?;
        Ok(bus::prop_bool(&props, "Active").unwrap_or(false))
    }

    /// Activate or deactivate the internet context. Turning data on also
    /// (re)starts the monitor; turning it off stops the monitor so it does
    /// not fight the operator.
    pub async fn set_data_status(self: &Arc<Self>, active: bool) -> Result<(), BearerError> {
        let ctx = self
            .apn
            .find_internet_context()
            .await
            .map_err(|e| BusError::Call(e.to_string()))?;
        self.bus
            .set_property(
                &ctx.path,
                IFACE_CONNECTION_CONTEXT,
                "Active",
                Value::from(active),
            )
            .await?;
        info!(context = %ctx.path, active, "data status set");

        if active {
            self.start_monitor().await;
        } else {
            self.stop_monitor().await;
        }
        Ok(())
    }

    /// (roaming allowed, currently roaming).
    pub async fn roaming_status(&self) -> Result<(bool, bool), BearerError> {
        let modem_path = self.current_modem_path.read().await.clone();

        let allowed = match self
            .bus
            .get_properties(&modem_path, IFACE_CONNECTION_MANAGER)
            .await
        {
            Ok(props) => bus::prop_bool(&props, "RoamingAllowed").unwrap_or(false),
            Err(e) => return Err(e.into()),
        };

        let is_roaming = self
            .bus
            .get_properties(&modem_path, IFACE_NETWORK_REGISTRATION)
            .await
            .map(|props| bus::prop_str(&props, "Status").as_deref() == Some("roaming"))
            .unwrap_or(false);

        Ok((allowed, is_roaming))
    }

    pub async fn set_roaming_allowed(&self, allowed: bool) -> Result<(), BearerError> {
        let modem_path = self.current_modem_path.read().await.clone();
        self.bus
            .set_property(
                &modem_path,
                IFACE_CONNECTION_MANAGER,
                "RoamingAllowed",
                Value::from(allowed),
            )
            .await?;
        info!(allowed, "roaming allowed set");
        Ok(())
    }

    // ── Restore logic ────────────────────────────────────────────────

    /// Check registration and context state, restoring data if it dropped.
    /// Returns a short human status.
    pub async fn check_and_restore(&self) -> String {
        let modem_path = self.current_modem_path.read().await.clone();

        let registered = match self
            .bus
            .get_properties(&modem_path, IFACE_NETWORK_REGISTRATION)
            .await
        {
            Ok(props) => matches!(
                bus::prop_str(&props, "Status").as_deref(),
                Some("registered") | Some("roaming")
            ),
            Err(e) => {
                debug!(error = %e, "registration query failed");
                false
            }
        };
        if !registered {
            return "waiting for registration".to_string();
        }

        let ctx = match self.apn.find_internet_context().await {
            Ok(ctx) => ctx,
            Err(e) => return format!("context lookup failed: {e}"),
        };
        if ctx.apn.is_empty() {
            return "APN not configured, skipping".to_string();
        }

        let active = self
            .bus
            .get_properties(&ctx.path, IFACE_CONNECTION_CONTEXT)
            .await
            .map(|props| bus::prop_bool(&props, "Active").unwrap_or(false))
            .unwrap_or(false);
        if active {
            return "connected".to_string();
        }

        match self
            .bus
            .set_property(&ctx.path, IFACE_CONNECTION_CONTEXT, "Active", Value::from(true))
            .await
        {
            Ok(()) => {
                info!(context = %ctx.path, "data connection restored");
                "data connection restored".to_string()
            }
            Err(e) => format!("restore failed: {e}"),
        }
    }

    /// Arm the coalesced restore: any previously pending attempt is
    /// cancelled, so a burst of drops yields one restore per window.
    async fn schedule_restore(self: &Arc<Self>) {
        let mut pending = self.pending_restore.lock().await;
        if let Some(handle) = pending.take() {
            handle.abort();
        }
        let bearer = Arc::clone(self);
        *pending = Some(tokio::spawn(async move {
            tokio::time::sleep(RESTORE_DELAY).await;
            let status = bearer.check_and_restore().await;
            debug!(status = %status, "coalesced restore ran");
        }));
    }

    async fn cancel_pending_restore(&self) {
        if let Some(handle) = self.pending_restore.lock().await.take() {
            handle.abort();
        }
    }

    // ── Monitor ──────────────────────────────────────────────────────

    /// Start the signal-driven monitor (idempotent).
    pub async fn start_monitor(self: &Arc<Self>) {
        let mut tasks = self.monitor_tasks.lock().await;
        if !tasks.is_empty() {
            return;
        }
        info!("bearer monitor starting");
        tasks.push(self.spawn_context_watch());
        tasks.push(self.spawn_registration_watch());
        tasks.push(self.spawn_manager_watch());
        tasks.push(self.spawn_name_watch());
    }

    /// Stop the monitor and cancel any pending restore.
    pub async fn stop_monitor(&self) {
        let mut tasks = self.monitor_tasks.lock().await;
        if tasks.is_empty() {
            return;
        }
        info!("bearer monitor stopping");
        for task in tasks.drain(..) {
            task.abort();
        }
        self.cancel_pending_restore().await;
    }

    pub async fn monitor_running(&self) -> bool {
        !self.monitor_tasks.lock().await.is_empty()
    }

    /// `ConnectionContext.PropertyChanged` on any path: `Active=false`
    /// schedules a coalesced restore.
    fn spawn_context_watch(self: &Arc<Self>) -> JoinHandle<()> {
        let bearer = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let mut stream = match bearer
                    .bus
                    .signal_stream(IFACE_CONNECTION_CONTEXT, "PropertyChanged")
                    .await
                {
                    Ok(s) => s,
                    Err(e) => {
                        debug!(error = %e, "context watch subscribe failed");
                        tokio::time::sleep(RESUBSCRIBE_DELAY).await;
                        continue;
                    }
                };

                while let Some(Ok(msg)) = stream.next().await {
                    let Ok((name, value)) = msg.body().deserialize::<(String, OwnedValue)>() else {
                        continue;
                    };
                    if name == "Active" && bool::try_from(value).ok() == Some(false) {
                        debug!("context went inactive, arming restore");
                        bearer.schedule_restore().await;
                    }
                }

                // Stream closed: connection died. Reset and resubscribe.
                bearer.bus.reset().await;
                tokio::time::sleep(RESUBSCRIBE_DELAY).await;
            }
        })
    }

    /// `NetworkRegistration.PropertyChanged`: on (re)registration of the
    /// current modem, restore immediately. The subscription matches every
    /// path and filters on the current modem so a SIM switch only has to
    /// update the filter.
    fn spawn_registration_watch(self: &Arc<Self>) -> JoinHandle<()> {
        let bearer = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let mut stream = match bearer
                    .bus
                    .signal_stream(IFACE_NETWORK_REGISTRATION, "PropertyChanged")
                    .await
                {
                    Ok(s) => s,
                    Err(e) => {
                        debug!(error = %e, "registration watch subscribe failed");
                        tokio::time::sleep(RESUBSCRIBE_DELAY).await;
                        continue;
                    }
                };

                while let Some(Ok(msg)) = stream.next().await {
                    let header = msg.header();
                    let Some(path) = header.path() else { continue };
                    if path.as_str() != bearer.current_modem_path.read().await.as_str() {
                        continue;
                    }
                    let Ok((name, value)) = msg.body().deserialize::<(String, OwnedValue)>() else {
                        continue;
                    };
                    if name != "Status" {
                        continue;
                    }
                    let status = String::try_from(value).unwrap_or_default();
                    if status == "registered" || status == "roaming" {
                        info!(status = %status, "network registered");
                        bearer.check_and_restore().await;
                    }
                }

                bearer.bus.reset().await;
                tokio::time::sleep(RESUBSCRIBE_DELAY).await;
            }
        })
    }

    /// `Manager.PropertyChanged` at `/`: a `DataCard` change means the SIM
    /// was switched externally — follow the new modem and re-check.
    fn spawn_manager_watch(self: &Arc<Self>) -> JoinHandle<()> {
        let bearer = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let mut stream = match bearer.bus.signal_stream(IFACE_MANAGER, "PropertyChanged").await
                {
                    Ok(s) => s,
                    Err(e) => {
                        debug!(error = %e, "manager watch subscribe failed");
                        tokio::time::sleep(RESUBSCRIBE_DELAY).await;
                        continue;
                    }
                };

                while let Some(Ok(msg)) = stream.next().await {
                    let Ok((name, value)) = msg.body().deserialize::<(String, OwnedValue)>() else {
                        continue;
                    };
                    if name != "DataCard" {
                        continue;
                    }
                    let new_path = String::try_from(value).unwrap_or_default();
                    if new_path.is_empty() {
                        continue;
                    }
                    info!(path = %new_path, "data card switched");
                    *bearer.current_modem_path.write().await = new_path;
                    bearer.check_and_restore().await;
                }

                bearer.bus.reset().await;
                tokio::time::sleep(RESUBSCRIBE_DELAY).await;
            }
        })
    }

    /// Follow the cellular daemon's name: re-check when it appears, cancel
    /// the pending restore when it vanishes.
    fn spawn_name_watch(self: &Arc<Self>) -> JoinHandle<()> {
        let bearer = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let conn = match bearer.bus.connection().await {
                    Ok(c) => c,
                    Err(_) => {
                        tokio::time::sleep(RESUBSCRIBE_DELAY).await;
                        continue;
                    }
                };
                let dbus = match zbus::fdo::DBusProxy::new(&conn).await {
                    Ok(p) => p,
                    Err(_) => {
                        tokio::time::sleep(RESUBSCRIBE_DELAY).await;
                        continue;
                    }
                };
                let mut stream = match dbus
                    .receive_name_owner_changed_with_args(&[(0, OFONO_SERVICE)])
                    .await
                {
                    Ok(s) => s,
                    Err(_) => {
                        tokio::time::sleep(RESUBSCRIBE_DELAY).await;
                        continue;
                    }
                };

                while let Some(signal) = stream.next().await {
                    let Ok(args) = signal.args() else { continue };
                    if args.new_owner().is_some() {
                        info!("cellular daemon appeared");
                        bearer.check_and_restore().await;
                    } else {
                        warn!("cellular daemon vanished");
                        bearer.cancel_pending_restore().await;
                    }
                }

                bearer.bus.reset().await;
                tokio::time::sleep(RESUBSCRIBE_DELAY).await;
            }
        })
    }

    // ── Watchdog ─────────────────────────────────────────────────────

    /// Periodic checker, independent of the monitor. Logs only when the
    /// status string changes.
    pub fn spawn_watchdog(self: &Arc<Self>, interval_secs: u64) -> JoinHandle<()> {
        let bearer = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let status = bearer.check_and_restore().await;
                let mut last = bearer.last_status.lock().await;
                if *last != status {
                    info!(status = %status, "bearer watchdog");
                    *last = status;
                }
            }
        })
    }
}
