//! Shared application state passed to every handler via Axum's `State`
//! extractor.

use std::sync::Arc;
use std::time::Instant;

use crate::apn::ApnManager;
use crate::auth::Auth;
use crate::bearer::DataBearer;
use crate::bus::Bus;
use crate::config::Config;
use crate::ipv6fwd::Ipv6Forwarder;
use crate::modem::Modem;
use crate::rathole::Rathole;
use crate::security::Security;
use crate::sms::SmsEngine;
use crate::store::Store;
use crate::usbmode::UsbModeManager;

/// Shared application state. All components live behind `Arc`s owned here;
/// nothing in the crate is a process-wide static.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic start instant (uptime in `/api/info`).
    pub start_time: Instant,
    pub store: Store,
    pub bus: Arc<Bus>,
    pub modem: Arc<Modem>,
    pub apn: Arc<ApnManager>,
    pub bearer: Arc<DataBearer>,
    pub sms: Arc<SmsEngine>,
    pub ipv6: Arc<Ipv6Forwarder>,
    pub rathole: Arc<Rathole>,
    pub usb: Arc<UsbModeManager>,
    pub auth: Auth,
    pub security: Security,
}

impl AppState {
    /// Wire up every component against one store and one bus connection.
    pub async fn build(config: Config) -> Result<Self, crate::store::StoreError> {
        let store = Store::open(std::path::Path::new(&config.server.db_path)).await?;
        Ok(Self::assemble(config, store))
    }

    /// In-memory variant for tests.
    pub async fn build_in_memory(config: Config) -> Result<Self, crate::store::StoreError> {
        let store = Store::open_in_memory().await?;
        Ok(Self::assemble(config, store))
    }

    fn assemble(config: Config, store: Store) -> Self {
        let bus = Arc::new(Bus::new());
        let modem = Arc::new(Modem::new(
            Arc::clone(&bus),
            config.device.modem_path.clone(),
        ));
        let apn = Arc::new(ApnManager::new(
            store.clone(),
            Arc::clone(&bus),
            config.device.modem_path.clone(),
            config.device.default_context_path.clone(),
        ));
        let bearer = Arc::new(DataBearer::new(
            Arc::clone(&bus),
            Arc::clone(&apn),
            config.device.modem_path.clone(),
        ));
        let sms = Arc::new(SmsEngine::new(
            store.clone(),
            Arc::clone(&bus),
            Arc::clone(&modem),
            config.device.modem_path.clone(),
        ));
        let ipv6 = Arc::new(Ipv6Forwarder::new(
            store.clone(),
            config.server.shell.clone(),
        ));
        let rathole = Arc::new(Rathole::new(
            store.clone(),
            config.rathole.clone(),
            config.server.shell.clone(),
        ));
        let usb = Arc::new(UsbModeManager::new(
            config.usb.clone(),
            config.server.shell.clone(),
        ));
        let auth = Auth::new(store.clone());
        let security = Security::new(store.clone());

        Self {
            config: Arc::new(config),
            start_time: Instant::now(),
            store,
            bus,
            modem,
            apn,
            bearer,
            sms,
            ipv6,
            rathole,
            usb,
            auth,
            security,
        }
    }
}
