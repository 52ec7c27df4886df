//! SMS engine: incoming-signal intake, persistence, outbound send, webhook
//! forwarding, and the connection maintenance loop.
//!
//! Incoming messages arrive as `MessageManager.IncomingMessage` signals with
//! a `(s, a{sv})` body — the string is the text, the dictionary carries
//! `Sender`. Intake persists first, then dispatches the webhook
//! asynchronously so a slow endpoint can never back-pressure the bus.
//!
//! The engine assumes the cellular daemon is up at init and lets the name
//! watcher correct the flag; initial subscription may transiently fail and
//! is healed by the maintenance loop.

pub mod webhook;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde::Serialize;
use sqlx::Row;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use zbus::zvariant::{OwnedObjectPath, OwnedValue};

use crate::bus::{self, Bus, BusError, IFACE_MESSAGE_MANAGER, OFONO_SERVICE};
use crate::modem::Modem;
use crate::store::{Store, StoreError};
use crate::util::unix_timestamp;
use webhook::{WebhookConfig, WebhookLogRing};

/// Inbox cap bounds and default.
pub const MAX_INBOX_RANGE: (i64, i64) = (10, 150);
pub const DEFAULT_MAX_INBOX: i64 = 50;
/// Outbox cap bounds and default.
pub const MAX_SENT_RANGE: (i64, i64) = (1, 50);
pub const DEFAULT_MAX_SENT: i64 = 10;

/// Timeout for the daemon's SendMessage call.
const SEND_TIMEOUT: Duration = Duration::from_secs(15);
/// Maintenance cadence.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(30);
/// Pause before resubscribing after a dropped stream.
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(3);

/// CNMI settings toggled by the "SMS fix".
const SMS_FIX_ON: &str = "AT+CNMI=3,2,0,1,0";
const SMS_FIX_OFF: &str = "AT+CNMI=3,1,0,1,0";

/// SMS engine errors.
#[derive(Debug, thiserror::Error)]
pub enum SmsError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("message not found")]
    NotFound,

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A stored incoming message.
#[derive(Debug, Clone, Serialize)]
pub struct SmsMessage {
    pub id: i64,
    pub sender: String,
    pub content: String,
    pub timestamp: i64,
    pub is_read: bool,
}

/// A stored outbound record.
#[derive(Debug, Clone, Serialize)]
pub struct SentSms {
    pub id: i64,
    pub recipient: String,
    pub content: String,
    pub timestamp: i64,
    pub status: String,
}

/// Inbox/outbox caps + fix flag.
#[derive(Debug, Clone, Serialize)]
pub struct SmsConfig {
    pub max_count: i64,
    pub max_sent_count: i64,
    pub sms_fix_enabled: bool,
}

#[derive(Default)]
struct EngineState {
    ofono_available: bool,
    subscribed: bool,
}

/// SMS engine component.
pub struct SmsEngine {
    store: Store,
    bus: Arc<Bus>,
    modem: Arc<Modem>,
    modem_path: String,
    http: reqwest::Client,
    /// Delivery-attempt ring, shared with spawned delivery tasks.
    pub webhook_log: Arc<WebhookLogRing>,
    state: Mutex<EngineState>,
}

impl SmsEngine {
    pub fn new(store: Store, bus: Arc<Bus>, modem: Arc<Modem>, modem_path: String) -> Self {
        Self {
            store,
            bus,
            modem,
            modem_path,
            http: reqwest::Client::new(),
            webhook_log: Arc::new(WebhookLogRing::sms_default()),
            state: Mutex::new(EngineState {
                // Assume the daemon is already up; the name watcher corrects
                // this if it is not.
                ofono_available: true,
                subscribed: false,
            }),
        }
    }

    // ── Intake ───────────────────────────────────────────────────────

    /// Persist one incoming message and dispatch the webhook if configured.
    pub async fn handle_incoming(&self, sender: &str, content: &str) -> Result<i64, SmsError> {
        let id = self.store_incoming(sender, content, unix_timestamp()).await?;
        info!(id, sender, "SMS stored");

        let config = self.webhook_config().await?;
        if config.enabled && !config.url.is_empty() {
            self.dispatch_webhook(&config, sender, content);
        }
        Ok(id)
    }

    async fn store_incoming(&self, sender: &str, content: &str, ts: i64) -> Result<i64, SmsError> {
        let result =
            sqlx::query("INSERT INTO sms (sender, content, timestamp, is_read) VALUES (?, ?, ?, 0)")
                .bind(sender)
                .bind(content)
                .bind(ts)
                .execute(self.store.pool())
                .await
                .map_err(StoreError::from)?;

        let max = self.config().await?.max_count;
        sqlx::query("DELETE FROM sms WHERE id NOT IN (SELECT id FROM sms ORDER BY id DESC LIMIT ?)")
            .bind(max)
            .execute(self.store.pool())
            .await
            .map_err(StoreError::from)?;

        Ok(result.last_insert_rowid())
    }

    /// Fire the webhook without blocking the intake path.
    fn dispatch_webhook(&self, config: &WebhookConfig, sender: &str, content: &str) {
        let body = webhook::render_body(&config.body, sender, content);
        let url = config.url.clone();
        let headers = config.headers.clone();
        let client = self.http.clone();
        let sender = sender.to_string();
        let request = body.clone();
        let log = Arc::clone(&self.webhook_log);
        tokio::spawn(async move {
            let (response, ok) = webhook::deliver(&client, &url, &headers, body).await;
            log.push(&sender, &request, &response, ok);
        });
    }

    /// Spawn the intake task: owns the IncomingMessage stream, resubscribing
    /// when the bus drops.
    pub fn spawn_intake(self: &Arc<Self>) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let mut stream = match engine
                    .bus
                    .signal_stream(IFACE_MESSAGE_MANAGER, "IncomingMessage")
                    .await
                {
                    Ok(s) => {
                        engine.state.lock().await.subscribed = true;
                        info!("SMS signal subscription active");
                        s
                    }
                    Err(e) => {
                        debug!(error = %e, "SMS subscribe failed");
                        engine.state.lock().await.subscribed = false;
                        tokio::time::sleep(RESUBSCRIBE_DELAY).await;
                        continue;
                    }
                };

                while let Some(Ok(msg)) = stream.next().await {
                    let parsed = msg
                        .body()
                        .deserialize::<(String, HashMap<String, OwnedValue>)>();
                    let Ok((content, props)) = parsed else {
                        warn!("incoming message signal with unexpected body");
                        continue;
                    };
                    let sender =
                        bus::prop_str(&props, "Sender").unwrap_or_else(|| "unknown".to_string());
                    if let Err(e) = engine.handle_incoming(&sender, &content).await {
                        warn!(error = %e, "failed to store incoming SMS");
                    }
                }

                engine.state.lock().await.subscribed = false;
                engine.bus.reset().await;
                tokio::time::sleep(RESUBSCRIBE_DELAY).await;
            }
        })
    }

    // ── Outbound ─────────────────────────────────────────────────────

    /// Send a message through the cellular daemon and record the outcome.
    pub async fn send(&self, recipient: &str, content: &str) -> Result<String, SmsError> {
        if recipient.is_empty() || content.is_empty() {
            return Err(SmsError::InvalidArgument(
                "recipient and content must not be empty".to_string(),
            ));
        }

        let result: Result<OwnedObjectPath, BusError> = self
            .bus
            .call(
                &self.modem_path,
                IFACE_MESSAGE_MANAGER,
                "SendMessage",
                &(recipient, content),
                SEND_TIMEOUT,
            )
            .await;

        match result {
            Ok(path) => {
                self.store_sent(recipient, content, "sent").await?;
                info!(recipient, path = %path, "SMS sent");
                Ok(path.to_string())
            }
            Err(e) => {
                self.store_sent(recipient, content, "failed").await?;
                Err(SmsError::SendFailed(e.to_string()))
            }
        }
    }

    async fn store_sent(&self, recipient: &str, content: &str, status: &str) -> Result<(), SmsError> {
        sqlx::query("INSERT INTO sent_sms (recipient, content, timestamp, status) VALUES (?, ?, ?, ?)")
            .bind(recipient)
            .bind(content)
            .bind(unix_timestamp())
            .bind(status)
            .execute(self.store.pool())
            .await
            .map_err(StoreError::from)?;

        let max = self.config().await?.max_sent_count;
        sqlx::query(
            "DELETE FROM sent_sms WHERE id NOT IN (SELECT id FROM sent_sms ORDER BY id DESC LIMIT ?)",
        )
        .bind(max)
        .execute(self.store.pool())
        .await
        .map_err(StoreError::from)?;
        Ok(())
    }

    // ── Listing / deletion ───────────────────────────────────────────

    pub async fn list(&self) -> Result<Vec<SmsMessage>, SmsError> {
        let rows = sqlx::query(
            "SELECT id, sender, content, timestamp, is_read FROM sms ORDER BY id DESC",
        )
        .fetch_all(self.store.pool())
        .await
        .map_err(StoreError::from)?;

        Ok(rows
            .iter()
            .map(|r| SmsMessage {
                id: r.get(0),
                sender: r.get(1),
                content: r.get(2),
                timestamp: r.get(3),
                is_read: r.get::<i64, _>(4) != 0,
            })
            .collect())
    }

    pub async fn delete(&self, id: i64) -> Result<(), SmsError> {
        let result = sqlx::query("DELETE FROM sms WHERE id = ?")
            .bind(id)
            .execute(self.store.pool())
            .await
            .map_err(StoreError::from)?;
        if result.rows_affected() == 0 {
            return Err(SmsError::NotFound);
        }
        Ok(())
    }

    pub async fn sent_list(&self) -> Result<Vec<SentSms>, SmsError> {
        let rows = sqlx::query(
            "SELECT id, recipient, content, timestamp, status FROM sent_sms ORDER BY id DESC",
        )
        .fetch_all(self.store.pool())
        .await
        .map_err(StoreError::from)?;

        Ok(rows
            .iter()
            .map(|r| SentSms {
                id: r.get(0),
                recipient: r.get(1),
                content: r.get(2),
                timestamp: r.get(3),
                status: r.get(4),
            })
            .collect())
    }

    pub async fn delete_sent(&self, id: i64) -> Result<(), SmsError> {
        let result = sqlx::query("DELETE FROM sent_sms WHERE id = ?")
            .bind(id)
            .execute(self.store.pool())
            .await
            .map_err(StoreError::from)?;
        if result.rows_affected() == 0 {
            return Err(SmsError::NotFound);
        }
        Ok(())
    }

    // ── Config ───────────────────────────────────────────────────────

    /// Caps + fix flag; first read yields the documented defaults.
    pub async fn config(&self) -> Result<SmsConfig, SmsError> {
        let row = sqlx::query(
            "SELECT max_count, max_sent_count, sms_fix_enabled FROM sms_config WHERE id = 1",
        )
        .fetch_optional(self.store.pool())
        .await
        .map_err(StoreError::from)?;

        Ok(row.map_or(
            SmsConfig {
                max_count: DEFAULT_MAX_INBOX,
                max_sent_count: DEFAULT_MAX_SENT,
                sms_fix_enabled: false,
            },
            |r| SmsConfig {
                max_count: r.get(0),
                max_sent_count: r.get(1),
                sms_fix_enabled: r.get::<i64, _>(2) != 0,
            },
        ))
    }

    pub async fn set_caps(&self, max_count: i64, max_sent_count: i64) -> Result<(), SmsError> {
        if !(MAX_INBOX_RANGE.0..=MAX_INBOX_RANGE.1).contains(&max_count) {
            return Err(SmsError::InvalidArgument(format!(
                "max_count must be within {}..{}",
                MAX_INBOX_RANGE.0, MAX_INBOX_RANGE.1
            )));
        }
        if !(MAX_SENT_RANGE.0..=MAX_SENT_RANGE.1).contains(&max_sent_count) {
            return Err(SmsError::InvalidArgument(format!(
                "max_sent_count must be within {}..{}",
                MAX_SENT_RANGE.0, MAX_SENT_RANGE.1
            )));
        }

        let fix = self.config().await?.sms_fix_enabled;
        sqlx::query(
            "INSERT OR REPLACE INTO sms_config (id, max_count, max_sent_count, sms_fix_enabled)
             VALUES (1, ?, ?, ?)",
        )
        .bind(max_count)
        .bind(max_sent_count)
        .bind(i64::from(fix))
        .execute(self.store.pool())
        .await
        .map_err(StoreError::from)?;
        Ok(())
    }

    /// Toggle the CNMI routing fix: the AT command must succeed before the
    /// flag is persisted.
    pub async fn set_fix_enabled(&self, enabled: bool) -> Result<(), SmsError> {
        let cmd = if enabled { SMS_FIX_ON } else { SMS_FIX_OFF };
        self.modem
            .execute_at(cmd)
            .await
            .map_err(|e| SmsError::SendFailed(e.to_string()))?;

        let config = self.config().await?;
        sqlx::query(
            "INSERT OR REPLACE INTO sms_config (id, max_count, max_sent_count, sms_fix_enabled)
             VALUES (1, ?, ?, ?)",
        )
        .bind(config.max_count)
        .bind(config.max_sent_count)
        .bind(i64::from(enabled))
        .execute(self.store.pool())
        .await
        .map_err(StoreError::from)?;

        info!(enabled, "SMS fix toggled");
        Ok(())
    }

    /// Re-apply the CNMI fix at startup or daemon reappearance.
    pub async fn apply_fix_if_enabled(&self) {
        match self.config().await {
            Ok(config) if config.sms_fix_enabled => {
                if let Err(e) = self.modem.execute_at(SMS_FIX_ON).await {
                    warn!(error = %e, "failed to re-apply SMS fix");
                } else {
                    info!("SMS fix re-applied");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "could not read SMS config"),
        }
    }

    // ── Webhook config ───────────────────────────────────────────────

    pub async fn webhook_config(&self) -> Result<WebhookConfig, SmsError> {
        let row = sqlx::query(
            "SELECT enabled, platform, url, body, headers FROM webhook_config WHERE id = 1",
        )
        .fetch_optional(self.store.pool())
        .await
        .map_err(StoreError::from)?;

        Ok(row.map_or_else(WebhookConfig::default, |r| WebhookConfig {
            enabled: r.get::<i64, _>(0) != 0,
            platform: r.get(1),
            url: r.get(2),
            body: r.get(3),
            headers: r.get(4),
        }))
    }

    pub async fn save_webhook_config(&self, config: &WebhookConfig) -> Result<(), SmsError> {
        sqlx::query(
            "INSERT OR REPLACE INTO webhook_config (id, enabled, platform, url, body, headers)
             VALUES (1, ?, ?, ?, ?, ?)",
        )
        .bind(i64::from(config.enabled))
        .bind(&config.platform)
        .bind(&config.url)
        .bind(&config.body)
        .bind(&config.headers)
        .execute(self.store.pool())
        .await
        .map_err(StoreError::from)?;
        info!("webhook config saved");
        Ok(())
    }

    /// Deliver a canned test message, ignoring the enabled flag.
    pub async fn test_webhook(&self) -> Result<bool, SmsError> {
        let config = self.webhook_config().await?;
        if config.url.is_empty() {
            return Err(SmsError::InvalidArgument("webhook URL is empty".to_string()));
        }
        let sender = "+8613800138000";
        let body = webhook::render_body(&config.body, sender, "webhook test message");
        let (response, ok) =
            webhook::deliver(&self.http, &config.url, &config.headers, body.clone()).await;
        self.webhook_log.push(sender, &body, &response, ok);
        Ok(ok)
    }

    // ── Health ───────────────────────────────────────────────────────

    /// Engine health: bus connected, daemon present, subscription active.
    pub async fn status_ok(&self) -> bool {
        let state = self.state.lock().await;
        self.bus.is_connected().await && state.ofono_available && state.subscribed
    }

    /// Maintenance loop: every ~30 s, verify the bus connection and the
    /// signal subscription, healing whatever has dropped.
    pub fn spawn_maintenance(self: &Arc<Self>) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;

                if let Err(e) = engine.bus.connection().await {
                    warn!(error = %e, "SMS maintenance: bus unreachable");
                    continue;
                }

                let state = engine.state.lock().await;
                if !state.subscribed {
                    debug!("SMS maintenance: subscription down, intake will resubscribe");
                }
                debug!(
                    available = state.ofono_available,
                    subscribed = state.subscribed,
                    "SMS maintenance tick"
                );
            }
        })
    }

    /// Name watcher: track daemon presence and re-apply the fix when it
    /// comes back.
    pub fn spawn_name_watch(self: &Arc<Self>) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let conn = match engine.bus.connection().await {
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
                        info!("cellular daemon appeared, SMS paths restored");
                        engine.state.lock().await.ofono_available = true;
                        engine.apply_fix_if_enabled().await;
                    } else {
                        warn!("cellular daemon vanished, SMS paths degraded");
                        engine.state.lock().await.ofono_available = false;
                    }
                }

                engine.bus.reset().await;
                tokio::time::sleep(RESUBSCRIBE_DELAY).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn engine() -> Arc<SmsEngine> {
        let store = Store::open_in_memory().await.unwrap();
        let bus = Arc::new(Bus::new());
        let modem = Arc::new(Modem::new(Arc::clone(&bus), "/ril_0".to_string()));
        Arc::new(SmsEngine::new(store, bus, modem, "/ril_0".to_string()))
    }

    #[tokio::test]
    async fn content_roundtrips_bit_for_bit() {
        let engine = engine().await;
        let nasty = "a|b'c\"d\ne\t|| #{content} 短信内容";
        let id = engine.store_incoming("+100", nasty, 1000).await.unwrap();
        assert!(id >= 1);

        let list = engine.list().await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].sender, "+100");
        assert_eq!(list[0].content, nasty);
        assert!(!list[0].is_read);
    }

    #[tokio::test]
    async fn inbox_evicts_oldest_beyond_cap() {
        let engine = engine().await;
        engine.set_caps(10, 5).await.unwrap();
        for i in 0..15 {
            engine
                .store_incoming("+1", &format!("msg {i}"), i)
                .await
                .unwrap();
        }
        let list = engine.list().await.unwrap();
        assert_eq!(list.len(), 10);
        // The kept rows are the highest ids, newest first.
        assert_eq!(list[0].content, "msg 14");
        assert_eq!(list[9].content, "msg 5");
    }

    #[tokio::test]
    async fn sent_records_evict_beyond_cap() {
        let engine = engine().await;
        engine.set_caps(50, 3).await.unwrap();
        for i in 0..5 {
            engine
                .store_sent(&format!("+{i}"), "out", "sent")
                .await
                .unwrap();
        }
        let sent = engine.sent_list().await.unwrap();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0].recipient, "+4");
    }

    #[tokio::test]
    async fn caps_are_validated() {
        let engine = engine().await;
        assert!(matches!(
            engine.set_caps(9, 10).await,
            Err(SmsError::InvalidArgument(_))
        ));
        assert!(matches!(
            engine.set_caps(151, 10).await,
            Err(SmsError::InvalidArgument(_))
        ));
        assert!(matches!(
            engine.set_caps(50, 0).await,
            Err(SmsError::InvalidArgument(_))
        ));
        assert!(matches!(
            engine.set_caps(50, 51).await,
            Err(SmsError::InvalidArgument(_))
        ));
        engine.set_caps(10, 1).await.unwrap();
        engine.set_caps(150, 50).await.unwrap();
    }

    #[tokio::test]
    async fn config_defaults_on_first_read() {
        let engine = engine().await;
        let config = engine.config().await.unwrap();
        assert_eq!(config.max_count, DEFAULT_MAX_INBOX);
        assert_eq!(config.max_sent_count, DEFAULT_MAX_SENT);
        assert!(!config.sms_fix_enabled);
    }

    #[tokio::test]
    async fn webhook_config_defaults_and_roundtrip() {
        let engine = engine().await;
        let config = engine.webhook_config().await.unwrap();
        assert!(!config.enabled);
        assert_eq!(config.platform, "pushplus");
        assert!(config.url.is_empty());

        let new = WebhookConfig {
            enabled: true,
            platform: "bark".to_string(),
            url: "http://example.invalid/hook".to_string(),
            body: "{\"s\":\"#{sender}\"}".to_string(),
            headers: "X-Key: v".to_string(),
        };
        engine.save_webhook_config(&new).await.unwrap();
        let read = engine.webhook_config().await.unwrap();
        assert!(read.enabled);
        assert_eq!(read.platform, "bark");
        assert_eq!(read.body, "{\"s\":\"#{sender}\"}");
    }

    #[tokio::test]
    async fn delete_missing_message_is_not_found() {
        let engine = engine().await;
        assert!(matches!(engine.delete(1).await, Err(SmsError::NotFound)));
        assert!(matches!(engine.delete_sent(1).await, Err(SmsError::NotFound)));
    }
}
