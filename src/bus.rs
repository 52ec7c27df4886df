//! Thin adapter over the system message bus.
//!
//! One shared connection serves the whole process; components hold this
//! handle and build per-call proxies or per-subscription signal streams from
//! it. The connection is (re)established on demand — callers that hit a
//! closed-connection error call [`Bus::reset`] and retry, which mirrors the
//! cellular daemon's own restart behavior.
//!
//! Method calls default to a 30 s timeout; the data-card pair uses 5 s
//! because slot switches are interactive.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{debug, warn};
use zbus::zvariant::{self, OwnedObjectPath, OwnedValue, Value};
use zbus::{Connection, MatchRule, MessageStream, Proxy};

/// Well-known name of the cellular daemon.
pub const OFONO_SERVICE: &str = "org.ofono";

pub const IFACE_MODEM: &str = "org.ofono.Modem";
pub const IFACE_MANAGER: &str = "org.ofono.Manager";
pub const IFACE_CONNECTION_CONTEXT: &str = "org.ofono.ConnectionContext";
pub const IFACE_CONNECTION_MANAGER: &str = "org.ofono.ConnectionManager";
pub const IFACE_NETWORK_REGISTRATION: &str = "org.ofono.NetworkRegistration";
pub const IFACE_NETWORK_MONITOR: &str = "org.ofono.NetworkMonitor";
pub const IFACE_MESSAGE_MANAGER: &str = "org.ofono.MessageManager";
pub const IFACE_RADIO_SETTINGS: &str = "org.ofono.RadioSettings";

/// Default method-call timeout.
pub const CALL_TIMEOUT: Duration = Duration::from_secs(30);
/// Timeout for data-card (SIM slot) operations.
pub const DATACARD_TIMEOUT: Duration = Duration::from_secs(5);

/// Bus-layer errors.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("bus unavailable: {0}")]
    Unavailable(String),

    #[error("bus call timed out")]
    Timeout,

    #[error("bus call failed: {0}")]
    Call(String),
}

impl From<zbus::Error> for BusError {
    fn from(e: zbus::Error) -> Self {
        match e {
            zbus::Error::InputOutput(_) | zbus::Error::Address(_) => {
                Self::Unavailable(e.to_string())
            }
            other => Self::Call(other.to_string()),
        }
    }
}

impl From<zvariant::Error> for BusError {
    fn from(e: zvariant::Error) -> Self {
        Self::Call(e.to_string())
    }
}

pub type BusResult<T> = Result<T, BusError>;

/// Shared handle to the system bus.
pub struct Bus {
    conn: RwLock<Option<Connection>>,
}

impl Bus {
    pub fn new() -> Self {
        Self {
            conn: RwLock::new(None),
        }
    }

    /// Return the live connection, establishing it if needed.
    pub async fn connection(&self) -> BusResult<Connection> {
        if let Some(conn) = self.conn.read().await.as_ref() {
            return Ok(conn.clone());
        }
        let mut slot = self.conn.write().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }
        let conn = Connection::system()
            .await
            .map_err(|e| BusError::Unavailable(e.to_string()))?;
        debug!("system bus connected");
        *slot = Some(conn.clone());
        Ok(conn)
    }

    /// Drop the cached connection so the next call reconnects.
    pub async fn reset(&self) {
        warn!("resetting system bus connection");
        *self.conn.write().await = None;
    }

    pub async fn is_connected(&self) -> bool {
        self.conn.read().await.is_some()
    }

    /// Build a dynamic proxy for an oFono object.
    pub async fn proxy(&self, path: &str, interface: &'static str) -> BusResult<Proxy<'static>> {
        let conn = self.connection().await?;
        let proxy = Proxy::new(&conn, OFONO_SERVICE, path.to_owned(), interface).await?;
        Ok(proxy)
    }

    /// Call a method on an oFono object with a timeout.
    pub async fn call<B, R>(
        &self,
        path: &str,
        interface: &'static str,
        method: &str,
        body: &B,
        timeout: Duration,
    ) -> BusResult<R>
    where
        B: serde::Serialize + zvariant::DynamicType + Sync,
        R: serde::de::DeserializeOwned + zvariant::Type,
    {
        let proxy = self.proxy(path, interface).await?;
        match tokio::time::timeout(timeout, proxy.call::<_, _, R>(method, body)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(BusError::Timeout),
        }
    }

    /// `GetProperties` on an oFono interface.
    pub async fn get_properties(
        &self,
        path: &str,
        interface: &'static str,
    ) -> BusResult<HashMap<String, OwnedValue>> {
        self.call(path, interface, "GetProperties", &(), CALL_TIMEOUT)
            .await
    }

    /// `SetProperty` on an oFono interface.
    pub async fn set_property(
        &self,
        path: &str,
        interface: &'static str,
        name: &str,
        value: Value<'_>,
    ) -> BusResult<()> {
        self.call(path, interface, "SetProperty", &(name, value), CALL_TIMEOUT)
            .await
    }

    /// `Manager.GetDataCard` — object path of the modem currently carrying
    /// data.
    pub async fn get_data_card(&self) -> BusResult<String> {
        let path: OwnedObjectPath = self
            .call("/", IFACE_MANAGER, "GetDataCard", &(), DATACARD_TIMEOUT)
            .await?;
        Ok(path.to_string())
    }

    /// `Manager.SetDataCard` — switch the data-carrying modem.
    pub async fn set_data_card(&self, modem_path: &str) -> BusResult<()> {
        let path = zvariant::ObjectPath::try_from(modem_path)
            .map_err(|e| BusError::Call(e.to_string()))?;
        self.call("/", IFACE_MANAGER, "SetDataCard", &(path,), DATACARD_TIMEOUT)
            .await
    }

    /// Subscribe to a signal on any object path of the given interface.
    ///
    /// Proxy-bound subscriptions pin a single path; context and message
    /// signals arrive from per-SIM paths that change under us, so the match
    /// rule is interface+member only.
    pub async fn signal_stream(
        &self,
        interface: &str,
        member: &str,
    ) -> BusResult<MessageStream> {
        let conn = self.connection().await?;
        let rule = MatchRule::builder()
            .msg_type(zbus::message::Type::Signal)
            .interface(interface)?
            .member(member)?
            .build();
        let stream = MessageStream::for_match_rule(rule, &conn, Some(64)).await?;
        Ok(stream)
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

/// Extract a string from a property map.
pub fn prop_str(props: &HashMap<String, OwnedValue>, key: &str) -> Option<String> {
    props
        .get(key)
        .and_then(|v| String::try_from(&**v).ok())
}

/// Extract a bool from a property map.
pub fn prop_bool(props: &HashMap<String, OwnedValue>, key: &str) -> Option<bool> {
    props.get(key).and_then(|v| bool::try_from(&**v).ok())
}

/// Extract a byte (oFono `Strength` is `y`) from a property map.
pub fn prop_byte(props: &HashMap<String, OwnedValue>, key: &str) -> Option<u8> {
    props.get(key).and_then(|v| u8::try_from(&**v).ok())
}
