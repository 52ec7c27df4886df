//! APN template store and context manager.
//!
//! Templates are local rows the operator edits freely; applying one writes
//! its fields into the cellular daemon's internet context. The target
//! context is re-resolved on every operation — a SIM swap invalidates
//! context paths, so caching one across calls would write into a dead
//! object.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use sqlx::Row;
use tracing::info;
use zbus::zvariant::{OwnedObjectPath, OwnedValue, Value};

use crate::bus::{self, Bus, BusError, IFACE_CONNECTION_CONTEXT, IFACE_CONNECTION_MANAGER};
use crate::store::{Store, StoreError};
use crate::util::unix_timestamp;

/// Upper bound on stored templates.
pub const MAX_TEMPLATES: i64 = 16;

/// Settle delay around context deactivation/reactivation.
const CONTEXT_SETTLE: Duration = Duration::from_millis(500);

/// APN component errors.
#[derive(Debug, thiserror::Error)]
pub enum ApnError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("template not found")]
    NotFound,

    #[error("template limit reached ({MAX_TEMPLATES})")]
    LimitReached,

    #[error("template name already exists")]
    NameExists,

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Stored APN template.
#[derive(Debug, Clone, Serialize)]
pub struct ApnTemplate {
    pub id: i64,
    pub name: String,
    pub apn: String,
    pub protocol: String,
    pub username: String,
    pub password: String,
    pub auth_method: String,
    pub created_at: i64,
}

/// APN mode/binding singleton.
#[derive(Debug, Clone, Serialize)]
pub struct ApnConfig {
    /// 0 = auto (carrier defaults), 1 = manual (bound template).
    pub mode: i64,
    pub template_id: i64,
    pub auto_start: i64,
}

/// A data context mirrored from the cellular daemon.
#[derive(Debug, Clone, Serialize)]
pub struct ApnContext {
    pub path: String,
    pub name: String,
    pub active: bool,
    pub apn: String,
    pub protocol: String,
    pub username: String,
    pub password: String,
    pub auth_method: String,
    pub context_type: String,
}

/// Application state of a bound template against the live context.
#[derive(Debug, Clone, Serialize)]
pub struct TemplateStatus {
    #[serde(flatten)]
    pub template: ApnTemplate,
    pub is_applied: bool,
    pub is_active: bool,
    pub applied_context: String,
}

/// APN manager.
pub struct ApnManager {
    store: Store,
    bus: Arc<Bus>,
    modem_path: String,
    default_context_path: String,
}

impl ApnManager {
    pub fn new(store: Store, bus: Arc<Bus>, modem_path: String, default_context_path: String) -> Self {
        Self {
            store,
            bus,
            modem_path,
            default_context_path,
        }
    }

    // ── Templates ────────────────────────────────────────────────────

    pub async fn template_list(&self) -> Result<Vec<ApnTemplate>, ApnError> {
        let rows = sqlx::query(
            "SELECT id, name, apn, protocol, username, password, auth_method, created_at
             FROM apn_templates ORDER BY id ASC",
        )
        .fetch_all(self.store.pool())
        .await
        .map_err(StoreError::from)?;

        Ok(rows.iter().map(template_from_row).collect())
    }

    pub async fn template_get(&self, id: i64) -> Result<ApnTemplate, ApnError> {
        let row = sqlx::query(
            "SELECT id, name, apn, protocol, username, password, auth_method, created_at
             FROM apn_templates WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(self.store.pool())
        .await
        .map_err(StoreError::from)?
        .ok_or(ApnError::NotFound)?;

        Ok(template_from_row(&row))
    }

    pub async fn template_create(
        &self,
        name: &str,
        apn: &str,
        protocol: &str,
        username: &str,
        password: &str,
        auth_method: &str,
    ) -> Result<i64, ApnError> {
        validate_template(name, apn, protocol, auth_method)?;

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM apn_templates")
            .fetch_one(self.store.pool())
            .await
            .map_err(StoreError::from)?;
        if count >= MAX_TEMPLATES {
            return Err(ApnError::LimitReached);
        }

        let result = sqlx::query(
            "INSERT INTO apn_templates (name, apn, protocol, username, password, auth_method, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(name)
        .bind(apn)
        .bind(protocol)
        .bind(username)
        .bind(password)
        .bind(auth_method)
        .bind(unix_timestamp())
        .execute(self.store.pool())
        .await
        .map_err(|e| {
            if e.to_string().contains("UNIQUE") {
                ApnError::NameExists
            } else {
                ApnError::Store(e.into())
            }
        })?;

        Ok(result.last_insert_rowid())
    }

    pub async fn template_update(
        &self,
        id: i64,
        name: &str,
        apn: &str,
        protocol: &str,
        username: &str,
        password: &str,
        auth_method: &str,
    ) -> Result<(), ApnError> {
        validate_template(name, apn, protocol, auth_method)?;

        let result = sqlx::query(
            "UPDATE apn_templates SET name=?, apn=?, protocol=?, username=?, password=?, auth_method=?
             WHERE id=?",
        )
        .bind(name)
        .bind(apn)
        .bind(protocol)
        .bind(username)
        .bind(password)
        .bind(auth_method)
        .bind(id)
        .execute(self.store.pool())
        .await
        .map_err(|e| {
            if e.to_string().contains("UNIQUE") {
                ApnError::NameExists
            } else {
                ApnError::Store(e.into())
            }
        })?;

        if result.rows_affected() == 0 {
            return Err(ApnError::NotFound);
        }
        Ok(())
    }

    pub async fn template_delete(&self, id: i64) -> Result<(), ApnError> {
        let result = sqlx::query("DELETE FROM apn_templates WHERE id = ?")
            .bind(id)
            .execute(self.store.pool())
            .await
            .map_err(StoreError::from)?;
        if result.rows_affected() == 0 {
            return Err(ApnError::NotFound);
        }
        Ok(())
    }

    // ── Config singleton ─────────────────────────────────────────────

    /// Read the mode/binding config; first read yields defaults.
    pub async fn config(&self) -> Result<ApnConfig, ApnError> {
        let row = sqlx::query("SELECT mode, template_id, auto_start FROM apn_config WHERE id = 1")
            .fetch_optional(self.store.pool())
            .await
            .map_err(StoreError::from)?;

        Ok(row.map_or(
            ApnConfig {
                mode: 0,
                template_id: 0,
                auto_start: 0,
            },
            |r| ApnConfig {
                mode: r.get(0),
                template_id: r.get(1),
                auto_start: r.get(2),
            },
        ))
    }

    pub async fn set_config(&self, mode: i64, template_id: i64, auto_start: i64) -> Result<(), ApnError> {
        if mode != 0 && mode != 1 {
            return Err(ApnError::InvalidArgument("mode must be 0 or 1".to_string()));
        }
        if mode == 1 && template_id > 0 {
            // Binding a template that doesn't exist is a client error.
            self.template_get(template_id).await?;
        }

        sqlx::query(
            "INSERT OR REPLACE INTO apn_config (id, mode, template_id, auto_start) VALUES (1, ?, ?, ?)",
        )
        .bind(mode)
        .bind(template_id)
        .bind(auto_start)
        .execute(self.store.pool())
        .await
        .map_err(StoreError::from)?;
        Ok(())
    }

    // ── Live contexts ────────────────────────────────────────────────

    /// Enumerate internet-type contexts from the cellular daemon.
    pub async fn contexts(&self) -> Result<Vec<ApnContext>, ApnError> {
        let raw: Vec<(OwnedObjectPath, std::collections::HashMap<String, OwnedValue>)> = self
            .bus
            .call(
                &self.modem_path,
                IFACE_CONNECTION_MANAGER,
                "GetContexts",
                &(),
                bus::CALL_TIMEOUT,
            )
            .await?;

        let mut out = Vec::new();
        for (path, props) in raw {
            let context_type = bus::prop_str(&props, "Type").unwrap_or_default();
            if context_type != "internet" {
                continue;
            }
            out.push(ApnContext {
                path: path.to_string(),
                name: bus::prop_str(&props, "Name").unwrap_or_else(|| "Internet".to_string()),
                active: bus::prop_bool(&props, "Active").unwrap_or(false),
                apn: bus::prop_str(&props, "AccessPointName").unwrap_or_default(),
                protocol: bus::prop_str(&props, "Protocol").unwrap_or_else(|| "ip".to_string()),
                username: bus::prop_str(&props, "Username").unwrap_or_default(),
                password: bus::prop_str(&props, "Password").unwrap_or_default(),
                auth_method: bus::prop_str(&props, "AuthenticationMethod")
                    .unwrap_or_else(|| "chap".to_string()),
                context_type,
            });
        }
        Ok(out)
    }

    /// Resolve the internet context to operate on. Never cached: prefer the
    /// first internet context with a configured APN, else the first internet
    /// context, else the static fallback path.
    pub async fn find_internet_context(&self) -> Result<ApnContext, ApnError> {
        let contexts = self.contexts().await.unwrap_or_default();

        if let Some(ctx) = contexts.iter().find(|c| !c.apn.is_empty()) {
            return Ok(ctx.clone());
        }
        if let Some(ctx) = contexts.first() {
            return Ok(ctx.clone());
        }
        Ok(ApnContext {
            path: self.default_context_path.clone(),
            name: "Internet".to_string(),
            active: false,
            apn: String::new(),
            protocol: "ip".to_string(),
            username: String::new(),
            password: String::new(),
            auth_method: "chap".to_string(),
            context_type: "internet".to_string(),
        })
    }

    /// Application status of a bound template against the live context.
    pub async fn template_status(&self, id: i64) -> Result<TemplateStatus, ApnError> {
        let template = self.template_get(id).await?;
        let ctx = self.find_internet_context().await?;
        let is_applied = !template.apn.is_empty() && ctx.apn == template.apn;
        Ok(TemplateStatus {
            is_active: is_applied && ctx.active,
            applied_context: if is_applied { ctx.path } else { String::new() },
            template,
            is_applied,
        })
    }

    /// Write a template into the live internet context.
    ///
    /// An active context rejects property writes, so it is deactivated
    /// first, given time to settle, written, then reactivated.
    pub async fn apply_template(&self, id: i64) -> Result<(), ApnError> {
        let template = self.template_get(id).await?;
        let ctx = self.find_internet_context().await?;

        let was_active = ctx.active;
        if was_active {
            self.set_context_active(&ctx.path, false).await?;
            tokio::time::sleep(CONTEXT_SETTLE).await;
        }

        self.set_context_prop(&ctx.path, "AccessPointName", &template.apn)
            .await?;
        self.set_context_prop(&ctx.path, "Protocol", &template.protocol)
            .await?;
        self.set_context_prop(&ctx.path, "Username", &template.username)
            .await?;
        self.set_context_prop(&ctx.path, "Password", &template.password)
            .await?;
        self.set_context_prop(&ctx.path, "AuthenticationMethod", &template.auth_method)
            .await?;

        if was_active {
            tokio::time::sleep(CONTEXT_SETTLE).await;
            self.set_context_active(&ctx.path, true).await?;
        }

        info!(template = %template.name, context = %ctx.path, "APN template applied");
        Ok(())
    }

    /// Reset the internet context to carrier defaults and drop the binding.
    pub async fn clear(&self) -> Result<(), ApnError> {
        let ctx = self.find_internet_context().await?;

        if ctx.active {
            self.set_context_active(&ctx.path, false).await?;
            tokio::time::sleep(CONTEXT_SETTLE).await;
        }
        self.set_context_prop(&ctx.path, "AccessPointName", "").await?;
        self.set_context_prop(&ctx.path, "Username", "").await?;
        self.set_context_prop(&ctx.path, "Password", "").await?;
        self.set_context_prop(&ctx.path, "AuthenticationMethod", "none")
            .await?;

        self.set_config(0, 0, 0).await?;
        info!(context = %ctx.path, "APN configuration cleared");
        Ok(())
    }

    async fn set_context_prop(&self, path: &str, name: &str, value: &str) -> Result<(), BusError> {
        self.bus
            .set_property(path, IFACE_CONNECTION_CONTEXT, name, Value::from(value))
            .await
    }

    async fn set_context_active(&self, path: &str, active: bool) -> Result<(), BusError> {
        self.bus
            .set_property(path, IFACE_CONNECTION_CONTEXT, "Active", Value::from(active))
            .await
    }
}

fn template_from_row(row: &sqlx::sqlite::SqliteRow) -> ApnTemplate {
    ApnTemplate {
        id: row.get(0),
        name: row.get(1),
        apn: row.get(2),
        protocol: row.get(3),
        username: row.get(4),
        password: row.get(5),
        auth_method: row.get(6),
        created_at: row.get(7),
    }
}

fn validate_template(name: &str, apn: &str, protocol: &str, auth_method: &str) -> Result<(), ApnError> {
    if name.is_empty() {
        return Err(ApnError::InvalidArgument("name must not be empty".to_string()));
    }
    if apn.is_empty() {
        return Err(ApnError::InvalidArgument("apn must not be empty".to_string()));
    }
    if !matches!(protocol, "ip" | "ipv6" | "dual") {
        return Err(ApnError::InvalidArgument(
            "protocol must be one of ip, ipv6, dual".to_string(),
        ));
    }
    if !matches!(auth_method, "none" | "pap" | "chap") {
        return Err(ApnError::InvalidArgument(
            "auth_method must be one of none, pap, chap".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn manager() -> ApnManager {
        ApnManager::new(
            Store::open_in_memory().await.unwrap(),
            Arc::new(Bus::new()),
            "/ril_0".to_string(),
            "/ril_0/context2".to_string(),
        )
    }

    #[tokio::test]
    async fn template_crud() {
        let mgr = manager().await;

        let id = mgr
            .template_create("cmnet", "cmnet", "dual", "", "", "chap")
            .await
            .unwrap();
        assert!(id >= 1);

        let list = mgr.template_list().await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].name, "cmnet");

        mgr.template_update(id, "cmnet", "cmnet.mnc000", "ipv6", "u", "p", "pap")
            .await
            .unwrap();
        let tpl = mgr.template_get(id).await.unwrap();
        assert_eq!(tpl.apn, "cmnet.mnc000");
        assert_eq!(tpl.protocol, "ipv6");

        mgr.template_delete(id).await.unwrap();
        assert!(matches!(mgr.template_get(id).await, Err(ApnError::NotFound)));
    }

    #[tokio::test]
    async fn template_name_must_be_unique() {
        let mgr = manager().await;
        mgr.template_create("a", "apn1", "ip", "", "", "none")
            .await
            .unwrap();
        assert!(matches!(
            mgr.template_create("a", "apn2", "ip", "", "", "none").await,
            Err(ApnError::NameExists)
        ));
    }

    #[tokio::test]
    async fn template_limit_enforced() {
        let mgr = manager().await;
        for i in 0..MAX_TEMPLATES {
            mgr.template_create(&format!("t{i}"), "apn", "ip", "", "", "none")
                .await
                .unwrap();
        }
        assert!(matches!(
            mgr.template_create("overflow", "apn", "ip", "", "", "none").await,
            Err(ApnError::LimitReached)
        ));
    }

    #[tokio::test]
    async fn template_validation() {
        let mgr = manager().await;
        assert!(matches!(
            mgr.template_create("", "apn", "ip", "", "", "none").await,
            Err(ApnError::InvalidArgument(_))
        ));
        assert!(matches!(
            mgr.template_create("x", "apn", "gre", "", "", "none").await,
            Err(ApnError::InvalidArgument(_))
        ));
        assert!(matches!(
            mgr.template_create("x", "apn", "ip", "", "", "md5").await,
            Err(ApnError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn config_defaults_then_roundtrip() {
        let mgr = manager().await;

        let cfg = mgr.config().await.unwrap();
        assert_eq!(cfg.mode, 0);
        assert_eq!(cfg.template_id, 0);
        assert_eq!(cfg.auto_start, 0);

        let id = mgr
            .template_create("t", "apn", "dual", "", "", "chap")
            .await
            .unwrap();
        mgr.set_config(1, id, 1).await.unwrap();

        let cfg = mgr.config().await.unwrap();
        assert_eq!(cfg.mode, 1);
        assert_eq!(cfg.template_id, id);
        assert_eq!(cfg.auto_start, 1);
    }

    #[tokio::test]
    async fn set_config_rejects_unknown_binding() {
        let mgr = manager().await;
        assert!(matches!(
            mgr.set_config(1, 99, 0).await,
            Err(ApnError::NotFound)
        ));
        assert!(matches!(
            mgr.set_config(5, 0, 0).await,
            Err(ApnError::InvalidArgument(_))
        ));
    }
}
