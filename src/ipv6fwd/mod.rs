//! IPv6→IPv4 TCP port forwarding.
//!
//! One listener task per enabled rule: it accepts on `[::]:ipv6_port` and
//! splices each connection onto `127.0.0.1:local_port`. The parent tracks
//! the workers in bounded slots, inserts an ip6tables ACCEPT per active port
//! (check-then-insert, so restarts don't stack duplicates) and removes the
//! rules again on stop before killing the workers, so lingering connections
//! close cleanly.

pub mod relay;
pub mod reporter;

use std::sync::Arc;

use serde::Serialize;
use sqlx::Row;
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::shell;
use crate::store::{Store, StoreError};
use crate::util::unix_timestamp;

/// Upper bound on forwarding rules (and thus worker slots).
pub const MAX_RULES: i64 = 10;

/// Shell timeout for firewall / address commands.
const SHELL_TIMEOUT_MS: u64 = 5000;

/// Forwarder errors.
#[derive(Debug, thiserror::Error)]
pub enum Ipv6Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("rule not found")]
    NotFound,

    #[error("rule limit reached ({MAX_RULES})")]
    LimitReached,

    #[error("no forwarding rules configured")]
    NoRules,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A forwarding rule.
#[derive(Debug, Clone, Serialize)]
pub struct Ipv6Rule {
    pub id: i64,
    pub local_port: u16,
    pub ipv6_port: u16,
    pub enabled: bool,
    pub created_at: i64,
}

/// Service configuration singleton.
#[derive(Debug, Clone, Serialize)]
pub struct Ipv6Config {
    pub enabled: bool,
    pub auto_start: bool,
    pub send_enabled: bool,
    /// Reporter interval in minutes, 1..=1440.
    pub send_interval: i64,
    pub webhook_url: String,
    pub webhook_body: String,
    pub webhook_headers: String,
}

impl Default for Ipv6Config {
    fn default() -> Self {
        Self {
            enabled: false,
            auto_start: false,
            send_enabled: false,
            send_interval: 60,
            webhook_url: String::new(),
            webhook_body: "{\"ipv6\":\"#{ipv6}\",\"link\":\"#{link}\",\"time\":\"#{time}\"}"
                .to_string(),
            webhook_headers: String::new(),
        }
    }
}

/// Runtime status.
#[derive(Debug, Clone, Serialize)]
pub struct Ipv6Status {
    pub running: bool,
    pub active_count: usize,
    pub rule_count: i64,
    pub ipv6_addr: String,
}

/// One running rule worker.
struct RuleWorker {
    rule_id: i64,
    ipv6_port: u16,
    task: JoinHandle<()>,
}

/// IPv6 forwarding component.
pub struct Ipv6Forwarder {
    store: Store,
    shell: String,
    workers: Mutex<Vec<RuleWorker>>,
    /// Periodic reporter task, re-armed on config change.
    reporter: Mutex<Option<JoinHandle<()>>>,
    pub send_log: Arc<reporter::SendLogRing>,
    http: reqwest::Client,
}

impl Ipv6Forwarder {
    pub fn new(store: Store, shell: String) -> Self {
        Self {
            store,
            shell,
            workers: Mutex::new(Vec::new()),
            reporter: Mutex::new(None),
            send_log: Arc::new(reporter::SendLogRing::new()),
            http: reqwest::Client::new(),
        }
    }

    // ── Rules ────────────────────────────────────────────────────────

    pub async fn rule_list(&self) -> Result<Vec<Ipv6Rule>, Ipv6Error> {
        let rows = sqlx::query(
            "SELECT id, local_port, ipv6_port, enabled, created_at
             FROM ipv6_proxy_rules ORDER BY id ASC",
        )
        .fetch_all(self.store.pool())
        .await
        .map_err(StoreError::from)?;

        Ok(rows
            .iter()
            .map(|r| Ipv6Rule {
                id: r.get(0),
                local_port: r.get::<i64, _>(1) as u16,
                ipv6_port: r.get::<i64, _>(2) as u16,
                enabled: r.get::<i64, _>(3) != 0,
                created_at: r.get(4),
            })
            .collect())
    }

    pub async fn rule_add(&self, local_port: i64, ipv6_port: i64) -> Result<i64, Ipv6Error> {
        validate_port(local_port)?;
        validate_port(ipv6_port)?;

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM ipv6_proxy_rules")
            .fetch_one(self.store.pool())
            .await
            .map_err(StoreError::from)?;
        if count >= MAX_RULES {
            return Err(Ipv6Error::LimitReached);
        }

        let result = sqlx::query(
            "INSERT INTO ipv6_proxy_rules (local_port, ipv6_port, enabled, created_at)
             VALUES (?, ?, 1, ?)",
        )
        .bind(local_port)
        .bind(ipv6_port)
        .bind(unix_timestamp())
        .execute(self.store.pool())
        .await
        .map_err(StoreError::from)?;

        let id = result.last_insert_rowid();
        info!(id, ipv6_port, local_port, "forwarding rule added");
        Ok(id)
    }

    pub async fn rule_update(
        &self,
        id: i64,
        local_port: i64,
        ipv6_port: i64,
        enabled: bool,
    ) -> Result<(), Ipv6Error> {
        validate_port(local_port)?;
        validate_port(ipv6_port)?;

        let result = sqlx::query(
            "UPDATE ipv6_proxy_rules SET local_port=?, ipv6_port=?, enabled=? WHERE id=?",
        )
        .bind(local_port)
        .bind(ipv6_port)
        .bind(i64::from(enabled))
        .bind(id)
        .execute(self.store.pool())
        .await
        .map_err(StoreError::from)?;

        if result.rows_affected() == 0 {
            return Err(Ipv6Error::NotFound);
        }
        Ok(())
    }

    pub async fn rule_delete(&self, id: i64) -> Result<(), Ipv6Error> {
        let result = sqlx::query("DELETE FROM ipv6_proxy_rules WHERE id = ?")
            .bind(id)
            .execute(self.store.pool())
            .await
            .map_err(StoreError::from)?;
        if result.rows_affected() == 0 {
            return Err(Ipv6Error::NotFound);
        }
        Ok(())
    }

    // ── Config ───────────────────────────────────────────────────────

    pub async fn config(&self) -> Result<Ipv6Config, Ipv6Error> {
        let row = sqlx::query(
            "SELECT enabled, auto_start, send_enabled, send_interval,
                    webhook_url, webhook_body, webhook_headers
             FROM ipv6_proxy_config WHERE id = 1",
        )
        .fetch_optional(self.store.pool())
        .await
        .map_err(StoreError::from)?;

        Ok(row.map_or_else(Ipv6Config::default, |r| Ipv6Config {
            enabled: r.get::<i64, _>(0) != 0,
            auto_start: r.get::<i64, _>(1) != 0,
            send_enabled: r.get::<i64, _>(2) != 0,
            send_interval: r.get(3),
            webhook_url: r.get(4),
            webhook_body: r.get(5),
            webhook_headers: r.get(6),
        }))
    }

    /// Persist the config. Enabling autostart forces the service enabled,
    /// and the reporter timer is re-armed to the new settings.
    pub async fn set_config(self: &Arc<Self>, mut config: Ipv6Config) -> Result<Ipv6Config, Ipv6Error> {
        if !(1..=1440).contains(&config.send_interval) {
            return Err(Ipv6Error::InvalidArgument(
                "send_interval must be within 1..1440 minutes".to_string(),
            ));
        }
        if config.auto_start {
            config.enabled = true;
        }

        sqlx::query(
            "INSERT OR REPLACE INTO ipv6_proxy_config
             (id, enabled, auto_start, send_enabled, send_interval,
              webhook_url, webhook_body, webhook_headers)
             VALUES (1, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(i64::from(config.enabled))
        .bind(i64::from(config.auto_start))
        .bind(i64::from(config.send_enabled))
        .bind(config.send_interval)
        .bind(&config.webhook_url)
        .bind(&config.webhook_body)
        .bind(&config.webhook_headers)
        .execute(self.store.pool())
        .await
        .map_err(StoreError::from)?;

        self.rearm_reporter().await;
        info!("forwarder config saved");
        Ok(config)
    }

    // ── Service control ──────────────────────────────────────────────

    pub async fn running(&self) -> bool {
        !self.workers.lock().await.is_empty()
    }

    /// Start a worker per enabled rule and open the firewall for each
    /// active port.
    pub async fn start(self: &Arc<Self>) -> Result<usize, Ipv6Error> {
        let mut workers = self.workers.lock().await;
        if !workers.is_empty() {
            debug!("forwarder already running");
            return Ok(workers.len());
        }

        let rules = self.rule_list().await?;
        if rules.is_empty() {
            return Err(Ipv6Error::NoRules);
        }

        for rule in rules.iter().filter(|r| r.enabled) {
            match self.spawn_rule_worker(rule).await {
                Ok(task) => {
                    self.firewall_allow(rule.ipv6_port).await;
                    workers.push(RuleWorker {
                        rule_id: rule.id,
                        ipv6_port: rule.ipv6_port,
                        task,
                    });
                    info!(rule = rule.id, port = rule.ipv6_port, "rule worker started");
                }
                Err(e) => {
                    warn!(rule = rule.id, port = rule.ipv6_port, error = %e, "rule worker failed to start");
                }
            }
        }

        info!(count = workers.len(), "forwarder started");
        Ok(workers.len())
    }

    /// Remove firewall rules, then kill the workers and clear the slots.
    pub async fn stop(&self) -> Result<(), Ipv6Error> {
        let mut workers = self.workers.lock().await;
        if workers.is_empty() {
            debug!("forwarder not running");
            return Ok(());
        }

        if let Ok(rules) = self.rule_list().await {
            for rule in rules.iter().filter(|r| r.enabled) {
                self.firewall_remove(rule.ipv6_port).await;
            }
        }

        for worker in workers.drain(..) {
            debug!(rule = worker.rule_id, port = worker.ipv6_port, "stopping rule worker");
            worker.task.abort();
        }

        info!("forwarder stopped");
        Ok(())
    }

    pub async fn restart(self: &Arc<Self>) -> Result<usize, Ipv6Error> {
        self.stop().await?;
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        self.start().await
    }

    pub async fn status(&self) -> Result<Ipv6Status, Ipv6Error> {
        let rule_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM ipv6_proxy_rules")
            .fetch_one(self.store.pool())
            .await
            .map_err(StoreError::from)?;
        let workers = self.workers.lock().await;
        Ok(Ipv6Status {
            running: !workers.is_empty(),
            active_count: workers.len(),
            rule_count,
            ipv6_addr: self.global_ipv6_addr().await.unwrap_or_default(),
        })
    }

    /// Bind `[::]:port` (reuse-addr, backlog 100) and accept-splice forever.
    async fn spawn_rule_worker(&self, rule: &Ipv6Rule) -> std::io::Result<JoinHandle<()>> {
        let socket = TcpSocket::new_v6()?;
        socket.set_reuseaddr(true)?;
        socket.bind(format!("[::]:{}", rule.ipv6_port).parse().expect("literal addr"))?;
        let listener = socket.listen(100)?;

        let local_port = rule.local_port;
        let ipv6_port = rule.ipv6_port;
        Ok(tokio::spawn(async move {
            loop {
                let (inbound, peer) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(port = ipv6_port, error = %e, "accept failed");
                        continue;
                    }
                };
                debug!(port = ipv6_port, %peer, "inbound connection");

                tokio::spawn(async move {
                    match TcpStream::connect(("127.0.0.1", local_port)).await {
                        Ok(outbound) => {
                            if let Err(e) = relay::splice(inbound, outbound).await {
                                debug!(error = %e, "relay ended with error");
                            }
                        }
                        Err(e) => {
                            warn!(local_port, error = %e, "local connect failed");
                        }
                    }
                });
            }
        }))
    }

    // ── Firewall ─────────────────────────────────────────────────────

    async fn firewall_allow(&self, port: u16) {
        let cmd = format!(
            "ip6tables -C INPUT -p tcp --dport {port} -j ACCEPT 2>/dev/null || \
             ip6tables -A INPUT -p tcp --dport {port} -j ACCEPT"
        );
        match shell::run(&self.shell, &cmd, SHELL_TIMEOUT_MS).await {
            Ok(out) if out.success() => info!(port, "firewall rule added"),
            Ok(out) => warn!(port, code = out.exit_code, "firewall add failed"),
            Err(e) => warn!(port, error = %e, "firewall add failed"),
        }
    }

    async fn firewall_remove(&self, port: u16) {
        let cmd = format!("ip6tables -D INPUT -p tcp --dport {port} -j ACCEPT 2>/dev/null");
        if let Err(e) = shell::run(&self.shell, &cmd, SHELL_TIMEOUT_MS).await {
            warn!(port, error = %e, "firewall remove failed");
        } else {
            info!(port, "firewall rule removed");
        }
    }

    // ── Address discovery ────────────────────────────────────────────

    /// First global-scope IPv6 address of the device, if any.
    pub async fn global_ipv6_addr(&self) -> Option<String> {
        let out = shell::run(&self.shell, "ip -6 addr show scope global", SHELL_TIMEOUT_MS)
            .await
            .ok()?;
        parse_first_inet6(&out.stdout)
    }

    // Reporter plumbing lives in reporter.rs; these accessors keep the
    // borrow surface narrow.
    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub(crate) fn reporter_slot(&self) -> &Mutex<Option<JoinHandle<()>>> {
        &self.reporter
    }
}

/// Pull the first `inet6` address out of `ip -6 addr` output.
fn parse_first_inet6(output: &str) -> Option<String> {
    for line in output.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("inet6 ") {
            let addr = rest.split('/').next()?.trim();
            if !addr.is_empty() && !addr.starts_with("fe80") {
                return Some(addr.to_string());
            }
        }
    }
    None
}

fn validate_port(port: i64) -> Result<(), Ipv6Error> {
    if !(1..=65535).contains(&port) {
        return Err(Ipv6Error::InvalidArgument(format!(
            "port {port} out of range 1..65535"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn forwarder() -> Arc<Ipv6Forwarder> {
        Arc::new(Ipv6Forwarder::new(
            Store::open_in_memory().await.unwrap(),
            "/bin/sh".to_string(),
        ))
    }

    #[tokio::test]
    async fn rule_crud_and_last_insert_id() {
        let fwd = forwarder().await;

        let id1 = fwd.rule_add(80, 8080).await.unwrap();
        let id2 = fwd.rule_add(22, 2222).await.unwrap();
        assert!(id2 > id1);

        let rules = fwd.rule_list().await.unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].local_port, 80);
        assert_eq!(rules[0].ipv6_port, 8080);
        assert!(rules[0].enabled);

        fwd.rule_update(id1, 81, 8081, false).await.unwrap();
        let rules = fwd.rule_list().await.unwrap();
        assert_eq!(rules[0].local_port, 81);
        assert!(!rules[0].enabled);

        fwd.rule_delete(id1).await.unwrap();
        assert!(matches!(fwd.rule_delete(id1).await, Err(Ipv6Error::NotFound)));
    }

    #[tokio::test]
    async fn rule_port_validation() {
        let fwd = forwarder().await;
        assert!(matches!(
            fwd.rule_add(0, 8080).await,
            Err(Ipv6Error::InvalidArgument(_))
        ));
        assert!(matches!(
            fwd.rule_add(80, 65536).await,
            Err(Ipv6Error::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn rule_limit_enforced() {
        let fwd = forwarder().await;
        for i in 0..MAX_RULES {
            fwd.rule_add(1000 + i, 2000 + i).await.unwrap();
        }
        assert!(matches!(
            fwd.rule_add(80, 8080).await,
            Err(Ipv6Error::LimitReached)
        ));
    }

    #[tokio::test]
    async fn config_defaults_on_first_read() {
        let fwd = forwarder().await;
        let config = fwd.config().await.unwrap();
        assert!(!config.enabled);
        assert_eq!(config.send_interval, 60);
        assert!(config.webhook_body.contains("#{ipv6}"));
    }

    #[tokio::test]
    async fn autostart_forces_enabled() {
        let fwd = forwarder().await;
        let mut config = Ipv6Config::default();
        config.auto_start = true;
        config.enabled = false;
        fwd.set_config(config).await.unwrap();

        let read = fwd.config().await.unwrap();
        assert!(read.auto_start);
        assert!(read.enabled);
    }

    #[tokio::test]
    async fn set_config_validates_interval() {
        let fwd = forwarder().await;
        let mut config = Ipv6Config::default();
        config.send_interval = 0;
        assert!(matches!(
            fwd.set_config(config).await,
            Err(Ipv6Error::InvalidArgument(_))
        ));
        let mut config = Ipv6Config::default();
        config.send_interval = 1441;
        assert!(matches!(
            fwd.set_config(config).await,
            Err(Ipv6Error::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn start_without_rules_is_an_error() {
        let fwd = forwarder().await;
        assert!(matches!(fwd.start().await, Err(Ipv6Error::NoRules)));
    }

    #[tokio::test]
    async fn start_and_stop_forward_traffic() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpListener;

        let fwd = forwarder().await;

        // Local service the rule forwards to.
        let local = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local_port = local.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = local.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 256];
                    while let Ok(n) = stream.read(&mut buf).await {
                        if n == 0 || stream.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });

        // Pick a free IPv6 port for the rule.
        let probe = TcpListener::bind("[::1]:0").await.unwrap();
        let ipv6_port = probe.local_addr().unwrap().port();
        drop(probe);

        fwd.rule_add(i64::from(local_port), i64::from(ipv6_port))
            .await
            .unwrap();
        let started = fwd.start().await.unwrap();
        assert_eq!(started, 1);
        assert!(fwd.running().await);

        let mut client = TcpStream::connect(("::1", ipv6_port)).await.unwrap();
        client.write_all(b"through the wall").await.unwrap();
        let mut buf = [0u8; 64];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"through the wall");
        drop(client);

        let status = fwd.status().await.unwrap();
        assert!(status.running);
        assert_eq!(status.active_count, 1);
        assert_eq!(status.rule_count, 1);

        fwd.stop().await.unwrap();
        assert!(!fwd.running().await);
    }

    #[test]
    fn parses_first_global_inet6() {
        let output = "\
2: rmnet_data0: <UP,LOWER_UP> mtu 1500 state UNKNOWN qlen 1000
    inet6 2409:8a55:e2f:1234::1a2b/64 scope global dynamic
       valid_lft 6543sec preferred_lft 2943sec
    inet6 fe80::1/64 scope link
";
        assert_eq!(
            parse_first_inet6(output).as_deref(),
            Some("2409:8a55:e2f:1234::1a2b")
        );
        assert_eq!(parse_first_inet6(""), None);
        assert_eq!(parse_first_inet6("    inet6 fe80::2/64 scope link"), None);
    }
}
