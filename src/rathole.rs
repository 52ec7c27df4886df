//! Reverse-tunnel (rathole) controller: config generation, child-process
//! supervision, log retrieval, and server-side deployment helpers.
//!
//! The controller never speaks the tunnel protocol itself — it renders the
//! client TOML from stored state, supervises the external binary, and tails
//! its log. The server-side TOML skeleton and install script are exported
//! verbatim for the operator; the device never executes them.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use sqlx::Row;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::RatholeConfig as RatholePaths;
use crate::shell;
use crate::store::{Store, StoreError};
use crate::util::unix_timestamp;

/// Upper bound on tunnel services.
pub const MAX_SERVICES: i64 = 16;

/// Default and maximum log tail length.
pub const DEFAULT_LOG_LINES: usize = 100;
pub const MAX_LOG_LINES: usize = 1000;

/// Externally-exposed server ports start here, assigned by service index.
const SERVER_BASE_PORT: u16 = 9000;

/// Delay between spawn and the liveness check.
const SPAWN_SETTLE: Duration = Duration::from_millis(500);

const SHELL_TIMEOUT_MS: u64 = 5000;

/// Controller errors.
#[derive(Debug, thiserror::Error)]
pub enum RatholeError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("service not found")]
    NotFound,

    #[error("service limit reached ({MAX_SERVICES})")]
    LimitReached,

    #[error("service name already exists")]
    NameExists,

    #[error("server address not configured")]
    NoServerAddr,

    #[error("no tunnel services configured")]
    NoServices,

    #[error("process error: {0}")]
    Process(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Persisted tunnel configuration.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TunnelConfig {
    pub server_addr: String,
    pub auto_start: bool,
    pub enabled: bool,
}

/// One forwarded service.
#[derive(Debug, Clone, Serialize)]
pub struct TunnelService {
    pub id: i64,
    pub name: String,
    pub token: String,
    pub local_addr: String,
    pub enabled: bool,
    pub created_at: i64,
}

/// Runtime status.
#[derive(Debug, Clone, Serialize)]
pub struct TunnelStatus {
    pub running: bool,
    pub pid: i32,
    pub service_count: i64,
    pub last_error: String,
}

/// Tunnel controller component.
pub struct Rathole {
    store: Store,
    paths: RatholePaths,
    shell: String,
    child: Mutex<Option<tokio::process::Child>>,
    last_error: Mutex<String>,
}

impl Rathole {
    pub fn new(store: Store, paths: RatholePaths, shell: String) -> Self {
        Self {
            store,
            paths,
            shell,
            child: Mutex::new(None),
            last_error: Mutex::new(String::new()),
        }
    }

    // ── Config ───────────────────────────────────────────────────────

    pub async fn config(&self) -> Result<TunnelConfig, RatholeError> {
        let row = sqlx::query(
            "SELECT server_addr, auto_start, enabled FROM rathole_config WHERE id = 1",
        )
        .fetch_optional(self.store.pool())
        .await
        .map_err(StoreError::from)?;

        Ok(row.map_or_else(TunnelConfig::default, |r| TunnelConfig {
            server_addr: r.get(0),
            auto_start: r.get::<i64, _>(1) != 0,
            enabled: r.get::<i64, _>(2) != 0,
        }))
    }

    pub async fn set_config(
        &self,
        server_addr: &str,
        auto_start: bool,
        enabled: bool,
    ) -> Result<(), RatholeError> {
        if server_addr.is_empty() {
            return Err(RatholeError::InvalidArgument(
                "server_addr must not be empty".to_string(),
            ));
        }
        if !server_addr.is_ascii() {
            return Err(RatholeError::InvalidArgument(
                "server_addr must be ASCII".to_string(),
            ));
        }
        if !server_addr.contains(':') {
            return Err(RatholeError::InvalidArgument(
                "server_addr must be host:port".to_string(),
            ));
        }

        sqlx::query(
            "INSERT OR REPLACE INTO rathole_config (id, server_addr, auto_start, enabled)
             VALUES (1, ?, ?, ?)",
        )
        .bind(server_addr)
        .bind(i64::from(auto_start))
        .bind(i64::from(enabled))
        .execute(self.store.pool())
        .await
        .map_err(StoreError::from)?;

        info!(server_addr, auto_start, enabled, "tunnel config saved");
        Ok(())
    }

    // ── Services ─────────────────────────────────────────────────────

    pub async fn service_list(&self) -> Result<Vec<TunnelService>, RatholeError> {
        let rows = sqlx::query(
            "SELECT id, name, token, local_addr, enabled, created_at
             FROM rathole_services ORDER BY id ASC",
        )
        .fetch_all(self.store.pool())
        .await
        .map_err(StoreError::from)?;

        Ok(rows
            .iter()
            .map(|r| TunnelService {
                id: r.get(0),
                name: r.get(1),
                token: r.get(2),
                local_addr: r.get(3),
                enabled: r.get::<i64, _>(4) != 0,
                created_at: r.get(5),
            })
            .collect())
    }

    pub async fn service_add(
        &self,
        name: &str,
        token: &str,
        local_addr: &str,
    ) -> Result<i64, RatholeError> {
        validate_service(name, token, local_addr)?;

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM rathole_services")
            .fetch_one(self.store.pool())
            .await
            .map_err(StoreError::from)?;
        if count >= MAX_SERVICES {
            return Err(RatholeError::LimitReached);
        }

        let result = sqlx::query(
            "INSERT INTO rathole_services (name, token, local_addr, enabled, created_at)
             VALUES (?, ?, ?, 1, ?)",
        )
        .bind(name)
        .bind(token)
        .bind(local_addr)
        .bind(unix_timestamp())
        .execute(self.store.pool())
        .await
        .map_err(|e| {
            if e.to_string().contains("UNIQUE") {
                RatholeError::NameExists
            } else {
                RatholeError::Store(e.into())
            }
        })?;

        info!(name, local_addr, "tunnel service added");
        Ok(result.last_insert_rowid())
    }

    pub async fn service_update(
        &self,
        id: i64,
        name: &str,
        token: &str,
        local_addr: &str,
        enabled: bool,
    ) -> Result<(), RatholeError> {
        validate_service(name, token, local_addr)?;

        let result = sqlx::query(
            "UPDATE rathole_services SET name=?, token=?, local_addr=?, enabled=? WHERE id=?",
        )
        .bind(name)
        .bind(token)
        .bind(local_addr)
        .bind(i64::from(enabled))
        .bind(id)
        .execute(self.store.pool())
        .await
        .map_err(|e| {
            if e.to_string().contains("UNIQUE") {
                RatholeError::NameExists
            } else {
                RatholeError::Store(e.into())
            }
        })?;

        if result.rows_affected() == 0 {
            return Err(RatholeError::NotFound);
        }
        Ok(())
    }

    pub async fn service_delete(&self, id: i64) -> Result<(), RatholeError> {
        let result = sqlx::query("DELETE FROM rathole_services WHERE id = ?")
            .bind(id)
            .execute(self.store.pool())
            .await
            .map_err(StoreError::from)?;
        if result.rows_affected() == 0 {
            return Err(RatholeError::NotFound);
        }
        Ok(())
    }

    // ── Config generation ────────────────────────────────────────────

    /// Render the client TOML for the current config and enabled services.
    pub async fn generate_client_config(&self) -> Result<String, RatholeError> {
        let config = self.config().await?;
        if config.server_addr.is_empty() {
            return Err(RatholeError::NoServerAddr);
        }

        let services: Vec<TunnelService> = self
            .service_list()
            .await?
            .into_iter()
            .filter(|s| s.enabled)
            .collect();
        if services.is_empty() {
            return Err(RatholeError::NoServices);
        }

        Ok(render_client_config(&config.server_addr, &services))
    }

    /// Server-side TOML skeleton the operator deploys on the public host.
    pub async fn generate_server_config(&self) -> Result<String, RatholeError> {
        let config = self.config().await?;
        let server_port = config
            .server_addr
            .rsplit_once(':')
            .map_or("2333", |(_, port)| port);

        let services = self.service_list().await?;

        let mut toml = format!("[server]\nbind_addr = \"[::]:{server_port}\"\n");
        for (index, service) in services.iter().enumerate() {
            if !service.enabled {
                continue;
            }
            let exposed = SERVER_BASE_PORT + index as u16;
            toml.push_str(&format!(
                "\n[server.services.{}]\ntoken = \"{}\"\nbind_addr = \"[::]:{}\"\n",
                service.name, service.token, exposed
            ));
        }
        Ok(toml)
    }

    /// Install script for the server host: writes the TOML, registers a
    /// systemd unit, downloads the binary and opens the firewall. Exported
    /// verbatim; never run on the device.
    pub async fn generate_install_script(&self) -> Result<String, RatholeError> {
        let server_toml = self.generate_server_config().await?;
        let config = self.config().await?;
        let server_port = config
            .server_addr
            .rsplit_once(':')
            .map_or("2333", |(_, port)| port);

        let mut ports = vec![server_port.to_string()];
        for (index, service) in self.service_list().await?.iter().enumerate() {
            if service.enabled {
                ports.push((SERVER_BASE_PORT + index as u16).to_string());
            }
        }
        let port_list = ports.join(" ");

        Ok(format!(
            r#"#!/bin/sh
# rathole server bootstrap
set -e

mkdir -p /etc/rathole
cat > /etc/rathole/server.toml <<'EOF'
{server_toml}EOF

if [ ! -x /usr/local/bin/rathole ]; then
    curl -fsSL -o /tmp/rathole.zip \
        https://github.com/rathole-org/rathole/releases/download/v0.5.0/rathole-x86_64-unknown-linux-gnu.zip
    unzip -o /tmp/rathole.zip -d /usr/local/bin
    chmod +x /usr/local/bin/rathole
fi

cat > /etc/systemd/system/rathole.service <<'EOF'
[Unit]
Description=rathole reverse tunnel server
After=network.target

[Service]
ExecStart=/usr/local/bin/rathole /etc/rathole/server.toml
Restart=always

[Install]
WantedBy=multi-user.target
EOF

for port in {port_list}; do
    if command -v ufw >/dev/null 2>&1; then
        ufw allow "$port"/tcp || true
    elif command -v firewall-cmd >/dev/null 2>&1; then
        firewall-cmd --permanent --add-port="$port"/tcp || true
    fi
done
command -v firewall-cmd >/dev/null 2>&1 && firewall-cmd --reload || true

systemctl daemon-reload
systemctl enable --now rathole
"#
        ))
    }

    // ── Process control ──────────────────────────────────────────────

    /// Regenerate the config, truncate the log, spawn the client and verify
    /// it survived its first half second.
    pub async fn start(&self) -> Result<i32, RatholeError> {
        if self.is_running().await {
            info!("tunnel client already running");
            let status = self.status().await?;
            return Ok(status.pid);
        }

        if !std::path::Path::new(&self.paths.bin_path).exists() {
            let err = format!("binary not found: {}", self.paths.bin_path);
            *self.last_error.lock().await = err.clone();
            return Err(RatholeError::Process(err));
        }

        let toml = self.generate_client_config().await?;
        if let Some(parent) = std::path::Path::new(&self.paths.config_path).parent() {
            std::fs::create_dir_all(parent).map_err(|e| RatholeError::Process(e.to_string()))?;
        }
        std::fs::write(&self.paths.config_path, toml)
            .map_err(|e| RatholeError::Process(e.to_string()))?;

        // Truncate the log so the first lines belong to this run.
        let log = std::fs::File::create(&self.paths.log_path)
            .map_err(|e| RatholeError::Process(e.to_string()))?;
        let log_err = log
            .try_clone()
            .map_err(|e| RatholeError::Process(e.to_string()))?;

        let child = tokio::process::Command::new(&self.paths.bin_path)
            .arg(&self.paths.config_path)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .spawn()
            .map_err(|e| {
                let err = format!("spawn failed: {e}");
                RatholeError::Process(err)
            })?;

        let pid = child.id().map_or(-1, |p| p as i32);
        std::fs::write(&self.paths.pid_path, format!("{pid}\n")).ok();
        *self.child.lock().await = Some(child);

        tokio::time::sleep(SPAWN_SETTLE).await;

        if !self.is_running().await {
            let err = "client exited immediately, check the log".to_string();
            *self.last_error.lock().await = err.clone();
            self.child.lock().await.take();
            return Err(RatholeError::Process(err));
        }

        self.last_error.lock().await.clear();
        info!(pid, "tunnel client started");
        Ok(pid)
    }

    /// Signal the client and reap it.
    pub async fn stop(&self) -> Result<(), RatholeError> {
        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.kill().await {
                warn!(error = %e, "kill failed");
            }
            let _ = child.wait().await;
        } else {
            // Not ours (e.g. left over from a previous run) — match by argv.
            let cmd = format!("pkill -f '{}'", self.argv_pattern());
            let _ = shell::run(&self.shell, &cmd, SHELL_TIMEOUT_MS).await;
        }

        std::fs::remove_file(&self.paths.pid_path).ok();
        info!("tunnel client stopped");
        Ok(())
    }

    pub async fn restart(&self) -> Result<i32, RatholeError> {
        self.stop().await?;
        tokio::time::sleep(SPAWN_SETTLE).await;
        self.start().await
    }

    /// Argv signature for pgrep/pkill. The basename's first character is
    /// bracketed so the wrapping `sh -c` (whose argv contains the pattern)
    /// never matches itself.
    fn argv_pattern(&self) -> String {
        let bin = self.paths.bin_path.as_str();
        let (dir, name) = bin.rsplit_once('/').unwrap_or(("", bin));
        let pattern = match name.chars().next() {
            Some(first) if dir.is_empty() => {
                format!("[{first}]{}", &name[first.len_utf8()..])
            }
            Some(first) => format!("{dir}/[{first}]{}", &name[first.len_utf8()..]),
            None => bin.to_string(),
        };
        format!("{pattern}.*{}", config_file_name(&self.paths))
    }

    /// Liveness via pgrep on the argv signature — survives a daemon restart
    /// that loses the child handle.
    pub async fn is_running(&self) -> bool {
        let cmd = format!("pgrep -f '{}'", self.argv_pattern());
        match shell::run(&self.shell, &cmd, SHELL_TIMEOUT_MS).await {
            Ok(out) => out.success() && !out.stdout.trim().is_empty(),
            Err(_) => false,
        }
    }

    pub async fn status(&self) -> Result<TunnelStatus, RatholeError> {
        let running = self.is_running().await;
        let pid = if running {
            let cmd = format!("pgrep -f '{}'", self.argv_pattern());
            shell::run(&self.shell, &cmd, SHELL_TIMEOUT_MS)
                .await
                .ok()
                .and_then(|out| out.stdout.lines().next().and_then(|l| l.trim().parse().ok()))
                .unwrap_or(-1)
        } else {
            -1
        };

        let service_count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM rathole_services WHERE enabled = 1")
                .fetch_one(self.store.pool())
                .await
                .map_err(StoreError::from)?;

        Ok(TunnelStatus {
            running,
            pid,
            service_count,
            last_error: self.last_error.lock().await.clone(),
        })
    }

    /// If running, bounce the client so a config change takes effect.
    pub async fn restart_if_running(self: &Arc<Self>) {
        if self.is_running().await {
            let rathole = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = rathole.restart().await {
                    warn!(error = %e, "tunnel restart after config change failed");
                }
            });
        }
    }

    // ── Logs ─────────────────────────────────────────────────────────

    /// Tail the last `lines` lines of the client log. `lines` is clamped to
    /// 1..=1000; missing log yields empty output.
    pub async fn logs(&self, lines: usize) -> String {
        let lines = lines.clamp(1, MAX_LOG_LINES);
        let content = match tokio::fs::read_to_string(&self.paths.log_path).await {
            Ok(content) => content,
            Err(_) => return String::new(),
        };
        let all: Vec<&str> = content.lines().collect();
        let start = all.len().saturating_sub(lines);
        all[start..].join("\n")
    }
}

/// Render the client TOML: `[client]` with the remote address, then one
/// block per enabled service.
fn render_client_config(server_addr: &str, services: &[TunnelService]) -> String {
    let mut toml = format!("[client]\nremote_addr = \"{server_addr}\"\n");
    for service in services {
        toml.push_str(&format!(
            "\n[client.services.{}]\ntoken = \"{}\"\nlocal_addr = \"{}\"\n",
            service.name, service.token, service.local_addr
        ));
    }
    toml
}

fn config_file_name(paths: &RatholePaths) -> &str {
    std::path::Path::new(&paths.config_path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("client.toml")
}

fn validate_service(name: &str, token: &str, local_addr: &str) -> Result<(), RatholeError> {
    if name.is_empty() || token.is_empty() || local_addr.is_empty() {
        return Err(RatholeError::InvalidArgument(
            "name, token and local_addr must not be empty".to_string(),
        ));
    }
    if !name.is_ascii() {
        return Err(RatholeError::InvalidArgument(
            "service name must be ASCII".to_string(),
        ));
    }
    if !local_addr.contains(':') {
        return Err(RatholeError::InvalidArgument(
            "local_addr must be host:port".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn rathole() -> Rathole {
        Rathole::new(
            Store::open_in_memory().await.unwrap(),
            RatholePaths::default(),
            "/bin/sh".to_string(),
        )
    }

    #[tokio::test]
    async fn client_config_matches_expected_layout() {
        let rathole = rathole().await;
        rathole
            .set_config("198.51.100.5:2333", false, true)
            .await
            .unwrap();
        rathole
            .service_add("web", "t1", "127.0.0.1:80")
            .await
            .unwrap();

        let toml = rathole.generate_client_config().await.unwrap();
        assert_eq!(
            toml,
            "[client]\n\
             remote_addr = \"198.51.100.5:2333\"\n\
             \n\
             [client.services.web]\n\
             token = \"t1\"\n\
             local_addr = \"127.0.0.1:80\"\n"
        );
    }

    #[tokio::test]
    async fn client_config_skips_disabled_services() {
        let rathole = rathole().await;
        rathole.set_config("host:2333", false, true).await.unwrap();
        rathole.service_add("web", "t1", "127.0.0.1:80").await.unwrap();
        let id = rathole.service_add("ssh", "t2", "127.0.0.1:22").await.unwrap();
        rathole
            .service_update(id, "ssh", "t2", "127.0.0.1:22", false)
            .await
            .unwrap();

        let toml = rathole.generate_client_config().await.unwrap();
        assert!(toml.contains("[client.services.web]"));
        assert!(!toml.contains("[client.services.ssh]"));
    }

    #[tokio::test]
    async fn client_config_requires_addr_and_services() {
        let rathole = rathole().await;
        assert!(matches!(
            rathole.generate_client_config().await,
            Err(RatholeError::NoServerAddr)
        ));

        rathole.set_config("host:2333", false, true).await.unwrap();
        assert!(matches!(
            rathole.generate_client_config().await,
            Err(RatholeError::NoServices)
        ));
    }

    #[tokio::test]
    async fn server_config_assigns_ports_by_index() {
        let rathole = rathole().await;
        rathole.set_config("198.51.100.5:2333", false, true).await.unwrap();
        rathole.service_add("web", "t1", "127.0.0.1:80").await.unwrap();
        rathole.service_add("ssh", "t2", "127.0.0.1:22").await.unwrap();

        let toml = rathole.generate_server_config().await.unwrap();
        assert!(toml.starts_with("[server]\nbind_addr = \"[::]:2333\"\n"));
        assert!(toml.contains("[server.services.web]\ntoken = \"t1\"\nbind_addr = \"[::]:9000\""));
        assert!(toml.contains("[server.services.ssh]\ntoken = \"t2\"\nbind_addr = \"[::]:9001\""));
    }

    #[tokio::test]
    async fn install_script_embeds_server_config() {
        let rathole = rathole().await;
        rathole.set_config("198.51.100.5:2333", false, true).await.unwrap();
        rathole.service_add("web", "t1", "127.0.0.1:80").await.unwrap();

        let script = rathole.generate_install_script().await.unwrap();
        assert!(script.starts_with("#!/bin/sh"));
        assert!(script.contains("bind_addr = \"[::]:2333\""));
        assert!(script.contains("systemctl enable --now rathole"));
        assert!(script.contains("2333 9000"));
    }

    #[tokio::test]
    async fn service_name_must_be_ascii_and_unique() {
        let rathole = rathole().await;
        assert!(matches!(
            rathole.service_add("网页", "t", "127.0.0.1:80").await,
            Err(RatholeError::InvalidArgument(_))
        ));
        rathole.service_add("web", "t", "127.0.0.1:80").await.unwrap();
        assert!(matches!(
            rathole.service_add("web", "t2", "127.0.0.1:81").await,
            Err(RatholeError::NameExists)
        ));
    }

    #[tokio::test]
    async fn service_limit_enforced() {
        let rathole = rathole().await;
        for i in 0..MAX_SERVICES {
            rathole
                .service_add(&format!("svc{i}"), "t", "127.0.0.1:80")
                .await
                .unwrap();
        }
        assert!(matches!(
            rathole.service_add("extra", "t", "127.0.0.1:80").await,
            Err(RatholeError::LimitReached)
        ));
    }

    #[tokio::test]
    async fn config_validation() {
        let rathole = rathole().await;
        assert!(matches!(
            rathole.set_config("", false, false).await,
            Err(RatholeError::InvalidArgument(_))
        ));
        assert!(matches!(
            rathole.set_config("服务器:2333", false, false).await,
            Err(RatholeError::InvalidArgument(_))
        ));
        assert!(matches!(
            rathole.set_config("no-port-here", false, false).await,
            Err(RatholeError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn config_defaults_then_roundtrip() {
        let rathole = rathole().await;
        let config = rathole.config().await.unwrap();
        assert!(config.server_addr.is_empty());
        assert!(!config.enabled);

        rathole.set_config("host:2333", true, true).await.unwrap();
        let config = rathole.config().await.unwrap();
        assert_eq!(config.server_addr, "host:2333");
        assert!(config.auto_start);
        assert!(config.enabled);
    }

    #[tokio::test]
    async fn start_fails_without_binary() {
        let rathole = rathole().await;
        rathole.set_config("host:2333", false, true).await.unwrap();
        rathole.service_add("web", "t", "127.0.0.1:80").await.unwrap();
        assert!(matches!(
            rathole.start().await,
            Err(RatholeError::Process(_))
        ));
    }
}
