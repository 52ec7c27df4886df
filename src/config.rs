//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `MIFICTL_LISTEN`, `MIFICTL_DB_PATH`
//! 2. **Config file** — path via `--config <path>`, or `mifictl.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:6677"
//! db_path = "6677.db"
//!
//! [device]
//! serial = "MIFI-0000-DEV-001"
//! modem_path = "/ril_0"
//!
//! [usb]
//! mode_cfg = "/mnt/data/mode.cfg"
//! mode_tmp_cfg = "/mnt/data/mode_tmp.cfg"
//!
//! [rathole]
//! bin_path = "/home/root/6677/rathole"
//! config_path = "/home/root/6677/client.toml"
//! log_path = "/tmp/rathole.log"
//! pid_path = "/tmp/rathole.pid"
//!
//! [bearer]
//! watchdog_interval_secs = 10
//!
//! [logging]
//! level = "info"
//! ```

use serde::Deserialize;
use std::path::Path;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub usb: UsbConfig,
    #[serde(default)]
    pub rathole: RatholeConfig,
    #[serde(default)]
    pub bearer: BearerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server and storage settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:6677`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// SQLite database file holding all persistent state (default `6677.db`).
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// Shell binary used for firewall / interface side-effects (default `/bin/sh`).
    #[serde(default = "default_shell")]
    pub shell: String,
}

/// Device identity and cellular daemon paths.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    /// Unique device serial number, reported in `/api/info`.
    #[serde(default = "default_serial")]
    pub serial: String,
    /// Object path of the default modem on the system bus (default `/ril_0`).
    #[serde(default = "default_modem_path")]
    pub modem_path: String,
    /// Fallback internet context path when enumeration finds none.
    #[serde(default = "default_context_path")]
    pub default_context_path: String,
}

/// USB gadget paths. Overridable so tests can point at a scratch directory.
#[derive(Debug, Clone, Deserialize)]
pub struct UsbConfig {
    /// Persistent mode file (default `/mnt/data/mode.cfg`).
    #[serde(default = "default_usb_mode_cfg")]
    pub mode_cfg: String,
    /// Transient mode file, wins over the persistent one at read time.
    #[serde(default = "default_usb_mode_tmp_cfg")]
    pub mode_tmp_cfg: String,
    /// configfs gadget root (default `/sys/kernel/config/usb_gadget/g1`).
    #[serde(default = "default_usb_gadget_root")]
    pub gadget_root: String,
    /// UDC class directory (default `/sys/class/udc`).
    #[serde(default = "default_udc_class_dir")]
    pub udc_class_dir: String,
    /// Gadget-side IP assigned to the USB network interface.
    #[serde(default = "default_usb_interface_ip")]
    pub interface_ip: String,
}

/// Paths for the external reverse-tunnel client binary.
#[derive(Debug, Clone, Deserialize)]
pub struct RatholeConfig {
    #[serde(default = "default_rathole_bin")]
    pub bin_path: String,
    #[serde(default = "default_rathole_config")]
    pub config_path: String,
    #[serde(default = "default_rathole_log")]
    pub log_path: String,
    #[serde(default = "default_rathole_pid")]
    pub pid_path: String,
}

/// Data-bearer watchdog settings.
#[derive(Debug, Clone, Deserialize)]
pub struct BearerConfig {
    /// Seconds between watchdog checks (default 10).
    #[serde(default = "default_watchdog_interval")]
    pub watchdog_interval_secs: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "0.0.0.0:6677".to_string()
}
fn default_db_path() -> String {
    "6677.db".to_string()
}
fn default_shell() -> String {
    "/bin/sh".to_string()
}
fn default_serial() -> String {
    "MIFI-0000-DEV-001".to_string()
}
fn default_modem_path() -> String {
    "/ril_0".to_string()
}
fn default_context_path() -> String {
    "/ril_0/context2".to_string()
}
fn default_usb_mode_cfg() -> String {
    "/mnt/data/mode.cfg".to_string()
}
fn default_usb_mode_tmp_cfg() -> String {
    "/mnt/data/mode_tmp.cfg".to_string()
}
fn default_usb_gadget_root() -> String {
    "/sys/kernel/config/usb_gadget/g1".to_string()
}
fn default_udc_class_dir() -> String {
    "/sys/class/udc".to_string()
}
fn default_usb_interface_ip() -> String {
    "192.168.66.1".to_string()
}
fn default_rathole_bin() -> String {
    "/home/root/6677/rathole".to_string()
}
fn default_rathole_config() -> String {
    "/home/root/6677/client.toml".to_string()
}
fn default_rathole_log() -> String {
    "/tmp/rathole.log".to_string()
}
fn default_rathole_pid() -> String {
    "/tmp/rathole.pid".to_string()
}
fn default_watchdog_interval() -> u64 {
    10
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            db_path: default_db_path(),
            shell: default_shell(),
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            serial: default_serial(),
            modem_path: default_modem_path(),
            default_context_path: default_context_path(),
        }
    }
}

impl Default for UsbConfig {
    fn default() -> Self {
        Self {
            mode_cfg: default_usb_mode_cfg(),
            mode_tmp_cfg: default_usb_mode_tmp_cfg(),
            gadget_root: default_usb_gadget_root(),
            udc_class_dir: default_udc_class_dir(),
            interface_ip: default_usb_interface_ip(),
        }
    }
}

impl Default for RatholeConfig {
    fn default() -> Self {
        Self {
            bin_path: default_rathole_bin(),
            config_path: default_rathole_config(),
            log_path: default_rathole_log(),
            pid_path: default_rathole_pid(),
        }
    }
}

impl Default for BearerConfig {
    fn default() -> Self {
        Self {
            watchdog_interval_secs: default_watchdog_interval(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise looks
    /// for `mifictl.toml` in the current directory, falling back to compiled
    /// defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config: Config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("mifictl.toml").exists() {
            let content =
                std::fs::read_to_string("mifictl.toml").expect("Failed to read mifictl.toml");
            toml::from_str(&content).expect("Failed to parse mifictl.toml")
        } else {
            Config::default()
        };

        // Env var overrides
        if let Ok(listen) = std::env::var("MIFICTL_LISTEN") {
            config.server.listen = listen;
        }
        if let Ok(db) = std::env::var("MIFICTL_DB_PATH") {
            config.server.db_path = db;
        }

        config
    }
}
