//! USB gadget mode switching (CDC-NCM / CDC-ECM / RNDIS).
//!
//! Two files drive the boot-time choice: the persistent `mode.cfg` and the
//! transient `mode_tmp.cfg`, with the transient one winning at read time.
//! The hot switch recomposes the gadget through configfs in a fixed order —
//! the UDC name is captured *before* detach because the class directory
//! reads empty while the controller is down.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{info, warn};

use crate::config::UsbConfig;
use crate::shell;

const SHELL_TIMEOUT_MS: u64 = 10_000;

/// IPA protocol tag sysfs node.
const PAMU3_PROTOCOL_PATH: &str = "/sys/devices/platform/soc/soc:ipa/2b300000.pamu3/protocol";
/// Downlink batch size node.
const PAMU3_DL_PKTS_PATH: &str = "/sys/devices/platform/soc/soc:ipa/2b300000.pamu3/max_dl_pkts";
/// functionfs endpoint that materialises once the debug bridge reopens.
const FFS_EP0_PATH: &str = "/dev/usb-ffs/adb/ep0";
/// Modem log transport selector.
const LOG_TRANSPORT_PATH: &str = "/sys/module/slog_bridge/parameters/log_transport";

const GADGET_DEV_MAC: &str = "cc:e8:ac:c0:00:00";
const GADGET_HOST_MAC: &str = "cc:e8:ac:c0:00:01";

/// USB mode errors.
#[derive(Debug, thiserror::Error)]
pub enum UsbError {
    #[error("invalid mode: {0}")]
    InvalidMode(i64),

    #[error("I/O error: {0}")]
    Io(String),
}

/// Gadget network class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbMode {
    Ncm = 1,
    Ecm = 2,
    Rndis = 3,
}

impl UsbMode {
    pub fn from_value(value: i64) -> Option<Self> {
        match value {
            1 => Some(Self::Ncm),
            2 => Some(Self::Ecm),
            3 => Some(Self::Rndis),
            _ => None,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "cdc_ncm" => Some(Self::Ncm),
            "cdc_ecm" => Some(Self::Ecm),
            "rndis" => Some(Self::Rndis),
            _ => None,
        }
    }

    pub fn value(self) -> i64 {
        self as i64
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Ncm => "cdc_ncm",
            Self::Ecm => "cdc_ecm",
            Self::Rndis => "rndis",
        }
    }

    fn profile(self) -> &'static UsbProfile {
        match self {
            Self::Ncm => &NCM_PROFILE,
            Self::Ecm => &ECM_PROFILE,
            Self::Rndis => &RNDIS_PROFILE,
        }
    }
}

/// Per-mode gadget composition values.
struct UsbProfile {
    vid: &'static str,
    pid: &'static str,
    configuration: &'static str,
    /// IPA protocol tag; ECM leaves it untouched.
    ipa_protocol: Option<&'static str>,
    /// Primary network function directory.
    function: &'static str,
    bcd_device: &'static str,
}

static NCM_PROFILE: UsbProfile = UsbProfile {
    vid: "0x1782",
    pid: "0x4040",
    configuration: "ncm",
    ipa_protocol: Some("NCM"),
    function: "ncm.gs0",
    bcd_device: "0x0404",
};

static ECM_PROFILE: UsbProfile = UsbProfile {
    vid: "0x1782",
    pid: "0x4039",
    configuration: "ecm",
    ipa_protocol: None,
    function: "ecm.gs0",
    bcd_device: "0x0404",
};

static RNDIS_PROFILE: UsbProfile = UsbProfile {
    vid: "0x1782",
    pid: "0x4038",
    configuration: "rndis",
    ipa_protocol: Some("RNDIS"),
    function: "rndis.gs4",
    bcd_device: "0x0404",
};

/// CDC function directories removed during teardown.
const CDC_FUNCTION_DIRS: [&str; 10] = [
    "ncm.gs0", "ncm.gs1", "ncm.gs2", "ncm.gs3", "ecm.gs0", "ecm.gs1", "ecm.gs2", "ecm.gs3",
    "rndis.gs4", "mbim.gs0",
];

/// Serial / auxiliary function directories (re)created for every mode.
const AUX_FUNCTION_DIRS: [&str; 10] = [
    "vser.gs0", "ffs.adb", "gser.gs0", "gser.gs1", "gser.gs2", "gser.gs3", "gser.gs4", "gser.gs5",
    "gser.gs6", "gser.gs7",
];

/// Link slot → function assignment. f1 is the active network function; the
/// rest carry AT, diagnostics, IQ logging and the debug bridge.
const LINK_ASSIGNMENT: [(&str, &str); 8] = [
    ("f2", "gser.gs2"),
    ("f3", "gser.gs0"),
    ("f4", "vser.gs0"),
    ("f5", "gser.gs3"),
    ("f6", "ffs.adb"),
    ("f7", "gser.gs4"),
    ("f8", "gser.gs5"),
    ("f9", "gser.gs6"),
];

/// USB mode component.
pub struct UsbModeManager {
    paths: UsbConfig,
    shell: String,
}

impl UsbModeManager {
    pub fn new(paths: UsbConfig, shell: String) -> Self {
        Self { paths, shell }
    }

    // ── Mode files ───────────────────────────────────────────────────

    /// Effective mode: transient file wins, then persistent, then hardware
    /// readback, then RNDIS.
    pub fn current_mode(&self) -> UsbMode {
        read_mode_file(&self.paths.mode_tmp_cfg)
            .or_else(|| read_mode_file(&self.paths.mode_cfg))
            .or_else(|| self.hardware_mode())
            .unwrap_or(UsbMode::Rndis)
    }

    /// Whether the transient file is currently overriding.
    pub fn is_temporary(&self) -> bool {
        Path::new(&self.paths.mode_tmp_cfg).exists()
    }

    /// Persist the mode choice. Permanent writes the main file and clears
    /// the transient override; transient only writes the override.
    pub fn set_mode(&self, mode: UsbMode, permanent: bool) -> Result<(), UsbError> {
        if permanent {
            write_mode_file(&self.paths.mode_cfg, mode)?;
            std::fs::remove_file(&self.paths.mode_tmp_cfg).ok();
            info!(mode = mode.name(), "USB mode set (permanent)");
        } else {
            write_mode_file(&self.paths.mode_tmp_cfg, mode)?;
            info!(mode = mode.name(), "USB mode set (temporary)");
        }
        Ok(())
    }

    /// Decide the live mode from the gadget's VID/PID pair.
    pub fn hardware_mode(&self) -> Option<UsbMode> {
        let vid = read_sysfs(&self.gadget_path("idVendor"))?;
        let pid = read_sysfs(&self.gadget_path("idProduct"))?;
        if vid != "0x1782" {
            return None;
        }
        match pid.as_str() {
            "0x4040" => Some(UsbMode::Ncm),
            "0x4039" => Some(UsbMode::Ecm),
            "0x4038" => Some(UsbMode::Rndis),
            _ => None,
        }
    }

    // ── Hot switch ───────────────────────────────────────────────────

    /// Recompose the gadget for `mode` without a reboot. Step order is
    /// firmware contract; re-ordering breaks enumeration on the host side.
    pub async fn switch_advanced(&self, mode: UsbMode) -> Result<(), UsbError> {
        let profile = mode.profile();
        // Captured before detach; the class dir is empty while detached.
        let udc_name = self.udc_name();

        info!(mode = mode.name(), "USB hot switch starting");

        // 1. Stop the device-side debug bridge.
        self.run_shell("killall adbd 2>/dev/null").await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        // 2. Detach the UDC.
        write_sysfs(&self.gadget_path("UDC"), "none");
        tokio::time::sleep(Duration::from_millis(100)).await;

        // 3. Remove all function links, then the CDC function dirs.
        self.remove_function_links();
        self.remove_cdc_functions();

        // 4. IPA protocol tag and downlink batch.
        if let Some(protocol) = profile.ipa_protocol {
            if Path::new(PAMU3_PROTOCOL_PATH).exists() {
                write_sysfs(Path::new(PAMU3_PROTOCOL_PATH), protocol);
            }
        }
        write_sysfs(Path::new(PAMU3_DL_PKTS_PATH), "7");

        // 5. Identity descriptors.
        write_sysfs(&self.gadget_path("idVendor"), profile.vid);
        write_sysfs(&self.gadget_path("idProduct"), profile.pid);
        write_sysfs(&self.gadget_path("bcdDevice"), profile.bcd_device);
        write_sysfs(&self.gadget_path("bDeviceClass"), "0");

        // 6. Configuration descriptor.
        write_sysfs(
            &self.config_path("strings/0x409/configuration"),
            profile.configuration,
        );
        write_sysfs(&self.config_path("MaxPower"), "500");
        write_sysfs(&self.config_path("bmAttributes"), "0xc0");

        // 7. Primary function dir plus the serial/aux set.
        self.create_function_dir(profile.function)?;
        for dir in AUX_FUNCTION_DIRS {
            self.create_function_dir(dir).ok();
        }

        // 8. MAC addresses on the network function.
        let dev_addr = self.function_path(profile.function).join("dev_addr");
        if dev_addr.exists() {
            write_sysfs(&dev_addr, GADGET_DEV_MAC);
        }
        let host_addr = self.function_path(profile.function).join("host_addr");
        if host_addr.exists() {
            write_sysfs(&host_addr, GADGET_HOST_MAC);
        }

        // 9. Link slots f1..f9.
        self.create_function_link(profile.function, "f1")?;
        for (link, function) in LINK_ASSIGNMENT {
            self.create_function_link(function, link).ok();
        }

        // 10. Restart the debug bridge.
        self.run_shell("/usr/bin/adbd-init &").await;
        tokio::time::sleep(Duration::from_millis(500)).await;

        // 11. Wait for functionfs to come back (up to 5 s).
        self.wait_for_functionfs().await;

        // 12. Route modem logs over the new composition.
        write_sysfs(Path::new(LOG_TRANSPORT_PATH), "1");

        // 13. Reattach the UDC under its captured name.
        write_sysfs(&self.gadget_path("UDC"), &udc_name);

        // 14. Give the host a second to enumerate.
        tokio::time::sleep(Duration::from_secs(1)).await;

        // 15. Bring up the network side.
        self.configure_network().await;

        info!(mode = mode.name(), "USB hot switch complete");
        Ok(())
    }

    /// First entry of the UDC class directory, with the vendor default as
    /// fallback.
    fn udc_name(&self) -> String {
        if let Ok(entries) = std::fs::read_dir(&self.paths.udc_class_dir) {
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().to_string();
                if !name.starts_with('.') {
                    return name;
                }
            }
        }
        "2a000000.dwc3".to_string()
    }

    fn remove_function_links(&self) {
        let config_dir = PathBuf::from(&self.paths.gadget_root).join("configs/b.1");
        let Ok(entries) = std::fs::read_dir(&config_dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path
                .symlink_metadata()
                .map(|m| m.file_type().is_symlink())
                .unwrap_or(false)
            {
                std::fs::remove_file(&path).ok();
            }
        }
    }

    fn remove_cdc_functions(&self) {
        for dir in CDC_FUNCTION_DIRS {
            std::fs::remove_dir(self.function_path(dir)).ok();
        }
    }

    fn create_function_dir(&self, name: &str) -> Result<(), UsbError> {
        let path = self.function_path(name);
        if !path.exists() {
            std::fs::create_dir_all(&path).map_err(|e| UsbError::Io(e.to_string()))?;
        }
        Ok(())
    }

    fn create_function_link(&self, function: &str, link: &str) -> Result<(), UsbError> {
        let target = self.function_path(function);
        let link_path = PathBuf::from(&self.paths.gadget_root)
            .join("configs/b.1")
            .join(link);
        #[cfg(unix)]
        std::os::unix::fs::symlink(&target, &link_path).map_err(|e| UsbError::Io(e.to_string()))?;
        Ok(())
    }

    async fn wait_for_functionfs(&self) {
        for _ in 0..50 {
            if Path::new(FFS_EP0_PATH).exists() {
                // Give the bridge a moment to open ep0.
                tokio::time::sleep(Duration::from_millis(200)).await;
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        warn!("functionfs mount timed out, continuing");
    }

    /// Interface bring-up after reattach: tethering, address/MAC, NAT and
    /// forwarding, hardware acceleration flags, readiness marker.
    async fn configure_network(&self) {
        tokio::time::sleep(Duration::from_millis(500)).await;

        self.run_shell("connmanctl tether gadget off 2>/dev/null").await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        self.run_shell("connmanctl disable gadget 2>/dev/null").await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        self.run_shell("connmanctl enable gadget 2>/dev/null").await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        self.run_shell("connmanctl tether gadget on 2>/dev/null").await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        let ip = &self.paths.interface_ip;
        let mut configured = false;
        'outer: for _ in 0..5 {
            for iface in ["usb0", "rndis0"] {
                if Path::new(&format!("/sys/class/net/{iface}")).exists() {
                    self.run_shell(&format!("ifconfig {iface} {ip} netmask 255.255.255.0"))
                        .await;
                    self.run_shell(&format!("ifconfig {iface} hw ether {GADGET_DEV_MAC}"))
                        .await;
                    self.run_shell(&format!("ip link set dev {iface} up")).await;
                    self.run_shell(
                        "iptables -t nat -A POSTROUTING -o rmnet_data0 -j MASQUERADE 2>/dev/null",
                    )
                    .await;
                    self.run_shell(&format!("iptables -A FORWARD -i {iface} -j ACCEPT 2>/dev/null"))
                        .await;
                    configured = true;
                    break 'outer;
                }
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        if !configured {
            warn!("USB network interface did not appear");
        }

        self.run_shell("ifconfig sipa_usb0 down 2>/dev/null").await;

        // Hardware forwarding acceleration.
        write_sysfs(Path::new("/proc/net/sfp/enable"), "1");
        write_sysfs(Path::new("/proc/net/sfp/tether_scheme"), "1");

        self.run_shell("touch /tmp/sipa_usb0_ok").await;
    }

    fn gadget_path(&self, rel: &str) -> PathBuf {
        PathBuf::from(&self.paths.gadget_root).join(rel)
    }

    fn config_path(&self, rel: &str) -> PathBuf {
        PathBuf::from(&self.paths.gadget_root).join("configs/b.1").join(rel)
    }

    fn function_path(&self, name: &str) -> PathBuf {
        PathBuf::from(&self.paths.gadget_root).join("functions").join(name)
    }

    async fn run_shell(&self, cmd: &str) {
        if let Err(e) = shell::run(&self.shell, cmd, SHELL_TIMEOUT_MS).await {
            warn!(cmd, error = %e, "usb shell step failed");
        }
    }
}

fn read_mode_file(path: &str) -> Option<UsbMode> {
    let content = std::fs::read_to_string(path).ok()?;
    let value: i64 = content.trim().parse().ok()?;
    UsbMode::from_value(value)
}

fn write_mode_file(path: &str, mode: UsbMode) -> Result<(), UsbError> {
    if let Some(parent) = Path::new(path).parent() {
        std::fs::create_dir_all(parent).map_err(|e| UsbError::Io(e.to_string()))?;
    }
    std::fs::write(path, mode.value().to_string()).map_err(|e| UsbError::Io(e.to_string()))
}

fn read_sysfs(path: &Path) -> Option<String> {
    std::fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn write_sysfs(path: &Path, value: &str) {
    if let Err(e) = std::fs::write(path, value) {
        warn!(path = %path.display(), error = %e, "sysfs write failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> UsbModeManager {
        let root = dir.path().to_string_lossy().to_string();
        UsbModeManager::new(
            UsbConfig {
                mode_cfg: format!("{root}/mode.cfg"),
                mode_tmp_cfg: format!("{root}/mode_tmp.cfg"),
                gadget_root: format!("{root}/gadget"),
                udc_class_dir: format!("{root}/udc"),
                interface_ip: "192.168.66.1".to_string(),
            },
            "/bin/sh".to_string(),
        )
    }

    #[test]
    fn mode_value_and_name_mapping() {
        assert_eq!(UsbMode::from_value(1), Some(UsbMode::Ncm));
        assert_eq!(UsbMode::from_value(3), Some(UsbMode::Rndis));
        assert_eq!(UsbMode::from_value(4), None);
        assert_eq!(UsbMode::from_name("cdc_ecm"), Some(UsbMode::Ecm));
        assert_eq!(UsbMode::from_name("ncm"), None);
        assert_eq!(UsbMode::Rndis.name(), "rndis");
        assert_eq!(UsbMode::Ncm.value(), 1);
    }

    #[test]
    fn temporary_file_wins_over_persistent() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);

        mgr.set_mode(UsbMode::Ncm, true).unwrap();
        assert_eq!(mgr.current_mode(), UsbMode::Ncm);
        assert!(!mgr.is_temporary());

        mgr.set_mode(UsbMode::Ecm, false).unwrap();
        assert_eq!(mgr.current_mode(), UsbMode::Ecm);
        assert!(mgr.is_temporary());
    }

    #[test]
    fn permanent_set_clears_temporary_override() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);

        mgr.set_mode(UsbMode::Ecm, false).unwrap();
        assert!(mgr.is_temporary());

        mgr.set_mode(UsbMode::Rndis, true).unwrap();
        assert!(!mgr.is_temporary());
        assert_eq!(mgr.current_mode(), UsbMode::Rndis);
    }

    #[test]
    fn defaults_to_rndis_without_files_or_hardware() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);
        assert_eq!(mgr.current_mode(), UsbMode::Rndis);
    }

    #[test]
    fn hardware_readback_from_descriptor_pair() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);

        let gadget = dir.path().join("gadget");
        std::fs::create_dir_all(&gadget).unwrap();
        std::fs::write(gadget.join("idVendor"), "0x1782\n").unwrap();
        std::fs::write(gadget.join("idProduct"), "0x4039\n").unwrap();
        assert_eq!(mgr.hardware_mode(), Some(UsbMode::Ecm));

        std::fs::write(gadget.join("idProduct"), "0x4040\n").unwrap();
        assert_eq!(mgr.hardware_mode(), Some(UsbMode::Ncm));

        std::fs::write(gadget.join("idVendor"), "0x05c6\n").unwrap();
        assert_eq!(mgr.hardware_mode(), None);

        // With no mode files, readback feeds current_mode().
        std::fs::write(gadget.join("idVendor"), "0x1782\n").unwrap();
        std::fs::write(gadget.join("idProduct"), "0x4038\n").unwrap();
        assert_eq!(mgr.current_mode(), UsbMode::Rndis);
    }

    #[test]
    fn mode_file_garbage_is_ignored() {
        let dir = TempDir::new().unwrap();
        let mgr = manager(&dir);
        std::fs::write(dir.path().join("mode_tmp.cfg"), "banana").unwrap();
        std::fs::write(dir.path().join("mode.cfg"), "2").unwrap();
        assert_eq!(mgr.current_mode(), UsbMode::Ecm);
    }
}
