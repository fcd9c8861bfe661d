//! coldvm configuration.
//!
//! Configuration is layered: built-in defaults, then an optional TOML file,
//! then command-line flags (applied by the binary). The resulting [`Config`]
//! is immutable once boot begins.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application name for config file storage.
const APP_NAME: &str = "coldvm";

/// First TCP port of QEMU's VNC displays (display `:0`).
pub const VNC_BASE_PORT: u16 = 5900;

/// Config file looked up in the working directory.
pub const LOCAL_CONFIG_FILE: &str = "coldvm.toml";

/// How the guest display is presented.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DisplayMode {
    /// VNC server inside QEMU, bridged to the browser by the display proxy.
    #[default]
    Remote,
    /// Local GTK window with GL acceleration.
    Local,
}

impl std::fmt::Display for DisplayMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisplayMode::Remote => write!(f, "VNC (Remote)"),
            DisplayMode::Local => write!(f, "GTK (Local)"),
        }
    }
}

/// Guest networking mode.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    /// Attach to a host bridge interface.
    #[default]
    Bridged,
    /// QEMU user-mode networking.
    Nat,
}

impl std::fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetworkMode::Bridged => write!(f, "bridge"),
            NetworkMode::Nat => write!(f, "nat"),
        }
    }
}

/// Virtual machine hardware settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct VmConfig {
    /// Number of virtual CPU cores.
    pub cpus: u32,

    /// Guest memory in GiB.
    pub ram_gb: u32,

    /// QEMU CPU model (`-cpu`).
    pub cpu_model: String,

    /// Display presentation.
    pub display: DisplayMode,

    /// Network mode.
    pub network: NetworkMode,

    /// Host bridge interface used in bridged mode.
    pub bridge: String,

    /// Pass a detected USB camera through to the guest.
    pub camera: bool,

    /// Attach an emulated sound card.
    pub audio: bool,

    /// Capture input on the sound card (duplex instead of output-only).
    pub microphone: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            cpus: 4,
            ram_gb: 4,
            cpu_model: "host".to_string(),
            display: DisplayMode::Remote,
            network: NetworkMode::Bridged,
            bridge: "virbr0".to_string(),
            camera: true,
            audio: true,
            microphone: true,
        }
    }
}

/// Filesystem layout consumed and produced by the launcher.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PathsConfig {
    /// Directory scanned for disk images.
    pub disk_dir: PathBuf,

    /// Directory scanned for ISO images.
    pub rom_dir: PathBuf,

    /// UEFI firmware code image (read-only).
    pub firmware_code: PathBuf,

    /// UEFI variable store (read-write, created if absent).
    pub firmware_vars: PathBuf,

    /// noVNC web client served by the display proxy.
    pub web_dir: PathBuf,

    /// System templates tried, in order, when creating the variable store.
    pub vars_templates: Vec<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            disk_dir: PathBuf::from("./devices/disk"),
            rom_dir: PathBuf::from("./devices/rom"),
            firmware_code: PathBuf::from("./boot/firmware/OVMF_CODE.fd"),
            firmware_vars: PathBuf::from("./boot/firmware/OVMF_VARS.fd"),
            web_dir: PathBuf::from("./libraries/noVNC"),
            vars_templates: vec![
                PathBuf::from("/usr/share/OVMF/OVMF_VARS.fd"),
                PathBuf::from("/usr/share/edk2-ovmf/x64/OVMF_VARS.fd"),
                PathBuf::from("/usr/share/qemu/OVMF_VARS.fd"),
            ],
        }
    }
}

/// External programs and launch timing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LaunchConfig {
    /// Hypervisor executable.
    pub hypervisor: String,

    /// Websocket display proxy executable.
    pub display_proxy: String,

    /// Disk image creation utility.
    pub disk_tool: String,

    /// USB device lister used for camera discovery.
    pub usb_lister: String,

    /// Size of the default disk created when none exists, in GiB.
    pub default_disk_gb: u64,

    /// Port the display proxy listens on.
    pub web_port: u16,

    /// VNC display index (QEMU listens on 5900 + index).
    pub vnc_display: u16,

    /// Maximum time to wait for the hypervisor to come up, in milliseconds.
    pub hypervisor_grace_ms: u64,

    /// Maximum time to wait for the display proxy to come up, in milliseconds.
    pub proxy_grace_ms: u64,

    /// Time allowed for each child to exit after SIGTERM, in seconds.
    pub stop_timeout_secs: u64,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            hypervisor: "qemu-system-x86_64".to_string(),
            display_proxy: "websockify".to_string(),
            disk_tool: "qemu-img".to_string(),
            usb_lister: "lsusb".to_string(),
            default_disk_gb: 30,
            web_port: 8080,
            vnc_display: 1,
            hypervisor_grace_ms: 3000,
            proxy_grace_ms: 2000,
            stop_timeout_secs: 10,
        }
    }
}

impl LaunchConfig {
    /// TCP port QEMU's VNC server listens on.
    ///
    /// Saturates for display indices [`Config::validate`] rejects.
    pub fn vnc_port(&self) -> u16 {
        VNC_BASE_PORT.saturating_add(self.vnc_display)
    }

    /// Hypervisor readiness window.
    pub fn hypervisor_grace(&self) -> Duration {
        Duration::from_millis(self.hypervisor_grace_ms)
    }

    /// Display proxy readiness window.
    pub fn proxy_grace(&self) -> Duration {
        Duration::from_millis(self.proxy_grace_ms)
    }

    /// Per-child graceful stop timeout.
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    /// Browser URL of the noVNC client.
    pub fn browser_url(&self) -> String {
        format!(
            "http://localhost:{}/vnc.html?resize=remote&autoconnect=true",
            self.web_port
        )
    }
}

/// Complete launcher configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// VM hardware settings.
    pub vm: VmConfig,

    /// Filesystem layout.
    pub paths: PathsConfig,

    /// External programs and timing.
    pub launch: LaunchConfig,
}

impl Config {
    /// Load configuration.
    ///
    /// An explicit path must exist. Without one, `./coldvm.toml` and then the
    /// user config file (`<config_dir>/coldvm/config.toml`) are tried; if
    /// neither exists, defaults are returned. The path actually read is
    /// returned alongside the config.
    pub fn load(explicit: Option<&Path>) -> Result<(Self, Option<PathBuf>)> {
        if let Some(path) = explicit {
            return Ok((Self::from_file(path)?, Some(path.to_path_buf())));
        }

        for candidate in Self::search_paths() {
            if candidate.is_file() {
                let config = Self::from_file(&candidate)?;
                return Ok((config, Some(candidate)));
            }
        }

        Ok((Self::default(), None))
    }

    /// Parse a TOML config file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigLoad(format!("{}: {}", path.display(), e)))?;
        toml::from_str(&text).map_err(|e| Error::ConfigLoad(format!("{}: {}", path.display(), e)))
    }

    /// Candidate config files, in lookup order.
    fn search_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from(LOCAL_CONFIG_FILE)];
        if let Some(dir) = dirs::config_dir() {
            paths.push(dir.join(APP_NAME).join("config.toml"));
        }
        paths
    }

    /// Check value constraints.
    pub fn validate(&self) -> Result<()> {
        if self.vm.cpus == 0 {
            return Err(Error::config("cpus must be greater than 0"));
        }
        if self.vm.ram_gb == 0 {
            return Err(Error::config("ram_gb must be greater than 0"));
        }
        if self.vm.cpu_model.trim().is_empty() {
            return Err(Error::config("cpu_model cannot be empty"));
        }
        if self.vm.network == NetworkMode::Bridged && self.vm.bridge.trim().is_empty() {
            return Err(Error::config("bridge interface cannot be empty in bridged mode"));
        }
        for (name, value) in [
            ("hypervisor", &self.launch.hypervisor),
            ("display_proxy", &self.launch.display_proxy),
            ("disk_tool", &self.launch.disk_tool),
            ("usb_lister", &self.launch.usb_lister),
        ] {
            if value.trim().is_empty() {
                return Err(Error::config(format!("{} cannot be empty", name)));
            }
        }
        if VNC_BASE_PORT.checked_add(self.launch.vnc_display).is_none() {
            return Err(Error::config(format!(
                "vnc_display must be at most {}",
                u16::MAX - VNC_BASE_PORT
            )));
        }
        if self.launch.default_disk_gb == 0 {
            return Err(Error::config("default_disk_gb must be greater than 0"));
        }
        Ok(())
    }
}
