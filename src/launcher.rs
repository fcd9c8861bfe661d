//! VM boot sequence.
//!
//! [`prepare`] checks the host, discovers media and builds the hypervisor
//! command without starting anything. [`start`] hands the result to the
//! [`Supervisor`]. Every fatal condition in `prepare` is detected before a
//! process is spawned.

use crate::config::{Config, DisplayMode, NetworkMode};
use crate::console;
use crate::error::{Error, Result};
use crate::host;
use crate::media::{self, FirmwarePair, MediaSet, VarsOrigin};
use crate::qemu::{self, NoteLevel, QemuCommand};
use crate::supervisor::{ChildRole, ChildSpec, Readiness, Supervisor};
use crate::usb::{CameraProbe, LsusbProbe};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;

/// Everything needed to start the VM.
#[derive(Debug, Clone)]
pub struct Plan {
    /// Effective configuration after fallbacks (e.g. NAT when the bridge is missing).
    pub config: Config,
    /// Discovered boot media.
    pub media: MediaSet,
    /// Firmware drives, when the firmware code image exists.
    pub firmware: Option<FirmwarePair>,
    /// Hypervisor invocation.
    pub command: QemuCommand,
    /// Display proxy executable, in remote display mode.
    pub proxy_program: Option<PathBuf>,
}

impl Plan {
    /// Spec for the hypervisor child.
    pub fn hypervisor_spec(&self) -> ChildSpec {
        let launch = &self.config.launch;
        let readiness = match self.config.vm.display {
            DisplayMode::Remote => {
                Readiness::listening(loopback(launch.vnc_port()), launch.hypervisor_grace())
            }
            DisplayMode::Local => Readiness::grace(launch.hypervisor_grace()),
        };

        ChildSpec::new(
            ChildRole::Hypervisor,
            self.command.program.clone(),
            self.command.args.clone(),
        )
        .readiness(readiness)
    }

    /// Spec for the display proxy child, in remote display mode.
    ///
    /// The proxy serves the noVNC client from the web directory and forwards
    /// websocket connections to QEMU's VNC port. It refuses to start if the
    /// web directory is missing.
    pub fn proxy_spec(&self) -> Option<ChildSpec> {
        let program = self.proxy_program.clone()?;
        let launch = &self.config.launch;
        let web_dir = &self.config.paths.web_dir;

        let args = vec![
            format!("--web={}", web_dir.display()),
            launch.web_port.to_string(),
            format!("localhost:{}", launch.vnc_port()),
        ];

        Some(
            ChildSpec::new(ChildRole::DisplayProxy, program, args)
                .readiness(Readiness::listening(
                    loopback(launch.web_port),
                    launch.proxy_grace(),
                ))
                .requires(web_dir.clone()),
        )
    }
}

fn loopback(port: u16) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, port))
}

/// Check the host and build the launch plan, probing for a camera with the
/// configured USB lister.
pub fn prepare(config: Config) -> Result<Plan> {
    let lister = host::find_program(&config.launch.usb_lister)
        .unwrap_or_else(|| PathBuf::from(&config.launch.usb_lister));
    prepare_with_probe(config, &LsusbProbe::new(lister))
}

/// Check the host and build the launch plan.
pub fn prepare_with_probe(mut config: Config, probe: &dyn CameraProbe) -> Result<Plan> {
    config.validate()?;

    print_header();
    console::info("Initializing Cold VM...");

    console::detail("Creating required directories...");
    match media::ensure_layout(&config.paths) {
        Ok(()) => console::success("Directory structure created!"),
        Err(e) => console::error(format!("Failed to create directories: {}", e)),
    }

    console::detail("Checking system requirements...");

    let hypervisor = require_tool("QEMU", &config.launch.hypervisor)?;

    let firmware_present = config.paths.firmware_code.exists();
    if firmware_present {
        console::success("OVMF Firmware found!");
    } else {
        console::warning(format!(
            "OVMF Firmware not found at: {} (booting without UEFI)",
            config.paths.firmware_code.display()
        ));
    }

    let proxy_program = match config.vm.display {
        DisplayMode::Remote => {
            let program = require_tool("Websockify", &config.launch.display_proxy)?;
            if config.paths.web_dir.exists() {
                console::success("noVNC found!");
            } else {
                console::warning(format!(
                    "noVNC not found at: {}",
                    config.paths.web_dir.display()
                ));
            }
            Some(program)
        }
        DisplayMode::Local => None,
    };

    if config.vm.network == NetworkMode::Bridged {
        if host::interface_exists(&config.vm.bridge) {
            console::success(format!(
                "Bridge interface '{}' is available!",
                config.vm.bridge
            ));
        } else {
            console::warning(format!("Bridge interface '{}' not found!", config.vm.bridge));
            console::warning("Falling back to user networking (NAT)");
            config.vm.network = NetworkMode::Nat;
        }
    }

    let media = discover_media(&config)?;

    let firmware = if firmware_present {
        prepare_firmware(&config)
    } else {
        None
    };

    console::blank();
    print_configuration(&config, firmware.is_some());

    if let Some(mode) = media.boot_mode() {
        console::info(format!("Boot Mode: {}", mode));
    }
    console::blank();

    let mut command = qemu::build(&config, &media, firmware.as_ref(), probe);
    command.program = hypervisor;

    for note in &command.notes {
        match note.level {
            NoteLevel::Success => console::success(&note.message),
            NoteLevel::Info => console::info(&note.message),
            NoteLevel::Detail => console::detail(&note.message),
            NoteLevel::Item => console::item(&note.message),
            NoteLevel::Warning => console::warning(&note.message),
        }
    }
    tracing::debug!(command = %command, "hypervisor command");

    Ok(Plan {
        config,
        media,
        firmware,
        command,
        proxy_program,
    })
}

fn require_tool(name: &str, program: &str) -> Result<PathBuf> {
    match host::find_program(program) {
        Some(path) => {
            console::success(format!("{} is available!", name));
            Ok(path)
        }
        None => Err(Error::tool_missing(name, program)),
    }
}

fn discover_media(config: &Config) -> Result<MediaSet> {
    let paths = &config.paths;

    console::detail("Scanning for disk images and ISO files...");
    let mut media = MediaSet::scan(paths)?;

    if media.disks.is_empty() {
        console::warning("No disk images found!");
        console::info(format!(
            "Creating default {}GB disk image...",
            config.launch.default_disk_gb
        ));

        let tool = host::find_program(&config.launch.disk_tool);
        if tool.is_none() {
            console::warning(format!(
                "{} not found, creating a sparse raw disk instead",
                config.launch.disk_tool
            ));
        }

        match media::ensure_default_disk(&paths.disk_dir, config.launch.default_disk_gb, tool.as_deref()) {
            Ok(Some(path)) => console::success(format!(
                "Default disk created: {}",
                path.display()
            )),
            Ok(None) => {}
            Err(e) => console::error(format!("Failed to create default disk: {}", e)),
        }

        media.disks = media::scan_disks(&paths.disk_dir)?;
    }

    if media.is_empty() {
        return Err(Error::NoBootableMedia {
            disk_dir: paths.disk_dir.display().to_string(),
            rom_dir: paths.rom_dir.display().to_string(),
        });
    }

    Ok(media)
}

fn prepare_firmware(config: &Config) -> Option<FirmwarePair> {
    let paths = &config.paths;

    match media::ensure_firmware_vars(&paths.firmware_vars, &paths.vars_templates) {
        Ok(VarsOrigin::Existing) => {}
        Ok(VarsOrigin::Copied(source)) => console::success(format!(
            "OVMF VARS file created from {}",
            source.display()
        )),
        Ok(VarsOrigin::Synthesized) => console::warning(
            "Created empty OVMF VARS file; UEFI settings may not persist",
        ),
        Err(e) => {
            console::warning(format!(
                "Could not create OVMF VARS file ({}); booting without UEFI",
                e
            ));
            return None;
        }
    }

    Some(FirmwarePair {
        code: paths.firmware_code.clone(),
        vars: paths.firmware_vars.clone(),
    })
}

fn print_header() {
    console::blank();
    console::banner(&["COLD VM MANAGER", "Virtual Machine Launcher"]);
    console::blank();
}

fn print_configuration(config: &Config, uefi: bool) {
    let vm = &config.vm;
    console::info("System Configuration:");
    console::item(format!("CPU: {} ({} cores)", vm.cpu_model, vm.cpus));
    console::item(format!("RAM: {} GB", vm.ram_gb));
    console::item("VirtIO: Enabled");
    console::item(format!(
        "OVMF/UEFI: {}",
        if uefi { "Enabled" } else { "Disabled" }
    ));
    console::item(format!("Display: {}", vm.display));
    console::item(format!("Network: {}", vm.network));
    console::blank();
}

/// Start the children described by `plan`.
///
/// On success the supervisor is `Active`. On failure it has already torn
/// down anything that started.
pub fn start(plan: &Plan, supervisor: &Supervisor) -> Result<()> {
    console::info("Starting virtual machine...");
    console::blank();

    supervisor.launch(plan.hypervisor_spec(), plan.proxy_spec())?;

    console::success("QEMU started successfully!");
    match plan.config.vm.display {
        DisplayMode::Remote => {
            console::success("Websockify started successfully!");
            console::blank();
            let url = plan.config.launch.browser_url();
            let line = format!("🌐 {}", url);
            console::banner(&["VM is ready! Access via web browser:", "", line.as_str()]);
        }
        DisplayMode::Local => console::success("VM started in local display mode!"),
    }

    console::blank();
    console::info("Press Ctrl+C to shutdown the VM");
    console::blank();
    Ok(())
}
