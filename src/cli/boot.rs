//! Boot command implementation.

use clap::Args;
use coldvm::config::{Config, DisplayMode, NetworkMode};
use coldvm::error::Error;
use coldvm::launcher;
use coldvm::signals;
use coldvm::supervisor::Supervisor;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Defaults shown at the end of `--help`.
pub const DEFAULTS_HELP: &str = "\
Default configuration:
  - 4 CPU cores (host model), 4 GB RAM
  - VirtIO devices, UEFI when OVMF firmware is present
  - VNC display served to the browser by websockify on port 8080
  - Bridge networking (virbr0), NAT if the bridge is missing
  - Camera, audio & microphone enabled

Defaults can be changed in ./coldvm.toml (or --config) and overridden by the flags above.";

/// Parse a stop timeout (e.g., "10s", "1m"). Only whole seconds, at least
/// one, are accepted.
fn parse_stop_timeout(s: &str) -> Result<Duration, String> {
    let timeout = humantime::parse_duration(s).map_err(|e| e.to_string())?;
    if timeout.is_zero() || timeout.subsec_nanos() != 0 {
        return Err(format!("{} is not a whole number of seconds (minimum 1s)", s));
    }
    Ok(timeout)
}

/// Boot the VM.
#[derive(Args, Debug, Default)]
pub struct BootCmd {
    /// Use local GTK display instead of VNC
    #[arg(long)]
    pub no_vnc: bool,

    /// Use NAT networking instead of bridge
    #[arg(long)]
    pub no_bridge: bool,

    /// Disable camera passthrough
    #[arg(long)]
    pub no_camera: bool,

    /// Disable microphone
    #[arg(long)]
    pub no_mic: bool,

    /// Disable audio entirely
    #[arg(long)]
    pub no_audio: bool,

    /// Number of CPU cores [default: 4]
    #[arg(long, value_name = "N", value_parser = clap::value_parser!(u32).range(1..))]
    pub cpus: Option<u32>,

    /// Memory in GB [default: 4]
    #[arg(long, value_name = "GB", value_parser = clap::value_parser!(u32).range(1..))]
    pub ram: Option<u32>,

    /// QEMU CPU model [default: host]
    #[arg(long, value_name = "MODEL")]
    pub cpu_model: Option<String>,

    /// Bridge interface for bridged networking [default: virbr0]
    #[arg(long, value_name = "IF")]
    pub bridge: Option<String>,

    /// Config file (TOML)
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Time each process gets to exit on shutdown before it is killed (e.g. "10s")
    #[arg(long, value_name = "DURATION", value_parser = parse_stop_timeout)]
    pub stop_timeout: Option<Duration>,

    /// Print the commands that would be run and exit
    #[arg(long)]
    pub dry_run: bool,
}

impl BootCmd {
    /// Apply flag overrides on top of the loaded configuration.
    pub fn apply(&self, config: &mut Config) {
        let vm = &mut config.vm;
        if self.no_vnc {
            vm.display = DisplayMode::Local;
        }
        if self.no_bridge {
            vm.network = NetworkMode::Nat;
        }
        if self.no_camera {
            vm.camera = false;
        }
        if self.no_mic {
            vm.microphone = false;
        }
        if self.no_audio {
            vm.audio = false;
        }
        if let Some(cpus) = self.cpus {
            vm.cpus = cpus;
        }
        if let Some(ram) = self.ram {
            vm.ram_gb = ram;
        }
        if let Some(model) = &self.cpu_model {
            vm.cpu_model = model.clone();
        }
        if let Some(bridge) = &self.bridge {
            vm.bridge = bridge.clone();
        }
        if let Some(timeout) = self.stop_timeout {
            config.launch.stop_timeout_secs = timeout.as_secs();
        }
    }

    /// Execute the boot command.
    ///
    /// Returns only on failure or dry run; once the VM is running the
    /// process stays idle until a termination signal ends it.
    pub fn run(self) -> coldvm::Result<()> {
        let (mut config, source) = Config::load(self.config.as_deref())?;
        if let Some(path) = source {
            tracing::debug!(path = %path.display(), "loaded config file");
        }
        self.apply(&mut config);

        let plan = launcher::prepare(config)?;

        if self.dry_run {
            println!("{}", plan.command);
            if let Some(proxy) = plan.proxy_spec() {
                println!("{} {}", proxy.program.display(), proxy.args.join(" "));
            }
            return Ok(());
        }

        let supervisor = Arc::new(Supervisor::new(plan.config.launch.stop_timeout()));
        signals::install(Arc::clone(&supervisor))?;

        match launcher::start(&plan, &supervisor) {
            Ok(()) => {}
            // The signal handler finishes the teardown and exits.
            Err(Error::Interrupted) => {}
            Err(e) => return Err(e),
        }

        loop {
            std::thread::park();
        }
    }
}
