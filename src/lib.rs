//! coldvm - QEMU virtual machine launcher.
//!
//! coldvm discovers disk and ISO images, builds a `qemu-system-x86_64`
//! invocation, starts the hypervisor and (in remote display mode) a
//! `websockify` proxy serving the noVNC web client, and tears both down in
//! reverse order when the process receives SIGINT or SIGTERM.
//!
//! # Modules
//!
//! - [`media`]: disk/ISO discovery, default disk and firmware vars creation
//! - [`qemu`]: hypervisor command construction
//! - [`usb`]: best-effort USB camera discovery
//! - [`supervisor`]: child process lifecycle (launch and ordered teardown)
//! - [`signals`]: routes termination signals to the supervisor
//! - [`launcher`]: the boot sequence tying the above together

pub mod config;
pub mod console;
pub mod error;
pub mod host;
pub mod launcher;
pub mod media;
pub mod process;
pub mod qemu;
pub mod signals;
pub mod supervisor;
pub mod usb;

pub use error::{Error, Result};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
