//! Error types for coldvm.

use crate::supervisor::ChildRole;

/// Result type alias using coldvm's [`enum@Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while preparing or running a VM.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A required external program is not installed.
    #[error("{name} is required but was not found ({program})")]
    ToolMissing {
        /// Human-readable tool name (e.g. "QEMU").
        name: String,
        /// Program that was searched for on PATH.
        program: String,
    },

    /// Neither a disk image nor an ISO is available to boot from.
    #[error("no bootable media available (add disk images to {disk_dir} or ISOs to {rom_dir})")]
    NoBootableMedia {
        /// Directory scanned for disk images.
        disk_dir: String,
        /// Directory scanned for ISO images.
        rom_dir: String,
    },

    /// A child process could not be started.
    #[error("failed to start {role}: {reason}")]
    Spawn {
        /// Which child failed.
        role: ChildRole,
        /// Underlying reason.
        reason: String,
    },

    /// A child process exited before it became ready.
    #[error("{role} exited during startup with status {code}")]
    ChildExited {
        /// Which child exited.
        role: ChildRole,
        /// Exit code (128 + signal for signal deaths).
        code: i32,
    },

    /// Launch was interrupted by a shutdown request.
    #[error("launch interrupted by shutdown request")]
    Interrupted,

    /// Operation not valid in the current supervisor state.
    #[error("invalid state: expected {expected}, got {actual}")]
    InvalidState {
        /// Expected state.
        expected: String,
        /// Actual state.
        actual: String,
    },

    /// Invalid configuration value.
    #[error("configuration error: {0}")]
    Config(String),

    /// Configuration file could not be read or parsed.
    #[error("failed to load config: {0}")]
    ConfigLoad(String),

    /// Disk or firmware file operation failed.
    #[error("storage error during {operation}: {reason}")]
    Storage {
        /// What was being attempted.
        operation: String,
        /// Underlying reason.
        reason: String,
    },

    /// The termination signal handler could not be installed.
    #[error("failed to install signal handler: {0}")]
    SignalHandler(String),

    /// USB device probing failed.
    #[error("device probe failed: {0}")]
    Probe(String),

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a storage error.
    pub fn storage(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Storage {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a spawn error for the given child role.
    pub fn spawn(role: ChildRole, reason: impl Into<String>) -> Self {
        Self::Spawn {
            role,
            reason: reason.into(),
        }
    }

    /// Create a missing-tool error.
    pub fn tool_missing(name: impl Into<String>, program: impl Into<String>) -> Self {
        Self::ToolMissing {
            name: name.into(),
            program: program.into(),
        }
    }

    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}
