//! Termination signal routing.
//!
//! SIGINT, SIGTERM and SIGHUP are delivered to a dedicated thread by
//! `ctrlc`; the handler runs the supervisor's teardown there and then exits
//! the process. The supervisor is passed in explicitly, so there is no
//! global state, and its own atomic guard keeps repeated signals from
//! re-entering teardown.

use crate::console;
use crate::error::{Error, Result};
use crate::supervisor::{ShutdownOutcome, Supervisor};
use std::sync::Arc;

/// Route termination signals to `supervisor`.
///
/// Install this before launching children so a signal that arrives
/// mid-launch still tears down whatever has started. Can only be called
/// once per process.
pub fn install(supervisor: Arc<Supervisor>) -> Result<()> {
    install_with(supervisor, |code| std::process::exit(code))
}

/// Like [`install`], with a custom exit action.
pub fn install_with<F>(supervisor: Arc<Supervisor>, exit: F) -> Result<()>
where
    F: Fn(i32) + Send + 'static,
{
    ctrlc::set_handler(move || {
        let code = handle_signal(&supervisor);
        exit(code);
    })
    .map_err(|e| Error::SignalHandler(e.to_string()))
}

/// Tear down through the supervisor and return the process exit code.
pub fn handle_signal(supervisor: &Supervisor) -> i32 {
    console::blank();
    console::info("Shutting down Cold VM...");
    match supervisor.shutdown() {
        ShutdownOutcome::Completed => {
            tracing::info!("termination signal handled");
        }
        ShutdownOutcome::AlreadyShuttingDown => {
            tracing::debug!("teardown was already in progress");
        }
    }

    let code = supervisor.exit_code();
    if code == 0 {
        console::success("Cold VM shutdown complete!");
    }
    code
}
