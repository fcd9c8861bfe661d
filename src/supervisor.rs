//! Child process supervisor.
//!
//! The supervisor owns at most two children: the hypervisor and, in remote
//! display mode, the websocket display proxy. It starts them in dependency
//! order and stops them in reverse order.
//!
//! ```text
//! Idle ──launch()──► Launching ──children ready──► Active
//!                        │                           │
//!                   spawn failure               shutdown()
//!                        ▼                           ▼
//!                     Failed ◄──(failure path)── ShuttingDown ──► Terminated
//! ```
//!
//! Per child: `NotStarted → Running → Stopping → Stopped`.
//!
//! # Limitations
//!
//! There is no liveness monitoring once `Active`: a child that dies on its
//! own is not noticed until shutdown, and nothing is ever restarted. The
//! launcher keeps the parent idle until a termination signal arrives.

use crate::console;
use crate::error::{Error, Result};
use crate::process::{ProcessGroup, POLL_INTERVAL};
use parking_lot::{Condvar, Mutex};
use std::net::{SocketAddr, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// How long a child that answered its readiness probe is still watched for
/// an early exit.
const LISTEN_SETTLE: Duration = Duration::from_millis(500);

/// Role of a managed child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChildRole {
    /// The hypervisor running the VM.
    Hypervisor,
    /// The websocket proxy bridging VNC to the browser.
    DisplayProxy,
}

impl std::fmt::Display for ChildRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChildRole::Hypervisor => write!(f, "hypervisor"),
            ChildRole::DisplayProxy => write!(f, "display proxy"),
        }
    }
}

/// Lifecycle state of a managed child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildState {
    /// Not spawned.
    NotStarted,
    /// Spawned and not yet asked to stop.
    Running,
    /// Termination signal sent, waiting for exit.
    Stopping,
    /// Exited and reaped.
    Stopped,
}

/// Lifecycle state of the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// Nothing started yet.
    Idle,
    /// Children are being started.
    Launching,
    /// All children started.
    Active,
    /// Teardown in progress.
    ShuttingDown,
    /// Clean shutdown complete.
    Terminated,
    /// Launch failed; whatever had started has been torn down.
    Failed,
}

impl std::fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SupervisorState::Idle => "idle",
            SupervisorState::Launching => "launching",
            SupervisorState::Active => "active",
            SupervisorState::ShuttingDown => "shutting down",
            SupervisorState::Terminated => "terminated",
            SupervisorState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Result of a [`Supervisor::shutdown`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// This call performed the teardown.
    Completed,
    /// Another call had already started the teardown; this one waited for it.
    AlreadyShuttingDown,
}

/// How long to wait for a child to come up, and how to tell it is up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Readiness {
    /// Maximum wait. Without a probe the full period is waited out.
    pub grace: Duration,
    /// TCP address the child is expected to listen on; a successful connect
    /// ends the wait early.
    pub probe: Option<SocketAddr>,
}

impl Readiness {
    /// Wait `grace` while checking the child has not exited.
    pub fn grace(grace: Duration) -> Self {
        Self { grace, probe: None }
    }

    /// Wait up to `grace` for `addr` to accept connections.
    pub fn listening(addr: SocketAddr, grace: Duration) -> Self {
        Self {
            grace,
            probe: Some(addr),
        }
    }
}

/// Everything needed to start one child.
#[derive(Debug, Clone)]
pub struct ChildSpec {
    /// Role of the child.
    pub role: ChildRole,
    /// Executable.
    pub program: PathBuf,
    /// Arguments, excluding the program.
    pub args: Vec<String>,
    /// Readiness check after spawning.
    pub readiness: Readiness,
    /// Paths that must exist at spawn time.
    pub requires: Vec<PathBuf>,
}

impl ChildSpec {
    /// Create a spec with no readiness wait and no required paths.
    pub fn new(role: ChildRole, program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            role,
            program: program.into(),
            args,
            readiness: Readiness::grace(Duration::ZERO),
            requires: Vec::new(),
        }
    }

    /// Set the readiness check.
    pub fn readiness(mut self, readiness: Readiness) -> Self {
        self.readiness = readiness;
        self
    }

    /// Require `path` to exist when the child is started.
    pub fn requires(mut self, path: impl Into<PathBuf>) -> Self {
        self.requires.push(path.into());
        self
    }

    fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.to_string_lossy().into_owned())
            .chain(self.args.iter().cloned())
            .collect()
    }
}

/// A child tracked by the supervisor.
#[derive(Debug)]
struct ManagedChild {
    role: ChildRole,
    command: Vec<String>,
    process: Option<ProcessGroup>,
    state: ChildState,
    transitions: Vec<ChildState>,
}

impl ManagedChild {
    fn running(role: ChildRole, command: Vec<String>, process: ProcessGroup) -> Self {
        Self {
            role,
            command,
            process: Some(process),
            state: ChildState::Running,
            transitions: vec![ChildState::NotStarted, ChildState::Running],
        }
    }

    fn set_state(&mut self, state: ChildState) {
        self.state = state;
        self.transitions.push(state);
    }

    /// Signal the child's group and wait for it to exit.
    ///
    /// A child that is not `Running` is left alone.
    fn stop(&mut self, timeout: Duration) {
        if self.state != ChildState::Running {
            return;
        }

        self.set_state(ChildState::Stopping);
        let code = match self.process.as_mut() {
            Some(process) => {
                tracing::debug!(role = %self.role, pid = process.pid(), "stopping child");
                Some(process.stop(timeout))
            }
            None => None,
        };
        self.process = None;
        self.set_state(ChildState::Stopped);

        tracing::info!(
            role = %self.role,
            command = %self.command.join(" "),
            exit_code = ?code,
            "child stopped"
        );
        console::success(format!("{} stopped", capitalize(&self.role.to_string())));
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Owns the hypervisor and display proxy processes.
///
/// Share it as `Arc<Supervisor>` between the launching thread and the
/// signal handler. Teardown is guarded by an atomic flag so it runs exactly
/// once no matter how many signals arrive.
#[derive(Debug)]
pub struct Supervisor {
    children: Mutex<Vec<ManagedChild>>,
    state: Mutex<SupervisorState>,
    shutting_down: AtomicBool,
    failed: AtomicBool,
    teardown_done: Mutex<bool>,
    teardown_cv: Condvar,
    stop_order: Mutex<Vec<ChildRole>>,
    stop_timeout: Duration,
}

impl Supervisor {
    /// Create an idle supervisor.
    ///
    /// `stop_timeout` is how long each child gets to exit after SIGTERM
    /// before it is killed.
    pub fn new(stop_timeout: Duration) -> Self {
        Self {
            children: Mutex::new(Vec::new()),
            state: Mutex::new(SupervisorState::Idle),
            shutting_down: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            teardown_done: Mutex::new(false),
            teardown_cv: Condvar::new(),
            stop_order: Mutex::new(Vec::new()),
            stop_timeout,
        }
    }

    /// Current supervisor state.
    pub fn state(&self) -> SupervisorState {
        *self.state.lock()
    }

    /// Current state of the child with `role`.
    pub fn child_state(&self, role: ChildRole) -> ChildState {
        self.children
            .lock()
            .iter()
            .find(|c| c.role == role)
            .map(|c| c.state)
            .unwrap_or(ChildState::NotStarted)
    }

    /// Every state the child with `role` has been in, oldest first.
    ///
    /// Empty if the child was never started.
    pub fn child_transitions(&self, role: ChildRole) -> Vec<ChildState> {
        self.children
            .lock()
            .iter()
            .find(|c| c.role == role)
            .map(|c| c.transitions.clone())
            .unwrap_or_default()
    }

    /// PID of the child with `role`, while it is tracked as running.
    pub fn child_pid(&self, role: ChildRole) -> Option<libc::pid_t> {
        self.children
            .lock()
            .iter()
            .find(|c| c.role == role)
            .and_then(|c| c.process.as_ref())
            .map(|p| p.pid())
    }

    /// Roles of the children stopped by the teardown, in stop order.
    pub fn stop_order(&self) -> Vec<ChildRole> {
        self.stop_order.lock().clone()
    }

    /// Process exit status matching the final state.
    pub fn exit_code(&self) -> i32 {
        match self.state() {
            SupervisorState::Terminated => 0,
            _ => 1,
        }
    }

    /// Start the hypervisor and, if given, the display proxy.
    ///
    /// Each child is spawned and then waited on per its [`Readiness`]. If
    /// the proxy cannot be started, the hypervisor is torn down before the
    /// error is returned and the supervisor ends in `Failed`. A shutdown
    /// requested while launching stops whatever already started and makes
    /// this return [`Error::Interrupted`].
    pub fn launch(&self, hypervisor: ChildSpec, proxy: Option<ChildSpec>) -> Result<()> {
        self.transition(SupervisorState::Idle, SupervisorState::Launching)?;

        let mut specs = vec![hypervisor];
        specs.extend(proxy);

        for spec in specs {
            if let Err(e) = self.start_child(&spec) {
                if !matches!(e, Error::Interrupted) {
                    self.fail();
                }
                return Err(e);
            }
        }

        // A concurrent shutdown may have moved us on already.
        if self
            .transition(SupervisorState::Launching, SupervisorState::Active)
            .is_err()
        {
            return Err(Error::Interrupted);
        }

        tracing::info!("supervisor active");
        Ok(())
    }

    /// Stop all children, last started first.
    ///
    /// The first call performs the teardown. Calls made while a teardown is
    /// running (a second Ctrl-C, a signal during a failed launch) do not
    /// signal anything; they wait for the teardown to finish.
    pub fn shutdown(&self) -> ShutdownOutcome {
        if self
            .shutting_down
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("shutdown already in progress");
            let mut done = self.teardown_done.lock();
            while !*done {
                self.teardown_cv.wait(&mut done);
            }
            return ShutdownOutcome::AlreadyShuttingDown;
        }

        self.teardown();
        ShutdownOutcome::Completed
    }

    fn fail(&self) {
        self.failed.store(true, Ordering::SeqCst);
        self.shutdown();
    }

    fn teardown(&self) {
        *self.state.lock() = SupervisorState::ShuttingDown;
        tracing::info!("shutting down children");

        {
            let mut children = self.children.lock();
            for child in children.iter_mut().rev() {
                if child.state == ChildState::Running {
                    child.stop(self.stop_timeout);
                    self.stop_order.lock().push(child.role);
                }
            }
        }

        let final_state = if self.failed.load(Ordering::SeqCst) {
            SupervisorState::Failed
        } else {
            SupervisorState::Terminated
        };
        *self.state.lock() = final_state;
        tracing::debug!(state = %final_state, "teardown complete");

        *self.teardown_done.lock() = true;
        self.teardown_cv.notify_all();
    }

    fn transition(&self, from: SupervisorState, to: SupervisorState) -> Result<()> {
        let mut state = self.state.lock();
        if *state != from {
            return Err(Error::InvalidState {
                expected: from.to_string(),
                actual: state.to_string(),
            });
        }
        tracing::debug!(from = %from, to = %to, "supervisor transition");
        *state = to;
        Ok(())
    }

    fn start_child(&self, spec: &ChildSpec) -> Result<()> {
        {
            // Spawn and register under the lock so a concurrent teardown
            // either sees the child or prevents it from starting.
            let mut children = self.children.lock();
            if self.shutting_down.load(Ordering::SeqCst) {
                return Err(Error::Interrupted);
            }

            if let Some(missing) = spec.requires.iter().find(|p| !p.exists()) {
                return Err(Error::spawn(
                    spec.role,
                    format!("required path not found: {}", missing.display()),
                ));
            }

            if let Some(addr) = spec.readiness.probe {
                if TcpStream::connect_timeout(&addr, POLL_INTERVAL).is_ok() {
                    return Err(Error::spawn(
                        spec.role,
                        format!("{} is already in use by another process", addr),
                    ));
                }
            }

            let process = ProcessGroup::spawn(&spec.program, &spec.args)
                .map_err(|e| Error::spawn(spec.role, format!("{}: {}", spec.program.display(), e)))?;

            tracing::info!(role = %spec.role, pid = process.pid(), "child spawned");
            children.push(ManagedChild::running(spec.role, spec.argv(), process));
        }

        self.await_ready(spec.role, &spec.readiness)
    }

    /// Returns the exit code if the child with `role` has exited.
    ///
    /// Fails with `Interrupted` once a shutdown has been requested.
    fn check_exited(&self, role: ChildRole) -> Result<Option<i32>> {
        let mut children = self.children.lock();
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(Error::Interrupted);
        }
        Ok(children
            .iter_mut()
            .find(|c| c.role == role)
            .and_then(|c| c.process.as_mut())
            .and_then(|p| p.exit_code()))
    }

    fn await_ready(&self, role: ChildRole, readiness: &Readiness) -> Result<()> {
        let deadline = Instant::now() + readiness.grace;
        // Set once the probe address answers; the child is then only
        // watched for an early exit until this instant.
        let mut settle_until: Option<Instant> = None;

        loop {
            if let Some(code) = self.check_exited(role)? {
                return Err(Error::ChildExited { role, code });
            }

            let now = Instant::now();
            if let Some(until) = settle_until {
                if now >= until {
                    return Ok(());
                }
                std::thread::sleep(POLL_INTERVAL.min(until - now));
                continue;
            }

            if let Some(addr) = readiness.probe {
                if TcpStream::connect_timeout(&addr, POLL_INTERVAL).is_ok() {
                    tracing::debug!(role = %role, addr = %addr, "child is listening");
                    settle_until = Some(deadline.min(Instant::now() + LISTEN_SETTLE));
                    continue;
                }
            }

            let now = Instant::now();
            if now >= deadline {
                if let Some(addr) = readiness.probe {
                    console::warning(format!(
                        "{} is running but not yet listening on {}",
                        capitalize(&role.to_string()),
                        addr
                    ));
                }
                return Ok(());
            }

            std::thread::sleep(POLL_INTERVAL.min(deadline - now));
        }
    }
}
