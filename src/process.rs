//! Child process groups.
//!
//! Every child is started as the leader of its own process group. Signals
//! go to the whole group so helpers a child forks (websockify forks per
//! connection) are not left behind, and a terminal Ctrl-C reaches only the
//! launcher, which then stops the children in order.

use std::ffi::OsStr;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

/// How long to wait for the leader after SIGKILL before blocking on it.
pub const KILL_GRACE: Duration = Duration::from_millis(500);

/// Interval between exit checks while waiting.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Exit code reported when the status of a child cannot be collected.
const UNKNOWN_EXIT: i32 = -1;

/// Exit code of a wait status; signal deaths map to `128 + signal`.
fn exit_code(status: libc::c_int) -> i32 {
    if libc::WIFEXITED(status) {
        libc::WEXITSTATUS(status)
    } else if libc::WIFSIGNALED(status) {
        128 + libc::WTERMSIG(status)
    } else {
        UNKNOWN_EXIT
    }
}

/// Reap `pid`, blocking only when `block` is set.
///
/// `None` means the child is still running.
fn reap(pid: libc::pid_t, block: bool) -> Option<i32> {
    let flags = if block { 0 } else { libc::WNOHANG };
    let mut status: libc::c_int = 0;

    match unsafe { libc::waitpid(pid, &mut status, flags) } {
        0 => None,
        r if r == pid => Some(exit_code(status)),
        // ECHILD: already reaped, or never ours
        _ => Some(UNKNOWN_EXIT),
    }
}

/// Send `signal` to every member of the group `pgid`.
///
/// Signal 0 only checks that some member still exists.
fn signal_group(pgid: libc::pid_t, signal: libc::c_int) -> bool {
    unsafe { libc::kill(-pgid, signal) == 0 }
}

fn reap_within(pid: libc::pid_t, timeout: Duration) -> Option<i32> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(code) = reap(pid, false) {
            return Some(code);
        }
        let now = Instant::now();
        if now >= deadline {
            return None;
        }
        std::thread::sleep(POLL_INTERVAL.min(deadline - now));
    }
}

/// A child process leading its own process group.
///
/// The child is tracked by pid; dropping the handle neither signals nor
/// reaps it.
#[derive(Debug)]
pub struct ProcessGroup {
    leader: libc::pid_t,
    exit: Option<i32>,
}

impl ProcessGroup {
    /// Execute `program` directly (no shell) as a new group leader.
    ///
    /// Stdin is detached so a background child never competes with the
    /// terminal; stdout and stderr are inherited.
    pub fn spawn<I, S>(program: impl AsRef<OsStr>, args: I) -> std::io::Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .process_group(0)
            .spawn()?;

        let leader = libc::pid_t::try_from(child.id())
            .map_err(|_| std::io::Error::other("child pid out of range"))?;

        Ok(Self { leader, exit: None })
    }

    /// Pid of the group leader (also the group id).
    pub fn pid(&self) -> libc::pid_t {
        self.leader
    }

    /// Exit code of the leader, if it has exited. Reaps it when it has.
    pub fn exit_code(&mut self) -> Option<i32> {
        if self.exit.is_none() {
            self.exit = reap(self.leader, false);
        }
        self.exit
    }

    /// Stop the whole group.
    ///
    /// SIGTERM goes to the group, the leader gets `timeout` to exit, then
    /// the group is SIGKILLed. Members that outlive the leader are killed
    /// too. Returns the leader's exit code; calling again after the leader
    /// has been reaped returns the same code.
    pub fn stop(&mut self, timeout: Duration) -> i32 {
        if let Some(code) = self.exit_code() {
            self.kill_stragglers();
            return code;
        }

        let code = if signal_group(self.leader, libc::SIGTERM) {
            reap_within(self.leader, timeout).unwrap_or_else(|| {
                tracing::debug!(pid = self.leader, "SIGTERM timeout, sending SIGKILL");
                signal_group(self.leader, libc::SIGKILL);
                reap_within(self.leader, KILL_GRACE)
                    .unwrap_or_else(|| reap(self.leader, true).unwrap_or(UNKNOWN_EXIT))
            })
        } else {
            // No member left to signal; collect the leader's status
            reap(self.leader, false).unwrap_or(UNKNOWN_EXIT)
        };

        self.exit = Some(code);
        self.kill_stragglers();
        code
    }

    fn kill_stragglers(&self) {
        if signal_group(self.leader, 0) {
            tracing::debug!(pgid = self.leader, "killing leftover process group members");
            signal_group(self.leader, libc::SIGKILL);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> ProcessGroup {
        ProcessGroup::spawn("/bin/sh", ["-c", script]).unwrap()
    }

    fn wait_exit(child: &mut ProcessGroup) -> i32 {
        loop {
            if let Some(code) = child.exit_code() {
                return code;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_exit_code_is_cached() {
        let mut child = sh("exit 3");
        assert_eq!(wait_exit(&mut child), 3);
        // The leader is reaped; later calls return the cached code
        assert_eq!(child.exit_code(), Some(3));
    }

    #[test]
    fn test_exit_code_polls_without_blocking() {
        let mut child = sh("/bin/sleep 30");
        assert_eq!(child.exit_code(), None);
        assert!(signal_group(child.pid(), 0));
        assert_eq!(child.stop(Duration::from_secs(5)), 128 + libc::SIGTERM);
    }

    #[test]
    fn test_spawn_missing_program() {
        assert!(ProcessGroup::spawn("/nonexistent/program", Vec::<String>::new()).is_err());
    }

    #[test]
    fn test_child_leads_own_group() {
        let mut child = sh("/bin/sleep 30");
        let pgid = unsafe { libc::getpgid(child.pid()) };
        assert_eq!(pgid, child.pid());
        assert_ne!(pgid, unsafe { libc::getpgrp() });
        child.stop(Duration::from_secs(5));
    }

    #[test]
    fn test_stop_terminates_group() {
        // The shell forks a grandchild in the same group
        let mut child = sh("/bin/sleep 30 & /bin/sleep 30");
        assert_eq!(child.exit_code(), None);

        assert_eq!(child.stop(Duration::from_secs(5)), 128 + libc::SIGTERM);
        assert_eq!(child.exit_code(), Some(128 + libc::SIGTERM));
    }

    #[test]
    fn test_stop_escalates_to_sigkill() {
        let mut child = sh("trap '' TERM; while :; do /bin/sleep 1; done");
        // Let the shell install its trap
        std::thread::sleep(Duration::from_millis(200));

        assert_eq!(child.stop(Duration::from_millis(300)), 128 + libc::SIGKILL);
    }

    #[test]
    fn test_stop_after_exit_returns_cached_code() {
        let mut child = sh("exit 0");
        wait_exit(&mut child);
        assert_eq!(child.stop(Duration::from_secs(1)), 0);
        assert_eq!(child.stop(Duration::from_secs(1)), 0);
    }
}
