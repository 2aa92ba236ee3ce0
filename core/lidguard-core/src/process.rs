//! Child process handles, spawning, and stray-process cleanup.
//!
//! Every spawned process is owned by exactly one [`ManagedProcess`] and is
//! reaped before the handle is dropped or replaced. Termination is
//! SIGTERM first, then SIGKILL once the grace period runs out.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};
use sysinfo::{ProcessRefreshKind, System, UpdateKind};
use tracing::{debug, warn};

use crate::error::{GuardError, Result};

const EXIT_POLL_MS: u64 = 20;

/// A program plus its arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new<I, S>(program: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.to_string(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Builds a spec from an argv-style list (`["caffeinate", "-d"]`).
    pub fn from_argv(argv: &[String], label: &'static str) -> Result<Self> {
        let (program, args) = argv.split_first().ok_or(GuardError::EmptyCommand(label))?;
        if program.trim().is_empty() {
            return Err(GuardError::EmptyCommand(label));
        }
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    AlreadyExited,
    Terminated,
    Killed,
    Failed,
}

/// A live (or recently exited) child process.
pub trait ManagedProcess: Send {
    fn pid(&self) -> u32;

    /// Non-blocking exit check. `Some(true)` means a clean exit.
    fn try_exit(&mut self) -> std::io::Result<Option<bool>>;

    /// Graceful terminate, escalating to a kill after `grace`. Always reaps.
    fn terminate(&mut self, grace: Duration) -> StopOutcome;
}

pub trait ProcessSpawner: Send + Sync {
    fn spawn(&self, command: &CommandSpec) -> Result<Box<dyn ManagedProcess>>;
}

/// Spawns real OS processes with all stdio detached.
#[derive(Debug, Clone, Default)]
pub struct SystemSpawner;

impl ProcessSpawner for SystemSpawner {
    fn spawn(&self, command: &CommandSpec) -> Result<Box<dyn ManagedProcess>> {
        let child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| GuardError::Spawn {
                program: command.program.clone(),
                source,
            })?;
        debug!(pid = child.id(), command = %command, "Spawned process");
        Ok(Box::new(ChildProcess {
            child,
            label: command.program.clone(),
            reaped: false,
        }))
    }
}

#[derive(Debug)]
pub struct ChildProcess {
    child: Child,
    label: String,
    reaped: bool,
}

impl ManagedProcess for ChildProcess {
    fn pid(&self) -> u32 {
        self.child.id()
    }

    fn try_exit(&mut self) -> std::io::Result<Option<bool>> {
        let status = self.child.try_wait()?;
        if status.is_some() {
            self.reaped = true;
        }
        Ok(status.map(|status| status.success()))
    }

    fn terminate(&mut self, grace: Duration) -> StopOutcome {
        if self.reaped {
            return StopOutcome::AlreadyExited;
        }
        match self.child.try_wait() {
            Ok(Some(_)) => {
                self.reaped = true;
                return StopOutcome::AlreadyExited;
            }
            Ok(None) => {}
            Err(err) => {
                debug!(error = %err, pid = self.pid(), "try_wait failed before terminate");
            }
        }

        send_sigterm(self.pid());

        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            match self.child.try_wait() {
                Ok(Some(_)) => {
                    self.reaped = true;
                    debug!(pid = self.pid(), process = %self.label, "Process terminated");
                    return StopOutcome::Terminated;
                }
                Ok(None) => thread::sleep(Duration::from_millis(EXIT_POLL_MS)),
                Err(_) => break,
            }
        }

        if let Err(err) = self.child.kill() {
            debug!(error = %err, pid = self.pid(), "Kill failed");
        }
        match self.child.wait() {
            Ok(_) => {
                self.reaped = true;
                warn!(pid = self.pid(), process = %self.label, "Process force killed");
                StopOutcome::Killed
            }
            Err(err) => {
                warn!(error = %err, pid = self.pid(), process = %self.label, "Failed to reap process");
                StopOutcome::Failed
            }
        }
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        if !self.reaped {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

fn send_sigterm(pid: u32) {
    #[cfg(unix)]
    {
        // SAFETY: plain signal delivery to a child we spawned and have not reaped,
        // so the PID cannot have been recycled yet.
        #[allow(unsafe_code)]
        let rc = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
        if rc != 0 {
            debug!(pid, error = %std::io::Error::last_os_error(), "SIGTERM failed");
        }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
    }
}

/// Runs `command` to completion, terminating it if it outlives `timeout`.
/// Returns whether it exited cleanly.
pub fn run_bounded(
    spawner: &dyn ProcessSpawner,
    command: &CommandSpec,
    timeout: Duration,
) -> Result<bool> {
    let mut process = spawner.spawn(command)?;
    Ok(wait_bounded(process.as_mut(), timeout))
}

/// Waits up to `timeout` for `process` to exit; terminates it otherwise.
pub fn wait_bounded(process: &mut dyn ManagedProcess, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        match process.try_exit() {
            Ok(Some(success)) => return success,
            Ok(None) if Instant::now() < deadline => {
                thread::sleep(Duration::from_millis(EXIT_POLL_MS));
            }
            Ok(None) | Err(_) => {
                process.terminate(Duration::from_millis(500));
                return false;
            }
        }
    }
}

/// Result of [`capture_bounded`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Captured {
    Exited { success: bool, stdout: String },
    /// The command outlived its deadline and was terminated.
    TimedOut,
}

/// Runs `command` with stdout captured, terminating it if it outlives
/// `timeout`. Stdout is drained on a helper thread so a chatty child cannot
/// stall on a full pipe.
pub fn capture_bounded(command: &CommandSpec, timeout: Duration) -> Result<Captured> {
    let mut child = Command::new(&command.program)
        .args(&command.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|source| GuardError::Spawn {
            program: command.program.clone(),
            source,
        })?;

    let (tx, rx) = mpsc::channel();
    if let Some(mut stdout) = child.stdout.take() {
        let spawned = thread::Builder::new()
            .name("lidguard-capture".to_string())
            .spawn(move || {
                let mut buffer = Vec::new();
                let _ = stdout.read_to_end(&mut buffer);
                let _ = tx.send(buffer);
            });
        if let Err(err) = spawned {
            warn!(error = %err, "Failed to spawn output reader");
        }
    }

    let mut process = ChildProcess {
        child,
        label: command.program.clone(),
        reaped: false,
    };
    let started = Instant::now();
    let success = loop {
        match process.try_exit() {
            Ok(Some(success)) => break success,
            Ok(None) if started.elapsed() < timeout => {
                thread::sleep(Duration::from_millis(EXIT_POLL_MS));
            }
            Ok(None) | Err(_) => {
                let outcome = process.terminate(Duration::from_millis(500));
                debug!(command = %command, outcome = ?outcome, "Command timed out");
                return Ok(Captured::TimedOut);
            }
        }
    };

    let remaining = timeout
        .saturating_sub(started.elapsed())
        .max(Duration::from_millis(EXIT_POLL_MS));
    match rx.recv_timeout(remaining) {
        Ok(buffer) => Ok(Captured::Exited {
            success,
            stdout: String::from_utf8_lossy(&buffer).into_owned(),
        }),
        Err(_) => Ok(Captured::TimedOut),
    }
}

/// Hands `process` to a detached thread that reaps it within `timeout`.
pub fn reap_in_background(mut process: Box<dyn ManagedProcess>, timeout: Duration) {
    let spawned = thread::Builder::new()
        .name("lidguard-reaper".to_string())
        .spawn(move || {
            wait_bounded(process.as_mut(), timeout);
        });
    if let Err(err) = spawned {
        warn!(error = %err, "Failed to spawn reaper thread");
    }
}

/// Sends SIGTERM to every process named `program` whose command line
/// contains `needle`. Never touches the current process.
///
/// Returns the number of processes signalled.
pub fn sweep_processes(program: &str, needle: &str) -> usize {
    let mut sys = System::new();
    sys.refresh_processes_specifics(ProcessRefreshKind::new().with_cmd(UpdateKind::Always));

    let own_pid = std::process::id();
    let mut signalled = 0;

    for (pid, process) in sys.processes() {
        if pid.as_u32() == own_pid {
            continue;
        }
        let cmd = process.cmd();
        let name_matches = process.name() == program
            || cmd
                .first()
                .map(|arg0| arg0.rsplit('/').next() == Some(program))
                .unwrap_or(false);
        if !name_matches || !cmd.iter().any(|arg| arg.contains(needle)) {
            continue;
        }

        #[cfg(unix)]
        {
            // SAFETY: SIGTERM delivery to a PID from the enumeration above. If it
            // exited in the meantime we get ESRCH, which is fine.
            #[allow(unsafe_code)]
            let rc = unsafe { libc::kill(pid.as_u32() as i32, libc::SIGTERM) };
            if rc == 0 {
                signalled += 1;
            } else {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ESRCH) {
                    debug!(pid = pid.as_u32(), error = %err, "Failed to signal stray process");
                }
            }
        }
    }

    signalled
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("sh", ["-c", script])
    }

    #[test]
    fn from_argv_rejects_empty() {
        assert!(CommandSpec::from_argv(&[], "inhibitor").is_err());
        assert!(CommandSpec::from_argv(&["  ".to_string()], "inhibitor").is_err());
    }

    #[test]
    fn from_argv_splits_program_and_args() {
        let argv = vec!["caffeinate".to_string(), "-d".to_string(), "-i".to_string()];
        let spec = CommandSpec::from_argv(&argv, "inhibitor").expect("spec");
        assert_eq!(spec.program, "caffeinate");
        assert_eq!(spec.args, vec!["-d".to_string(), "-i".to_string()]);
        assert_eq!(spec.to_string(), "caffeinate -d -i");
    }

    #[test]
    fn spawn_missing_program_is_spawn_error() {
        let err = SystemSpawner
            .spawn(&CommandSpec::new("lidguard-definitely-missing", Vec::<String>::new()))
            .err()
            .expect("spawn should fail");
        assert!(matches!(err, GuardError::Spawn { .. }));
    }

    #[test]
    fn run_bounded_reports_exit_status() {
        assert!(run_bounded(&SystemSpawner, &sh("exit 0"), Duration::from_secs(5)).expect("run"));
        assert!(!run_bounded(&SystemSpawner, &sh("exit 3"), Duration::from_secs(5)).expect("run"));
    }

    #[test]
    fn capture_bounded_returns_stdout() {
        let captured =
            capture_bounded(&sh("echo 'state: open'"), Duration::from_secs(5)).expect("run");
        assert_eq!(
            captured,
            Captured::Exited {
                success: true,
                stdout: "state: open\n".to_string(),
            }
        );
    }

    #[test]
    fn capture_bounded_gives_up_on_hung_command() {
        let started = Instant::now();
        let captured =
            capture_bounded(&sh("exec sleep 30"), Duration::from_millis(200)).expect("run");
        assert_eq!(captured, Captured::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn terminate_stops_long_running_child() {
        let mut process = SystemSpawner.spawn(&sh("exec sleep 30")).expect("spawn");
        let outcome = process.terminate(Duration::from_secs(2));
        assert!(matches!(
            outcome,
            StopOutcome::Terminated | StopOutcome::Killed
        ));
        assert_eq!(
            process.terminate(Duration::from_secs(1)),
            StopOutcome::AlreadyExited
        );
    }

    #[test]
    fn terminate_escalates_when_sigterm_is_ignored() {
        let mut process = SystemSpawner
            .spawn(&sh("trap '' TERM; exec sleep 30"))
            .expect("spawn");
        thread::sleep(Duration::from_millis(100));
        let outcome = process.terminate(Duration::from_millis(200));
        assert_eq!(outcome, StopOutcome::Killed);
    }

    #[test]
    fn sweep_without_matches_is_noop() {
        assert_eq!(
            sweep_processes("lidguard-no-such-player", "/nonexistent/sound.aiff"),
            0
        );
    }
}
