//! Keeps the machine awake while armed.
//!
//! At most one inhibitor process is live. Launch failures are logged and
//! reported as `false`; they never block arming.

use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use crate::config::InhibitorConfig;
use crate::flags::lock;
use crate::process::{CommandSpec, ManagedProcess, ProcessSpawner, StopOutcome};

pub struct SleepInhibitor {
    config: InhibitorConfig,
    spawner: Arc<dyn ProcessSpawner>,
    handle: Mutex<Option<Box<dyn ManagedProcess>>>,
}

impl SleepInhibitor {
    pub fn new(config: InhibitorConfig, spawner: Arc<dyn ProcessSpawner>) -> Self {
        Self {
            config,
            spawner,
            handle: Mutex::new(None),
        }
    }

    /// Replaces any running inhibitor with a fresh one.
    pub fn start(&self) -> bool {
        let mut handle = lock(&self.handle);
        if let Some(mut previous) = handle.take() {
            previous.terminate(self.config.stop_grace());
        }

        let command = match CommandSpec::from_argv(&self.config.command, "inhibitor") {
            Ok(command) => command,
            Err(err) => {
                warn!(error = %err, "Sleep inhibitor not configured");
                return false;
            }
        };

        match self.spawner.spawn(&command) {
            Ok(process) => {
                info!(pid = process.pid(), command = %command, "Sleep inhibitor started");
                *handle = Some(process);
                true
            }
            Err(err) => {
                warn!(error = %err, "Failed to start sleep inhibitor");
                false
            }
        }
    }

    /// No-op when nothing is running.
    pub fn stop(&self) {
        let Some(mut process) = lock(&self.handle).take() else {
            return;
        };
        let pid = process.pid();
        match process.terminate(self.config.stop_grace()) {
            StopOutcome::Terminated | StopOutcome::AlreadyExited => {
                info!(pid, "Sleep inhibitor stopped");
            }
            StopOutcome::Killed => warn!(pid, "Sleep inhibitor force killed"),
            StopOutcome::Failed => warn!(pid, "Failed to stop sleep inhibitor"),
        }
    }

    /// Whether an inhibitor process is currently alive.
    pub fn is_active(&self) -> bool {
        let mut handle = lock(&self.handle);
        let exited = match handle.as_mut() {
            Some(process) => !matches!(process.try_exit(), Ok(None)),
            None => return false,
        };
        if exited {
            *handle = None;
        }
        !exited
    }
}

impl Drop for SleepInhibitor {
    fn drop(&mut self) {
        self.stop();
    }
}
