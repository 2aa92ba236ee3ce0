//! Alarm playback supervisor.
//!
//! ```text
//!            trigger()                 budget exhausted
//!   Idle ───────────────► Playing ─────────────────────► Failing
//!    ▲                      │  ▲                            │
//!    │ launch failed        │  │ playback ended, restarted  │
//!    │                      ▼  │                            │
//!    │                    (supervising loop)                │
//!    │                      │                               │
//!    │          stop() / disarm                 stop()      │
//!    │                      ▼                               ▼
//!    └──────── trigger() ─ Stopped ◄────────────────────────┘
//! ```
//!
//! A session owns at most one playback process. The supervising loop and
//! `stop()` coordinate through the session's run flag and a mutex around the
//! playback handle: whoever takes the handle out of the mutex reaps it, and
//! the loop re-checks the run flag under that mutex before launching a
//! replacement, so a stop can never race a restart into an orphaned player.

use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::audio::AudioActuator;
use crate::config::AlarmConfig;
use crate::error::{GuardError, Result};
use crate::flags::{join_with_timeout, lock, ArmWatch, RunFlag};
use crate::process::ManagedProcess;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmPhase {
    Idle,
    Playing,
    Failing,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AlarmSnapshot {
    pub phase: AlarmPhase,
    pub consecutive_failures: u32,
    pub max_consecutive_failures: u32,
    pub restarts: u64,
}

/// The single cross-loop entry point used by the lid monitor.
pub trait AlarmTrigger: Send + Sync {
    fn trigger(&self) -> Result<()>;
}

#[derive(Debug)]
struct AlarmStatus {
    generation: u64,
    phase: AlarmPhase,
    consecutive_failures: u32,
    restarts: u64,
}

type PlaybackSlot = Mutex<Option<Box<dyn ManagedProcess>>>;

struct AlarmSession {
    run: RunFlag,
    playback: Arc<PlaybackSlot>,
    worker: Option<JoinHandle<()>>,
}

pub struct AlarmSupervisor {
    audio: Arc<dyn AudioActuator>,
    armed: ArmWatch,
    config: AlarmConfig,
    status: Arc<Mutex<AlarmStatus>>,
    session: Mutex<Option<AlarmSession>>,
}

impl AlarmSupervisor {
    pub fn new(audio: Arc<dyn AudioActuator>, armed: ArmWatch, config: AlarmConfig) -> Self {
        Self {
            audio,
            armed,
            config,
            status: Arc::new(Mutex::new(AlarmStatus {
                generation: 0,
                phase: AlarmPhase::Idle,
                consecutive_failures: 0,
                restarts: 0,
            })),
            session: Mutex::new(None),
        }
    }

    pub fn phase(&self) -> AlarmPhase {
        lock(&self.status).phase
    }

    pub fn snapshot(&self) -> AlarmSnapshot {
        let status = lock(&self.status);
        AlarmSnapshot {
            phase: status.phase,
            consecutive_failures: status.consecutive_failures,
            max_consecutive_failures: self.config.max_consecutive_failures,
            restarts: status.restarts,
        }
    }

    /// Starts a fresh alarm session, replacing any existing one.
    ///
    /// Sessions started while armed end on disarm and loop until then.
    /// Sessions started while disarmed (test triggers) play through once.
    pub fn start(&self) -> Result<()> {
        self.start_session(false)
    }

    /// With `armed_only`, the armed flag is re-read under the session lock so
    /// a trigger that loses a race with disarm starts nothing. `stop()` clears
    /// the flag before it takes the session, so any session stored after the
    /// check is still torn down by that stop.
    fn start_session(&self, armed_only: bool) -> Result<()> {
        let mut session = lock(&self.session);
        if armed_only && !self.armed.is_armed() {
            debug!("Disarmed before the alarm started; trigger dropped");
            return Ok(());
        }
        if let Some(previous) = session.take() {
            self.shutdown_session(previous);
        }

        let generation = {
            let mut status = lock(&self.status);
            status.generation = status.generation.wrapping_add(1);
            status.phase = AlarmPhase::Idle;
            status.consecutive_failures = 0;
            status.generation
        };

        self.audio.maximize_volume();
        let process = match self.audio.start_playback() {
            Ok(process) => process,
            Err(err) => {
                error!(error = %err, permanent = err.is_permanent(), "Alarm trigger failed");
                return Err(err);
            }
        };
        self.audio.fire_fallbacks();

        let follow_disarm = armed_only || self.armed.is_armed();
        let pid = process.pid();
        let run = RunFlag::new();
        let playback: Arc<PlaybackSlot> = Arc::new(Mutex::new(Some(process)));
        let supervisor_loop = SupervisorLoop {
            audio: Arc::clone(&self.audio),
            armed: self.armed.clone(),
            follow_disarm,
            config: self.config.clone(),
            run: run.clone(),
            playback: Arc::clone(&playback),
            status: Arc::clone(&self.status),
            generation,
        };

        lock(&self.status).phase = AlarmPhase::Playing;
        let worker = match thread::Builder::new()
            .name("lidguard-alarm".to_string())
            .spawn(move || supervisor_loop.run())
        {
            Ok(worker) => worker,
            Err(err) => {
                if let Some(mut process) = lock(&playback).take() {
                    process.terminate(self.config.stop_grace());
                }
                lock(&self.status).phase = AlarmPhase::Idle;
                return Err(GuardError::PlaybackLaunch {
                    details: format!("failed to spawn alarm loop: {}", err),
                });
            }
        };

        info!(pid, follow_disarm, "Alarm triggered");
        *session = Some(AlarmSession {
            run,
            playback,
            worker: Some(worker),
        });
        Ok(())
    }

    /// Ends the current session and sweeps stray players. Idempotent.
    pub fn stop(&self) {
        let previous = lock(&self.session).take();
        let had_session = previous.is_some();
        if let Some(previous) = previous {
            self.shutdown_session(previous);
        }

        {
            let mut status = lock(&self.status);
            status.generation = status.generation.wrapping_add(1);
            if matches!(status.phase, AlarmPhase::Playing | AlarmPhase::Failing) {
                status.phase = AlarmPhase::Stopped;
            }
        }

        let swept = self.audio.sweep_strays();
        if had_session || swept > 0 {
            info!(swept, "Alarm stopped");
        }
    }

    /// Terminates stray players of the alarm sound left by earlier runs.
    pub fn sweep_strays(&self) -> usize {
        self.audio.sweep_strays()
    }

    fn shutdown_session(&self, mut session: AlarmSession) {
        session.run.stop();
        if let Some(mut process) = lock(&session.playback).take() {
            let outcome = process.terminate(self.config.stop_grace());
            debug!(pid = process.pid(), outcome = ?outcome, "Alarm playback stopped");
        }
        if let Some(worker) = session.worker.take() {
            if !join_with_timeout(worker, self.config.join_timeout()) {
                warn!("Alarm loop did not exit within the join timeout");
            }
        }
    }
}

impl AlarmTrigger for AlarmSupervisor {
    fn trigger(&self) -> Result<()> {
        self.start_session(true)
    }
}

impl Drop for AlarmSupervisor {
    fn drop(&mut self) {
        if let Some(session) = lock(&self.session).take() {
            self.shutdown_session(session);
        }
    }
}

enum PlaybackEnd {
    Exited { success: bool },
    Cancelled,
}

struct SupervisorLoop {
    audio: Arc<dyn AudioActuator>,
    armed: ArmWatch,
    follow_disarm: bool,
    config: AlarmConfig,
    run: RunFlag,
    playback: Arc<PlaybackSlot>,
    status: Arc<Mutex<AlarmStatus>>,
    generation: u64,
}

impl SupervisorLoop {
    fn run(self) {
        let mut started_at = Instant::now();
        loop {
            let end = self.wait_for_playback();
            let immediate = started_at.elapsed() < self.config.immediate_failure_window();
            match end {
                PlaybackEnd::Cancelled => break,
                PlaybackEnd::Exited { success } => {
                    if !success && immediate {
                        if self.record_failure() {
                            break;
                        }
                    } else {
                        self.reset_failures();
                    }
                }
            }

            if !self.follow_disarm {
                self.set_phase(AlarmPhase::Idle);
                break;
            }

            // A player that exits right away, cleanly or not, is relaunched
            // no faster than once per retry delay.
            if immediate && !self.run.sleep(self.config.retry_delay()) {
                break;
            }

            match self.restart() {
                Some(at) => started_at = at,
                None => break,
            }
        }

        self.finish();
    }

    fn should_continue(&self) -> bool {
        self.run.is_running() && (!self.follow_disarm || self.armed.is_armed())
    }

    fn wait_for_playback(&self) -> PlaybackEnd {
        loop {
            {
                let mut playback = lock(&self.playback);
                if !self.should_continue() {
                    if let Some(mut process) = playback.take() {
                        process.terminate(self.config.stop_grace());
                    }
                    return PlaybackEnd::Cancelled;
                }
                let Some(process) = playback.as_mut() else {
                    return PlaybackEnd::Cancelled;
                };
                match process.try_exit() {
                    Ok(Some(success)) => {
                        *playback = None;
                        return PlaybackEnd::Exited { success };
                    }
                    Ok(None) => {}
                    Err(err) => {
                        warn!(error = %err, "Failed to poll alarm playback");
                        if let Some(mut process) = playback.take() {
                            process.terminate(self.config.stop_grace());
                        }
                        return PlaybackEnd::Exited { success: false };
                    }
                }
            }
            self.run.sleep(self.config.wait_poll());
        }
    }

    /// Relaunches playback, retrying transient failures within the budget.
    /// Returns the launch time, or `None` when the loop should end.
    fn restart(&self) -> Option<Instant> {
        let mut attempt = 0u32;
        loop {
            let mut playback = lock(&self.playback);
            if !self.should_continue() {
                return None;
            }

            self.audio.maximize_volume();
            if attempt == 0 {
                self.audio.fire_fallbacks();
            }
            attempt = attempt.saturating_add(1);

            match self.audio.start_playback() {
                Ok(process) => {
                    debug!(pid = process.pid(), "Alarm playback restarted");
                    *playback = Some(process);
                    self.bump_restarts();
                    return Some(Instant::now());
                }
                Err(err) if err.is_permanent() => {
                    error!(error = %err, "Alarm sound unavailable; giving up");
                    self.set_phase(AlarmPhase::Failing);
                    return None;
                }
                Err(err) => {
                    drop(playback);
                    warn!(error = %err, attempt, "Alarm playback failed to launch");
                    if self.record_failure() {
                        return None;
                    }
                    if !self.run.sleep(self.config.retry_delay()) {
                        return None;
                    }
                }
            }
        }
    }

    /// Returns true once the failure budget is exhausted.
    fn record_failure(&self) -> bool {
        let mut status = lock(&self.status);
        if status.generation != self.generation {
            return true;
        }
        status.consecutive_failures = status.consecutive_failures.saturating_add(1);
        if status.consecutive_failures >= self.config.max_consecutive_failures {
            status.phase = AlarmPhase::Failing;
            error!(
                failures = status.consecutive_failures,
                "Alarm failure budget exhausted; alarm silenced"
            );
            return true;
        }
        false
    }

    fn reset_failures(&self) {
        let mut status = lock(&self.status);
        if status.generation == self.generation {
            status.consecutive_failures = 0;
        }
    }

    fn bump_restarts(&self) {
        let mut status = lock(&self.status);
        if status.generation == self.generation {
            status.restarts = status.restarts.saturating_add(1);
        }
    }

    fn set_phase(&self, phase: AlarmPhase) {
        let mut status = lock(&self.status);
        if status.generation == self.generation {
            status.phase = phase;
        }
    }

    fn finish(&self) {
        if let Some(mut process) = lock(&self.playback).take() {
            process.terminate(self.config.stop_grace());
        }
        let mut status = lock(&self.status);
        if status.generation == self.generation && status.phase == AlarmPhase::Playing {
            status.phase = AlarmPhase::Stopped;
        }
        debug!(phase = ?status.phase, "Alarm loop exited");
    }
}
