//! Arm/disarm state machine and lifecycle owner for the background supervisors.
//!
//! `arm()` flips the armed flag synchronously and hands inhibitor + monitor
//! startup to a short-lived thread. Each arm/stop bumps an epoch; a startup
//! thread that finds the epoch moved on does nothing, so a quick
//! arm→stop never leaves an inhibitor or monitor running.
//!
//! The armed flag and the epoch only change together under the `gate` lock,
//! so whichever of two racing arm/stop calls takes it last decides both.
//! `stop()` updates them while holding `lifecycle`, which orders its teardown
//! against any startup thread.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::thread;
use tracing::{debug, info, warn};

use crate::alarm::{AlarmSnapshot, AlarmSupervisor};
use crate::audio::{AudioActuator, CommandAudio};
use crate::config::GuardConfig;
use crate::flags::{lock, ArmState};
use crate::inhibitor::SleepInhibitor;
use crate::monitor::{LidMonitor, MonitorPhase};
use crate::probe::{probe_from_config, LidProbe};
use crate::process::{ProcessSpawner, SystemSpawner};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArmStatus {
    pub armed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ControllerSnapshot {
    pub armed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub armed_at: Option<DateTime<Utc>>,
    pub monitor: MonitorPhase,
    pub alarm: AlarmSnapshot,
    pub inhibitor_active: bool,
}

struct ControllerInner {
    armed: ArmState,
    armed_at: Mutex<Option<DateTime<Utc>>>,
    /// Arm/stop epoch. The armed flag is written only while this is held.
    gate: Mutex<u64>,
    lifecycle: Mutex<()>,
    inhibitor: SleepInhibitor,
    monitor: LidMonitor,
    alarm: Arc<AlarmSupervisor>,
}

/// Cheap to clone; all clones drive the same state.
#[derive(Clone)]
pub struct StateController {
    inner: Arc<ControllerInner>,
}

impl StateController {
    pub fn new(
        config: &GuardConfig,
        probe: Arc<dyn LidProbe>,
        audio: Arc<dyn AudioActuator>,
        spawner: Arc<dyn ProcessSpawner>,
    ) -> Self {
        let armed = ArmState::new();
        let alarm = Arc::new(AlarmSupervisor::new(
            audio,
            armed.watch(),
            config.alarm.clone(),
        ));
        let monitor = LidMonitor::new(
            probe,
            alarm.clone(),
            armed.watch(),
            config.monitor.clone(),
        );
        let inhibitor = SleepInhibitor::new(config.inhibitor.clone(), spawner);

        Self {
            inner: Arc::new(ControllerInner {
                armed,
                armed_at: Mutex::new(None),
                gate: Mutex::new(0),
                lifecycle: Mutex::new(()),
                inhibitor,
                monitor,
                alarm,
            }),
        }
    }

    /// Wires the real probe, audio commands, and process spawner.
    pub fn from_config(config: &GuardConfig) -> Self {
        let spawner: Arc<dyn ProcessSpawner> = Arc::new(SystemSpawner);
        let audio = Arc::new(CommandAudio::new(config.audio.clone(), Arc::clone(&spawner)));
        Self::new(config, probe_from_config(&config.probe), audio, spawner)
    }

    /// Arms (or re-arms) the guard. Returns once the flag is set; inhibitor
    /// and monitor startup continue in the background.
    pub fn arm(&self) -> ArmStatus {
        let (epoch, was_armed) = {
            let mut gate = lock(&self.inner.gate);
            *gate = gate.wrapping_add(1);
            let was_armed = self.inner.armed.set(true);
            *lock(&self.inner.armed_at) = Some(Utc::now());
            (*gate, was_armed)
        };
        info!(epoch, rearm = was_armed, "Arming");

        let inner = Arc::clone(&self.inner);
        let spawned = thread::Builder::new()
            .name("lidguard-arm".to_string())
            .spawn(move || inner.start_subsystems(epoch));
        if let Err(err) = spawned {
            warn!(error = %err, "Failed to spawn arm thread; starting inline");
            self.inner.start_subsystems(epoch);
        }

        ArmStatus { armed: true }
    }

    /// Disarms and tears down alarm, monitor, and inhibitor (in that order).
    /// Every step is bounded, so this always returns.
    pub fn stop(&self) -> ArmStatus {
        let _lifecycle = lock(&self.inner.lifecycle);
        {
            let mut gate = lock(&self.inner.gate);
            *gate = gate.wrapping_add(1);
            self.inner.armed.set(false);
            *lock(&self.inner.armed_at) = None;
        }

        self.inner.alarm.stop();
        self.inner.monitor.stop();
        self.inner.inhibitor.stop();
        info!("Disarmed");

        ArmStatus { armed: false }
    }

    pub fn status(&self) -> ArmStatus {
        ArmStatus {
            armed: self.inner.armed.is_armed(),
        }
    }

    /// Fires the alarm directly, bypassing the lid monitor. Serialized with
    /// `stop()`, so a concurrent disarm either silences it or precedes it.
    pub fn test_trigger(&self) -> TriggerOutcome {
        let _lifecycle = lock(&self.inner.lifecycle);
        match self.inner.alarm.start() {
            Ok(()) => TriggerOutcome {
                success: true,
                reason: None,
            },
            Err(err) => TriggerOutcome {
                success: false,
                reason: Some(err.to_string()),
            },
        }
    }

    pub fn health(&self) -> ControllerSnapshot {
        ControllerSnapshot {
            armed: self.inner.armed.is_armed(),
            armed_at: *lock(&self.inner.armed_at),
            monitor: self.inner.monitor.phase(),
            alarm: self.inner.alarm.snapshot(),
            inhibitor_active: self.inner.inhibitor.is_active(),
        }
    }

    /// Kills alarm players left behind by a previous process.
    pub fn sweep_stray_players(&self) -> usize {
        self.inner.alarm.sweep_strays()
    }
}

impl ControllerInner {
    fn start_subsystems(&self, epoch: u64) {
        let _lifecycle = lock(&self.lifecycle);
        if *lock(&self.gate) != epoch || !self.armed.is_armed() {
            debug!(epoch, "Arm startup superseded");
            return;
        }
        let inhibitor_started = self.inhibitor.start();
        self.monitor.start();
        info!(inhibitor_started, "Armed");
    }
}
