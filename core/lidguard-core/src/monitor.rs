//! Lid monitor: polls the probe and triggers the alarm on an Open→Closed edge.
//!
//! Each `start()` builds a new [`LidEdgeDetector`], so the first good reading
//! of every arm cycle only records a baseline. Arming with the lid already
//! closed therefore never fires.

use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::alarm::AlarmTrigger;
use crate::config::MonitorConfig;
use crate::flags::{join_with_timeout, lock, ArmWatch, RunFlag};
use crate::probe::{LidProbe, LidState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorPhase {
    Stopped,
    Initializing,
    Watching,
    /// The probe reported a permanent error; polling has ended.
    Faulted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LidObservation {
    /// Unknown reading; nothing recorded.
    Ignored,
    Baseline(LidState),
    Unchanged,
    Changed { from: LidState, to: LidState },
    /// Open→Closed. Reported once per edge.
    ClosedEdge,
}

/// Tracks the last conclusive lid reading for one arm cycle.
#[derive(Debug, Default)]
pub struct LidEdgeDetector {
    recorded: Option<LidState>,
}

impl LidEdgeDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recorded(&self) -> Option<LidState> {
        self.recorded
    }

    pub fn observe(&mut self, reading: LidState) -> LidObservation {
        if reading == LidState::Unknown {
            return LidObservation::Ignored;
        }
        let Some(previous) = self.recorded.replace(reading) else {
            return LidObservation::Baseline(reading);
        };
        match (previous, reading) {
            (LidState::Open, LidState::Closed) => LidObservation::ClosedEdge,
            (from, to) if from == to => LidObservation::Unchanged,
            (from, to) => LidObservation::Changed { from, to },
        }
    }
}

#[derive(Debug)]
struct PhaseCell {
    generation: u64,
    phase: MonitorPhase,
}

struct MonitorSession {
    run: RunFlag,
    worker: Option<JoinHandle<()>>,
}

pub struct LidMonitor {
    probe: Arc<dyn LidProbe>,
    alarm: Arc<dyn AlarmTrigger>,
    armed: ArmWatch,
    config: MonitorConfig,
    phase: Arc<Mutex<PhaseCell>>,
    session: Mutex<Option<MonitorSession>>,
}

impl LidMonitor {
    pub fn new(
        probe: Arc<dyn LidProbe>,
        alarm: Arc<dyn AlarmTrigger>,
        armed: ArmWatch,
        config: MonitorConfig,
    ) -> Self {
        Self {
            probe,
            alarm,
            armed,
            config,
            phase: Arc::new(Mutex::new(PhaseCell {
                generation: 0,
                phase: MonitorPhase::Stopped,
            })),
            session: Mutex::new(None),
        }
    }

    pub fn phase(&self) -> MonitorPhase {
        lock(&self.phase).phase
    }

    /// Starts a fresh polling session, stopping any previous one first.
    pub fn start(&self) {
        let mut session = lock(&self.session);
        if let Some(previous) = session.take() {
            self.shutdown_session(previous);
        }

        let generation = {
            let mut cell = lock(&self.phase);
            cell.generation = cell.generation.wrapping_add(1);
            cell.phase = MonitorPhase::Initializing;
            cell.generation
        };

        let run = RunFlag::new();
        let poller = Poller {
            probe: Arc::clone(&self.probe),
            alarm: Arc::clone(&self.alarm),
            armed: self.armed.clone(),
            config: self.config.clone(),
            run: run.clone(),
            phase: Arc::clone(&self.phase),
            generation,
            detector: LidEdgeDetector::new(),
        };

        match thread::Builder::new()
            .name("lidguard-monitor".to_string())
            .spawn(move || poller.run())
        {
            Ok(worker) => {
                debug!(generation, "Lid monitor started");
                *session = Some(MonitorSession {
                    run,
                    worker: Some(worker),
                });
            }
            Err(err) => {
                error!(error = %err, "Failed to spawn lid monitor");
                lock(&self.phase).phase = MonitorPhase::Stopped;
            }
        }
    }

    /// Stops polling and waits (bounded) for the loop to exit.
    pub fn stop(&self) {
        if let Some(previous) = lock(&self.session).take() {
            self.shutdown_session(previous);
        }
        let mut cell = lock(&self.phase);
        cell.generation = cell.generation.wrapping_add(1);
        cell.phase = MonitorPhase::Stopped;
    }

    fn shutdown_session(&self, mut session: MonitorSession) {
        session.run.stop();
        if let Some(worker) = session.worker.take() {
            if !join_with_timeout(worker, self.config.join_timeout()) {
                warn!("Lid monitor did not exit within the join timeout");
            }
        }
    }
}

impl Drop for LidMonitor {
    fn drop(&mut self) {
        if let Some(session) = lock(&self.session).take() {
            self.shutdown_session(session);
        }
    }
}

struct Poller {
    probe: Arc<dyn LidProbe>,
    alarm: Arc<dyn AlarmTrigger>,
    armed: ArmWatch,
    config: MonitorConfig,
    run: RunFlag,
    phase: Arc<Mutex<PhaseCell>>,
    generation: u64,
    detector: LidEdgeDetector,
}

impl Poller {
    fn run(mut self) {
        while self.run.is_running() && self.armed.is_armed() {
            match self.probe.read() {
                Ok(reading) => self.handle_reading(reading),
                Err(err) if err.is_permanent() => {
                    error!(error = %err, "Lid sensor unavailable; monitor stopped");
                    self.set_phase(MonitorPhase::Faulted);
                    return;
                }
                Err(err) => warn!(error = %err, "Lid probe failed"),
            }

            if !self.run.sleep(self.config.poll_interval()) {
                break;
            }
        }
        self.set_phase(MonitorPhase::Stopped);
        debug!(generation = self.generation, "Lid monitor exited");
    }

    fn handle_reading(&mut self, reading: LidState) {
        match self.detector.observe(reading) {
            LidObservation::Baseline(state) => {
                info!(state = ?state, "Lid baseline recorded");
                self.set_phase(MonitorPhase::Watching);
            }
            LidObservation::ClosedEdge => {
                if !self.armed.is_armed() {
                    return;
                }
                warn!("Lid closed while armed; triggering alarm");
                if let Err(err) = self.alarm.trigger() {
                    error!(error = %err, "Alarm trigger from lid monitor failed");
                }
            }
            LidObservation::Changed { from, to } => {
                debug!(from = ?from, to = ?to, "Lid state changed");
            }
            LidObservation::Unchanged | LidObservation::Ignored => {}
        }
    }

    fn set_phase(&self, phase: MonitorPhase) {
        let mut cell = lock(&self.phase);
        if cell.generation == self.generation {
            cell.phase = phase;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{GuardError, Result};
    use crate::flags::ArmState;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    #[derive(Clone)]
    struct ScriptedProbe {
        readings: Arc<Mutex<VecDeque<Result<LidState>>>>,
        reads: Arc<AtomicUsize>,
    }

    impl ScriptedProbe {
        fn new(readings: Vec<Result<LidState>>) -> Self {
            Self {
                readings: Arc::new(Mutex::new(VecDeque::from(readings))),
                reads: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn drained(&self) -> bool {
            self.readings.lock().expect("lock readings").is_empty()
        }
    }

    impl LidProbe for ScriptedProbe {
        fn read(&self) -> Result<LidState> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.readings
                .lock()
                .expect("lock readings")
                .pop_front()
                .unwrap_or(Ok(LidState::Unknown))
        }
    }

    #[derive(Default)]
    struct CountingAlarm {
        triggers: AtomicUsize,
    }

    impl AlarmTrigger for CountingAlarm {
        fn trigger(&self) -> Result<()> {
            self.triggers.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn fast_config() -> MonitorConfig {
        MonitorConfig {
            poll_interval_ms: 2,
            join_timeout_ms: 2_000,
        }
    }

    fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        condition()
    }

    #[test]
    fn detector_first_reading_is_baseline() {
        let mut detector = LidEdgeDetector::new();
        assert_eq!(
            detector.observe(LidState::Closed),
            LidObservation::Baseline(LidState::Closed)
        );
        assert_eq!(detector.observe(LidState::Closed), LidObservation::Unchanged);
    }

    #[test]
    fn detector_ignores_unknown_without_recording() {
        let mut detector = LidEdgeDetector::new();
        assert_eq!(detector.observe(LidState::Unknown), LidObservation::Ignored);
        assert_eq!(detector.recorded(), None);

        detector.observe(LidState::Open);
        assert_eq!(detector.observe(LidState::Unknown), LidObservation::Ignored);
        assert_eq!(detector.recorded(), Some(LidState::Open));
        assert_eq!(detector.observe(LidState::Closed), LidObservation::ClosedEdge);
    }

    #[test]
    fn detector_reports_each_edge_once() {
        let mut detector = LidEdgeDetector::new();
        let readings = [
            LidState::Open,
            LidState::Closed,
            LidState::Closed,
            LidState::Open,
            LidState::Closed,
        ];
        let edges = readings
            .iter()
            .filter(|reading| detector.observe(**reading) == LidObservation::ClosedEdge)
            .count();
        assert_eq!(edges, 2);
    }

    #[test]
    fn closed_at_arm_time_does_not_trigger() {
        let probe = ScriptedProbe::new(vec![
            Ok(LidState::Closed),
            Ok(LidState::Closed),
            Ok(LidState::Closed),
        ]);
        let alarm = Arc::new(CountingAlarm::default());
        let state = ArmState::new();
        state.set(true);
        let monitor = LidMonitor::new(
            Arc::new(probe.clone()),
            alarm.clone(),
            state.watch(),
            fast_config(),
        );

        monitor.start();
        assert!(wait_until(Duration::from_secs(2), || probe.drained()));
        monitor.stop();

        assert_eq!(alarm.triggers.load(Ordering::SeqCst), 0);
        assert_eq!(monitor.phase(), MonitorPhase::Stopped);
    }

    #[test]
    fn open_to_closed_triggers_exactly_once() {
        let probe = ScriptedProbe::new(vec![
            Ok(LidState::Open),
            Ok(LidState::Unknown),
            Ok(LidState::Closed),
            Ok(LidState::Closed),
            Ok(LidState::Unknown),
            Ok(LidState::Closed),
        ]);
        let alarm = Arc::new(CountingAlarm::default());
        let state = ArmState::new();
        state.set(true);
        let monitor = LidMonitor::new(
            Arc::new(probe.clone()),
            alarm.clone(),
            state.watch(),
            fast_config(),
        );

        monitor.start();
        assert!(wait_until(Duration::from_secs(2), || probe.drained()));
        assert!(wait_until(Duration::from_secs(2), || {
            monitor.phase() == MonitorPhase::Watching
        }));
        monitor.stop();

        assert_eq!(alarm.triggers.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn loop_exits_when_disarmed() {
        let probe = ScriptedProbe::new(vec![Ok(LidState::Open)]);
        let alarm = Arc::new(CountingAlarm::default());
        let state = ArmState::new();
        state.set(true);
        let monitor = LidMonitor::new(
            Arc::new(probe.clone()),
            alarm,
            state.watch(),
            fast_config(),
        );

        monitor.start();
        assert!(wait_until(Duration::from_secs(2), || {
            monitor.phase() == MonitorPhase::Watching
        }));
        state.set(false);
        assert!(wait_until(Duration::from_secs(2), || {
            monitor.phase() == MonitorPhase::Stopped
        }));

        let reads = probe.reads.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(probe.reads.load(Ordering::SeqCst), reads);
        monitor.stop();
    }

    #[test]
    fn permanent_probe_error_faults_monitor() {
        let probe = ScriptedProbe::new(vec![Err(GuardError::ProbeUnavailable(
            "no sensor".to_string(),
        ))]);
        let alarm = Arc::new(CountingAlarm::default());
        let state = ArmState::new();
        state.set(true);
        let monitor = LidMonitor::new(Arc::new(probe), alarm.clone(), state.watch(), fast_config());

        monitor.start();
        assert!(wait_until(Duration::from_secs(2), || {
            monitor.phase() == MonitorPhase::Faulted
        }));
        monitor.stop();
        assert_eq!(alarm.triggers.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn restart_resets_baseline() {
        let probe = ScriptedProbe::new(vec![Ok(LidState::Open)]);
        let alarm = Arc::new(CountingAlarm::default());
        let state = ArmState::new();
        state.set(true);
        let monitor = LidMonitor::new(
            Arc::new(probe.clone()),
            alarm.clone(),
            state.watch(),
            fast_config(),
        );

        monitor.start();
        assert!(wait_until(Duration::from_secs(2), || probe.drained()));
        monitor.stop();

        probe
            .readings
            .lock()
            .expect("lock readings")
            .extend([Ok(LidState::Closed), Ok(LidState::Closed)]);
        monitor.start();
        assert!(wait_until(Duration::from_secs(2), || probe.drained()));
        monitor.stop();

        assert_eq!(alarm.triggers.load(Ordering::SeqCst), 0);
    }
}
