#![allow(dead_code)]

use lidguard_core::{
    AlarmConfig, AudioActuator, CommandSpec, GuardConfig, GuardError, InhibitorConfig, LidProbe,
    LidState, ManagedProcess, MonitorConfig, ProcessSpawner, Result, StopOutcome,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// A process that runs until terminated, or until `runtime` elapses.
pub struct FakeProcess {
    pid: u32,
    alive: Arc<AtomicBool>,
    started: Instant,
    runtime: Option<Duration>,
}

impl FakeProcess {
    fn new(pid: u32, alive: Arc<AtomicBool>, runtime: Option<Duration>) -> Self {
        Self {
            pid,
            alive,
            started: Instant::now(),
            runtime,
        }
    }
}

impl ManagedProcess for FakeProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn try_exit(&mut self) -> std::io::Result<Option<bool>> {
        if !self.alive.load(Ordering::SeqCst) {
            return Ok(Some(true));
        }
        match self.runtime {
            Some(runtime) if self.started.elapsed() >= runtime => {
                self.alive.store(false, Ordering::SeqCst);
                Ok(Some(true))
            }
            _ => Ok(None),
        }
    }

    fn terminate(&mut self, _grace: Duration) -> StopOutcome {
        if self.alive.swap(false, Ordering::SeqCst) {
            StopOutcome::Terminated
        } else {
            StopOutcome::AlreadyExited
        }
    }
}

fn count_alive(handles: &Mutex<Vec<Arc<AtomicBool>>>) -> usize {
    handles
        .lock()
        .expect("lock handles")
        .iter()
        .filter(|alive| alive.load(Ordering::SeqCst))
        .count()
}

/// Lid sensor whose reading is set by the test.
pub struct ScriptedLid {
    state: Mutex<LidState>,
    unavailable: AtomicBool,
    reads: AtomicUsize,
}

impl ScriptedLid {
    pub fn new(initial: LidState) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(initial),
            unavailable: AtomicBool::new(false),
            reads: AtomicUsize::new(0),
        })
    }

    pub fn set(&self, state: LidState) {
        *self.state.lock().expect("lock lid") = state;
    }

    pub fn make_unavailable(&self) {
        self.unavailable.store(true, Ordering::SeqCst);
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

impl LidProbe for ScriptedLid {
    fn read(&self) -> Result<LidState> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(GuardError::ProbeUnavailable("scripted".to_string()));
        }
        Ok(*self.state.lock().expect("lock lid"))
    }
}

/// Audio output that counts playbacks and tracks which players are alive.
pub struct FakeAudio {
    sound_present: AtomicBool,
    fail_launches: AtomicBool,
    runtime: Option<Duration>,
    launches: AtomicUsize,
    players: Mutex<Vec<Arc<AtomicBool>>>,
}

impl FakeAudio {
    /// Players run until terminated.
    pub fn endless() -> Arc<Self> {
        Self::with_runtime(None)
    }

    pub fn with_runtime(runtime: Option<Duration>) -> Arc<Self> {
        Arc::new(Self {
            sound_present: AtomicBool::new(true),
            fail_launches: AtomicBool::new(false),
            runtime,
            launches: AtomicUsize::new(0),
            players: Mutex::new(Vec::new()),
        })
    }

    pub fn remove_sound(&self) {
        self.sound_present.store(false, Ordering::SeqCst);
    }

    pub fn fail_launches(&self) {
        self.fail_launches.store(true, Ordering::SeqCst);
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn live_players(&self) -> usize {
        count_alive(&self.players)
    }
}

impl AudioActuator for FakeAudio {
    fn maximize_volume(&self) -> bool {
        true
    }

    fn start_playback(&self) -> Result<Box<dyn ManagedProcess>> {
        if !self.sound_present.load(Ordering::SeqCst) {
            return Err(GuardError::SoundMissing(PathBuf::from("/missing/alarm.aiff")));
        }
        let launch = self.launches.fetch_add(1, Ordering::SeqCst);
        if launch > 0 && self.fail_launches.load(Ordering::SeqCst) {
            return Err(GuardError::PlaybackLaunch {
                details: "scripted failure".to_string(),
            });
        }
        let alive = Arc::new(AtomicBool::new(true));
        self.players
            .lock()
            .expect("lock players")
            .push(Arc::clone(&alive));
        Ok(Box::new(FakeProcess::new(
            10_000 + launch as u32,
            alive,
            self.runtime,
        )))
    }

    fn fire_fallbacks(&self) {}

    fn sweep_strays(&self) -> usize {
        0
    }
}

/// Spawner for the sleep inhibitor. Every process runs until terminated.
#[derive(Default)]
pub struct FakeSpawner {
    delay: Duration,
    spawned: Mutex<Vec<CommandSpec>>,
    processes: Mutex<Vec<Arc<AtomicBool>>>,
}

impl FakeSpawner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Each spawn blocks for `delay` first.
    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            ..Self::default()
        })
    }

    pub fn spawn_count(&self) -> usize {
        self.spawned.lock().expect("lock spawned").len()
    }

    pub fn live(&self) -> usize {
        count_alive(&self.processes)
    }
}

impl ProcessSpawner for FakeSpawner {
    fn spawn(&self, command: &CommandSpec) -> Result<Box<dyn ManagedProcess>> {
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }
        let mut spawned = self.spawned.lock().expect("lock spawned");
        spawned.push(command.clone());
        let alive = Arc::new(AtomicBool::new(true));
        self.processes
            .lock()
            .expect("lock processes")
            .push(Arc::clone(&alive));
        Ok(Box::new(FakeProcess::new(
            20_000 + spawned.len() as u32,
            alive,
            None,
        )))
    }
}

pub fn fast_config() -> GuardConfig {
    GuardConfig {
        monitor: MonitorConfig {
            poll_interval_ms: 10,
            join_timeout_ms: 2_000,
        },
        alarm: AlarmConfig {
            max_consecutive_failures: 3,
            wait_poll_ms: 5,
            stop_grace_ms: 50,
            retry_delay_ms: 5,
            immediate_failure_window_ms: 1_000,
            join_timeout_ms: 2_000,
        },
        inhibitor: InhibitorConfig {
            command: vec!["caffeinate".to_string(), "-d".to_string()],
            stop_grace_ms: 50,
        },
        ..GuardConfig::default()
    }
}

pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}
