//! Shared flags read by the background loops.
//!
//! `ArmState` is written only by the controller; loops get a read-only
//! [`ArmWatch`]. `RunFlag` is a per-session stop signal whose `sleep` wakes
//! immediately when the flag is cleared, keeping stop latency bounded by
//! lock handoff rather than by the poll interval.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const JOIN_POLL_MS: u64 = 10;

/// Process-wide armed flag. Not `Clone`: there is exactly one writer.
#[derive(Debug, Default)]
pub struct ArmState {
    armed: Arc<AtomicBool>,
}

impl ArmState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::SeqCst)
    }

    /// Returns the previous value.
    pub fn set(&self, armed: bool) -> bool {
        self.armed.swap(armed, Ordering::SeqCst)
    }

    pub fn watch(&self) -> ArmWatch {
        ArmWatch {
            armed: Arc::clone(&self.armed),
        }
    }
}

/// Read-only view of [`ArmState`].
#[derive(Debug, Clone)]
pub struct ArmWatch {
    armed: Arc<AtomicBool>,
}

impl ArmWatch {
    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
struct RunFlagInner {
    running: Mutex<bool>,
    changed: Condvar,
}

/// Cancellation-aware run flag shared between a control thread and a loop.
#[derive(Debug, Clone)]
pub struct RunFlag {
    inner: Arc<RunFlagInner>,
}

impl RunFlag {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RunFlagInner {
                running: Mutex::new(true),
                changed: Condvar::new(),
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        *lock(&self.inner.running)
    }

    pub fn stop(&self) {
        let mut guard = lock(&self.inner.running);
        *guard = false;
        self.inner.changed.notify_all();
    }

    /// Sleeps up to `duration`, returning early if the flag is cleared.
    /// Returns whether the flag is still set.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut guard = lock(&self.inner.running);
        while *guard {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            guard = match self.inner.changed.wait_timeout(guard, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        *guard
    }
}

impl Default for RunFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// Locks `mutex`, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Joins `handle` if it finishes within `timeout`. A thread that misses the
/// deadline is detached and `false` is returned.
pub fn join_with_timeout(handle: JoinHandle<()>, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(JOIN_POLL_MS));
    }
    if handle.join().is_err() {
        tracing::warn!("Background thread panicked");
    }
    true
}
