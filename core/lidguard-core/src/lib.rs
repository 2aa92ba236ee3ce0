//! # lidguard-core
//!
//! Anti-theft guard for laptops: once armed, closing the lid sounds an alarm
//! that keeps playing at full volume until the owner disarms.
//!
//! ## Design Principles
//!
//! - **Synchronous**: Plain threads, no async runtime. Every background loop
//!   has a cancellation-aware sleep and a bounded join.
//! - **Single writer**: Only [`StateController`] writes the armed flag; the
//!   monitor and alarm loops read it through an [`ArmWatch`].
//! - **Injectable edges**: The lid sensor, audio output, and process spawning
//!   sit behind traits so the state machines run against fakes in tests.
//! - **No orphans**: Every spawned process has exactly one owner and is reaped
//!   before the handle is dropped or replaced.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use lidguard_core::{load_config, StateController};
//!
//! let config = load_config(None)?;
//! let controller = StateController::from_config(&config);
//! controller.arm();
//! // ... lid closes, alarm plays ...
//! controller.stop();
//! ```

pub mod alarm;
pub mod audio;
pub mod config;
pub mod controller;
pub mod error;
pub mod flags;
pub mod inhibitor;
pub mod monitor;
pub mod probe;
pub mod process;

pub use alarm::{AlarmPhase, AlarmSnapshot, AlarmSupervisor, AlarmTrigger};
pub use audio::{AudioActuator, CommandAudio};
pub use config::*;
pub use controller::{ArmStatus, ControllerSnapshot, StateController, TriggerOutcome};
pub use error::{GuardError, Result};
pub use flags::{ArmState, ArmWatch, RunFlag};
pub use inhibitor::SleepInhibitor;
pub use monitor::{LidEdgeDetector, LidMonitor, LidObservation, MonitorPhase};
pub use probe::{AcpiLidProbe, IoregLidProbe, LidProbe, LidState};
pub use process::{CommandSpec, ManagedProcess, ProcessSpawner, StopOutcome, SystemSpawner};
