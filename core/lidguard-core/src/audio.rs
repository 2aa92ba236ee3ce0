//! Sound output: volume, primary playback, and fallback channels.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::AudioConfig;
use crate::error::{GuardError, Result};
use crate::process::{
    reap_in_background, run_bounded, sweep_processes, CommandSpec, ManagedProcess, ProcessSpawner,
};

pub trait AudioActuator: Send + Sync {
    /// Best-effort. Returns whether the volume command succeeded.
    fn maximize_volume(&self) -> bool;

    /// Launches one play-through of the alarm sound.
    ///
    /// `GuardError::SoundMissing` is permanent; launch errors are transient.
    fn start_playback(&self) -> Result<Box<dyn ManagedProcess>>;

    /// Fires the tone and speech channels without waiting on them.
    fn fire_fallbacks(&self);

    /// Terminates stray players of the alarm sound. Returns how many.
    fn sweep_strays(&self) -> usize;
}

/// Drives sound through external commands (`afplay`, `osascript`, `say`, ...).
pub struct CommandAudio {
    config: AudioConfig,
    spawner: Arc<dyn ProcessSpawner>,
}

impl CommandAudio {
    pub fn new(config: AudioConfig, spawner: Arc<dyn ProcessSpawner>) -> Self {
        Self { config, spawner }
    }

    fn player_name(&self) -> &str {
        self.config
            .player
            .rsplit('/')
            .next()
            .unwrap_or(self.config.player.as_str())
    }

    fn fire(&self, argv: &[String], label: &'static str) {
        let command = match CommandSpec::from_argv(argv, label) {
            Ok(command) => command,
            Err(err) => {
                debug!(error = %err, channel = label, "Fallback channel not configured");
                return;
            }
        };
        match self.spawner.spawn(&command) {
            Ok(process) => reap_in_background(
                process,
                Duration::from_millis(self.config.fallback_timeout_ms),
            ),
            Err(err) => debug!(error = %err, channel = label, "Fallback channel failed"),
        }
    }
}

impl AudioActuator for CommandAudio {
    fn maximize_volume(&self) -> bool {
        let command = match CommandSpec::from_argv(&self.config.volume_command, "volume") {
            Ok(command) => command,
            Err(_) => return false,
        };
        let timeout = Duration::from_millis(self.config.volume_timeout_ms);
        match run_bounded(self.spawner.as_ref(), &command, timeout) {
            Ok(true) => true,
            Ok(false) => {
                debug!(command = %command, "Volume command exited with failure");
                false
            }
            Err(err) => {
                warn!(error = %err, "Failed to maximize volume");
                false
            }
        }
    }

    fn start_playback(&self) -> Result<Box<dyn ManagedProcess>> {
        let sound = &self.config.sound_path;
        if !sound.is_file() {
            return Err(GuardError::SoundMissing(sound.clone()));
        }
        let command = CommandSpec::new(&self.config.player, [sound.to_string_lossy()]);
        self.spawner
            .spawn(&command)
            .map_err(|err| GuardError::PlaybackLaunch {
                details: err.to_string(),
            })
    }

    fn fire_fallbacks(&self) {
        if self.config.enable_tone {
            self.fire(&self.config.tone_command, "tone");
        }
        if self.config.enable_speech {
            self.fire(&self.config.speech_command, "speech");
        }
    }

    fn sweep_strays(&self) -> usize {
        let needle = self.config.sound_path.to_string_lossy();
        let count = sweep_processes(self.player_name(), &needle);
        if count > 0 {
            debug!(count, "Swept stray alarm players");
        }
        count
    }
}
