//! Error types for lidguard-core operations.

use std::path::PathBuf;

/// All errors that can occur in lidguard-core operations.
///
/// Permanent failures (missing sound, unusable lid sensor) are distinct
/// variants so callers can abort instead of retrying.
#[derive(Debug, thiserror::Error)]
pub enum GuardError {
    // ─────────────────────────────────────────────────────────────────────
    // Sound Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Alarm sound not found at {0}")]
    SoundMissing(PathBuf),

    #[error("Failed to launch alarm playback: {details}")]
    PlaybackLaunch { details: String },

    // ─────────────────────────────────────────────────────────────────────
    // Probe Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Lid sensor unavailable: {0}")]
    ProbeUnavailable(String),

    // ─────────────────────────────────────────────────────────────────────
    // Process Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command is empty: {0}")]
    EmptyCommand(&'static str),

    // ─────────────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Home directory not found")]
    HomeNotFound,

    #[error("Configuration file malformed: {path}: {details}")]
    ConfigMalformed { path: PathBuf, details: String },

    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl GuardError {
    /// Permanent errors are reported and never retried.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            GuardError::SoundMissing(_) | GuardError::ProbeUnavailable(_)
        )
    }
}

/// Convenience type alias for Results using GuardError.
pub type Result<T> = std::result::Result<T, GuardError>;

impl From<GuardError> for String {
    fn from(err: GuardError) -> String {
        err.to_string()
    }
}
