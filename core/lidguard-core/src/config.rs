//! Runtime configuration loaded from `~/.lidguard/config.toml`.
//!
//! Every field has a default, so a missing file or a partial file is valid.
//! Command defaults differ between macOS and other Unix systems.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{GuardError, Result};

pub const CONFIG_ENV: &str = "LIDGUARD_CONFIG";
const LIDGUARD_DIR: &str = ".lidguard";
const CONFIG_FILE: &str = "config.toml";

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;
pub const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 10;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct GuardConfig {
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub alarm: AlarmConfig,
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub inhibitor: InhibitorConfig,
    #[serde(default)]
    pub probe: ProbeConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_join_timeout_ms")]
    pub join_timeout_ms: u64,
}

impl MonitorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            join_timeout_ms: default_join_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlarmConfig {
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    #[serde(default = "default_wait_poll_ms")]
    pub wait_poll_ms: u64,
    #[serde(default = "default_alarm_stop_grace_ms")]
    pub stop_grace_ms: u64,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_immediate_failure_window_ms")]
    pub immediate_failure_window_ms: u64,
    #[serde(default = "default_join_timeout_ms")]
    pub join_timeout_ms: u64,
}

impl AlarmConfig {
    pub fn wait_poll(&self) -> Duration {
        Duration::from_millis(self.wait_poll_ms.max(1))
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn immediate_failure_window(&self) -> Duration {
        Duration::from_millis(self.immediate_failure_window_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

impl Default for AlarmConfig {
    fn default() -> Self {
        Self {
            max_consecutive_failures: default_max_consecutive_failures(),
            wait_poll_ms: default_wait_poll_ms(),
            stop_grace_ms: default_alarm_stop_grace_ms(),
            retry_delay_ms: default_retry_delay_ms(),
            immediate_failure_window_ms: default_immediate_failure_window_ms(),
            join_timeout_ms: default_join_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AudioConfig {
    #[serde(default = "default_sound_path")]
    pub sound_path: PathBuf,
    #[serde(default = "default_player")]
    pub player: String,
    #[serde(default = "default_volume_command")]
    pub volume_command: Vec<String>,
    #[serde(default = "default_tone_command")]
    pub tone_command: Vec<String>,
    #[serde(default = "default_speech_command")]
    pub speech_command: Vec<String>,
    #[serde(default = "default_true")]
    pub enable_tone: bool,
    #[serde(default = "default_true")]
    pub enable_speech: bool,
    #[serde(default = "default_volume_timeout_ms")]
    pub volume_timeout_ms: u64,
    #[serde(default = "default_fallback_timeout_ms")]
    pub fallback_timeout_ms: u64,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sound_path: default_sound_path(),
            player: default_player(),
            volume_command: default_volume_command(),
            tone_command: default_tone_command(),
            speech_command: default_speech_command(),
            enable_tone: true,
            enable_speech: true,
            volume_timeout_ms: default_volume_timeout_ms(),
            fallback_timeout_ms: default_fallback_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct InhibitorConfig {
    #[serde(default = "default_inhibitor_command")]
    pub command: Vec<String>,
    #[serde(default = "default_inhibitor_stop_grace_ms")]
    pub stop_grace_ms: u64,
}

impl InhibitorConfig {
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

impl Default for InhibitorConfig {
    fn default() -> Self {
        Self {
            command: default_inhibitor_command(),
            stop_grace_ms: default_inhibitor_stop_grace_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProbeKind {
    Ioreg,
    Acpi,
}

impl Default for ProbeKind {
    fn default() -> Self {
        if cfg!(target_os = "macos") {
            Self::Ioreg
        } else {
            Self::Acpi
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProbeConfig {
    #[serde(default)]
    pub kind: ProbeKind,
    #[serde(default = "default_acpi_path")]
    pub acpi_path: PathBuf,
    /// Upper bound on a single command-based lid query.
    #[serde(default = "default_probe_timeout_ms")]
    pub timeout_ms: u64,
}

impl ProbeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            kind: ProbeKind::default(),
            acpi_path: default_acpi_path(),
            timeout_ms: default_probe_timeout_ms(),
        }
    }
}

/// Returns `~/.lidguard`.
pub fn lidguard_dir() -> Result<PathBuf> {
    dirs::home_dir()
        .map(|home| home.join(LIDGUARD_DIR))
        .ok_or(GuardError::HomeNotFound)
}

/// `$LIDGUARD_CONFIG`, else `~/.lidguard/config.toml`.
pub fn default_config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        if !path.trim().is_empty() {
            return Ok(PathBuf::from(path));
        }
    }
    Ok(lidguard_dir()?.join(CONFIG_FILE))
}

/// Loads the config at `path` (or the default path). A missing file yields
/// defaults; an unreadable or malformed file is an error.
pub fn load_config(path: Option<PathBuf>) -> Result<GuardConfig> {
    let config_path = match path {
        Some(path) => path,
        None => default_config_path()?,
    };

    if !config_path.exists() {
        return Ok(GuardConfig::default());
    }

    let content = fs_err::read_to_string(&config_path).map_err(|source| GuardError::Io {
        context: format!("Failed to read config {}", config_path.display()),
        source,
    })?;
    parse_config(&config_path, &content)
}

fn parse_config(path: &Path, content: &str) -> Result<GuardConfig> {
    toml::from_str::<GuardConfig>(content).map_err(|err| GuardError::ConfigMalformed {
        path: path.to_path_buf(),
        details: err.to_string(),
    })
}

fn default_true() -> bool {
    true
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_join_timeout_ms() -> u64 {
    2_000
}

fn default_max_consecutive_failures() -> u32 {
    DEFAULT_MAX_CONSECUTIVE_FAILURES
}

fn default_wait_poll_ms() -> u64 {
    100
}

fn default_alarm_stop_grace_ms() -> u64 {
    1_500
}

fn default_retry_delay_ms() -> u64 {
    500
}

fn default_immediate_failure_window_ms() -> u64 {
    1_000
}

fn default_volume_timeout_ms() -> u64 {
    3_000
}

fn default_fallback_timeout_ms() -> u64 {
    10_000
}

fn default_inhibitor_stop_grace_ms() -> u64 {
    5_000
}

fn default_probe_timeout_ms() -> u64 {
    1_000
}

fn default_acpi_path() -> PathBuf {
    PathBuf::from("/proc/acpi/button/lid/LID0/state")
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|part| part.to_string()).collect()
}

#[cfg(target_os = "macos")]
fn default_sound_path() -> PathBuf {
    PathBuf::from("/System/Library/Sounds/Sosumi.aiff")
}

#[cfg(not(target_os = "macos"))]
fn default_sound_path() -> PathBuf {
    PathBuf::from("/usr/share/sounds/freedesktop/stereo/alarm-clock-elapsed.oga")
}

#[cfg(target_os = "macos")]
fn default_player() -> String {
    "afplay".to_string()
}

#[cfg(not(target_os = "macos"))]
fn default_player() -> String {
    "paplay".to_string()
}

#[cfg(target_os = "macos")]
fn default_volume_command() -> Vec<String> {
    argv(&["osascript", "-e", "set volume output volume 100 without output muted"])
}

#[cfg(not(target_os = "macos"))]
fn default_volume_command() -> Vec<String> {
    argv(&["pactl", "set-sink-volume", "@DEFAULT_SINK@", "100%"])
}

#[cfg(target_os = "macos")]
fn default_tone_command() -> Vec<String> {
    argv(&["osascript", "-e", "beep 3"])
}

#[cfg(not(target_os = "macos"))]
fn default_tone_command() -> Vec<String> {
    argv(&["paplay", "/usr/share/sounds/freedesktop/stereo/bell.oga"])
}

#[cfg(target_os = "macos")]
fn default_speech_command() -> Vec<String> {
    argv(&["say", "Alarm. This computer is protected."])
}

#[cfg(not(target_os = "macos"))]
fn default_speech_command() -> Vec<String> {
    argv(&["spd-say", "Alarm. This computer is protected."])
}

#[cfg(target_os = "macos")]
fn default_inhibitor_command() -> Vec<String> {
    argv(&["caffeinate", "-d", "-i"])
}

#[cfg(not(target_os = "macos"))]
fn default_inhibitor_command() -> Vec<String> {
    argv(&[
        "systemd-inhibit",
        "--what=sleep:handle-lid-switch",
        "--who=lidguard",
        "--why=Lid alarm armed",
        "sleep",
        "infinity",
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = parse_config(Path::new("config.toml"), "").expect("parse");
        assert_eq!(config.monitor.poll_interval_ms, DEFAULT_POLL_INTERVAL_MS);
        assert_eq!(
            config.alarm.max_consecutive_failures,
            DEFAULT_MAX_CONSECUTIVE_FAILURES
        );
        assert_eq!(config.inhibitor.stop_grace_ms, 5_000);
        assert!(config.audio.enable_tone);
        assert!(!config.inhibitor.command.is_empty());
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let raw = r#"
[alarm]
max_consecutive_failures = 3

[audio]
sound_path = "/tmp/siren.wav"
enable_speech = false

[probe]
kind = "acpi"
acpi_path = "/tmp/lid"
"#;
        let config = parse_config(Path::new("config.toml"), raw).expect("parse");
        assert_eq!(config.alarm.max_consecutive_failures, 3);
        assert_eq!(config.alarm.wait_poll_ms, 100);
        assert_eq!(config.audio.sound_path, PathBuf::from("/tmp/siren.wav"));
        assert!(!config.audio.enable_speech);
        assert!(config.audio.enable_tone);
        assert_eq!(config.probe.kind, ProbeKind::Acpi);
        assert_eq!(config.probe.acpi_path, PathBuf::from("/tmp/lid"));
        assert_eq!(config.probe.timeout_ms, 1_000);
    }

    #[test]
    fn malformed_config_is_reported() {
        let err = parse_config(Path::new("config.toml"), "[alarm\nbroken")
            .expect_err("malformed");
        assert!(matches!(err, GuardError::ConfigMalformed { .. }));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = load_config(Some(dir.path().join("absent.toml"))).expect("load");
        assert_eq!(config.monitor.poll_interval_ms, DEFAULT_POLL_INTERVAL_MS);
    }

    #[test]
    fn load_reads_file_from_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[monitor]\npoll_interval_ms = 250\n").expect("write");
        let config = load_config(Some(path)).expect("load");
        assert_eq!(config.monitor.poll_interval(), Duration::from_millis(250));
    }
}
