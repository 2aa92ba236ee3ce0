//! Lid position probes.
//!
//! A probe answers Open / Closed / Unknown. Unknown covers any inconclusive
//! query (command failed or hung, output unparseable) and is never treated
//! as a transition. `Err` is reserved for a sensor that cannot be queried at
//! all.

use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::config::{ProbeConfig, ProbeKind};
use crate::error::{GuardError, Result};
use crate::process::{capture_bounded, Captured, CommandSpec};

const CLAMSHELL_KEY: &str = "\"AppleClamshellState\"";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LidState {
    Open,
    Closed,
    Unknown,
}

pub trait LidProbe: Send + Sync {
    fn read(&self) -> Result<LidState>;
}

/// macOS: reads `AppleClamshellState` from the IO registry.
///
/// Each query is bounded by `timeout`; a hung `ioreg` reads as Unknown.
#[derive(Debug, Clone)]
pub struct IoregLidProbe {
    command: CommandSpec,
    timeout: Duration,
}

impl IoregLidProbe {
    pub fn new(timeout: Duration) -> Self {
        Self::with_command(
            CommandSpec::new("ioreg", ["-r", "-k", "AppleClamshellState", "-d", "4"]),
            timeout,
        )
    }

    pub fn with_command(command: CommandSpec, timeout: Duration) -> Self {
        Self { command, timeout }
    }
}

impl LidProbe for IoregLidProbe {
    fn read(&self) -> Result<LidState> {
        match capture_bounded(&self.command, self.timeout) {
            Ok(Captured::Exited {
                success: true,
                stdout,
            }) => Ok(parse_ioreg_clamshell(&stdout)),
            Ok(Captured::Exited { success: false, .. }) => Ok(LidState::Unknown),
            Ok(Captured::TimedOut) => {
                warn!(
                    command = %self.command,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Lid query timed out"
                );
                Ok(LidState::Unknown)
            }
            Err(GuardError::Spawn { source, .. }) if source.kind() == ErrorKind::NotFound => {
                Err(GuardError::ProbeUnavailable(format!(
                    "{} not found",
                    self.command.program
                )))
            }
            Err(_) => Ok(LidState::Unknown),
        }
    }
}

/// Linux: reads the ACPI lid button state file.
#[derive(Debug, Clone)]
pub struct AcpiLidProbe {
    path: PathBuf,
}

impl AcpiLidProbe {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl LidProbe for AcpiLidProbe {
    fn read(&self) -> Result<LidState> {
        match fs_err::read_to_string(&self.path) {
            Ok(content) => Ok(parse_acpi_lid(&content)),
            Err(err) if err.kind() == ErrorKind::NotFound => Err(GuardError::ProbeUnavailable(
                format!("{} does not exist", self.path.display()),
            )),
            Err(_) => Ok(LidState::Unknown),
        }
    }
}

/// Builds the probe selected by `config`.
pub fn probe_from_config(config: &ProbeConfig) -> Arc<dyn LidProbe> {
    match config.kind {
        ProbeKind::Ioreg => Arc::new(IoregLidProbe::new(config.timeout())),
        ProbeKind::Acpi => Arc::new(AcpiLidProbe::new(config.acpi_path.clone())),
    }
}

fn parse_ioreg_clamshell(output: &str) -> LidState {
    for line in output.lines() {
        let Some(index) = line.find(CLAMSHELL_KEY) else {
            continue;
        };
        let rest = &line[index + CLAMSHELL_KEY.len()..];
        let Some(value) = rest.split('=').nth(1).map(str::trim) else {
            continue;
        };
        return match value {
            "Yes" => LidState::Closed,
            "No" => LidState::Open,
            _ => LidState::Unknown,
        };
    }
    LidState::Unknown
}

fn parse_acpi_lid(content: &str) -> LidState {
    let value = content
        .split(':')
        .nth(1)
        .map(|value| value.trim().to_ascii_lowercase());
    match value.as_deref() {
        Some("open") => LidState::Open,
        Some("closed") => LidState::Closed,
        _ => LidState::Unknown,
    }
}
