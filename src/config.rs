use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::shell::TerminalType;

/// Engine configuration, loaded from TOML. Every field has a default, so an
/// empty file (or no file at all) yields a working configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Terminal type used when a create request does not name one.
    pub default_terminal: TerminalType,
    /// Command timeout when the caller does not pass one.
    pub default_timeout_ms: u64,
    /// Upper bound applied to caller-supplied timeouts.
    pub max_timeout_ms: u64,
    /// Lines retained per session.
    pub max_output_lines: usize,
    /// Sessions idle for longer than this are reaped.
    pub session_timeout_secs: u64,
    /// Period of the reaper sweep.
    pub reaper_interval_secs: u64,
    /// How long a closed session stays readable before it is removed.
    pub close_grace_ms: u64,
    pub cols: u16,
    pub rows: u16,
    /// Delay between writing a command and the first completion poll.
    pub settle_delay_ms: u64,
    pub poll_interval_ms: u64,
    /// Consecutive unchanged polls required before prompt matching.
    pub stable_polls: u32,
    pub shells: ShellConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_terminal: TerminalType::PowerShell,
            default_timeout_ms: 5_000,
            max_timeout_ms: 300_000,
            max_output_lines: crate::buffer::DEFAULT_MAX_LINES,
            session_timeout_secs: 3_600,
            reaper_interval_secs: 600,
            close_grace_ms: 5_000,
            cols: 120,
            rows: 30,
            settle_delay_ms: 100,
            poll_interval_ms: 50,
            stable_polls: 1,
            shells: ShellConfig::default(),
        }
    }
}

/// Shell executable settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShellConfig {
    /// Explicit PowerShell executable. Skips probing when set.
    pub powershell: Option<PathBuf>,
    /// Probed in order when `powershell` is unset.
    pub powershell_candidates: Vec<String>,
    /// Explicit command processor. Defaults to `%COMSPEC%`, then `cmd.exe`.
    pub cmd: Option<PathBuf>,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            powershell: None,
            powershell_candidates: vec![
                "pwsh".to_string(),
                r"C:\Program Files\PowerShell\7\pwsh.exe".to_string(),
                r"C:\Windows\System32\WindowsPowerShell\v1.0\powershell.exe".to_string(),
                "powershell.exe".to_string(),
            ],
            cmd: None,
        }
    }
}

impl EngineConfig {
    /// Load config from a TOML file path. Returns None if file doesn't exist.
    pub fn load(path: &std::path::Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        config.validate()?;
        Ok(Some(config))
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks: [(&str, bool); 6] = [
            ("max_output_lines", self.max_output_lines > 0),
            ("poll_interval_ms", self.poll_interval_ms > 0),
            ("reaper_interval_secs", self.reaper_interval_secs > 0),
            ("default_timeout_ms", self.default_timeout_ms > 0),
            ("cols", self.cols > 0),
            ("rows", self.rows > 0),
        ];
        if let Some((field, _)) = checks.iter().find(|(_, ok)| !ok) {
            return Err(ConfigError::Invalid(format!("{field} must be greater than zero")));
        }
        if self.default_timeout_ms > self.max_timeout_ms {
            return Err(ConfigError::Invalid(format!(
                "default_timeout_ms ({}) exceeds max_timeout_ms ({})",
                self.default_timeout_ms, self.max_timeout_ms
            )));
        }
        Ok(())
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }
}

/// Default location of the config file: `<config_dir>/aiterm/config.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("aiterm").join("config.toml"))
}

/// Errors that can occur when loading config.
#[derive(Debug)]
pub enum ConfigError {
    ReadFailed(PathBuf, std::io::Error),
    ParseFailed(PathBuf, toml::de::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadFailed(path, e) => {
                write!(f, "Failed to read config {}: {}", path.display(), e)
            }
            Self::ParseFailed(path, e) => {
                write!(f, "Failed to parse config {}: {}", path.display(), e)
            }
            Self::Invalid(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}
