use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::ShellConfig;

/// The kind of shell a session runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum TerminalType {
    #[serde(alias = "PowerShell", alias = "pwsh")]
    PowerShell,
    #[serde(alias = "CMD", alias = "Cmd")]
    Cmd,
}

impl std::fmt::Display for TerminalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TerminalType::PowerShell => write!(f, "powershell"),
            TerminalType::Cmd => write!(f, "cmd"),
        }
    }
}

impl std::str::FromStr for TerminalType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "powershell" | "pwsh" => Ok(TerminalType::PowerShell),
            "cmd" => Ok(TerminalType::Cmd),
            other => Err(format!("unknown terminal type: {other}")),
        }
    }
}

/// Executable and arguments for one terminal type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
}

/// Terminal type to shell executable mapping, resolved once at startup.
#[derive(Debug, Clone)]
pub struct ShellTable {
    powershell: ShellSpec,
    cmd: ShellSpec,
}

impl ShellTable {
    /// Resolve shell paths from config, probing PowerShell candidates in order.
    ///
    /// Resolution never fails: if nothing is found, the last candidate is used
    /// as-is and a missing shell surfaces later as a spawn error.
    pub fn resolve(config: &ShellConfig) -> Self {
        let powershell = match &config.powershell {
            Some(path) => path.clone(),
            None => probe_candidates(&config.powershell_candidates)
                .unwrap_or_else(|| {
                    let fallback = config
                        .powershell_candidates
                        .last()
                        .cloned()
                        .unwrap_or_else(|| "powershell.exe".to_string());
                    tracing::warn!(%fallback, "no PowerShell candidate found, using fallback");
                    PathBuf::from(fallback)
                }),
        };
        let cmd = config.cmd.clone().unwrap_or_else(|| {
            std::env::var_os("COMSPEC")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("cmd.exe"))
        });

        tracing::info!(
            powershell = %powershell.display(),
            cmd = %cmd.display(),
            "resolved shell executables"
        );

        Self::new(powershell, cmd)
    }

    /// Build a table from explicit executables.
    pub fn new(powershell: impl Into<PathBuf>, cmd: impl Into<PathBuf>) -> Self {
        Self {
            powershell: ShellSpec {
                program: powershell.into(),
                args: vec!["-NoLogo".to_string()],
            },
            cmd: ShellSpec {
                program: cmd.into(),
                args: Vec::new(),
            },
        }
    }

    pub fn get(&self, terminal: TerminalType) -> &ShellSpec {
        match terminal {
            TerminalType::PowerShell => &self.powershell,
            TerminalType::Cmd => &self.cmd,
        }
    }
}

/// First candidate that exists: path-like candidates are checked on disk,
/// bare names are looked up on `PATH`.
fn probe_candidates(candidates: &[String]) -> Option<PathBuf> {
    candidates.iter().find_map(|candidate| {
        let path = Path::new(candidate);
        if path.components().count() > 1 || path.is_absolute() {
            path.is_file().then(|| path.to_path_buf())
        } else {
            which::which(candidate).ok()
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_type_parses_case_insensitively() {
        assert_eq!("PowerShell".parse::<TerminalType>(), Ok(TerminalType::PowerShell));
        assert_eq!("cmd".parse::<TerminalType>(), Ok(TerminalType::Cmd));
        assert!("bash".parse::<TerminalType>().is_err());
    }

    #[test]
    fn terminal_type_deserializes_aliases() {
        let t: TerminalType = serde_json::from_str("\"PowerShell\"").unwrap();
        assert_eq!(t, TerminalType::PowerShell);
        let t: TerminalType = serde_json::from_str("\"cmd\"").unwrap();
        assert_eq!(t, TerminalType::Cmd);
        assert!(serde_json::from_str::<TerminalType>("\"zsh\"").is_err());
    }

    #[test]
    fn explicit_paths_win() {
        let config = ShellConfig {
            powershell: Some(PathBuf::from("/opt/pwsh/pwsh")),
            powershell_candidates: vec!["nothing-here".into()],
            cmd: Some(PathBuf::from("/custom/cmd")),
        };
        let table = ShellTable::resolve(&config);
        assert_eq!(table.get(TerminalType::PowerShell).program, PathBuf::from("/opt/pwsh/pwsh"));
        assert_eq!(table.get(TerminalType::PowerShell).args, vec!["-NoLogo"]);
        assert_eq!(table.get(TerminalType::Cmd).program, PathBuf::from("/custom/cmd"));
        assert!(table.get(TerminalType::Cmd).args.is_empty());
    }

    #[test]
    fn probing_takes_first_existing_candidate() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("fake-pwsh");
        std::fs::write(&present, "").unwrap();
        let candidates = vec![
            dir.path().join("missing").display().to_string(),
            present.display().to_string(),
        ];
        assert_eq!(probe_candidates(&candidates), Some(present));
    }

    #[test]
    fn unresolvable_candidates_fall_back_to_last() {
        let config = ShellConfig {
            powershell: None,
            powershell_candidates: vec![
                "/no/such/pwsh".into(),
                "aiterm-no-such-shell-binary".into(),
            ],
            cmd: None,
        };
        let table = ShellTable::resolve(&config);
        assert_eq!(
            table.get(TerminalType::PowerShell).program,
            PathBuf::from("aiterm-no-such-shell-binary")
        );
    }
}
