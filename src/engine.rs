//! The operations callers invoke: create+execute, write, read, list, close.
//!
//! `Engine` owns the registry and hands it to the detector and the reaper;
//! the RPC layer only ever talks to this type.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::detector::{self, PollSettings};
use crate::error::EngineError;
use crate::pty::{ProcessBackend, PtyError};
use crate::reaper::Reaper;
use crate::session::{EngineEvent, Session, SessionInfo, SessionRegistry};
use crate::shell::{ShellTable, TerminalType};

/// Result of a successful create+execute.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    pub session_id: String,
    pub command: String,
    pub output: Vec<String>,
}

/// A failed create+execute.
///
/// If the session was created before the failure (a timeout, or the shell
/// exiting during startup or mid-command) its id and the output captured so far are kept, so
/// the caller can still `read` the session later.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct ExecuteFailure {
    pub session_id: Option<String>,
    pub output: Vec<String>,
    #[source]
    pub error: EngineError,
}

impl From<EngineError> for ExecuteFailure {
    fn from(error: EngineError) -> Self {
        Self {
            session_id: None,
            output: Vec::new(),
            error,
        }
    }
}

/// Buffered output plus metadata, as returned by `read`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionOutput {
    pub output: Vec<String>,
    pub session: SessionInfo,
}

/// Outcome of closing one session during `close_all`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseDetail {
    pub session_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Summary of `close_all`. A partial failure is reported here, never raised.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseAllReport {
    pub success: bool,
    pub total_closed: usize,
    pub total_failed: usize,
    pub details: Vec<CloseDetail>,
}

pub struct Engine {
    registry: SessionRegistry,
    config: Arc<EngineConfig>,
    poll: PollSettings,
}

impl Engine {
    pub fn new(backend: Arc<dyn ProcessBackend>, shells: ShellTable, config: EngineConfig) -> Self {
        let config = Arc::new(config);
        Self {
            registry: SessionRegistry::new(backend, shells, config.clone()),
            poll: PollSettings::from_config(&config),
            config,
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Caller timeout in milliseconds, defaulted and clamped to the
    /// configured maximum. Zero is rejected.
    pub fn resolve_timeout(&self, timeout_ms: Option<u64>) -> Result<Duration, EngineError> {
        let ms = timeout_ms.unwrap_or(self.config.default_timeout_ms);
        if ms == 0 {
            return Err(EngineError::InvalidArgument("timeout must be greater than zero".into()));
        }
        Ok(Duration::from_millis(ms.min(self.config.max_timeout_ms)))
    }

    /// Spawn a shell and wait (up to `ready_timeout`) for its first prompt.
    ///
    /// A shell that never shows a recognizable prompt is still returned; a
    /// shell that exits during startup is reported as `SessionClosed`.
    pub async fn create_session(
        &self,
        terminal: Option<TerminalType>,
        working_directory: &str,
        ready_timeout: Duration,
    ) -> Result<Session, EngineError> {
        let session = self.spawn_session(terminal, working_directory).await?;
        self.await_ready(&session, ready_timeout).await?;
        Ok(session)
    }

    async fn spawn_session(
        &self,
        terminal: Option<TerminalType>,
        working_directory: &str,
    ) -> Result<Session, EngineError> {
        let terminal = terminal.unwrap_or(self.config.default_terminal);
        let registry = self.registry.clone();
        let cwd = working_directory.to_string();
        // Spawning forks and execs; run it on the blocking pool.
        tokio::task::spawn_blocking(move || registry.create(terminal, &cwd, None))
            .await
            .map_err(|e| {
                EngineError::SpawnFailed(PtyError::SpawnCommand(anyhow::anyhow!("spawn task failed: {e}")))
            })?
    }

    /// Wait for the first prompt. Not seeing one in time is only logged.
    async fn await_ready(&self, session: &Session, timeout: Duration) -> Result<(), EngineError> {
        match detector::wait_for_ready(session, timeout, &self.poll).await {
            Ok(()) => Ok(()),
            Err(EngineError::TimedOut { timeout_ms }) => {
                tracing::warn!(session = %session.id, timeout_ms, "no prompt seen after startup");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Run `command` in an existing session and return its output lines.
    pub async fn execute(
        &self,
        id: &str,
        command: &str,
        timeout_ms: Option<u64>,
    ) -> Result<Vec<String>, EngineError> {
        let timeout = self.resolve_timeout(timeout_ms)?;
        let session = self.registry.get(id)?;
        detector::execute_and_wait(&session, command, timeout, &self.poll).await
    }

    /// Create a new session and run `command` in it.
    pub async fn create_and_execute(
        &self,
        terminal: Option<TerminalType>,
        working_directory: &str,
        command: &str,
        timeout_ms: Option<u64>,
    ) -> Result<Execution, ExecuteFailure> {
        if command.trim().is_empty() {
            return Err(EngineError::InvalidArgument("command must not be empty".into()).into());
        }
        let timeout = self.resolve_timeout(timeout_ms)?;
        // One deadline covers both the startup wait and the command.
        let deadline = Instant::now() + timeout;
        let session = self.spawn_session(terminal, working_directory).await?;

        let ready_within = deadline.saturating_duration_since(Instant::now());
        let result = match self.await_ready(&session, ready_within).await {
            Ok(()) => match deadline.checked_duration_since(Instant::now()) {
                Some(remaining) if !remaining.is_zero() => {
                    detector::execute_and_wait(&session, command, remaining, &self.poll).await
                }
                _ => Err(EngineError::TimedOut { timeout_ms: 0 }),
            },
            Err(e) => Err(e),
        };

        match result {
            Ok(output) => Ok(Execution {
                session_id: session.id.clone(),
                command: command.to_string(),
                output,
            }),
            Err(error) => {
                let error = match error {
                    EngineError::TimedOut { .. } => EngineError::TimedOut {
                        timeout_ms: timeout.as_millis() as u64,
                    },
                    other => other,
                };
                tracing::debug!(session = %session.id, %error, "command did not complete");
                Err(ExecuteFailure {
                    session_id: Some(session.id.clone()),
                    output: session.output().snapshot(),
                    error,
                })
            }
        }
    }

    /// Send raw input. With `add_newline` the input is submitted (Enter is
    /// appended); without it the input is only typed. Returns the input.
    pub fn write(&self, id: &str, input: &str, add_newline: bool) -> Result<String, EngineError> {
        let session = self.registry.get(id)?;
        let data = if add_newline {
            format!("{input}\r")
        } else {
            input.to_string()
        };
        session.write(data)?;
        tracing::debug!(session = %id, bytes = input.len(), add_newline, "input written");
        Ok(input.to_string())
    }

    /// Snapshot of a session's buffered output. Never blocks on the shell.
    pub fn read(&self, id: &str) -> Result<SessionOutput, EngineError> {
        let session = self.registry.get(id)?;
        Ok(SessionOutput {
            output: session.output().snapshot(),
            session: session.info(),
        })
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        self.registry.list_all()
    }

    /// Close one session. Closing an already-closed session succeeds.
    pub fn close(&self, id: &str) -> Result<SessionInfo, EngineError> {
        let session = self.registry.get(id)?;
        session.close().map_err(|source| EngineError::KillFailed {
            id: id.to_string(),
            source,
        })?;
        Ok(session.info())
    }

    /// Close every active session, best effort.
    pub fn close_all(&self) -> CloseAllReport {
        let mut details = Vec::new();
        for session in self.registry.sessions().into_iter().filter(Session::is_active) {
            let detail = match session.close() {
                Ok(()) => CloseDetail {
                    session_id: session.id.clone(),
                    success: true,
                    error: None,
                },
                Err(e) => {
                    tracing::warn!(session = %session.id, ?e, "failed to close session");
                    CloseDetail {
                        session_id: session.id.clone(),
                        success: false,
                        error: Some(e.to_string()),
                    }
                }
            };
            details.push(detail);
        }
        details.sort_by(|a, b| a.session_id.cmp(&b.session_id));

        let total_failed = details.iter().filter(|d| !d.success).count();
        let total_closed = details.len() - total_failed;
        tracing::info!(total_closed, total_failed, "closed all sessions");
        CloseAllReport {
            success: total_failed == 0,
            total_closed,
            total_failed,
            details,
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.registry.subscribe_events()
    }

    /// Start the periodic reaper. It stops when `shutdown` is cancelled.
    pub fn spawn_reaper(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        Reaper::from_config(self.registry.clone(), &self.config)
            .spawn(self.config.reaper_interval(), shutdown)
    }
}
