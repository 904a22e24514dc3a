use crate::pty::PtyError;

/// Errors returned by engine operations.
///
/// Every variant is local to the call that produced it. A failing session
/// never poisons the registry or other sessions.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Missing or malformed input (relative working directory, empty
    /// command, reused session id, zero timeout).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// No session with this id is registered (it may already have been reaped).
    #[error("session not found: {0}")]
    NotFound(String),

    /// The session's process has exited or was closed.
    #[error("session closed: {0}")]
    SessionClosed(String),

    /// The OS could not create the pty or the shell process.
    #[error("failed to spawn shell: {0}")]
    SpawnFailed(#[source] PtyError),

    /// No prompt was observed before the deadline.
    #[error("command did not complete within {timeout_ms}ms")]
    TimedOut { timeout_ms: u64 },

    /// The process did not accept the input (its input queue is full).
    /// The session stays Active and the write can be retried.
    #[error("input rejected by session {id}: {source}")]
    InputRejected {
        id: String,
        #[source]
        source: PtyError,
    },

    /// An explicit close could not kill the process. The session stays Active.
    #[error("failed to close session {id}: {source}")]
    KillFailed {
        id: String,
        #[source]
        source: PtyError,
    },
}

impl EngineError {
    /// Returns a machine-readable error code string.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::InvalidArgument(_) => "invalid_argument",
            EngineError::NotFound(_) => "not_found",
            EngineError::SessionClosed(_) => "session_closed",
            EngineError::SpawnFailed(_) => "spawn_failed",
            EngineError::TimedOut { .. } => "timed_out",
            EngineError::InputRejected { .. } => "input_rejected",
            EngineError::KillFailed { .. } => "kill_failed",
        }
    }
}
