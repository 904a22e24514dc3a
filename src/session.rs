use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::buffer::OutputBuffer;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::pty::{ProcessBackend, ProcessHandle, ProcessObserver, PtyError, SpawnRequest};
use crate::shell::{ShellTable, TerminalType};

/// Returns true for POSIX absolute paths, drive paths (`C:\x`, `C:/x`) and
/// UNC paths (`\\server\share`), regardless of the host platform.
pub fn is_absolute_dir(path: &str) -> bool {
    let bytes = path.as_bytes();
    let drive = bytes.len() >= 3
        && bytes[0].is_ascii_alphabetic()
        && bytes[1] == b':'
        && (bytes[2] == b'\\' || bytes[2] == b'/');
    drive || path.starts_with(r"\\") || Path::new(path).is_absolute()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Closed,
}

#[derive(Debug)]
struct Lifecycle {
    status: SessionStatus,
    exit_code: Option<i32>,
    closed_at: Option<DateTime<Utc>>,
}

/// Server-level session lifecycle events.
///
/// Published on a broadcast channel; a slow or absent listener only loses
/// events, it never holds up the engine.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    SessionCreated {
        session_id: String,
        terminal_type: TerminalType,
        working_directory: PathBuf,
    },
    OutputReceived { session_id: String, lines: Vec<String> },
    SessionClosed { session_id: String, exit_code: Option<i32> },
    SessionRemoved { session_id: String },
    ErrorOccurred { session_id: Option<String>, context: String },
}

/// The part of a session the process adapter writes into.
///
/// Holds everything except the process handle, so it can be handed to the
/// backend as the process observer before the handle exists.
struct SessionCore {
    id: String,
    buffer: OutputBuffer,
    lifecycle: Mutex<Lifecycle>,
    last_activity: Mutex<DateTime<Utc>>,
    /// Cancelled exactly once, on the Active -> Closed transition.
    closed: CancellationToken,
    events_tx: broadcast::Sender<EngineEvent>,
}

impl SessionCore {
    fn touch(&self) {
        *self.last_activity.lock() = Utc::now();
    }

    /// Perform the Active -> Closed transition. Returns false if the session
    /// was already closed, in which case nothing changes.
    fn mark_closed(&self, exit_code: Option<i32>) -> bool {
        {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.status == SessionStatus::Closed {
                return false;
            }
            lifecycle.status = SessionStatus::Closed;
            lifecycle.exit_code = exit_code;
            lifecycle.closed_at = Some(Utc::now());
        }
        self.closed.cancel();
        let _ = self.events_tx.send(EngineEvent::SessionClosed {
            session_id: self.id.clone(),
            exit_code,
        });
        true
    }
}

impl ProcessObserver for SessionCore {
    fn on_data(&self, chunk: &str) {
        let lines = self.buffer.push_chunk(chunk);
        if lines.is_empty() {
            return;
        }
        self.touch();
        let _ = self.events_tx.send(EngineEvent::OutputReceived {
            session_id: self.id.clone(),
            lines,
        });
    }

    fn on_exit(&self, exit_code: Option<i32>) {
        if self.mark_closed(exit_code) {
            tracing::info!(session = %self.id, ?exit_code, "session shell exited");
        }
    }
}

/// Serializable view of a session, as returned by list and read.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub terminal_type: TerminalType,
    pub working_directory: PathBuf,
    pub status: SessionStatus,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub output_line_count: usize,
}

/// One shell process plus its buffered output and metadata.
///
/// Cheap to clone; clones share the same process and buffer. Only the
/// session can write to or kill its process.
#[derive(Clone)]
pub struct Session {
    pub id: String,
    pub terminal_type: TerminalType,
    pub working_directory: PathBuf,
    pub created_at: DateTime<Utc>,
    pub pid: Option<u32>,
    core: Arc<SessionCore>,
    process: Arc<dyn ProcessHandle>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("terminal_type", &self.terminal_type)
            .field("pid", &self.pid)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn status(&self) -> SessionStatus {
        self.core.lifecycle.lock().status
    }

    pub fn is_active(&self) -> bool {
        self.status() == SessionStatus::Active
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.core.lifecycle.lock().exit_code
    }

    pub fn closed_at(&self) -> Option<DateTime<Utc>> {
        self.core.lifecycle.lock().closed_at
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        *self.core.last_activity.lock()
    }

    pub fn output(&self) -> &OutputBuffer {
        &self.core.buffer
    }

    /// Token cancelled when the session transitions to Closed.
    pub fn closed_token(&self) -> CancellationToken {
        self.core.closed.clone()
    }

    /// Send raw input to the shell.
    ///
    /// Fails with `SessionClosed` once the session is closed or the process
    /// input has gone away, and with `InputRejected` while the session is
    /// alive but cannot take more input. Input is never silently dropped.
    pub fn write(&self, data: impl Into<Bytes>) -> Result<(), EngineError> {
        if !self.is_active() {
            return Err(EngineError::SessionClosed(self.id.clone()));
        }
        match self.process.write(data.into()) {
            Ok(()) => {
                self.core.touch();
                Ok(())
            }
            Err(PtyError::Closed) => Err(EngineError::SessionClosed(self.id.clone())),
            Err(e) => {
                let _ = self.core.events_tx.send(EngineEvent::ErrorOccurred {
                    session_id: Some(self.id.clone()),
                    context: format!("write failed: {e}"),
                });
                Err(EngineError::InputRejected {
                    id: self.id.clone(),
                    source: e,
                })
            }
        }
    }

    /// Kill the process and mark the session closed.
    ///
    /// A session that is already closed is left alone. If the kill itself
    /// fails the session stays Active and the error is returned.
    pub fn close(&self) -> Result<(), PtyError> {
        if !self.is_active() {
            return Ok(());
        }
        self.process.kill()?;
        if self.core.mark_closed(None) {
            tracing::info!(session = %self.id, "session closed");
        }
        Ok(())
    }

    /// Kill without letting a kill failure keep the session alive.
    ///
    /// Used when the session is being evicted no matter what; a process that
    /// is already gone is the expected failure here.
    pub fn force_close(&self) {
        if !self.is_active() {
            return;
        }
        if let Err(e) = self.process.kill() {
            tracing::debug!(session = %self.id, ?e, "kill failed during eviction");
        }
        self.core.mark_closed(None);
    }

    /// Mark closed after the process exited. Used by the process adapter
    /// path and by tests driving a fake backend.
    pub fn handle_exit(&self, exit_code: Option<i32>) {
        self.core.on_exit(exit_code);
    }

    pub fn info(&self) -> SessionInfo {
        let (status, exit_code) = {
            let lifecycle = self.core.lifecycle.lock();
            (lifecycle.status, lifecycle.exit_code)
        };
        SessionInfo {
            id: self.id.clone(),
            terminal_type: self.terminal_type,
            working_directory: self.working_directory.clone(),
            status,
            pid: self.pid,
            exit_code,
            created_at: self.created_at,
            last_activity: self.last_activity(),
            output_line_count: self.core.buffer.len(),
        }
    }
}

struct RegistryInner {
    sessions: HashMap<String, Session>,
    /// Ids that were registered at some point. Never handed out again.
    used_ids: HashSet<String>,
}

/// Manages all sessions by id.
///
/// Structural changes (insert/remove) take the write lock; lookups and
/// listing take the read lock and hand out clones, so per-session work never
/// holds the registry lock.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RwLock<RegistryInner>>,
    events_tx: broadcast::Sender<EngineEvent>,
    backend: Arc<dyn ProcessBackend>,
    shells: Arc<ShellTable>,
    config: Arc<EngineConfig>,
}

impl SessionRegistry {
    const EVENT_CAPACITY: usize = 256;

    pub fn new(
        backend: Arc<dyn ProcessBackend>,
        shells: ShellTable,
        config: Arc<EngineConfig>,
    ) -> Self {
        let (events_tx, _) = broadcast::channel(Self::EVENT_CAPACITY);
        Self {
            inner: Arc::new(RwLock::new(RegistryInner {
                sessions: HashMap::new(),
                used_ids: HashSet::new(),
            })),
            events_tx,
            backend,
            shells: Arc::new(shells),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Spawn a shell and register a new session for it.
    ///
    /// Blocks for the duration of the fork/exec; async callers should run it
    /// on the blocking pool. Must be called within a tokio runtime.
    ///
    /// If `id` is given it must be non-empty and never used before; otherwise
    /// a UUIDv4 is assigned. Nothing is registered if the spawn fails.
    pub fn create(
        &self,
        terminal_type: TerminalType,
        working_directory: &str,
        id: Option<String>,
    ) -> Result<Session, EngineError> {
        if !is_absolute_dir(working_directory) {
            return Err(EngineError::InvalidArgument(format!(
                "working directory must be an absolute path: {working_directory}"
            )));
        }
        let id = match id {
            Some(id) => {
                self.check_id_available(&id)?;
                id
            }
            None => uuid::Uuid::new_v4().to_string(),
        };

        let core = Arc::new(SessionCore {
            id: id.clone(),
            buffer: OutputBuffer::new(self.config.max_output_lines),
            lifecycle: Mutex::new(Lifecycle {
                status: SessionStatus::Active,
                exit_code: None,
                closed_at: None,
            }),
            last_activity: Mutex::new(Utc::now()),
            closed: CancellationToken::new(),
            events_tx: self.events_tx.clone(),
        });

        let shell = self.shells.get(terminal_type);
        let request = SpawnRequest {
            program: shell.program.clone(),
            args: shell.args.clone(),
            cwd: PathBuf::from(working_directory),
            rows: self.config.rows,
            cols: self.config.cols,
        };
        let process = self
            .backend
            .spawn(request, core.clone())
            .map_err(|e| {
                let _ = self.events_tx.send(EngineEvent::ErrorOccurred {
                    session_id: None,
                    context: format!("spawn {terminal_type} in {working_directory}: {e}"),
                });
                EngineError::SpawnFailed(e)
            })?;

        let session = Session {
            id: id.clone(),
            terminal_type,
            working_directory: PathBuf::from(working_directory),
            created_at: Utc::now(),
            pid: process.pid(),
            core,
            process: Arc::from(process),
        };

        // Authoritative uniqueness check, under the write lock.
        {
            let mut inner = self.inner.write();
            if !inner.used_ids.insert(id.clone()) {
                drop(inner);
                let _ = session.close();
                return Err(EngineError::InvalidArgument(format!(
                    "session id already used: {id}"
                )));
            }
            inner.sessions.insert(id.clone(), session.clone());
        }

        tracing::info!(
            session = %id,
            terminal = %terminal_type,
            cwd = %working_directory,
            pid = ?session.pid,
            "session created"
        );
        let _ = self.events_tx.send(EngineEvent::SessionCreated {
            session_id: id,
            terminal_type,
            working_directory: session.working_directory.clone(),
        });

        self.monitor_close(&session);
        Ok(session)
    }

    fn check_id_available(&self, id: &str) -> Result<(), EngineError> {
        if id.trim().is_empty() {
            return Err(EngineError::InvalidArgument("session id must not be empty".into()));
        }
        if self.inner.read().used_ids.contains(id) {
            return Err(EngineError::InvalidArgument(format!("session id already used: {id}")));
        }
        Ok(())
    }

    /// Remove the session from the registry once it closes, after the grace
    /// delay, so a final read can still see its output.
    fn monitor_close(&self, session: &Session) {
        let registry = self.clone();
        let id = session.id.clone();
        let closed = session.closed_token();
        let grace = self.config.close_grace();
        tokio::spawn(async move {
            closed.cancelled().await;
            tokio::time::sleep(grace).await;
            if registry.remove(&id).is_some() {
                tracing::debug!(session = %id, "closed session removed after grace delay");
            }
        });
    }

    /// Look up a session by id, returning a clone if found.
    pub fn get(&self, id: &str) -> Result<Session, EngineError> {
        self.inner
            .read()
            .sessions
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(id.to_string()))
    }

    /// Snapshot of all registered sessions.
    pub fn sessions(&self) -> Vec<Session> {
        self.inner.read().sessions.values().cloned().collect()
    }

    /// Info for every session, oldest first.
    pub fn list_all(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self.sessions().iter().map(Session::info).collect();
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        infos
    }

    /// Remove a session, returning it if it was registered.
    ///
    /// Only closed sessions are removed; an active session stays registered
    /// and `None` is returned.
    pub fn remove(&self, id: &str) -> Option<Session> {
        let removed = {
            let mut inner = self.inner.write();
            match inner.sessions.get(id) {
                Some(session) if !session.is_active() => inner.sessions.remove(id),
                _ => None,
            }
        };
        if removed.is_some() {
            let _ = self.events_tx.send(EngineEvent::SessionRemoved {
                session_id: id.to_string(),
            });
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.inner.read().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Subscribe to session lifecycle events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.events_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absolute_dir_accepts_drive_unc_and_posix_paths() {
        assert!(is_absolute_dir(r"C:\Users\test"));
        assert!(is_absolute_dir("d:/work"));
        assert!(is_absolute_dir(r"\\server\share\dir"));
        #[cfg(unix)]
        assert!(is_absolute_dir("/home/test"));
    }

    #[test]
    fn absolute_dir_rejects_relative_paths() {
        assert!(!is_absolute_dir(r"Users\test"));
        assert!(!is_absolute_dir("C:"));
        assert!(!is_absolute_dir("C:relative"));
        assert!(!is_absolute_dir(""));
        assert!(!is_absolute_dir("./here"));
    }

    fn core(id: &str) -> (Arc<SessionCore>, broadcast::Receiver<EngineEvent>) {
        let (events_tx, rx) = broadcast::channel(16);
        let core = Arc::new(SessionCore {
            id: id.to_string(),
            buffer: OutputBuffer::new(10),
            lifecycle: Mutex::new(Lifecycle {
                status: SessionStatus::Active,
                exit_code: None,
                closed_at: None,
            }),
            last_activity: Mutex::new(Utc::now()),
            closed: CancellationToken::new(),
            events_tx,
        });
        (core, rx)
    }

    #[test]
    fn mark_closed_transitions_once() {
        let (core, mut rx) = core("s");
        assert!(core.mark_closed(Some(3)));
        assert!(!core.mark_closed(Some(9)));
        assert!(!core.mark_closed(None));

        let lifecycle = core.lifecycle.lock();
        assert_eq!(lifecycle.status, SessionStatus::Closed);
        assert_eq!(lifecycle.exit_code, Some(3));
        drop(lifecycle);
        assert!(core.closed.is_cancelled());

        // Exactly one SessionClosed event.
        assert!(matches!(
            rx.try_recv(),
            Ok(EngineEvent::SessionClosed { exit_code: Some(3), .. })
        ));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn on_data_buffers_and_publishes() {
        let (core, mut rx) = core("s");
        let before = *core.last_activity.lock();
        std::thread::sleep(std::time::Duration::from_millis(5));
        core.on_data("hello\r\nPS C:\\> ");

        assert_eq!(core.buffer.snapshot(), vec!["hello", "PS C:\\> "]);
        assert!(*core.last_activity.lock() > before);
        match rx.try_recv() {
            Ok(EngineEvent::OutputReceived { session_id, lines }) => {
                assert_eq!(session_id, "s");
                assert_eq!(lines, vec!["hello", "PS C:\\> "]);
            }
            other => panic!("expected OutputReceived, got {other:?}"),
        }
    }
}
