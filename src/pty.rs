//! Process adapter: runs a shell inside a pseudo-terminal and streams its
//! output to an observer.
//!
//! The engine only talks to the [`ProcessBackend`] / [`ProcessHandle`] traits,
//! so tests can substitute a scripted fake for a real shell.

use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtyPair, PtySize};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Error, Debug)]
pub enum PtyError {
    #[error("failed to open pty: {0}")]
    OpenPty(#[source] anyhow::Error),

    #[error("failed to spawn command: {0}")]
    SpawnCommand(#[source] anyhow::Error),

    #[error("working directory does not exist: {0}")]
    InvalidDirectory(String),

    #[error("failed to clone reader: {0}")]
    CloneReader(#[source] anyhow::Error),

    #[error("failed to take writer: {0}")]
    TakeWriter(#[source] anyhow::Error),

    #[error("input channel full")]
    InputBackpressure,

    #[error("process input is closed")]
    Closed,

    #[error("failed to kill process: {0}")]
    Kill(#[source] std::io::Error),
}

/// Receives the output and exit of a spawned process.
///
/// Called from blocking reader threads; implementations must not block.
pub trait ProcessObserver: Send + Sync {
    /// A chunk of decoded terminal text, exactly as read from the pty.
    fn on_data(&self, chunk: &str);
    /// The process exited. Delivered at most once.
    fn on_exit(&self, exit_code: Option<i32>);
}

/// A live process owned by exactly one session.
pub trait ProcessHandle: Send + Sync {
    fn pid(&self) -> Option<u32>;
    /// Queue bytes for the process's stdin.
    fn write(&self, data: Bytes) -> Result<(), PtyError>;
    /// Terminate the process.
    fn kill(&self) -> Result<(), PtyError>;
}

/// Spawns processes for the session registry.
pub trait ProcessBackend: Send + Sync {
    fn spawn(
        &self,
        request: SpawnRequest,
        observer: Arc<dyn ProcessObserver>,
    ) -> Result<Box<dyn ProcessHandle>, PtyError>;
}

/// Everything needed to launch one shell.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub rows: u16,
    pub cols: u16,
}

/// Capacity of the per-process input queue.
const INPUT_CHANNEL_CAPACITY: usize = 64;

/// The real backend: `portable_pty`'s native pty system.
#[derive(Debug, Default, Clone, Copy)]
pub struct PtyBackend;

impl ProcessBackend for PtyBackend {
    fn spawn(
        &self,
        request: SpawnRequest,
        observer: Arc<dyn ProcessObserver>,
    ) -> Result<Box<dyn ProcessHandle>, PtyError> {
        Ok(Box::new(Pty::spawn(request, observer)?))
    }
}

/// A shell running in a pseudo-terminal.
///
/// Three blocking tasks serve each pty: a reader feeding the observer, a
/// writer draining the input queue, and a child monitor reporting the exit.
/// All three end on their own once the child exits and the pty closes.
pub struct Pty {
    pid: Option<u32>,
    input_tx: mpsc::Sender<Bytes>,
    killer: parking_lot::Mutex<Box<dyn ChildKiller + Send + Sync>>,
    // Dropping the master closes the pty; keep it for the process lifetime.
    _master: parking_lot::Mutex<Box<dyn MasterPty + Send>>,
}

impl std::fmt::Debug for Pty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pty").field("pid", &self.pid).finish_non_exhaustive()
    }
}

impl Pty {
    pub fn spawn(
        request: SpawnRequest,
        observer: Arc<dyn ProcessObserver>,
    ) -> Result<Self, PtyError> {
        if !request.cwd.is_dir() {
            return Err(PtyError::InvalidDirectory(request.cwd.display().to_string()));
        }

        let pty_system = native_pty_system();
        let size = PtySize {
            rows: request.rows,
            cols: request.cols,
            pixel_width: 0,
            pixel_height: 0,
        };
        let PtyPair { master, slave } = pty_system.openpty(size).map_err(PtyError::OpenPty)?;

        let mut cmd = CommandBuilder::new(&request.program);
        cmd.args(&request.args);
        cmd.cwd(&request.cwd);
        cmd.env("TERM", std::env::var("TERM").unwrap_or_else(|_| "xterm-256color".to_string()));

        let mut child = slave.spawn_command(cmd).map_err(PtyError::SpawnCommand)?;
        // The slave end belongs to the child now; holding it would keep the
        // reader from ever seeing EOF.
        drop(slave);

        let pid = child.process_id();
        let killer = child.clone_killer();
        let reader = master.try_clone_reader().map_err(PtyError::CloneReader)?;
        let writer = master.take_writer().map_err(PtyError::TakeWriter)?;

        let exit_observer = observer.clone();
        tokio::task::spawn_blocking(move || {
            let code = match child.wait() {
                Ok(status) => {
                    tracing::debug!(?status, "shell exited");
                    Some(status.exit_code() as i32)
                }
                Err(e) => {
                    tracing::error!(?e, "error waiting for shell");
                    None
                }
            };
            exit_observer.on_exit(code);
        });

        tokio::task::spawn_blocking(move || {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                use std::io::Read;
                let mut reader = reader;
                let mut decoder = Utf8Decoder::default();
                let mut buf = [0u8; 4096];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            let text = decoder.decode(&buf[..n]);
                            if !text.is_empty() {
                                observer.on_data(&text);
                            }
                        }
                        Err(_) => break,
                    }
                }
            }));
            if let Err(e) = result {
                tracing::error!("pty reader task panicked: {:?}", e);
            }
        });

        let (input_tx, input_rx) = mpsc::channel::<Bytes>(INPUT_CHANNEL_CAPACITY);
        tokio::task::spawn_blocking(move || {
            use std::io::Write;
            let mut writer = writer;
            let mut rx = input_rx;
            while let Some(data) = rx.blocking_recv() {
                if writer.write_all(&data).is_err() {
                    break;
                }
                let _ = writer.flush();
            }
        });

        Ok(Self {
            pid,
            input_tx,
            killer: parking_lot::Mutex::new(killer),
            _master: parking_lot::Mutex::new(master),
        })
    }
}

impl ProcessHandle for Pty {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn write(&self, data: Bytes) -> Result<(), PtyError> {
        self.input_tx.try_send(data).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => PtyError::InputBackpressure,
            mpsc::error::TrySendError::Closed(_) => PtyError::Closed,
        })
    }

    fn kill(&self) -> Result<(), PtyError> {
        self.killer.lock().kill().map_err(PtyError::Kill)
    }
}

/// Incremental UTF-8 decoder.
///
/// A multi-byte character split across two reads is held back until the
/// rest arrives; invalid sequences become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn decode(&mut self, input: &[u8]) -> String {
        self.pending.extend_from_slice(input);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(s) => {
                    out.push_str(s);
                    self.pending.clear();
                    return out;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        // Incomplete sequence at the end: wait for more bytes.
                        None => {
                            self.pending.drain(..valid);
                            return out;
                        }
                        Some(bad) => {
                            out.push('\u{FFFD}');
                            self.pending.drain(..valid + bad);
                        }
                    }
                }
            }
        }
    }
}
