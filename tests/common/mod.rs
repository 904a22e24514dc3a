#![allow(dead_code)]

use aiterm::config::EngineConfig;
use aiterm::engine::Engine;
use aiterm::pty::{ProcessBackend, ProcessHandle, ProcessObserver, PtyError, SpawnRequest};
use aiterm::shell::ShellTable;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const PROMPT: &str = r"PS C:\Users\test> ";

/// How the fake shell answers a submitted line.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Print these lines, then the prompt.
    Lines(Vec<String>),
    /// Print these lines after a delay, then the prompt.
    Late(Duration, Vec<String>),
    /// Never answer.
    Hang,
    /// Exit with this code.
    Exit(i32),
}

pub type Script = Arc<dyn Fn(&str) -> Reply + Send + Sync>;

/// Default script: `echo <text>` prints `<text>`, `exit` exits, `hang`
/// never returns, anything else prints nothing.
pub fn default_script() -> Script {
    Arc::new(|line: &str| {
        if let Some(text) = line.strip_prefix("echo ") {
            Reply::Lines(vec![text.to_string()])
        } else if line == "exit" {
            Reply::Exit(0)
        } else if line == "hang" {
            Reply::Hang
        } else if let Some(n) = line.strip_prefix("count ") {
            let n: usize = n.parse().unwrap_or(0);
            Reply::Lines((1..=n).map(|i| format!("out {i}")).collect())
        } else {
            Reply::Lines(Vec::new())
        }
    })
}

/// A process of the fake backend.
pub struct FakeProcess {
    pub pid: u32,
    pub request: SpawnRequest,
    observer: Arc<dyn ProcessObserver>,
    script: Script,
    echo: bool,
    pending: Mutex<String>,
    /// Every line submitted with Enter.
    pub submitted: Mutex<Vec<String>>,
    /// Raw input chunks, in order.
    pub raw_input: Mutex<Vec<String>>,
    killed: AtomicBool,
    kill_fails: AtomicBool,
    input_full: AtomicBool,
}

impl FakeProcess {
    /// Make every later write fail as if the input queue were full.
    pub fn fill_input(&self) {
        self.input_full.store(true, Ordering::SeqCst);
    }

    /// Make every later kill of this process fail.
    pub fn fail_kill(&self) {
        self.kill_fails.store(true, Ordering::SeqCst);
    }

    /// Emit raw terminal text as if the shell printed it.
    pub fn emit(&self, text: &str) {
        self.observer.on_data(text);
    }

    /// Simulate the shell exiting on its own.
    pub fn exit(&self, code: i32) {
        self.killed.store(true, Ordering::SeqCst);
        self.observer.on_exit(Some(code));
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::SeqCst)
    }

    fn submit(self: &Arc<Self>, line: String) {
        self.submitted.lock().push(line.clone());
        let reply = (self.script)(&line);
        let process = self.clone();
        tokio::spawn(async move {
            if process.echo {
                process.emit(&format!("{line}\r\n"));
            }
            match reply {
                Reply::Lines(lines) => process.print(&lines),
                Reply::Late(delay, lines) => {
                    tokio::time::sleep(delay).await;
                    process.print(&lines);
                }
                Reply::Hang => {}
                Reply::Exit(code) => process.exit(code),
            }
        });
    }

    fn print(&self, lines: &[String]) {
        if self.is_killed() {
            return;
        }
        for line in lines {
            self.emit(&format!("{line}\r\n"));
        }
        self.emit(PROMPT);
    }
}

struct FakeHandle(Arc<FakeProcess>);

impl ProcessHandle for FakeHandle {
    fn pid(&self) -> Option<u32> {
        Some(self.0.pid)
    }

    fn write(&self, data: Bytes) -> Result<(), PtyError> {
        let process = &self.0;
        if process.is_killed() {
            return Err(PtyError::Closed);
        }
        if process.input_full.load(Ordering::SeqCst) {
            return Err(PtyError::InputBackpressure);
        }
        let text = String::from_utf8_lossy(&data).into_owned();
        process.raw_input.lock().push(text.clone());
        let mut complete = Vec::new();
        {
            let mut pending = process.pending.lock();
            for ch in text.chars() {
                if ch == '\r' || ch == '\n' {
                    complete.push(std::mem::take(&mut *pending));
                } else {
                    pending.push(ch);
                }
            }
        }
        for line in complete {
            process.submit(line);
        }
        Ok(())
    }

    fn kill(&self) -> Result<(), PtyError> {
        let process = &self.0;
        if process.kill_fails.load(Ordering::SeqCst) {
            return Err(PtyError::Kill(std::io::Error::other("access denied")));
        }
        if !process.killed.swap(true, Ordering::SeqCst) {
            let observer = process.observer.clone();
            // The real exit notification arrives later, from the wait thread.
            tokio::spawn(async move { observer.on_exit(Some(1)) });
        }
        Ok(())
    }
}

/// Scripted stand-in for the pty backend.
pub struct FakeBackend {
    script: Script,
    echo: bool,
    startup_prompt: bool,
    fail_spawn: AtomicBool,
    next_pid: AtomicU32,
    processes: Mutex<Vec<Arc<FakeProcess>>>,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Self::with_script(default_script(), false)
    }

    /// A backend whose shells echo each submitted line, like a real pty.
    pub fn echoing() -> Arc<Self> {
        Self::with_script(default_script(), true)
    }

    /// A backend whose shells print nothing at all, not even a prompt.
    pub fn silent() -> Arc<Self> {
        Arc::new(Self {
            startup_prompt: false,
            ..Self::build(Arc::new(|_line: &str| Reply::Hang), false)
        })
    }

    pub fn with_script(script: Script, echo: bool) -> Arc<Self> {
        Arc::new(Self::build(script, echo))
    }

    fn build(script: Script, echo: bool) -> Self {
        Self {
            script,
            echo,
            startup_prompt: true,
            fail_spawn: AtomicBool::new(false),
            next_pid: AtomicU32::new(1000),
            processes: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_spawns(&self) {
        self.fail_spawn.store(true, Ordering::SeqCst);
    }

    pub fn process(&self, pid: u32) -> Arc<FakeProcess> {
        self.processes
            .lock()
            .iter()
            .find(|p| p.pid == pid)
            .cloned()
            .expect("no fake process with that pid")
    }

    /// The most recently spawned process.
    pub fn latest(&self) -> Option<Arc<FakeProcess>> {
        self.processes.lock().last().cloned()
    }

    pub fn spawned(&self) -> usize {
        self.processes.lock().len()
    }
}

impl ProcessBackend for FakeBackend {
    fn spawn(
        &self,
        request: SpawnRequest,
        observer: Arc<dyn ProcessObserver>,
    ) -> Result<Box<dyn ProcessHandle>, PtyError> {
        if self.fail_spawn.load(Ordering::SeqCst) {
            return Err(PtyError::SpawnCommand(anyhow::anyhow!("executable not found")));
        }
        let process = Arc::new(FakeProcess {
            pid: self.next_pid.fetch_add(1, Ordering::SeqCst),
            request,
            observer,
            script: self.script.clone(),
            echo: self.echo,
            pending: Mutex::new(String::new()),
            submitted: Mutex::new(Vec::new()),
            raw_input: Mutex::new(Vec::new()),
            killed: AtomicBool::new(false),
            kill_fails: AtomicBool::new(false),
            input_full: AtomicBool::new(false),
        });
        if self.startup_prompt {
            // Banner and first prompt, as a shell prints them on startup.
            process.emit("Windows PowerShell\r\n\r\n");
            process.emit(PROMPT);
        }
        self.processes.lock().push(process.clone());
        Ok(Box::new(FakeHandle(process)))
    }
}

/// Config with short delays so tests run fast.
pub fn fast_config() -> EngineConfig {
    EngineConfig {
        settle_delay_ms: 10,
        poll_interval_ms: 10,
        close_grace_ms: 5_000,
        ..Default::default()
    }
}

pub fn create_engine(backend: Arc<FakeBackend>) -> Engine {
    create_engine_with_config(backend, fast_config())
}

pub fn create_engine_with_config(backend: Arc<FakeBackend>, config: EngineConfig) -> Engine {
    Engine::new(backend, ShellTable::new("pwsh", "cmd.exe"), config)
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
