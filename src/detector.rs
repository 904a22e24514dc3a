//! Command completion detection.
//!
//! A raw pty gives no "command finished" signal. The only observable proxy is
//! the shell printing its idle prompt again, so completion is detected in two
//! phases: first the output has to go quiet (no buffer change for
//! `stable_polls` consecutive polls), then the last one or two lines, with
//! escape sequences removed, have to look like a prompt for the session's
//! terminal type. Requiring quiet output first keeps a command that merely
//! prints something prompt-shaped mid-run from ending the wait early.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tokio::time::MissedTickBehavior;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::session::Session;
use crate::shell::TerminalType;

static ANSI_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"\x1b\[[0-?]*[ -/]*[@-~]",            // CSI
        r"|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)?", // OSC, BEL or ST terminated
        r"|\x1b[()*+].",                        // charset designation
        r"|\x1b[ -~]",                          // other two-byte sequences
        r"|[\x00-\x08\x0b-\x1f\x7f]",           // stray control characters
    ))
    .expect("valid ANSI regex")
});

static POWERSHELL_PROMPT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|\s)PS [A-Za-z]:\\[^>\n]*>\s*$").expect("valid prompt regex"));

static CMD_PROMPT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z]:\\[^>\n]*>\s*$").expect("valid prompt regex"));

static GENERIC_PROMPT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r">\s*$").expect("valid prompt regex"));

/// Remove terminal escape sequences and control characters (tabs survive).
pub fn strip_ansi(text: &str) -> String {
    ANSI_RE.replace_all(text, "").into_owned()
}

/// Does `text` (already stripped) end with an idle prompt?
pub fn matches_prompt(terminal: TerminalType, text: &str) -> bool {
    match terminal {
        TerminalType::PowerShell => POWERSHELL_PROMPT_RE.is_match(text),
        TerminalType::Cmd => CMD_PROMPT_RE.is_match(text) || GENERIC_PROMPT_RE.is_match(text),
    }
}

/// How many trailing lines of `lines` form a prompt: 1 if the last line
/// matches on its own, 2 if it only matches joined with the line before it
/// (a prompt wrapped or split across lines), `None` otherwise.
pub fn prompt_tail(terminal: TerminalType, lines: &[String]) -> Option<usize> {
    let last = strip_ansi(lines.last()?);
    if matches_prompt(terminal, &last) {
        return Some(1);
    }
    if lines.len() >= 2 {
        let joined = strip_ansi(&lines[lines.len() - 2]) + &last;
        if matches_prompt(terminal, &joined) {
            return Some(2);
        }
    }
    None
}

/// Is `line` the shell echoing `command` back, bare or after a prompt?
fn is_echo(line: &str, command: &str) -> bool {
    let command = command.trim();
    if command.is_empty() {
        return false;
    }
    let line = strip_ansi(line);
    let line = line.trim();
    line == command || line.ends_with(&format!("> {command}")) || line.ends_with(&format!(">{command}"))
}

/// Cut a captured window down to the command's own output: the trailing
/// prompt lines go, and so does a leading echo of the command.
pub fn command_output(mut lines: Vec<String>, command: &str, prompt_lines: usize) -> Vec<String> {
    lines.truncate(lines.len().saturating_sub(prompt_lines));
    if lines.first().is_some_and(|first| is_echo(first, command)) {
        lines.remove(0);
    }
    lines
}

/// Polling parameters for completion detection.
#[derive(Debug, Clone, Copy)]
pub struct PollSettings {
    pub settle: Duration,
    pub interval: Duration,
    pub stable_polls: u32,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            settle: Duration::from_millis(100),
            interval: Duration::from_millis(50),
            stable_polls: 1,
        }
    }
}

impl PollSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            settle: Duration::from_millis(config.settle_delay_ms),
            interval: Duration::from_millis(config.poll_interval_ms.max(1)),
            stable_polls: config.stable_polls,
        }
    }
}

/// Write `command` plus Enter and wait for the shell to return to its prompt.
///
/// Returns the lines the command printed. On `TimedOut` only the waiting is
/// abandoned: the command keeps running and its output keeps accumulating in
/// the session buffer. If the session closes while waiting (exit, close,
/// reaper) the wait ends with `SessionClosed`.
pub async fn execute_and_wait(
    session: &Session,
    command: &str,
    timeout: Duration,
    settings: &PollSettings,
) -> Result<Vec<String>, EngineError> {
    if !session.is_active() {
        return Err(EngineError::SessionClosed(session.id.clone()));
    }
    let baseline = session.output().revision();
    // Enter moves the shell to a new line, so output starts on a fresh line.
    let start = session.output().seal();
    session.write(format!("{command}\r"))?;

    let (lines, prompt_lines) = wait_for_prompt(session, start, baseline, timeout, settings).await?;
    let output = command_output(lines, command, prompt_lines);
    tracing::debug!(session = %session.id, lines = output.len(), "command completed");
    Ok(output)
}

/// Wait until the shell shows an idle prompt, without writing anything.
///
/// Used right after spawn so a startup banner and first prompt are not
/// mistaken for the completion of the first command.
pub async fn wait_for_ready(
    session: &Session,
    timeout: Duration,
    settings: &PollSettings,
) -> Result<(), EngineError> {
    let baseline = session.output().revision();
    wait_for_prompt(session, 0, baseline, timeout, settings).await?;
    Ok(())
}

/// Poll the buffer from absolute index `start` until it is stable and ends in
/// a prompt. Returns the window and the number of trailing prompt lines.
async fn wait_for_prompt(
    session: &Session,
    start: u64,
    baseline_revision: u64,
    timeout: Duration,
    settings: &PollSettings,
) -> Result<(Vec<String>, usize), EngineError> {
    let closed = session.closed_token();
    let buffer = session.output();
    let terminal = session.terminal_type;

    let poll = async {
        tokio::time::sleep(settings.settle).await;
        let mut ticker = tokio::time::interval(settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_revision = baseline_revision;
        let mut stable: u32 = 0;
        loop {
            ticker.tick().await;
            let revision = buffer.revision();
            if revision == last_revision {
                stable = stable.saturating_add(1);
            } else {
                stable = 0;
                last_revision = revision;
            }
            if stable < settings.stable_polls {
                continue;
            }
            let current = buffer.slice_since(start);
            if current.is_empty() {
                continue;
            }
            if let Some(prompt_lines) = prompt_tail(terminal, &current) {
                return (current, prompt_lines);
            }
        }
    };

    // Dropping the poll future on either exit path cancels its timers.
    tokio::select! {
        biased;
        _ = closed.cancelled() => Err(EngineError::SessionClosed(session.id.clone())),
        result = tokio::time::timeout(timeout, poll) => result.map_err(|_| EngineError::TimedOut {
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}
