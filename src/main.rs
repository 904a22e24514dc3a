//! aiterm - interactive shell sessions for AI agents
//!
//! Serves the session engine as an MCP server over stdio. Each
//! `execute_command` call starts a PowerShell or CMD process in a
//! pseudo-terminal; later calls write to it, read its output, or close it.

use clap::Parser as ClapParser;
use rmcp::{transport::stdio, ServiceExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use aiterm::{
    config::{self, ConfigError, EngineConfig},
    engine::Engine,
    mcp::AitermMcpServer,
    pty::PtyBackend,
    session::EngineEvent,
    shell::{ShellTable, TerminalType},
};

/// aiterm - interactive PowerShell/CMD sessions over MCP
#[derive(ClapParser, Debug)]
#[command(name = "aiterm", version, about, long_about = None)]
struct Cli {
    /// Path to the TOML config file (defaults to <config dir>/aiterm/config.toml)
    #[arg(long, env = "AITERM_CONFIG")]
    config: Option<PathBuf>,

    /// Terminal type for sessions that do not name one: powershell or cmd
    #[arg(long, env = "AITERM_TERMINAL")]
    terminal: Option<TerminalType>,
}

#[derive(Error, Debug)]
enum AppError {
    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error("MCP server error: {0}")]
    Mcp(String),
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    // stdout carries the JSON-RPC stream.
    init_tracing_stderr();
    let cli = Cli::parse();

    let mut config = load_config(cli.config.as_deref())?;
    if let Some(terminal) = cli.terminal {
        config.default_terminal = terminal;
    }

    let shells = ShellTable::resolve(&config.shells);
    let engine = Arc::new(Engine::new(Arc::new(PtyBackend), shells, config));

    let shutdown = CancellationToken::new();
    let reaper = engine.spawn_reaper(shutdown.clone());
    spawn_event_log(&engine);

    let result = run_mcp(engine.clone()).await;

    shutdown.cancel();
    if let Err(e) = reaper.await {
        tracing::warn!(?e, "reaper task failed");
    }
    let report = engine.close_all();
    tracing::info!(
        closed = report.total_closed,
        failed = report.total_failed,
        "aiterm exiting"
    );
    result
}

/// Initialize tracing with stderr output.
fn init_tracing_stderr() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "aiterm=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn load_config(explicit: Option<&Path>) -> Result<EngineConfig, AppError> {
    let Some(path) = explicit.map(Path::to_path_buf).or_else(config::default_config_path) else {
        return Ok(EngineConfig::default());
    };
    match EngineConfig::load(&path)? {
        Some(config) => {
            tracing::info!(path = %path.display(), "loaded config");
            Ok(config)
        }
        None => {
            if explicit.is_some() {
                tracing::warn!(path = %path.display(), "config file not found, using defaults");
            }
            Ok(EngineConfig::default())
        }
    }
}

/// Serve MCP on stdin/stdout until the client disconnects or Ctrl+C.
async fn run_mcp(engine: Arc<Engine>) -> Result<(), AppError> {
    tracing::info!("aiterm MCP server starting on stdio");
    let service = AitermMcpServer::new(engine)
        .serve(stdio())
        .await
        .map_err(|e| AppError::Mcp(e.to_string()))?;

    // Dropping the running service on Ctrl+C cancels it.
    tokio::select! {
        result = service.waiting() => {
            let reason = result.map_err(|e| AppError::Mcp(e.to_string()))?;
            tracing::info!(?reason, "MCP client disconnected");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted, shutting down");
        }
    }
    Ok(())
}

/// Log engine lifecycle events at debug level.
fn spawn_event_log(engine: &Engine) {
    let mut events = engine.subscribe_events();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "event log fell behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}

fn log_event(event: &EngineEvent) {
    match event {
        EngineEvent::SessionCreated {
            session_id,
            terminal_type,
            working_directory,
        } => tracing::debug!(
            session = %session_id,
            terminal = %terminal_type,
            cwd = %working_directory.display(),
            "event: session created"
        ),
        EngineEvent::OutputReceived { session_id, lines } => {
            tracing::debug!(session = %session_id, lines = lines.len(), "event: output")
        }
        EngineEvent::SessionClosed {
            session_id,
            exit_code,
        } => tracing::debug!(session = %session_id, ?exit_code, "event: session closed"),
        EngineEvent::SessionRemoved { session_id } => {
            tracing::debug!(session = %session_id, "event: session removed")
        }
        EngineEvent::ErrorOccurred {
            session_id,
            context,
        } => tracing::debug!(session = ?session_id, %context, "event: error"),
    }
}
