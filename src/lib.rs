//! aiterm - interactive shell sessions for AI agents.
//!
//! The crate is organised around the session engine:
//!
//! - [`session`]: the session registry and per-session state
//! - [`pty`]: the process adapter (pseudo-terminal backed shells)
//! - [`buffer`]: bounded per-session output buffers
//! - [`detector`]: prompt-based command completion detection
//! - [`reaper`]: periodic eviction of closed and idle sessions
//! - [`engine`]: the operations exposed to callers
//! - [`mcp`]: the MCP tool surface over the engine

pub mod buffer;
pub mod config;
pub mod detector;
pub mod engine;
pub mod error;
pub mod mcp;
pub mod pty;
pub mod reaper;
pub mod session;
pub mod shell;
