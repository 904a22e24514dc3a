// MCP tool parameter types and the response envelope

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::EngineError;
use crate::shell::TerminalType;

fn default_add_newline() -> bool {
    true
}

/// Parameters for the `execute_command` tool.
#[derive(Debug, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteCommandParams {
    /// Shell to start. Defaults to the configured terminal (PowerShell).
    #[schemars(description = "Shell to start: 'powershell' or 'cmd'. Defaults to PowerShell.")]
    pub terminal_type: Option<TerminalType>,

    #[schemars(description = "Absolute path of the directory the shell starts in.")]
    pub working_directory: String,

    #[schemars(description = "Command to run in the new session.")]
    pub command: String,

    /// Milliseconds to wait for the prompt to return.
    #[schemars(description = "Milliseconds to wait for the command to finish. Defaults to 5000.")]
    pub timeout: Option<u64>,
}

/// Parameters for the `write_to_terminal` tool.
#[derive(Debug, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WriteParams {
    #[schemars(description = "Id of the target session.")]
    pub session_id: String,

    #[schemars(description = "Text to send to the shell.")]
    pub input: String,

    /// Submit the input (press Enter). Set false to build up input in parts.
    #[serde(default = "default_add_newline")]
    #[schemars(description = "Press Enter after the input. Defaults to true; set false to type without executing.")]
    pub add_newline: bool,
}

/// Parameters for tools that address one session.
#[derive(Debug, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionIdParams {
    #[schemars(description = "Id of the target session.")]
    pub session_id: String,
}

/// Parameters for tools that take no arguments.
#[derive(Debug, Default, Deserialize, schemars::JsonSchema)]
pub struct EmptyParams {}

/// Uniform success envelope: `{ success, data, timestamp }`.
pub fn success_envelope<T: Serialize>(data: &T) -> Value {
    json!({
        "success": true,
        "data": data,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    })
}

/// Uniform failure envelope: `{ success, error, code, data?, timestamp }`.
pub fn failure_envelope(error: &str, code: &str, data: Option<Value>) -> Value {
    let mut envelope = json!({
        "success": false,
        "error": error,
        "code": code,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    });
    if let Some(data) = data {
        envelope["data"] = data;
    }
    envelope
}

pub fn engine_error_envelope(error: &EngineError) -> Value {
    failure_envelope(&error.to_string(), error.code(), None)
}
