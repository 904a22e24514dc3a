pub mod tools;

use std::sync::Arc;

use rmcp::{
    handler::server::router::tool::ToolRouter,
    handler::server::wrapper::Parameters,
    model::*,
    tool, tool_handler, tool_router, ServerHandler,
};
use serde::Serialize;

use crate::engine::{Engine, ExecuteFailure};
use crate::error::EngineError;

use tools::{EmptyParams, ExecuteCommandParams, SessionIdParams, WriteParams};

fn success_result<T: Serialize>(data: &T) -> CallToolResult {
    CallToolResult::success(vec![Content::text(
        serde_json::to_string(&tools::success_envelope(data)).unwrap_or_default(),
    )])
}

fn error_result(envelope: serde_json::Value) -> CallToolResult {
    CallToolResult::error(vec![Content::text(
        serde_json::to_string(&envelope).unwrap_or_default(),
    )])
}

fn engine_error_result(error: &EngineError) -> CallToolResult {
    error_result(tools::engine_error_envelope(error))
}

fn execute_failure_result(failure: &ExecuteFailure) -> CallToolResult {
    let data = failure.session_id.as_ref().map(|id| {
        serde_json::json!({
            "sessionId": id,
            "output": failure.output,
        })
    });
    error_result(tools::failure_envelope(
        &failure.error.to_string(),
        failure.error.code(),
        data,
    ))
}

/// MCP front end for the session engine.
#[derive(Clone)]
pub struct AitermMcpServer {
    engine: Arc<Engine>,
    tool_router: ToolRouter<AitermMcpServer>,
}

impl AitermMcpServer {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            tool_router: Self::tool_router(),
        }
    }
}

#[tool_handler(router = self.tool_router)]
impl ServerHandler for AitermMcpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "aiterm".to_string(),
                title: None,
                version: env!("CARGO_PKG_VERSION").to_string(),
                description: Some(
                    "Interactive PowerShell and CMD sessions for AI agents.".to_string(),
                ),
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "Use execute_command to start a new shell session and run a command in it; \
                 the response carries the sessionId. Use write_to_terminal to send further \
                 input to that session and read_terminal_output to fetch everything it has \
                 printed. list_terminal_sessions shows all sessions, close_session and \
                 close_all_sessions terminate them."
                    .to_string(),
            ),
        }
    }
}

#[tool_router]
impl AitermMcpServer {
    #[tool(description = "Start a new PowerShell or CMD session in an absolute working directory, run one command in it, and return the command's output lines together with the new sessionId. Always creates a new session.")]
    async fn execute_command(
        &self,
        Parameters(params): Parameters<ExecuteCommandParams>,
    ) -> Result<CallToolResult, ErrorData> {
        let result = self
            .engine
            .create_and_execute(
                params.terminal_type,
                &params.working_directory,
                &params.command,
                params.timeout,
            )
            .await;
        Ok(match result {
            Ok(execution) => success_result(&execution),
            Err(failure) => execute_failure_result(&failure),
        })
    }

    #[tool(description = "Send input to an existing session. By default Enter is pressed after the input; set addNewline=false to type without executing. Does not wait for output; use read_terminal_output afterwards.")]
    async fn write_to_terminal(
        &self,
        Parameters(params): Parameters<WriteParams>,
    ) -> Result<CallToolResult, ErrorData> {
        Ok(
            match self
                .engine
                .write(&params.session_id, &params.input, params.add_newline)
            {
                Ok(input) => success_result(&serde_json::json!({
                    "sessionId": params.session_id,
                    "input": input,
                })),
                Err(e) => engine_error_result(&e),
            },
        )
    }

    #[tool(description = "Return all buffered output of a session (most recent lines, bounded) plus its status. Does not block.")]
    async fn read_terminal_output(
        &self,
        Parameters(params): Parameters<SessionIdParams>,
    ) -> Result<CallToolResult, ErrorData> {
        Ok(match self.engine.read(&params.session_id) {
            Ok(output) => success_result(&output),
            Err(e) => engine_error_result(&e),
        })
    }

    #[tool(description = "List all terminal sessions with their id, terminal type, working directory, status, pid, timestamps and buffered line count.")]
    async fn list_terminal_sessions(
        &self,
        Parameters(_params): Parameters<EmptyParams>,
    ) -> Result<CallToolResult, ErrorData> {
        Ok(success_result(&self.engine.list()))
    }

    #[tool(description = "Close one session, terminating its shell process.")]
    async fn close_session(
        &self,
        Parameters(params): Parameters<SessionIdParams>,
    ) -> Result<CallToolResult, ErrorData> {
        Ok(match self.engine.close(&params.session_id) {
            Ok(info) => success_result(&info),
            Err(e) => engine_error_result(&e),
        })
    }

    #[tool(description = "Close every active session. Best effort: reports how many sessions were closed and which ones failed.")]
    async fn close_all_sessions(
        &self,
        Parameters(_params): Parameters<EmptyParams>,
    ) -> Result<CallToolResult, ErrorData> {
        let report = self.engine.close_all();
        if report.success {
            return Ok(success_result(&report));
        }
        let message = format!(
            "{} of {} sessions could not be closed",
            report.total_failed,
            report.total_closed + report.total_failed
        );
        Ok(error_result(tools::failure_envelope(
            &message,
            "partial_failure",
            serde_json::to_value(&report).ok(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_of(result: &CallToolResult) -> serde_json::Value {
        let text = result
            .content
            .first()
            .and_then(|c| c.as_text())
            .map(|t| t.text.clone())
            .unwrap();
        serde_json::from_str(&text).unwrap()
    }

    #[test]
    fn execute_failure_carries_session_and_output() {
        let failure = ExecuteFailure {
            session_id: Some("s1".into()),
            output: vec!["partial".into()],
            error: EngineError::TimedOut { timeout_ms: 100 },
        };
        let result = execute_failure_result(&failure);
        assert_eq!(result.is_error, Some(true));
        let v = text_of(&result);
        assert_eq!(v["code"], "timed_out");
        assert_eq!(v["data"]["sessionId"], "s1");
        assert_eq!(v["data"]["output"][0], "partial");
    }

    #[test]
    fn execute_failure_without_session_has_no_data() {
        let failure = ExecuteFailure::from(EngineError::InvalidArgument("bad".into()));
        let v = text_of(&execute_failure_result(&failure));
        assert_eq!(v["code"], "invalid_argument");
        assert!(v.get("data").is_none());
    }

    #[test]
    fn success_result_is_not_error() {
        let result = success_result(&vec!["a"]);
        assert_ne!(result.is_error, Some(true));
        assert_eq!(text_of(&result)["data"][0], "a");
    }
}
