//! Agent runner seam.
//!
//! The chat/LLM execution pipeline is an external collaborator: the gateway
//! only needs to invoke it by session key. The [`EchoRunner`] is a
//! development stand-in that keeps the HTTP surface and scheduler
//! exercisable without a model attached.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::error::{ErrorCode, GatewayError};

/// One message of a chat exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// `system`, `user`, or `assistant`.
    pub role: String,
    /// Message text.
    pub content: String,
}

/// Input to one agent run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunInput {
    /// Conversation messages, oldest first.
    pub messages: Vec<ChatMessage>,
    /// Resolved target agent, when the caller knows it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
}

/// Output of one agent run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutput {
    /// Assistant reply text.
    pub text: String,
    /// Prompt tokens consumed.
    pub input_tokens: u64,
    /// Completion tokens produced.
    pub output_tokens: u64,
}

/// Errors surfaced by an agent runner.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// The runner did not answer within its deadline.
    #[error("agent run timed out after {0}ms")]
    Timeout(u64),
    /// The runner is not reachable or failed internally.
    #[error("agent runner unavailable: {0}")]
    Unavailable(String),
    /// The runner does not implement the requested operation.
    #[error("unsupported runner operation: {0}")]
    Unsupported(String),
}

impl From<RunnerError> for GatewayError {
    fn from(err: RunnerError) -> Self {
        match err {
            RunnerError::Timeout(ms) => {
                GatewayError::agent_timeout(format!("agent run timed out after {ms}ms"))
            },
            RunnerError::Unavailable(msg) => GatewayError::unavailable(msg),
            RunnerError::Unsupported(what) => GatewayError::new(
                ErrorCode::Unavailable,
                format!("unsupported runner operation: {what}"),
            ),
        }
    }
}

/// The agent execution pipeline, addressed by session key.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    /// Run one turn for the session identified by `session_key`.
    async fn run(&self, session_key: &str, input: RunInput) -> Result<RunOutput, RunnerError>;

    /// Invoke a single tool outside a chat turn.
    ///
    /// # Errors
    ///
    /// Default implementation reports the operation as unsupported.
    async fn invoke_tool(
        &self,
        _session_key: &str,
        tool: &str,
        _args: Value,
    ) -> Result<Value, RunnerError> {
        Err(RunnerError::Unsupported(format!("tool invocation ({tool})")))
    }
}

/// Development runner: echoes the last user message.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoRunner;

#[async_trait]
impl AgentRunner for EchoRunner {
    async fn run(&self, _session_key: &str, input: RunInput) -> Result<RunOutput, RunnerError> {
        let text = input
            .messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.clone())
            .unwrap_or_default();
        // Rough 4-bytes-per-token estimate, good enough for a dev stand-in.
        let input_tokens = input
            .messages
            .iter()
            .map(|m| m.content.len() as u64 / 4)
            .sum();
        let output_tokens = text.len() as u64 / 4;
        Ok(RunOutput {
            text,
            input_tokens,
            output_tokens,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echo_returns_last_user_message() {
        let runner = EchoRunner;
        let out = runner
            .run(
                "tenant:demo:agent:main:main",
                RunInput {
                    messages: vec![
                        ChatMessage {
                            role: "user".into(),
                            content: "first".into(),
                        },
                        ChatMessage {
                            role: "assistant".into(),
                            content: "reply".into(),
                        },
                        ChatMessage {
                            role: "user".into(),
                            content: "second".into(),
                        },
                    ],
                    agent_id: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(out.text, "second");
    }

    #[tokio::test]
    async fn tool_invocation_is_unsupported_by_default() {
        let runner = EchoRunner;
        let err = runner
            .invoke_tool("key", "exec", Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::Unsupported(_)));
    }

    #[test]
    fn runner_error_maps_to_wire_codes() {
        let err: GatewayError = RunnerError::Timeout(30_000).into();
        assert_eq!(err.code, ErrorCode::AgentTimeout);
        let err: GatewayError = RunnerError::Unavailable("down".into()).into();
        assert_eq!(err.code, ErrorCode::Unavailable);
    }
}
