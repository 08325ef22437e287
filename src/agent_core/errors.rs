//! Agent Core error types.

use thiserror::Error;

use crate::inference::InferenceError;
use crate::mcp_client::McpError;

/// Text shown when no backing target exists at all.
pub const NO_TARGET_MESSAGE: &str = "No LLM provider configured and no MCP server connected.";

/// Text shown when the agent finishes without a usable reply.
pub const EMPTY_RESPONSE_MESSAGE: &str = "Received an unexpected or empty response from the AI agent.";

/// Errors that can occur during agent core operations.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Nothing can answer: no live agent, no provider key, no server.
    #[error("{reason}")]
    NotReady { reason: String },

    /// Another send is still in flight for this session.
    #[error("a message is already being processed")]
    Busy,

    /// Blank input.
    #[error("message is empty")]
    EmptyInput,

    /// The agent finished without text.
    #[error("{}", EMPTY_RESPONSE_MESSAGE)]
    EmptyResponse,

    /// The agent kept calling tools past its round limit.
    #[error("agent stopped after {rounds} tool rounds without a final answer")]
    MaxRounds { rounds: usize },

    /// A model call failed.
    #[error("{reason}")]
    Inference { reason: String },

    /// Model client or tool bind failed while building an agent.
    #[error("agent construction failed: {reason}")]
    Construction { reason: String },
}

impl From<InferenceError> for AgentError {
    fn from(e: InferenceError) -> Self {
        AgentError::Inference {
            reason: e.user_message(),
        }
    }
}

impl From<McpError> for AgentError {
    fn from(e: McpError) -> Self {
        AgentError::Construction {
            reason: e.to_string(),
        }
    }
}
