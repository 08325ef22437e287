//! Tool-calling agent.
//!
//! Runs the model against a bound tool set until it answers without tool
//! calls:
//! 1. Call the model with the history and every tool definition
//! 2. Execute each requested tool call on its server
//! 3. Append the results and go again, up to `max_rounds`
//!
//! Tool failures are reported back to the model as tool output rather than
//! aborting the turn; only model failures end the invocation.

use std::sync::Arc;
use std::time::Instant;

use super::errors::AgentError;
use crate::inference::types::{ChatMessage, ToolCall, ToolDefinition};
use crate::inference::ModelClient;
use crate::mcp_client::{BoundTool, ToolCallResult};

// ─── Settings ────────────────────────────────────────────────────────────────

/// Limits applied to one agent invocation.
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub max_rounds: usize,
    pub max_tool_result_chars: usize,
    pub system_prompt: Option<String>,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_rounds: 8,
            max_tool_result_chars: 6_000,
            system_prompt: Some(
                "You are a helpful assistant. Use the available tools when they help answer \
                 the user's request, and answer directly otherwise."
                    .to_string(),
            ),
        }
    }
}

// ─── ToolAgent ───────────────────────────────────────────────────────────────

/// A model client plus the tools it may call.
pub struct ToolAgent {
    model: Arc<dyn ModelClient>,
    tools: Vec<BoundTool>,
    definitions: Vec<ToolDefinition>,
    settings: AgentSettings,
}

impl ToolAgent {
    pub fn build(model: Arc<dyn ModelClient>, tools: Vec<BoundTool>, settings: AgentSettings) -> Self {
        let definitions = tools
            .iter()
            .map(|t| ToolDefinition {
                name: t.name.clone(),
                description: t.description.clone(),
                parameters: t.parameters.clone(),
            })
            .collect();
        Self {
            model,
            tools,
            definitions,
            settings,
        }
    }

    pub fn tool_names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name.as_str()).collect()
    }

    pub fn model(&self) -> &Arc<dyn ModelClient> {
        &self.model
    }

    /// Run the agent over `history` and return its final assistant message.
    ///
    /// `thread_id` scopes the invocation in logs; all state lives in `history`.
    pub async fn invoke(
        &self,
        history: &[ChatMessage],
        thread_id: &str,
    ) -> Result<ChatMessage, AgentError> {
        let mut messages = Vec::with_capacity(history.len() + 1);
        if let Some(prompt) = &self.settings.system_prompt {
            messages.push(ChatMessage::system(prompt.clone()));
        }
        messages.extend_from_slice(history);

        tracing::info!(
            thread_id,
            provider = self.model.provider().as_str(),
            history = history.len(),
            tools = self.tools.len(),
            "agent invoke"
        );

        for round in 0..self.settings.max_rounds {
            let reply = self.model.complete(&messages, &self.definitions).await?;

            if !reply.has_tool_calls() {
                let text = reply.text.unwrap_or_default();
                if text.trim().is_empty() {
                    tracing::warn!(thread_id, round, "agent returned empty response");
                    return Err(AgentError::EmptyResponse);
                }
                tracing::info!(thread_id, round, chars = text.len(), "agent answered");
                return Ok(ChatMessage::assistant(text));
            }

            tracing::info!(
                thread_id,
                round,
                calls = reply.tool_calls.len(),
                "agent requested tool calls"
            );

            let calls = reply.tool_calls;
            messages.push(ChatMessage::assistant_tool_calls(reply.text, calls.clone()));
            for call in &calls {
                let result = self.execute(call).await;
                messages.push(ChatMessage::tool_result(call, result.text));
            }
        }

        tracing::warn!(thread_id, rounds = self.settings.max_rounds, "agent hit round limit");
        Err(AgentError::MaxRounds {
            rounds: self.settings.max_rounds,
        })
    }

    /// Execute one tool call. Never fails: errors become the tool's output.
    async fn execute(&self, call: &ToolCall) -> ToolCallResult {
        let started = Instant::now();
        let Some(tool) = self.tools.iter().find(|t| t.name == call.name) else {
            tracing::warn!(tool = %call.name, "model called unknown tool");
            return ToolCallResult {
                tool_name: call.name.clone(),
                success: false,
                text: format!("Error: unknown tool '{}'", call.name),
                execution_time_ms: 0,
            };
        };

        let outcome = tool.call(call.arguments.clone()).await;
        let execution_time_ms = started.elapsed().as_millis() as u64;

        let (success, text) = match outcome {
            Ok(result) if result.is_error => (false, format!("Error: {}", result.text())),
            Ok(result) => (true, result.text()),
            Err(e) => (false, format!("Error: {e}")),
        };

        tracing::info!(
            tool = %call.name,
            server = %tool.server,
            success,
            execution_time_ms,
            "tool call finished"
        );

        ToolCallResult {
            tool_name: call.name.clone(),
            success,
            text: truncate_tool_result(&text, &call.name, self.settings.max_tool_result_chars),
            execution_time_ms,
        }
    }
}

/// Truncate a tool result that exceeds `max_chars` characters.
pub fn truncate_tool_result(result: &str, tool_name: &str, max_chars: usize) -> String {
    let total = result.chars().count();
    if total <= max_chars {
        return result.to_string();
    }

    let truncated: String = result.chars().take(max_chars).collect();
    tracing::warn!(
        tool = %tool_name,
        original_len = total,
        truncated_to = max_chars,
        "tool result truncated"
    );
    format!("{truncated}\n\n[... truncated: showing first {max_chars} of {total} chars]")
}

// ─── Tests ───────────────────────────────────────────────────────────────────
