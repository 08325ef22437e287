//! Anthropic Messages API client (non-streaming).
//!
//! System messages move to the top-level `system` field, tool calls become
//! `tool_use` blocks and tool results `tool_result` blocks inside a user
//! message. Consecutive tool results are merged into one user message since
//! the API requires alternating roles.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::client::{parse_body, send_for_text, HttpClients, ModelClient};
use super::errors::InferenceError;
use super::types::{ChatMessage, ModelReply, Provider, Role, ToolCall, ToolDefinition};
use crate::config::ProviderSettings;

/// API version header value.
const ANTHROPIC_VERSION: &str = "2023-06-01";

// ─── Wire Types ──────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool>,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: Vec<ContentBlock>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Serialize)]
struct WireTool {
    name: String,
    description: String,
    input_schema: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

// ─── Conversion ──────────────────────────────────────────────────────────────

fn to_request(
    settings: &ProviderSettings,
    messages: &[ChatMessage],
    tools: &[ToolDefinition],
) -> MessagesRequest {
    let system: Vec<&str> = messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.text())
        .filter(|t| !t.is_empty())
        .collect();

    let mut wire: Vec<WireMessage> = Vec::new();
    for m in messages.iter().filter(|m| m.role != Role::System) {
        let (role, blocks) = match m.role {
            Role::User => ("user", vec![ContentBlock::Text { text: m.text().to_string() }]),
            Role::Assistant => {
                let mut blocks = Vec::new();
                if !m.text().is_empty() {
                    blocks.push(ContentBlock::Text { text: m.text().to_string() });
                }
                blocks.extend(m.tool_calls.iter().map(|tc| ContentBlock::ToolUse {
                    id: tc.id.clone(),
                    name: tc.name.clone(),
                    input: tc.arguments.clone(),
                }));
                ("assistant", blocks)
            }
            Role::Tool => (
                "user",
                vec![ContentBlock::ToolResult {
                    tool_use_id: m.tool_call_id.clone().unwrap_or_default(),
                    content: m.text().to_string(),
                }],
            ),
            Role::System => continue,
        };

        if blocks.is_empty() {
            continue;
        }
        match wire.last_mut() {
            Some(last) if last.role == role => last.content.extend(blocks),
            _ => wire.push(WireMessage { role, content: blocks }),
        }
    }

    MessagesRequest {
        model: settings.model.clone(),
        max_tokens: settings.max_tokens,
        system: (!system.is_empty()).then(|| system.join("\n\n")),
        messages: wire,
        tools: tools
            .iter()
            .map(|t| WireTool {
                name: t.name.clone(),
                description: t.description.clone(),
                input_schema: t.parameters.clone(),
            })
            .collect(),
    }
}

fn parse_reply(body: &str) -> Result<ModelReply, InferenceError> {
    let resp: MessagesResponse = parse_body(body)?;
    let mut text = String::new();
    let mut tool_calls = Vec::new();

    for block in resp.content {
        match block {
            ContentBlock::Text { text: t } => text.push_str(&t),
            ContentBlock::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                id: if id.is_empty() {
                    format!("call_{}", Uuid::new_v4())
                } else {
                    id
                },
                name,
                arguments: input,
            }),
            ContentBlock::ToolResult { .. } | ContentBlock::Other => {}
        }
    }

    Ok(ModelReply {
        text: (!text.is_empty()).then_some(text),
        tool_calls,
    })
}

// ─── AnthropicClient ─────────────────────────────────────────────────────────

pub struct AnthropicClient {
    clients: HttpClients,
    settings: ProviderSettings,
    api_key: String,
}

impl AnthropicClient {
    pub fn new(clients: HttpClients, settings: ProviderSettings, api_key: &str) -> Self {
        Self {
            clients,
            settings,
            api_key: api_key.to_string(),
        }
    }
}

#[async_trait]
impl ModelClient for AnthropicClient {
    fn provider(&self) -> Provider {
        Provider::Claude
    }

    fn model(&self) -> &str {
        &self.settings.model
    }

    async fn generate(&self, prompt: &str) -> Result<String, InferenceError> {
        let reply = self.complete(&[ChatMessage::user(prompt)], &[]).await?;
        Ok(reply.text.unwrap_or_default())
    }

    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<ModelReply, InferenceError> {
        let url = format!("{}/messages", self.settings.base_url);
        let body = to_request(&self.settings, messages, tools);

        tracing::info!(
            url = %url,
            model = %body.model,
            message_count = body.messages.len(),
            tool_count = body.tools.len(),
            "anthropic request"
        );

        let request = self
            .clients
            .http
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body);
        let text = send_for_text(request, &url, self.clients.request_timeout).await?;
        parse_reply(&text)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
