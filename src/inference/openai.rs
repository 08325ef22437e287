//! OpenAI Chat Completions client.
//!
//! Speaks `POST {base_url}/chat/completions`, streaming or not. Any
//! OpenAI-compatible endpoint works by pointing `base_url` at it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::client::{parse_body, send_checked, send_for_text, HttpClients, ModelClient, StreamingModelClient};
use super::errors::InferenceError;
use super::streaming::text_deltas;
use super::types::{
    ChatMessage, ModelReply, Provider, Role, TextStream, ToolCall, ToolDefinition,
};
use crate::config::ProviderSettings;

// ─── Wire Types ──────────────────────────────────────────────────────────────

/// Request body for `POST /chat/completions`.
#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'static str>,
    max_tokens: u32,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: Role,
    /// `""` rather than `null` for assistant tool-call turns; some
    /// compatible servers reject `null` content.
    content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireToolCall {
    #[serde(default)]
    id: Option<String>,
    #[serde(default = "function_type")]
    r#type: String,
    function: WireFunctionCall,
}

fn function_type() -> String {
    "function".to_string()
}

#[derive(Debug, Serialize, Deserialize)]
struct WireFunctionCall {
    name: String,
    /// JSON-encoded arguments.
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Serialize)]
struct WireTool {
    r#type: &'static str,
    function: WireFunction,
}

#[derive(Debug, Serialize)]
struct WireFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ResponseChoice>,
}

#[derive(Debug, Deserialize)]
struct ResponseChoice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

/// Raw SSE chunk.
#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

// ─── Conversion ──────────────────────────────────────────────────────────────

fn to_wire_messages(messages: &[ChatMessage]) -> Vec<WireMessage> {
    messages
        .iter()
        .map(|m| WireMessage {
            role: m.role,
            content: m.text().to_string(),
            tool_call_id: m.tool_call_id.clone(),
            tool_calls: m
                .tool_calls
                .iter()
                .map(|tc| WireToolCall {
                    id: Some(tc.id.clone()),
                    r#type: function_type(),
                    function: WireFunctionCall {
                        name: tc.name.clone(),
                        arguments: tc.arguments.to_string(),
                    },
                })
                .collect(),
        })
        .collect()
}

fn to_wire_tools(tools: &[ToolDefinition]) -> Option<Vec<WireTool>> {
    if tools.is_empty() {
        return None;
    }
    Some(
        tools
            .iter()
            .map(|t| WireTool {
                r#type: "function",
                function: WireFunction {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.parameters.clone(),
                },
            })
            .collect(),
    )
}

/// Parse a non-streaming response body into a `ModelReply`.
fn parse_completion(body: &str) -> Result<ModelReply, InferenceError> {
    let resp: ChatCompletionResponse = parse_body(body)?;
    let choice = resp
        .choices
        .into_iter()
        .next()
        .ok_or(InferenceError::InvalidResponse {
            reason: "empty choices array".into(),
        })?;

    let mut tool_calls = Vec::with_capacity(choice.message.tool_calls.len());
    for tc in choice.message.tool_calls {
        let arguments = if tc.function.arguments.trim().is_empty() {
            serde_json::json!({})
        } else {
            serde_json::from_str(&tc.function.arguments).map_err(|e| {
                InferenceError::InvalidResponse {
                    reason: format!("invalid tool call arguments for '{}': {e}", tc.function.name),
                }
            })?
        };
        tool_calls.push(ToolCall {
            id: tc.id.unwrap_or_else(|| format!("call_{}", Uuid::new_v4())),
            name: tc.function.name,
            arguments,
        });
    }

    Ok(ModelReply {
        text: choice.message.content.filter(|c| !c.is_empty()),
        tool_calls,
    })
}

/// Text delta of one SSE chunk.
fn parse_chunk(data: &str) -> Result<Option<String>, InferenceError> {
    let chunk: ChatCompletionChunk =
        serde_json::from_str(data).map_err(|e| InferenceError::StreamError {
            reason: format!("failed to parse SSE chunk: {e} (data: {data})"),
        })?;
    Ok(chunk.choices.into_iter().next().and_then(|c| c.delta.content))
}

// ─── OpenAiClient ────────────────────────────────────────────────────────────

pub struct OpenAiClient {
    clients: HttpClients,
    settings: ProviderSettings,
    api_key: String,
}

impl OpenAiClient {
    pub fn new(clients: HttpClients, settings: ProviderSettings, api_key: &str) -> Self {
        Self {
            clients,
            settings,
            api_key: api_key.to_string(),
        }
    }

    fn url(&self) -> String {
        format!("{}/chat/completions", self.settings.base_url)
    }

    fn request(&self, messages: &[ChatMessage], tools: &[ToolDefinition], stream: bool) -> ChatCompletionRequest {
        let tools = to_wire_tools(tools);
        ChatCompletionRequest {
            model: self.settings.model.clone(),
            messages: to_wire_messages(messages),
            tool_choice: tools.as_ref().map(|_| "auto"),
            tools,
            max_tokens: self.settings.max_tokens,
            stream,
        }
    }
}

#[async_trait]
impl ModelClient for OpenAiClient {
    fn provider(&self) -> Provider {
        Provider::OpenAi
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
        let url = self.url();
        let body = self.request(messages, tools, false);

        tracing::info!(
            url = %url,
            model = %body.model,
            message_count = body.messages.len(),
            tool_count = tools.len(),
            "openai request"
        );

        let request = self
            .clients
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body);
        let text = send_for_text(request, &url, self.clients.request_timeout).await?;
        parse_completion(&text)
    }
}

#[async_trait]
impl StreamingModelClient for OpenAiClient {
    async fn generate_stream(&self, prompt: &str) -> Result<TextStream, InferenceError> {
        let url = self.url();
        let body = self.request(&[ChatMessage::user(prompt)], &[], true);

        tracing::info!(url = %url, model = %body.model, "openai stream request");

        let request = self
            .clients
            .http_stream
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("Accept", "text/event-stream")
            .json(&body);
        let response = send_checked(request, &url, self.clients.request_timeout).await?;
        Ok(text_deltas(response, parse_chunk))
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
