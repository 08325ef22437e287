//! Google Gemini `generateContent` client.
//!
//! Blocking calls use `models/{model}:generateContent`; streaming uses
//! `models/{model}:streamGenerateContent?alt=sse`, whose events each carry a
//! partial `GenerateContentResponse`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::client::{parse_body, send_checked, send_for_text, HttpClients, ModelClient, StreamingModelClient};
use super::errors::InferenceError;
use super::streaming::text_deltas;
use super::types::{ChatMessage, ModelReply, Provider, Role, TextStream, ToolCall, ToolDefinition};
use crate::config::ProviderSettings;

// ─── Wire Types ──────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTools>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    max_output_tokens: u32,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    function_call: Option<FunctionCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    function_response: Option<FunctionResponse>,
}

#[derive(Debug, Serialize, Deserialize)]
struct FunctionCall {
    name: String,
    #[serde(default)]
    args: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct FunctionResponse {
    name: String,
    response: serde_json::Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireTools {
    function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Debug, Serialize)]
struct FunctionDeclaration {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Content,
}

// ─── Conversion ──────────────────────────────────────────────────────────────

fn text_part(text: &str) -> Part {
    Part {
        text: Some(text.to_string()),
        ..Part::default()
    }
}

fn to_request(
    settings: &ProviderSettings,
    messages: &[ChatMessage],
    tools: &[ToolDefinition],
) -> GenerateContentRequest {
    let system: Vec<Part> = messages
        .iter()
        .filter(|m| m.role == Role::System && !m.text().is_empty())
        .map(|m| text_part(m.text()))
        .collect();

    let mut contents: Vec<Content> = Vec::new();
    for m in messages.iter().filter(|m| m.role != Role::System) {
        let (role, parts) = match m.role {
            Role::User => ("user", vec![text_part(m.text())]),
            Role::Assistant => {
                let mut parts = Vec::new();
                if !m.text().is_empty() {
                    parts.push(text_part(m.text()));
                }
                parts.extend(m.tool_calls.iter().map(|tc| Part {
                    function_call: Some(FunctionCall {
                        name: tc.name.clone(),
                        args: tc.arguments.clone(),
                    }),
                    ..Part::default()
                }));
                ("model", parts)
            }
            Role::Tool => (
                "user",
                vec![Part {
                    function_response: Some(FunctionResponse {
                        name: m.name.clone().unwrap_or_default(),
                        response: serde_json::json!({ "content": m.text() }),
                    }),
                    ..Part::default()
                }],
            ),
            Role::System => continue,
        };

        if parts.is_empty() {
            continue;
        }
        match contents.last_mut() {
            Some(last) if last.role.as_deref() == Some(role) => last.parts.extend(parts),
            _ => contents.push(Content {
                role: Some(role.to_string()),
                parts,
            }),
        }
    }

    let tools = if tools.is_empty() {
        Vec::new()
    } else {
        vec![WireTools {
            function_declarations: tools
                .iter()
                .map(|t| FunctionDeclaration {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.parameters.clone(),
                })
                .collect(),
        }]
    };

    GenerateContentRequest {
        contents,
        system_instruction: (!system.is_empty()).then(|| Content {
            role: None,
            parts: system,
        }),
        tools,
        generation_config: GenerationConfig {
            max_output_tokens: settings.max_tokens,
        },
    }
}

fn first_candidate(resp: GenerateContentResponse) -> Content {
    resp.candidates
        .into_iter()
        .next()
        .map(|c| c.content)
        .unwrap_or_default()
}

fn parse_reply(body: &str) -> Result<ModelReply, InferenceError> {
    let resp: GenerateContentResponse = parse_body(body)?;
    let mut text = String::new();
    let mut tool_calls = Vec::new();

    for part in first_candidate(resp).parts {
        if let Some(t) = part.text {
            text.push_str(&t);
        }
        if let Some(call) = part.function_call {
            tool_calls.push(ToolCall {
                // Gemini does not assign call ids.
                id: format!("call_{}", Uuid::new_v4()),
                name: call.name,
                arguments: if call.args.is_null() {
                    serde_json::json!({})
                } else {
                    call.args
                },
            });
        }
    }

    Ok(ModelReply {
        text: (!text.is_empty()).then_some(text),
        tool_calls,
    })
}

/// Text delta of one streamed event.
fn parse_chunk(data: &str) -> Result<Option<String>, InferenceError> {
    let resp: GenerateContentResponse =
        serde_json::from_str(data).map_err(|e| InferenceError::StreamError {
            reason: format!("failed to parse SSE chunk: {e} (data: {data})"),
        })?;
    let text: String = first_candidate(resp)
        .parts
        .into_iter()
        .filter_map(|p| p.text)
        .collect();
    Ok((!text.is_empty()).then_some(text))
}

// ─── GeminiClient ────────────────────────────────────────────────────────────

pub struct GeminiClient {
    clients: HttpClients,
    settings: ProviderSettings,
    api_key: String,
}

impl GeminiClient {
    pub fn new(clients: HttpClients, settings: ProviderSettings, api_key: &str) -> Self {
        Self {
            clients,
            settings,
            api_key: api_key.to_string(),
        }
    }

    fn url(&self, method: &str) -> String {
        format!("{}/models/{}:{method}", self.settings.base_url, self.settings.model)
    }
}

#[async_trait]
impl ModelClient for GeminiClient {
    fn provider(&self) -> Provider {
        Provider::Gemini
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
        let url = self.url("generateContent");
        let body = to_request(&self.settings, messages, tools);

        tracing::info!(
            url = %url,
            content_count = body.contents.len(),
            tool_count = tools.len(),
            "gemini request"
        );

        let request = self
            .clients
            .http
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body);
        let text = send_for_text(request, &url, self.clients.request_timeout).await?;
        parse_reply(&text)
    }
}

#[async_trait]
impl StreamingModelClient for GeminiClient {
    async fn generate_stream(&self, prompt: &str) -> Result<TextStream, InferenceError> {
        let url = self.url("streamGenerateContent");
        let body = to_request(&self.settings, &[ChatMessage::user(prompt)], &[]);

        tracing::info!(url = %url, "gemini stream request");

        let request = self
            .clients
            .http_stream
            .post(&url)
            .query(&[("alt", "sse")])
            .header("x-goog-api-key", &self.api_key)
            .json(&body);
        let response = send_checked(request, &url, self.clients.request_timeout).await?;
        Ok(text_deltas(response, parse_chunk))
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> ProviderSettings {
        ProviderSettings::default_for(Provider::Gemini)
    }

    #[test]
    fn test_request_shape() {
        let req = to_request(
            &settings(),
            &[ChatMessage::system("sys"), ChatMessage::user("hi")],
            &[ToolDefinition {
                name: "s__t".into(),
                description: "tool".into(),
                parameters: serde_json::json!({"type": "object", "properties": {}}),
            }],
        );
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["systemInstruction"]["parts"][0]["text"], "sys");
        assert_eq!(json["contents"][0]["role"], "user");
        assert_eq!(json["contents"][0]["parts"][0]["text"], "hi");
        assert_eq!(json["tools"][0]["functionDeclarations"][0]["name"], "s__t");
        assert_eq!(json["generationConfig"]["maxOutputTokens"], 4096);
    }

    #[test]
    fn test_tool_turns_use_model_role_and_function_response() {
        let call = ToolCall {
            id: "call_1".into(),
            name: "s__t".into(),
            arguments: serde_json::json!({"a": 1}),
        };
        let req = to_request(
            &settings(),
            &[
                ChatMessage::user("go"),
                ChatMessage::assistant_tool_calls(None, vec![call.clone()]),
                ChatMessage::tool_result(&call, "result"),
            ],
            &[],
        );
        let json = serde_json::to_value(&req.contents).unwrap();
        assert_eq!(json[1]["role"], "model");
        assert_eq!(json[1]["parts"][0]["functionCall"]["name"], "s__t");
        assert_eq!(json[2]["parts"][0]["functionResponse"]["response"]["content"], "result");
    }

    #[test]
    fn test_parse_reply_function_call() {
        let body = r#"{
            "candidates": [{
                "content": {"role": "model", "parts": [
                    {"functionCall": {"name": "s__search", "args": {"q": "x"}}}
                ]},
                "finishReason": "STOP"
            }]
        }"#;
        let reply = parse_reply(body).unwrap();
        assert!(reply.text.is_none());
        assert_eq!(reply.tool_calls[0].name, "s__search");
        assert!(reply.tool_calls[0].id.starts_with("call_"));
    }

    #[test]
    fn test_parse_reply_no_candidates_is_empty() {
        let reply = parse_reply(r#"{"candidates": []}"#).unwrap();
        assert_eq!(reply, ModelReply::default());
    }

    #[test]
    fn test_parse_chunk_text() {
        let data = r#"{"candidates":[{"content":{"parts":[{"text":"Hel"},{"text":"lo"}],"role":"model"}}]}"#;
        assert_eq!(parse_chunk(data).unwrap().as_deref(), Some("Hello"));
        assert_eq!(parse_chunk(r#"{"candidates":[]}"#).unwrap(), None);
    }
}
