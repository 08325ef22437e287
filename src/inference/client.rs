//! Model client contracts and the provider factory.
//!
//! Every provider implements [`ModelClient`] (one-shot generation plus
//! tool-calling completion). Providers that can stream also implement
//! [`StreamingModelClient`]. Which one a provider is gets decided once, when
//! the factory builds it, and is carried as a [`DirectModel`] variant.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client as HttpClient;

use super::anthropic::AnthropicClient;
use super::errors::InferenceError;
use super::gemini::GeminiClient;
use super::openai::OpenAiClient;
use super::types::{ChatMessage, ModelReply, Provider, TextStream, ToolDefinition};
use crate::config::{ProviderSettings, ProvidersConfig};

// ─── Constants ───────────────────────────────────────────────────────────────

/// TCP connection timeout used when none is configured.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Total request timeout for streaming calls.
///
/// Streams stay open for the whole reply, so they get a longer budget than
/// blocking calls.
const STREAM_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

// ─── Contracts ───────────────────────────────────────────────────────────────

/// A provider-specific model client.
#[async_trait]
pub trait ModelClient: Send + Sync {
    fn provider(&self) -> Provider;

    /// Model identifier requests are sent to.
    fn model(&self) -> &str;

    /// Single-prompt text generation.
    async fn generate(&self, prompt: &str) -> Result<String, InferenceError>;

    /// Multi-turn completion with tool definitions.
    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
    ) -> Result<ModelReply, InferenceError>;
}

/// A model client that can stream single-prompt generation.
#[async_trait]
pub trait StreamingModelClient: ModelClient {
    async fn generate_stream(&self, prompt: &str) -> Result<TextStream, InferenceError>;
}

/// The direct-chat capability of a provider.
#[derive(Clone)]
pub enum DirectModel {
    Streaming(Arc<dyn StreamingModelClient>),
    Blocking(Arc<dyn ModelClient>),
}

impl DirectModel {
    pub fn provider(&self) -> Provider {
        match self {
            DirectModel::Streaming(c) => c.provider(),
            DirectModel::Blocking(c) => c.provider(),
        }
    }

    pub fn supports_streaming(&self) -> bool {
        matches!(self, DirectModel::Streaming(_))
    }
}

/// A constructed provider: the agent-facing client and its direct capability.
///
/// Both point at the same underlying client.
#[derive(Clone)]
pub struct ProviderModel {
    pub client: Arc<dyn ModelClient>,
    pub direct: DirectModel,
}

impl ProviderModel {
    /// Wrap a streaming-capable client.
    pub fn streaming<C: StreamingModelClient + 'static>(client: C) -> Self {
        let client = Arc::new(client);
        Self {
            client: client.clone(),
            direct: DirectModel::Streaming(client),
        }
    }

    /// Wrap a client without streaming.
    pub fn blocking<C: ModelClient + 'static>(client: C) -> Self {
        let client: Arc<dyn ModelClient> = Arc::new(client);
        Self {
            client: client.clone(),
            direct: DirectModel::Blocking(client),
        }
    }
}

/// Builds provider clients from credentials.
pub trait ModelFactory: Send + Sync {
    fn create(&self, provider: Provider, credential: &str) -> Result<ProviderModel, InferenceError>;
}

// ─── HTTP Factory ────────────────────────────────────────────────────────────

/// Shared HTTP clients handed to every provider client.
#[derive(Clone)]
pub struct HttpClients {
    pub http: HttpClient,
    pub http_stream: HttpClient,
    pub request_timeout: Duration,
}

impl HttpClients {
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> Result<Self, InferenceError> {
        let http = HttpClient::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()
            .map_err(|e| InferenceError::ConfigError {
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        let http_stream = HttpClient::builder()
            .connect_timeout(connect_timeout)
            .timeout(STREAM_REQUEST_TIMEOUT.max(request_timeout))
            .build()
            .map_err(|e| InferenceError::ConfigError {
                reason: format!("failed to build streaming HTTP client: {e}"),
            })?;

        Ok(Self {
            http,
            http_stream,
            request_timeout,
        })
    }
}

/// Production factory: real HTTP clients per provider.
///
/// OpenAI and Gemini stream; Claude is blocking.
pub struct HttpModelFactory {
    providers: ProvidersConfig,
    clients: HttpClients,
}

impl HttpModelFactory {
    pub fn new(
        providers: ProvidersConfig,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self, InferenceError> {
        Ok(Self {
            providers,
            clients: HttpClients::new(connect_timeout, request_timeout)?,
        })
    }

    fn settings(&self, provider: Provider) -> &ProviderSettings {
        self.providers.get(provider)
    }
}

impl ModelFactory for HttpModelFactory {
    fn create(&self, provider: Provider, credential: &str) -> Result<ProviderModel, InferenceError> {
        let credential = credential.trim();
        if credential.is_empty() {
            return Err(InferenceError::MissingCredential {
                provider: provider.display_name().to_string(),
            });
        }

        let settings = self.settings(provider).clone();
        reqwest::Url::parse(&settings.base_url).map_err(|e| InferenceError::ConfigError {
            reason: format!("invalid base_url for {provider}: {e}"),
        })?;

        tracing::info!(
            provider = provider.as_str(),
            model = %settings.model,
            base_url = %settings.base_url,
            "creating model client"
        );

        let clients = self.clients.clone();
        Ok(match provider {
            Provider::OpenAi => {
                ProviderModel::streaming(OpenAiClient::new(clients, settings, credential))
            }
            Provider::Gemini => {
                ProviderModel::streaming(GeminiClient::new(clients, settings, credential))
            }
            Provider::Claude => {
                ProviderModel::blocking(AnthropicClient::new(clients, settings, credential))
            }
        })
    }
}

// ─── HTTP Helpers ────────────────────────────────────────────────────────────

/// Map a `reqwest` send error to an `InferenceError`.
pub(crate) fn map_send_error(url: &str, timeout: Duration, e: reqwest::Error) -> InferenceError {
    if e.is_timeout() {
        InferenceError::Timeout {
            duration_secs: timeout.as_secs(),
        }
    } else {
        InferenceError::ConnectionFailed {
            endpoint: url.to_string(),
            reason: e.to_string(),
        }
    }
}

/// Send a request and return the body of a 2xx response.
pub(crate) async fn send_for_text(
    request: reqwest::RequestBuilder,
    url: &str,
    timeout: Duration,
) -> Result<String, InferenceError> {
    let response = send_checked(request, url, timeout).await?;
    response.text().await.map_err(|e| InferenceError::StreamError {
        reason: format!("failed to read response body: {e}"),
    })
}

/// Send a request, failing with `HttpError` on a non-2xx status.
pub(crate) async fn send_checked(
    request: reqwest::RequestBuilder,
    url: &str,
    timeout: Duration,
) -> Result<reqwest::Response, InferenceError> {
    let response = request
        .send()
        .await
        .map_err(|e| map_send_error(url, timeout, e))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        tracing::warn!(url, status = status.as_u16(), "provider returned error status");
        return Err(InferenceError::HttpError {
            status: status.as_u16(),
            body,
        });
    }
    Ok(response)
}

/// Parse a JSON body into `T`.
pub(crate) fn parse_body<T: serde::de::DeserializeOwned>(body: &str) -> Result<T, InferenceError> {
    serde_json::from_str(body).map_err(|e| InferenceError::InvalidResponse {
        reason: format!("failed to parse response: {e}"),
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn factory() -> HttpModelFactory {
        HttpModelFactory::new(
            ProvidersConfig::default(),
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .unwrap()
    }

    #[test]
    fn test_factory_capabilities() {
        let f = factory();
        let openai = f.create(Provider::OpenAi, "sk").unwrap();
        assert!(openai.direct.supports_streaming());
        assert_eq!(openai.client.model(), "gpt-4o-mini");

        let gemini = f.create(Provider::Gemini, "g").unwrap();
        assert!(gemini.direct.supports_streaming());
        assert_eq!(gemini.direct.provider(), Provider::Gemini);

        let claude = f.create(Provider::Claude, "c").unwrap();
        assert!(!claude.direct.supports_streaming());
        assert_eq!(claude.client.provider(), Provider::Claude);
    }

    #[test]
    fn test_factory_rejects_blank_credential() {
        let err = factory().create(Provider::OpenAi, "  ").err().unwrap();
        assert!(matches!(err, InferenceError::MissingCredential { .. }));
    }

    #[test]
    fn test_factory_rejects_bad_base_url() {
        let mut providers = ProvidersConfig::default();
        providers.openai.base_url = "not a url".into();
        let f = HttpModelFactory::new(providers, Duration::from_secs(1), Duration::from_secs(1))
            .unwrap();
        assert!(matches!(
            f.create(Provider::OpenAi, "sk").err().unwrap(),
            InferenceError::ConfigError { .. }
        ));
    }

    #[test]
    fn test_parse_body_error() {
        let err = parse_body::<serde_json::Value>("not json").unwrap_err();
        assert!(matches!(err, InferenceError::InvalidResponse { .. }));
    }
}
