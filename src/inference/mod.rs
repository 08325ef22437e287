//! Inference: hosted model provider clients.
//!
//! This module handles all communication with the model providers:
//! - OpenAI Chat Completions (streaming and non-streaming)
//! - Anthropic Messages (non-streaming)
//! - Gemini `generateContent` (streaming and non-streaming)
//! - Tool-calling completions for the agent
//! - SSE stream parsing
//!
//! Callers depend on the `ModelClient` contracts, never on a provider type,
//! so switching providers is a key change, not a code change.

pub mod anthropic;
pub mod client;
pub mod errors;
pub mod gemini;
pub mod openai;
pub mod streaming;
pub mod types;

// Re-exports for convenience
pub use client::{
    DirectModel, HttpModelFactory, ModelClient, ModelFactory, ProviderModel, StreamingModelClient,
};
pub use errors::InferenceError;
pub use types::{
    ApiKeys, ChatMessage, ModelReply, Provider, Role, TextStream, ToolCall, ToolDefinition,
};
