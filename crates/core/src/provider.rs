//! ChatService trait, the abstraction over the chat-completion backend.
//!
//! The engine only ever talks to the model through this trait; the actual
//! wire client (HTTP, routing, auth) lives outside the core. A capability
//! tier resolves to a concrete `model` string before the request is built,
//! so escalation logic never needs to know how the binding works.

use crate::error::ProviderError;
use crate::message::{Message, MessageToolCall};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A chat-completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    /// The concrete model to use (resolved from the current tier)
    pub model: String,

    /// The bounded conversation view to send
    pub messages: Vec<Message>,

    /// Tool definitions the model may call; empty = no-tools mode
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,

    /// Temperature (0.0 = deterministic)
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Maximum tokens to generate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Image attachments for multimodal requests
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ImageAttachment>,
}

fn default_temperature() -> f32 {
    0.7
}

/// An image passed alongside the user task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageAttachment {
    /// Base64 payload or a URL, depending on what the caller has
    pub source: ImageSource,

    /// MIME type, e.g. "image/png"
    pub mime_type: String,
}

/// Where the image bytes come from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageSource {
    Base64(String),
    Url(String),
}

/// A tool definition sent to the model so it knows what it can call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// The tool name
    pub name: String,

    /// Description of what the tool does
    pub description: String,

    /// JSON Schema describing the tool's parameters
    pub parameters: serde_json::Value,
}

/// A complete (non-streaming) response from the chat service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    /// The generated text (may be empty when only tool calls are returned)
    pub text: String,

    /// Tool calls the model wants executed, in request order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<MessageToolCall>,

    /// Token usage statistics
    pub usage: Option<Usage>,

    /// Which model actually responded (may differ from requested)
    pub model: String,
}

impl ChatResponse {
    /// A response with neither text nor tool calls, a no-op turn.
    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty() && self.tool_calls.is_empty()
    }
}

/// Token usage information.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// A single chunk in a streaming response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChunk {
    /// Partial content delta
    #[serde(default)]
    pub content: Option<String>,

    /// Partial tool call deltas
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<MessageToolCall>,

    /// Whether this is the final chunk
    #[serde(default)]
    pub done: bool,

    /// Usage info (typically only in the final chunk)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

/// The chat-completion service the loop consults every iteration.
///
/// The loop wraps every call in its own timeout and retry policy; an
/// implementation should surface transport problems as `ProviderError`
/// rather than retrying internally.
#[async_trait]
pub trait ChatService: Send + Sync {
    /// A human-readable name for this backend.
    fn name(&self) -> &str;

    /// Send a request and get a complete response.
    async fn chat(&self, request: ChatRequest) -> std::result::Result<ChatResponse, ProviderError>;

    /// Send a request and get a stream of response chunks, in order.
    ///
    /// Default implementation calls `chat()` and wraps the result as a
    /// single chunk.
    async fn stream(
        &self,
        request: ChatRequest,
    ) -> std::result::Result<
        tokio::sync::mpsc::Receiver<std::result::Result<StreamChunk, ProviderError>>,
        ProviderError,
    > {
        let response = self.chat(request).await?;
        let (tx, rx) = tokio::sync::mpsc::channel(1);
        let _ = tx
            .send(Ok(StreamChunk {
                content: Some(response.text),
                tool_calls: response.tool_calls,
                done: true,
                usage: response.usage,
            }))
            .await;
        Ok(rx)
    }
}
