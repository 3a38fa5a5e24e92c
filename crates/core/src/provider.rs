//! Provider trait: the abstraction over LLM backends.
//!
//! A Provider streams a model turn back as incremental chunks: text deltas,
//! completed function-call directives, and a final chunk carrying the finish
//! reason (including safety blocks) and any grounding metadata.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::ProviderError;
use crate::message::{Message, MessageToolCall};

/// A single model invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRequest {
    /// The model to use (e.g., "anthropic/claude-sonnet-4", "gpt-4o")
    pub model: String,

    /// System instruction, sent ahead of the history
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,

    /// The conversation history
    pub messages: Vec<Message>,

    /// Temperature (0.0 = deterministic, 1.0 = creative)
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Maximum tokens to generate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Available tools the model can call
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,

    /// Stop sequences
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
}

fn default_temperature() -> f32 {
    0.7
}

impl ProviderRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            system: None,
            messages,
            temperature: default_temperature(),
            max_tokens: None,
            tools: Vec::new(),
            stop: Vec::new(),
        }
    }
}

/// A tool definition sent to the LLM so it knows what tools it can call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// The tool name
    pub name: String,

    /// Description of what the tool does
    pub description: String,

    /// JSON Schema describing the tool's parameters
    pub parameters: serde_json::Value,
}

/// Token usage information.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Why the model stopped generating.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Length,
    /// Output withheld by a safety filter; the detail names the category
    Safety(String),
}

/// A single chunk in a streaming response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamChunk {
    /// Partial content delta
    #[serde(default)]
    pub content: Option<String>,

    /// Completed tool-call directives
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<MessageToolCall>,

    /// Whether this is the final chunk
    #[serde(default)]
    pub done: bool,

    /// Usage info (typically only in the final chunk)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,

    /// Citation / grounding metadata (typically only in the final chunk)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grounding: Option<serde_json::Value>,
}

impl StreamChunk {
    pub fn text(delta: impl Into<String>) -> Self {
        Self {
            content: Some(delta.into()),
            ..Self::default()
        }
    }

    pub fn finished(reason: FinishReason) -> Self {
        Self {
            done: true,
            finish_reason: Some(reason),
            ..Self::default()
        }
    }
}

/// The result of draining a stream into one assistant turn.
#[derive(Debug, Clone)]
pub struct ProviderResponse {
    pub message: Message,
    pub usage: Option<Usage>,
    pub finish_reason: Option<FinishReason>,
    pub grounding: Option<serde_json::Value>,
}

pub type ChunkReceiver = mpsc::Receiver<std::result::Result<StreamChunk, ProviderError>>;

/// The core Provider trait.
///
/// Every LLM backend implements `stream()`. The loop never calls `complete()`;
/// it exists for one-shot callers such as the CLI health check.
#[async_trait]
pub trait Provider: Send + Sync {
    /// A human-readable name for this provider (e.g., "openrouter", "openai").
    fn name(&self) -> &str;

    /// Send a request and get a stream of response chunks.
    async fn stream(&self, request: ProviderRequest) -> std::result::Result<ChunkReceiver, ProviderError>;

    /// Send a request and collect the whole turn.
    async fn complete(&self, request: ProviderRequest) -> std::result::Result<ProviderResponse, ProviderError> {
        let mut rx = self.stream(request).await?;
        let mut text = String::new();
        let mut calls = Vec::new();
        let mut usage = None;
        let mut finish_reason = None;
        let mut grounding = None;

        while let Some(chunk) = rx.recv().await {
            let chunk = chunk?;
            if let Some(delta) = chunk.content {
                text.push_str(&delta);
            }
            calls.extend(chunk.tool_calls);
            usage = chunk.usage.or(usage);
            finish_reason = chunk.finish_reason.or(finish_reason);
            grounding = chunk.grounding.or(grounding);
            if chunk.done {
                break;
            }
        }

        Ok(ProviderResponse {
            message: Message::assistant(text).with_tool_calls(calls),
            usage,
            finish_reason,
            grounding,
        })
    }

    /// Health check: can we reach the provider?
    async fn health_check(&self) -> std::result::Result<bool, ProviderError> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Canned;

    #[async_trait]
    impl Provider for Canned {
        fn name(&self) -> &str {
            "canned"
        }

        async fn stream(&self, _request: ProviderRequest) -> std::result::Result<ChunkReceiver, ProviderError> {
            let (tx, rx) = mpsc::channel(8);
            tx.send(Ok(StreamChunk::text("hel"))).await.unwrap();
            tx.send(Ok(StreamChunk::text("lo"))).await.unwrap();
            let mut last = StreamChunk::finished(FinishReason::Stop);
            last.grounding = Some(serde_json::json!({"sources": ["a"]}));
            tx.send(Ok(last)).await.unwrap();
            Ok(rx)
        }
    }

    #[tokio::test]
    async fn complete_drains_the_stream() {
        let resp = Canned.complete(ProviderRequest::new("m", vec![])).await.unwrap();
        assert_eq!(resp.message.content, "hello");
        assert_eq!(resp.finish_reason, Some(FinishReason::Stop));
        assert!(resp.grounding.is_some());
    }

    #[test]
    fn provider_request_defaults() {
        let req = ProviderRequest::new("gpt-4o", vec![]);
        assert!((req.temperature - 0.7).abs() < f32::EPSILON);
        assert!(req.system.is_none());
    }

    #[test]
    fn safety_finish_reason_serializes_with_detail() {
        let json = serde_json::to_value(FinishReason::Safety("violence".into())).unwrap();
        assert_eq!(json["reason"], "safety");
        assert_eq!(json["detail"], "violence");
    }
}
