//! # weft core
//!
//! Domain types, traits, and error definitions for the weft orchestration
//! engine. It depends on nothing heavier than serde and tokio's sync
//! primitives, and defines the model every other crate implements against.
//!
//! ## Seams
//!
//! - [`Provider`]: streamed model turns
//! - [`ChatStore`]: durable conversations
//! - [`Tool`] / [`ToolDispatch`]: capabilities and their dispatch
//! - [`StreamEvent`]: what a job emits to its sinks
//!
//! Every seam is a trait so the loop can be driven by scripted providers and
//! in-memory stores in tests.

pub mod correlation;
pub mod error;
pub mod event;
pub mod message;
pub mod provider;
pub mod store;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use correlation::CorrelationMap;
pub use error::{AgentError, Error, ProviderError, Result, StoreError, ToolError};
pub use event::StreamEvent;
pub use message::{
    Conversation, ConversationId, ConversationPatch, ConversationSummary, ErrorKind, Message,
    MessageToolCall, ResponseError, ResponseMeta, ResponseStatus, Role, ToolResultBlock,
};
pub use provider::{
    ChunkReceiver, FinishReason, Provider, ProviderRequest, ProviderResponse, StreamChunk,
    ToolDefinition, Usage,
};
pub use store::ChatStore;
pub use tool::{
    Tool, ToolCall, ToolCallEvent, ToolContext, ToolDispatch, ToolOutcome, ToolRegistry, ToolResult,
};
