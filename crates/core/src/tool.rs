//! Tool trait: the abstraction over agent capabilities.
//!
//! Two seams live here. [`Tool`] is one in-process capability, collected in a
//! [`ToolRegistry`]. [`ToolDispatch`] is what the agentic loop talks to: it
//! resolves a name to local execution or remote delegation and never fails
//! past its own boundary.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::ToolError;
use crate::event::StreamEvent;
use crate::message::MessageToolCall;
use crate::provider::ToolDefinition;

/// A request to execute a tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique call ID (matches the LLM's tool_call.id)
    pub id: String,

    /// Name of the tool to execute
    pub name: String,

    /// Arguments as a JSON value
    pub arguments: serde_json::Value,
}

/// The result of a tool execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    /// The call ID this result is for
    pub call_id: String,

    /// Whether the tool executed successfully
    pub success: bool,

    /// The output content
    pub output: String,

    /// Optional structured data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Per-call execution context handed to a tool.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub call_id: String,

    /// Fires when the owning job is cancelled.
    pub cancel: CancellationToken,

    events: Option<mpsc::Sender<StreamEvent>>,
}

impl ToolContext {
    pub fn new(call_id: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            call_id: call_id.into(),
            cancel,
            events: None,
        }
    }

    /// Route progress reports onto a job's event stream.
    pub fn with_events(mut self, events: mpsc::Sender<StreamEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Emit a `tool-update` event for this call. Dropped if nobody listens.
    pub async fn report(&self, progress: serde_json::Value) {
        if let Some(events) = &self.events {
            let _ = events
                .send(StreamEvent::ToolUpdate {
                    id: self.call_id.clone(),
                    progress,
                })
                .await;
        }
    }
}

/// The core Tool trait.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool (e.g., "current_time", "http_fetch").
    fn name(&self) -> &str;

    /// A description of what this tool does (sent to the LLM).
    fn description(&self) -> &str;

    /// JSON Schema describing this tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Execute the tool with the given arguments.
    async fn execute(
        &self,
        arguments: serde_json::Value,
        ctx: &ToolContext,
    ) -> std::result::Result<ToolResult, ToolError>;

    /// Convert this tool into a ToolDefinition for sending to the LLM.
    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

/// A registry of in-process tools, shared by every job.
pub struct ToolRegistry {
    tools: HashMap<String, Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool. Replaces any existing tool with the same name.
    pub fn register(&mut self, tool: Box<dyn Tool>) {
        let name = tool.name().to_string();
        self.tools.insert(name, tool);
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.get(name).map(|t| t.as_ref())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Get all tool definitions, sorted by name for a stable prompt.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<_> = self.tools.values().map(|t| t.to_definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Execute a tool call.
    pub async fn execute(
        &self,
        call: &ToolCall,
        ctx: &ToolContext,
    ) -> std::result::Result<ToolResult, ToolError> {
        let tool = self
            .tools
            .get(&call.name)
            .ok_or_else(|| ToolError::NotFound(call.name.clone()))?;
        tool.execute(call.arguments.clone(), ctx).await
    }

    /// List all registered tool names.
    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// What one dispatch settled to: a success output or a structured error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutcome {
    /// The string folded back into history
    pub output: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolOutcome {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            error: None,
        }
    }

    /// Structured error result; the output is a JSON object the model can read.
    pub fn failure(err: &ToolError) -> Self {
        let message = err.to_string();
        let output = serde_json::json!({ "error": message, "code": err.code() }).to_string();
        Self {
            output,
            error: Some(message),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// A tool call as tracked over its lifetime: proposed, dispatched, settled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallEvent {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ToolOutcome>,

    pub start_time: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
}

impl ToolCallEvent {
    /// Start tracking a call proposed by the model.
    pub fn start(call: &MessageToolCall) -> Self {
        Self {
            id: call.id.clone(),
            name: call.name.clone(),
            arguments: parse_arguments(&call.arguments),
            result: None,
            start_time: Utc::now(),
            end_time: None,
        }
    }

    /// Set the result. Returns `false` and leaves the event untouched if a
    /// result was already recorded.
    pub fn complete(&mut self, outcome: ToolOutcome) -> bool {
        if self.result.is_some() {
            return false;
        }
        self.result = Some(outcome);
        self.end_time = Some(Utc::now());
        true
    }

    pub fn is_complete(&self) -> bool {
        self.result.is_some()
    }
}

/// Parse model-provided arguments. Malformed JSON is kept as a raw string.
pub fn parse_arguments(raw: &str) -> serde_json::Value {
    if raw.trim().is_empty() {
        return serde_json::json!({});
    }
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}

/// The dispatcher seam used by the agentic loop.
///
/// Implementations must convert every internal failure into a
/// [`ToolOutcome::failure`]; nothing escapes `dispatch` as an error.
#[async_trait]
pub trait ToolDispatch: Send + Sync {
    /// Schemas of every tool the model may call.
    fn definitions(&self) -> Vec<ToolDefinition>;

    async fn dispatch(&self, name: &str, arguments: &str, call_id: &str) -> ToolOutcome;
}
