//! Delegated tools: executed by the client, not in-process.
//!
//! A delegated call registers a correlation under its call id, emits a
//! `frontend-tool-request` on the job's event stream, and waits for the
//! client to answer through the gateway. The wait ends on the answer, on
//! the round-trip timeout, or on job cancellation. Timeout and cancellation
//! remove the correlation before returning, so a late answer is discarded.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use weft_core::correlation::CorrelationMap;
use weft_core::error::ToolError;
use weft_core::event::StreamEvent;
use weft_core::provider::ToolDefinition;

/// The client's answer: `Ok(output)` or `Err(message)`.
pub type DelegatedReply = Result<String, String>;

/// Process-wide registry of in-flight delegated calls, keyed by call id.
pub type PendingToolCalls = CorrelationMap<DelegatedReply>;

/// Catalog of delegated tools and their round-trip timeout.
pub struct DelegatedTools {
    definitions: Vec<ToolDefinition>,
    timeout: Duration,
}

impl DelegatedTools {
    pub fn new(definitions: Vec<ToolDefinition>, timeout: Duration) -> Self {
        Self { definitions, timeout }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new(), Duration::from_secs(60))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.definitions.iter().any(|d| d.name == name)
    }

    pub fn definitions(&self) -> &[ToolDefinition] {
        &self.definitions
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run one round trip through the client.
    pub async fn call(
        &self,
        pending: &Arc<PendingToolCalls>,
        events: &mpsc::Sender<StreamEvent>,
        cancel: &CancellationToken,
        name: &str,
        arguments: serde_json::Value,
        call_id: &str,
    ) -> Result<String, ToolError> {
        let reply = pending.register(call_id);

        let request = StreamEvent::FrontendToolRequest {
            call_id: call_id.to_string(),
            name: name.to_string(),
            arguments,
        };
        if events.send(request).await.is_err() {
            pending.remove(call_id);
            return Err(ToolError::ExecutionFailed {
                tool_name: name.to_string(),
                reason: "event stream closed before the request was sent".into(),
            });
        }
        debug!(tool = %name, call_id = %call_id, "Awaiting delegated tool response");

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                pending.remove(call_id);
                Err(ToolError::Cancelled(name.to_string()))
            }
            answer = reply => match answer {
                Ok(Ok(output)) => Ok(output),
                Ok(Err(message)) => Err(ToolError::ExecutionFailed {
                    tool_name: name.to_string(),
                    reason: message,
                }),
                Err(_) => Err(ToolError::ExecutionFailed {
                    tool_name: name.to_string(),
                    reason: "correlation was replaced or dropped".into(),
                }),
            },
            _ = tokio::time::sleep(self.timeout) => {
                pending.remove(call_id);
                warn!(tool = %name, call_id = %call_id, timeout_secs = self.timeout.as_secs(), "Delegated tool timed out");
                Err(ToolError::Timeout {
                    tool_name: name.to_string(),
                    timeout_secs: self.timeout.as_secs(),
                })
            }
        }
    }
}
