//! Tool dispatcher: one per job.
//!
//! Resolves a tool name to in-process execution through the shared
//! [`ToolRegistry`] or to a client round trip through [`DelegatedTools`].
//! Every failure, including a panicking tool, is converted into a structured
//! error outcome; nothing escapes `dispatch`.

use async_trait::async_trait;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use weft_core::error::ToolError;
use weft_core::event::StreamEvent;
use weft_core::provider::ToolDefinition;
use weft_core::tool::{ToolCall, ToolContext, ToolDispatch, ToolOutcome, ToolRegistry, parse_arguments};

use crate::delegated::{DelegatedTools, PendingToolCalls};

pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    delegated: Arc<DelegatedTools>,
    pending: Arc<PendingToolCalls>,
    events: mpsc::Sender<StreamEvent>,
    cancel: CancellationToken,
}

impl ToolDispatcher {
    /// A dispatcher bound to one job's event stream and cancellation signal.
    pub fn new(
        registry: Arc<ToolRegistry>,
        events: mpsc::Sender<StreamEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            registry,
            delegated: Arc::new(DelegatedTools::empty()),
            pending: Arc::new(PendingToolCalls::new()),
            events,
            cancel,
        }
    }

    /// Enable delegated tools, sharing the process-wide correlation registry.
    pub fn with_delegated(mut self, delegated: Arc<DelegatedTools>, pending: Arc<PendingToolCalls>) -> Self {
        self.delegated = delegated;
        self.pending = pending;
        self
    }

    async fn try_dispatch(&self, name: &str, arguments: &str, call_id: &str) -> Result<String, ToolError> {
        let args = parse_arguments(arguments);
        if !args.is_object() {
            return Err(ToolError::InvalidArguments(format!(
                "arguments for '{name}' must be a JSON object"
            )));
        }

        if self.registry.contains(name) {
            self.run_local(name, args, call_id).await
        } else if self.delegated.contains(name) {
            self.delegated
                .call(&self.pending, &self.events, &self.cancel, name, args, call_id)
                .await
        } else {
            Err(ToolError::NotFound(name.to_string()))
        }
    }

    async fn run_local(&self, name: &str, arguments: serde_json::Value, call_id: &str) -> Result<String, ToolError> {
        let call = ToolCall {
            id: call_id.to_string(),
            name: name.to_string(),
            arguments,
        };
        let ctx = ToolContext::new(call_id, self.cancel.child_token()).with_events(self.events.clone());
        let run = AssertUnwindSafe(self.registry.execute(&call, &ctx)).catch_unwind();

        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(ToolError::Cancelled(name.to_string())),
            result = run => result,
        };

        match result {
            Ok(Ok(res)) if res.success => Ok(res.output),
            Ok(Ok(res)) => Err(ToolError::ExecutionFailed {
                tool_name: name.to_string(),
                reason: res.output,
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ToolError::ExecutionFailed {
                tool_name: name.to_string(),
                reason: "tool panicked".into(),
            }),
        }
    }
}

#[async_trait]
impl ToolDispatch for ToolDispatcher {
    fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs = self.registry.definitions();
        for def in self.delegated.definitions() {
            if !self.registry.contains(&def.name) {
                defs.push(def.clone());
            }
        }
        defs
    }

    async fn dispatch(&self, name: &str, arguments: &str, call_id: &str) -> ToolOutcome {
        let started = Instant::now();
        debug!(tool = %name, call_id = %call_id, "Dispatching tool");

        match self.try_dispatch(name, arguments, call_id).await {
            Ok(output) => {
                info!(tool = %name, duration_ms = started.elapsed().as_millis() as u64, "Tool succeeded");
                ToolOutcome::success(output)
            }
            Err(e) => {
                warn!(tool = %name, code = e.code(), error = %e, "Tool failed");
                ToolOutcome::failure(&e)
            }
        }
    }
}
