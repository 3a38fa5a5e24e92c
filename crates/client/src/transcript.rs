//! Client-side view of one generation, folded from its event stream.
//!
//! A reconnect replays the job's whole log. The transcript counts every
//! non-ping event it has applied; after [`Transcript::begin_replay`] that
//! many events are skipped, so the stitched stream has neither a gap nor a
//! duplicate.

use weft_core::event::StreamEvent;
use weft_core::message::ResponseError;
use weft_core::tool::ToolCallEvent;

/// Where the generation stands, as far as this client has seen.
#[derive(Debug, Clone, PartialEq)]
pub enum TranscriptStatus {
    /// Nothing applied yet.
    Idle,
    Streaming,
    /// Suspended on a plan checkpoint.
    AwaitingApproval,
    Completed,
    Failed(ResponseError),
    Cancelled(String),
}

impl TranscriptStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed(_) | Self::Cancelled(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingPlan {
    pub approval_id: String,
    pub plan: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolRequest {
    pub call_id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct Transcript {
    job_id: Option<String>,
    conversation_id: Option<String>,
    message_id: Option<String>,
    text: String,
    final_text: Option<String>,
    grounding: Option<serde_json::Value>,
    tools: Vec<ToolCallEvent>,
    pending_plan: Option<PendingPlan>,
    tool_requests: Vec<ToolRequest>,
    status: TranscriptStatus,
    applied: usize,
    skip: usize,
}

impl Default for Transcript {
    fn default() -> Self {
        Self::new()
    }
}

impl Transcript {
    pub fn new() -> Self {
        Self {
            job_id: None,
            conversation_id: None,
            message_id: None,
            text: String::new(),
            final_text: None,
            grounding: None,
            tools: Vec::new(),
            pending_plan: None,
            tool_requests: Vec::new(),
            status: TranscriptStatus::Idle,
            applied: 0,
            skip: 0,
        }
    }

    /// Prepare for a reconnect: the next `applied()` events are the replayed
    /// prefix and will be ignored.
    pub fn begin_replay(&mut self) {
        self.skip = self.applied;
    }

    /// Fold one event in. Returns `true` if it was new to this transcript,
    /// `false` for heartbeats, replayed duplicates and anything after a
    /// terminal event.
    pub fn apply(&mut self, event: &StreamEvent) -> bool {
        if event.is_heartbeat() {
            return false;
        }

        // A different job behind the same conversation: start over.
        if let StreamEvent::Start { job_id, .. } = event {
            if self.job_id.as_deref().is_some_and(|current| current != job_id) {
                *self = Self::new();
            }
        }

        if self.skip > 0 {
            self.skip -= 1;
            return false;
        }
        if self.status.is_terminal() {
            return false;
        }

        self.applied += 1;
        if !matches!(event, StreamEvent::PlanReady { .. }) && self.pending_plan.take().is_some() {
            self.status = TranscriptStatus::Streaming;
        }

        match event {
            StreamEvent::Start {
                job_id,
                conversation_id,
                message_id,
            } => {
                self.job_id = Some(job_id.clone());
                self.conversation_id = Some(conversation_id.clone());
                self.message_id = Some(message_id.clone());
                self.status = TranscriptStatus::Streaming;
            }
            StreamEvent::TextChunk { text } => self.text.push_str(text),
            StreamEvent::ToolCallStart(call) => self.tools.push(call.clone()),
            StreamEvent::ToolUpdate { .. } => {}
            StreamEvent::ToolCallEnd(call) => {
                self.tool_requests.retain(|r| r.call_id != call.id);
                match self.tools.iter_mut().find(|t| t.id == call.id) {
                    Some(existing) => *existing = call.clone(),
                    None => self.tools.push(call.clone()),
                }
            }
            StreamEvent::PlanReady { approval_id, plan } => {
                self.pending_plan = Some(PendingPlan {
                    approval_id: approval_id.clone(),
                    plan: plan.clone(),
                });
                self.status = TranscriptStatus::AwaitingApproval;
            }
            StreamEvent::FrontendToolRequest {
                call_id,
                name,
                arguments,
            } => self.tool_requests.push(ToolRequest {
                call_id: call_id.clone(),
                name: name.clone(),
                arguments: arguments.clone(),
            }),
            StreamEvent::Complete { final_text, grounding } => {
                self.final_text = Some(final_text.clone());
                self.grounding = grounding.clone();
                self.status = TranscriptStatus::Completed;
            }
            StreamEvent::Error(error) => self.status = TranscriptStatus::Failed(error.clone()),
            StreamEvent::Cancel { reason } => self.status = TranscriptStatus::Cancelled(reason.clone()),
            StreamEvent::Ping { .. } => {}
        }
        true
    }

    pub fn job_id(&self) -> Option<&str> {
        self.job_id.as_deref()
    }

    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation_id.as_deref()
    }

    pub fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    /// Every text delta streamed so far, across turns.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Text of the final turn, once complete.
    pub fn final_text(&self) -> Option<&str> {
        self.final_text.as_deref()
    }

    pub fn grounding(&self) -> Option<&serde_json::Value> {
        self.grounding.as_ref()
    }

    /// Tool calls in start order; settled ones carry their result.
    pub fn tools(&self) -> &[ToolCallEvent] {
        &self.tools
    }

    pub fn pending_plan(&self) -> Option<&PendingPlan> {
        self.pending_plan.as_ref()
    }

    /// Delegated calls requested and not yet settled.
    pub fn tool_requests(&self) -> &[ToolRequest] {
        &self.tool_requests
    }

    pub fn status(&self) -> &TranscriptStatus {
        &self.status
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    /// Number of non-ping events applied.
    pub fn applied(&self) -> usize {
        self.applied
    }
}
