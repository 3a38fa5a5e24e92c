//! Wire events streamed from a job to its attached sinks.
//!
//! Each event serialises to one NDJSON line of the form
//! `{"type": "<kebab-case>", "payload": {...}}`.

use serde::{Deserialize, Serialize};

use crate::message::ResponseError;
use crate::tool::ToolCallEvent;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum StreamEvent {
    /// First event of every job.
    Start {
        job_id: String,
        conversation_id: String,
        /// Id of the assistant message the response is persisted under
        message_id: String,
    },

    TextChunk { text: String },

    ToolCallStart(ToolCallEvent),

    /// Progress reported by a running tool.
    ToolUpdate {
        id: String,
        progress: serde_json::Value,
    },

    /// A tool call settled; `result` is always set.
    ToolCallEnd(ToolCallEvent),

    /// The loop is suspended until `approval_id` is resolved.
    PlanReady { approval_id: String, plan: String },

    /// A delegated tool must be executed by the client, which answers with
    /// the same `call_id`.
    FrontendToolRequest {
        call_id: String,
        name: String,
        arguments: serde_json::Value,
    },

    Complete {
        final_text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        grounding: Option<serde_json::Value>,
    },

    Error(ResponseError),

    Cancel { reason: String },

    /// Liveness only; never part of the replay log.
    Ping { ts: i64 },
}

impl StreamEvent {
    /// The wire `type` tag.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::TextChunk { .. } => "text-chunk",
            Self::ToolCallStart(_) => "tool-call-start",
            Self::ToolUpdate { .. } => "tool-update",
            Self::ToolCallEnd(_) => "tool-call-end",
            Self::PlanReady { .. } => "plan-ready",
            Self::FrontendToolRequest { .. } => "frontend-tool-request",
            Self::Complete { .. } => "complete",
            Self::Error(_) => "error",
            Self::Cancel { .. } => "cancel",
            Self::Ping { .. } => "ping",
        }
    }

    /// Complete, error and cancel end a job's stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete { .. } | Self::Error(_) | Self::Cancel { .. })
    }

    pub fn is_heartbeat(&self) -> bool {
        matches!(self, Self::Ping { .. })
    }

    pub fn ping() -> Self {
        Self::Ping {
            ts: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Serialise as one newline-terminated NDJSON line.
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim_end())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ErrorKind;

    #[test]
    fn text_chunk_wire_shape() {
        let line = StreamEvent::TextChunk { text: "hel".into() }.to_line().unwrap();
        assert!(line.ends_with('\n'));
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["type"], "text-chunk");
        assert_eq!(value["payload"]["text"], "hel");
    }

    #[test]
    fn error_payload_is_flat() {
        let event = StreamEvent::Error(ResponseError {
            kind: ErrorKind::ApprovalDenied,
            message: "Plan approval denied".into(),
        });
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["payload"]["kind"], "approval_denied");
        assert!(event.is_terminal());
    }

    #[test]
    fn event_type_matches_serde_tag() {
        let events = vec![
            StreamEvent::Start { job_id: "j".into(), conversation_id: "c".into(), message_id: "m".into() },
            StreamEvent::PlanReady { approval_id: "a".into(), plan: "p".into() },
            StreamEvent::FrontendToolRequest { call_id: "x".into(), name: "n".into(), arguments: serde_json::json!({}) },
            StreamEvent::Complete { final_text: "done".into(), grounding: None },
            StreamEvent::Cancel { reason: "user".into() },
            StreamEvent::ping(),
        ];
        for event in events {
            let value = serde_json::to_value(&event).unwrap();
            assert_eq!(value["type"], event.event_type());
            let back = StreamEvent::from_line(&event.to_line().unwrap()).unwrap();
            assert_eq!(back, event);
        }
    }

    #[test]
    fn only_ping_is_heartbeat() {
        assert!(StreamEvent::ping().is_heartbeat());
        assert!(!StreamEvent::TextChunk { text: String::new() }.is_heartbeat());
        assert!(!StreamEvent::ping().is_terminal());
    }
}
