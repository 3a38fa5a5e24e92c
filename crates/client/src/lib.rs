//! Client side of the weft streaming protocol.
//!
//! - [`LineDecoder`] splits a chunked NDJSON body into lines.
//! - [`Transcript`] folds events into client state and absorbs the replayed
//!   prefix after a reconnect.
//! - [`GatewayClient`] talks to the gateway; [`Follower`] drives a
//!   generation to its end, reattaching when the connection drops.

pub mod client;
pub mod ndjson;
pub mod transcript;

pub use client::{EventStream, Follower, GatewayClient};
pub use ndjson::LineDecoder;
pub use transcript::{PendingPlan, ToolRequest, Transcript, TranscriptStatus};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Gateway returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Malformed event line: {0}")]
    Decode(serde_json::Error),

    #[error("No active job for conversation '{0}'")]
    NoActiveJob(String),

    #[error("Stream dropped before the conversation was known")]
    Disconnected,

    #[error("Gave up reconnecting after {0} attempts")]
    ReconnectExhausted(u32),
}
