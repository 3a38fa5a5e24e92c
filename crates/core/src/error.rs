//! Error types for the weft domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant.

use thiserror::Error;

use crate::message::{ErrorKind, ResponseError};

/// The top-level error type for all weft operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Provider errors ---
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    // --- Tool errors ---
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    // --- Store errors ---
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    // --- Loop errors ---
    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError {
        status_code: u16,
        message: String,
    },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Response blocked by safety filter: {0}")]
    SafetyBlocked(String),

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),
}

impl ProviderError {
    /// Whether a retry has a reasonable chance of succeeding.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::Network(_) | Self::Timeout(_) => true,
            Self::ApiError { status_code, .. } => *status_code >= 500,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Tool execution failed: {tool_name}: {reason}")]
    ExecutionFailed { tool_name: String, reason: String },

    #[error("Tool timed out: {tool_name} after {timeout_secs}s")]
    Timeout { tool_name: String, timeout_secs: u64 },

    #[error("Invalid tool arguments: {0}")]
    InvalidArguments(String),

    #[error("Tool call cancelled: {0}")]
    Cancelled(String),
}

impl ToolError {
    /// Stable machine-readable code carried in structured error results.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::ExecutionFailed { .. } => "execution_failed",
            Self::Timeout { .. } => "timeout",
            Self::InvalidArguments(_) => "invalid_arguments",
            Self::Cancelled(_) => "cancelled",
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Conversation not found: {0}")]
    NotFound(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Errors that end an agentic loop through its error path.
///
/// Cancellation is not an error and has no variant here.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("Plan approval denied")]
    ApprovalDenied,

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Turn limit of {0} reached without a final answer")]
    TurnLimit(u32),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl AgentError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Provider(ProviderError::SafetyBlocked(_)) => ErrorKind::Safety,
            Self::Provider(ProviderError::Timeout(_)) | Self::Timeout(_) => ErrorKind::Timeout,
            Self::Provider(_) => ErrorKind::Provider,
            Self::ApprovalDenied => ErrorKind::ApprovalDenied,
            Self::TurnLimit(_) => ErrorKind::TurnLimit,
            Self::Store(_) => ErrorKind::Store,
        }
    }

    /// The structured form recorded on the response and sent on the wire.
    pub fn to_response_error(&self) -> ResponseError {
        ResponseError {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}
