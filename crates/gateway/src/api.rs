//! HTTP API v1.
//!
//! Endpoints:
//!
//! - `POST   /v1/generate`                      : start a generation, stream NDJSON
//! - `GET    /v1/conversations/{id}/stream`     : reattach, replaying before going live
//! - `POST   /v1/conversations/{id}/cancel`     : cancel the active job
//! - `POST   /v1/conversations/{id}/approval`   : answer a plan-ready checkpoint
//! - `POST   /v1/tool-responses`                : answer a frontend tool request
//! - `GET    /v1/conversations`                 : list conversations
//! - `POST   /v1/conversations`                 : create a conversation
//! - `GET    /v1/conversations/{id}`            : fetch a conversation
//! - `DELETE /v1/conversations/{id}`            : delete a conversation
//! - `GET    /v1/jobs`                          : active jobs

use axum::{
    Router,
    body::Body,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{info, warn};

use weft_agent::{ApprovalDecision, ApprovalRegistry};
use weft_core::message::{Conversation, ConversationId, ConversationSummary};
use weft_core::store::ChatStore;
use weft_tools::PendingToolCalls;

use crate::generation::GenerationService;
use crate::jobs::{Job, JobInfo, JobRegistry, SinkId};

pub const NDJSON: &str = "application/x-ndjson";

// ── State ─────────────────────────────────────────────────────────────────

/// Shared state for the v1 API.
pub struct ApiState {
    pub store: Arc<dyn ChatStore>,
    pub jobs: Arc<JobRegistry>,
    pub generation: Arc<GenerationService>,
    pub approvals: Arc<ApprovalRegistry>,
    pub pending_tools: Arc<PendingToolCalls>,
    pub provider_name: String,
    pub start_time: chrono::DateTime<chrono::Utc>,
}

pub type SharedApiState = Arc<ApiState>;

// ── Router ────────────────────────────────────────────────────────────────

/// Build the v1 API router. Nest this under "/v1" in the main router.
pub fn v1_router(state: SharedApiState) -> Router {
    Router::new()
        .route("/generate", post(generate_handler))
        .route("/conversations", get(list_conversations_handler).post(create_conversation_handler))
        .route(
            "/conversations/{id}",
            get(get_conversation_handler).delete(delete_conversation_handler),
        )
        .route("/conversations/{id}/stream", get(reconnect_handler))
        .route("/conversations/{id}/cancel", post(cancel_handler))
        .route("/conversations/{id}/approval", post(approval_handler))
        .route("/tool-responses", post(tool_response_handler))
        .route("/jobs", get(list_jobs_handler))
        .with_state(state)
}

// ── Request / Response types ──────────────────────────────────────────────

#[derive(Deserialize)]
struct GenerateRequest {
    /// Existing conversation ID (omit to create new).
    #[serde(default)]
    conversation_id: Option<String>,
    message: String,
}

#[derive(Deserialize)]
struct ApprovalRequest {
    approval_id: String,
    decision: ApprovalDecision,
}

#[derive(Deserialize)]
struct ToolResponseRequest {
    call_id: String,
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize, Default)]
struct CreateConversationRequest {
    #[serde(default)]
    title: Option<String>,
}

#[derive(Deserialize)]
struct ListQuery {
    #[serde(default = "default_list_limit")]
    limit: usize,
}

fn default_list_limit() -> usize {
    50
}

#[derive(Serialize, Deserialize)]
pub struct ConversationListResponse {
    pub conversations: Vec<ConversationSummary>,
}

#[derive(Serialize, Deserialize)]
pub struct JobListResponse {
    pub jobs: Vec<JobInfo>,
    pub total: usize,
}

#[derive(Serialize, Deserialize)]
pub struct AckResponse {
    pub ok: bool,
}

#[derive(Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(ErrorResponse { error: message.into() }))
}

fn internal(e: impl std::fmt::Display) -> ApiError {
    api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

// ── Streaming ─────────────────────────────────────────────────────────────

/// Detaches its sink when the response body is dropped, e.g. on client
/// disconnect. The job itself keeps running.
struct SinkGuard {
    job: Arc<Job>,
    sink_id: SinkId,
}

impl Drop for SinkGuard {
    fn drop(&mut self) {
        self.job.detach(self.sink_id);
    }
}

/// Attach a sink to `job` and stream its events as NDJSON lines.
fn ndjson_stream(job: Arc<Job>) -> Response {
    let attachment = job.attach();
    let guard = SinkGuard {
        job,
        sink_id: attachment.sink_id,
    };
    let lines = UnboundedReceiverStream::new(attachment.events).map(move |event| {
        let _ = &guard;
        let line = event.to_line().unwrap_or_default();
        Ok::<_, Infallible>(line)
    });

    (
        [(header::CONTENT_TYPE, NDJSON), (header::CACHE_CONTROL, "no-cache")],
        Body::from_stream(lines),
    )
        .into_response()
}

// ── Handlers ──────────────────────────────────────────────────────────────

/// `POST /v1/generate`: start (or preempt) a generation and stream it.
async fn generate_handler(
    State(state): State<SharedApiState>,
    Json(payload): Json<GenerateRequest>,
) -> Result<Response, ApiError> {
    if payload.message.trim().is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "message must not be empty"));
    }
    let conversation_id = payload.conversation_id.as_deref().map(ConversationId::from);
    info!(
        conversation_id = ?conversation_id.as_ref().map(|c| c.to_string()),
        message_len = payload.message.len(),
        "v1/generate request"
    );

    let job = state
        .generation
        .start(conversation_id, payload.message)
        .await
        .map_err(internal)?;
    Ok(ndjson_stream(job))
}

/// `GET /v1/conversations/{id}/stream`: replay the active job, then follow it.
async fn reconnect_handler(
    State(state): State<SharedApiState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let job = state
        .jobs
        .get(&id)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("no active job for conversation '{id}'")))?;
    info!(conversation_id = %id, job_id = %job.id, replay = job.event_count(), "Client reattached");
    Ok(ndjson_stream(job))
}

async fn cancel_handler(
    State(state): State<SharedApiState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<AckResponse>), ApiError> {
    if !state.jobs.cancel(&id, "cancelled by user") {
        return Err(api_error(StatusCode::NOT_FOUND, format!("no active job for conversation '{id}'")));
    }
    info!(conversation_id = %id, "Cancellation requested");
    Ok((StatusCode::ACCEPTED, Json(AckResponse { ok: true })))
}

async fn approval_handler(
    State(state): State<SharedApiState>,
    Path(id): Path<String>,
    Json(payload): Json<ApprovalRequest>,
) -> Result<Json<AckResponse>, ApiError> {
    if state.jobs.get(&id).is_none() {
        return Err(api_error(StatusCode::NOT_FOUND, format!("no active job for conversation '{id}'")));
    }
    if !state.approvals.resolve(&id, &payload.approval_id, payload.decision) {
        warn!(
            conversation_id = %id,
            approval_id = %payload.approval_id,
            "Approval for unknown, settled or foreign checkpoint"
        );
        return Err(api_error(StatusCode::NOT_FOUND, "approval is not pending"));
    }
    Ok(Json(AckResponse { ok: true }))
}

/// `POST /v1/tool-responses`: resolve a delegated tool call. Late answers
/// (after timeout or cancellation) are rejected with 404.
async fn tool_response_handler(
    State(state): State<SharedApiState>,
    Json(payload): Json<ToolResponseRequest>,
) -> Result<Json<AckResponse>, ApiError> {
    let reply = match (payload.error, payload.result) {
        (Some(error), _) => Err(error),
        (None, Some(serde_json::Value::String(text))) => Ok(text),
        (None, Some(value)) => Ok(value.to_string()),
        (None, None) => {
            return Err(api_error(StatusCode::BAD_REQUEST, "either result or error is required"));
        }
    };
    if !state.pending_tools.resolve(&payload.call_id, reply) {
        warn!(call_id = %payload.call_id, "Tool response for unknown or expired call");
        return Err(api_error(StatusCode::NOT_FOUND, "tool call is not pending"));
    }
    Ok(Json(AckResponse { ok: true }))
}

async fn list_conversations_handler(
    State(state): State<SharedApiState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ConversationListResponse>, ApiError> {
    let conversations = state
        .store
        .list_conversations(query.limit)
        .await
        .map_err(internal)?;
    Ok(Json(ConversationListResponse { conversations }))
}

async fn create_conversation_handler(
    State(state): State<SharedApiState>,
    body: axum::body::Bytes,
) -> Result<(StatusCode, Json<Conversation>), ApiError> {
    let payload: CreateConversationRequest = if body.is_empty() {
        CreateConversationRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| api_error(StatusCode::BAD_REQUEST, e.to_string()))?
    };
    let mut conversation = Conversation::new();
    conversation.title = payload.title;
    let created = state
        .store
        .create_conversation(conversation)
        .await
        .map_err(internal)?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn get_conversation_handler(
    State(state): State<SharedApiState>,
    Path(id): Path<String>,
) -> Result<Json<Conversation>, ApiError> {
    state
        .store
        .get_conversation(&ConversationId::from(id.as_str()))
        .await
        .map_err(internal)?
        .map(Json)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("conversation '{id}' not found")))
}

/// Cancels any active job first so its final flush cannot resurrect the
/// conversation.
async fn delete_conversation_handler(
    State(state): State<SharedApiState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if let Some(job) = state.jobs.get(&id) {
        job.cancel("conversation deleted");
        job.wait_finished(std::time::Duration::from_secs(5)).await;
    }
    let deleted = state
        .store
        .delete_conversation(&ConversationId::from(id.as_str()))
        .await
        .map_err(internal)?;
    if deleted {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(api_error(StatusCode::NOT_FOUND, format!("conversation '{id}' not found")))
    }
}

async fn list_jobs_handler(State(state): State<SharedApiState>) -> Json<JobListResponse> {
    let jobs = state.jobs.list();
    let total = jobs.len();
    Json(JobListResponse { jobs, total })
}
