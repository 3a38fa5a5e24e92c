//! HTTP client for the weft gateway.

use serde::Deserialize;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, info, warn};
use weft_core::event::StreamEvent;
use weft_core::message::{Conversation, ConversationSummary};

use crate::ClientError;
use crate::ndjson::LineDecoder;
use crate::transcript::Transcript;

/// Base reconnect delay, doubled per consecutive failed attempt.
const BASE_RECONNECT_DELAY_MS: u64 = 250;
/// Ceiling for a single reconnect delay.
const MAX_RECONNECT_DELAY_MS: u64 = 8_000;
const MAX_RECONNECT_ATTEMPTS: u32 = 6;

#[derive(Deserialize)]
struct ErrorBody {
    error: String,
}

#[derive(Deserialize)]
struct ConversationList {
    conversations: Vec<ConversationSummary>,
}

/// Typed wrapper over the gateway's v1 API.
#[derive(Clone)]
pub struct GatewayClient {
    base_url: String,
    http: reqwest::Client,
    max_reconnects: u32,
    base_delay: Duration,
}

impl GatewayClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
            max_reconnects: MAX_RECONNECT_ATTEMPTS,
            base_delay: Duration::from_millis(BASE_RECONNECT_DELAY_MS),
        }
    }

    /// Bound the reconnect loop of [`Follower`].
    pub fn with_reconnect(mut self, max_attempts: u32, base_delay: Duration) -> Self {
        self.max_reconnects = max_attempts;
        self.base_delay = base_delay;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1{}", self.base_url, path)
    }

    /// Delay before reconnect attempt `attempt` (0-based).
    fn backoff(&self, attempt: u32) -> Duration {
        let delay = self.base_delay.saturating_mul(2u32.saturating_pow(attempt));
        delay.min(Duration::from_millis(MAX_RECONNECT_DELAY_MS))
    }

    /// Start a generation and return its live stream.
    pub async fn generate(&self, conversation_id: Option<&str>, message: &str) -> Result<EventStream, ClientError> {
        let body = serde_json::json!({
            "conversation_id": conversation_id,
            "message": message,
        });
        let response = self.http.post(self.url("/generate")).json(&body).send().await?;
        Ok(EventStream::new(check(response).await?))
    }

    /// Reattach to the active job of `conversation_id`.
    pub async fn attach(&self, conversation_id: &str) -> Result<EventStream, ClientError> {
        let response = self
            .http
            .get(self.url(&format!("/conversations/{conversation_id}/stream")))
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(ClientError::NoActiveJob(conversation_id.to_string()));
        }
        Ok(EventStream::new(check(response).await?))
    }

    pub async fn cancel(&self, conversation_id: &str) -> Result<(), ClientError> {
        let response = self
            .http
            .post(self.url(&format!("/conversations/{conversation_id}/cancel")))
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    /// Approve a plan checkpoint; `instruction` becomes the next user turn.
    pub async fn approve(&self, conversation_id: &str, approval_id: &str, instruction: &str) -> Result<(), ClientError> {
        self.decide(conversation_id, approval_id, serde_json::json!(instruction))
            .await
    }

    pub async fn deny(&self, conversation_id: &str, approval_id: &str) -> Result<(), ClientError> {
        self.decide(conversation_id, approval_id, serde_json::json!(false))
            .await
    }

    async fn decide(&self, conversation_id: &str, approval_id: &str, decision: serde_json::Value) -> Result<(), ClientError> {
        let body = serde_json::json!({ "approval_id": approval_id, "decision": decision });
        let response = self
            .http
            .post(self.url(&format!("/conversations/{conversation_id}/approval")))
            .json(&body)
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    /// Answer a `frontend-tool-request`.
    pub async fn respond_tool(&self, call_id: &str, reply: Result<String, String>) -> Result<(), ClientError> {
        let body = match reply {
            Ok(result) => serde_json::json!({ "call_id": call_id, "result": result }),
            Err(error) => serde_json::json!({ "call_id": call_id, "error": error }),
        };
        let response = self.http.post(self.url("/tool-responses")).json(&body).send().await?;
        check(response).await?;
        Ok(())
    }

    pub async fn list_conversations(&self, limit: usize) -> Result<Vec<ConversationSummary>, ClientError> {
        let response = self
            .http
            .get(self.url("/conversations"))
            .query(&[("limit", limit)])
            .send()
            .await?;
        let list: ConversationList = check(response).await?.json().await?;
        Ok(list.conversations)
    }

    pub async fn get_conversation(&self, conversation_id: &str) -> Result<Conversation, ClientError> {
        let response = self
            .http
            .get(self.url(&format!("/conversations/{conversation_id}")))
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }

    /// Follow `stream` to its terminal event, reattaching on disconnect.
    pub fn follow(&self, stream: EventStream) -> Follower<'_> {
        Follower {
            client: self,
            stream: Some(stream),
            transcript: Transcript::new(),
            attempts: 0,
        }
    }
}

/// Map a non-success status to [`ClientError::Api`] with the server's message.
async fn check(response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&text)
        .map(|b| b.error)
        .unwrap_or(text);
    Err(ClientError::Api {
        status: status.as_u16(),
        message,
    })
}

/// One NDJSON response body, decoded event by event.
pub struct EventStream {
    response: reqwest::Response,
    decoder: LineDecoder,
    lines: VecDeque<String>,
    done: bool,
}

impl EventStream {
    fn new(response: reqwest::Response) -> Self {
        Self {
            response,
            decoder: LineDecoder::new(),
            lines: VecDeque::new(),
            done: false,
        }
    }

    /// The next event, or `None` once the body has ended.
    pub async fn next_event(&mut self) -> Option<Result<StreamEvent, ClientError>> {
        loop {
            if let Some(line) = self.lines.pop_front() {
                return Some(StreamEvent::from_line(&line).map_err(ClientError::Decode));
            }
            if self.done {
                return None;
            }
            match self.response.chunk().await {
                Ok(Some(bytes)) => self.lines.extend(self.decoder.push(&bytes)),
                Ok(None) => {
                    self.done = true;
                    self.lines.extend(self.decoder.finish());
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(ClientError::Http(e)));
                }
            }
        }
    }
}

/// Drives a generation to its end across disconnects.
///
/// Each call to [`Follower::next`] yields the next event that is new to the
/// transcript. A dropped connection is reattached with bounded exponential
/// backoff; the replayed prefix is absorbed by the transcript.
pub struct Follower<'a> {
    client: &'a GatewayClient,
    stream: Option<EventStream>,
    transcript: Transcript,
    attempts: u32,
}

impl Follower<'_> {
    /// The next new event, or `Ok(None)` after the terminal event.
    pub async fn next(&mut self) -> Result<Option<StreamEvent>, ClientError> {
        loop {
            if self.transcript.is_finished() {
                return Ok(None);
            }
            let Some(stream) = self.stream.as_mut() else {
                self.reconnect().await?;
                continue;
            };
            match stream.next_event().await {
                Some(Ok(event)) => {
                    if self.transcript.apply(&event) {
                        self.attempts = 0;
                        return Ok(Some(event));
                    }
                }
                Some(Err(ClientError::Decode(e))) => warn!(error = %e, "Skipping malformed stream line"),
                Some(Err(e)) => {
                    warn!(error = %e, "Stream interrupted");
                    self.stream = None;
                }
                None => {
                    debug!("Stream ended before a terminal event");
                    self.stream = None;
                }
            }
        }
    }

    async fn reconnect(&mut self) -> Result<(), ClientError> {
        let conversation_id = self
            .transcript
            .conversation_id()
            .map(str::to_string)
            .ok_or(ClientError::Disconnected)?;

        loop {
            if self.attempts >= self.client.max_reconnects {
                return Err(ClientError::ReconnectExhausted(self.attempts));
            }
            let delay = self.client.backoff(self.attempts);
            self.attempts += 1;
            tokio::time::sleep(delay).await;

            match self.client.attach(&conversation_id).await {
                Ok(stream) => {
                    info!(
                        conversation_id = %conversation_id,
                        attempt = self.attempts,
                        skip = self.transcript.applied(),
                        "Reattached to job"
                    );
                    self.transcript.begin_replay();
                    self.stream = Some(stream);
                    return Ok(());
                }
                Err(e @ ClientError::NoActiveJob(_)) => return Err(e),
                Err(e) => warn!(attempt = self.attempts, error = %e, "Reconnect failed"),
            }
        }
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn into_transcript(self) -> Transcript {
        self.transcript
    }
}
