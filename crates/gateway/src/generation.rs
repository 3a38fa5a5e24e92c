//! Per-request wiring: job, history, buffer, dispatcher and loop.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use weft_agent::{AgentLoop, LoopOutcome, PersistenceBuffer, RunContext};
use weft_core::error::{AgentError, StoreError};
use weft_core::event::StreamEvent;
use weft_core::message::{Conversation, ConversationId, ConversationPatch, Message};
use weft_core::store::ChatStore;
use weft_core::tool::ToolRegistry;
use weft_tools::{DelegatedTools, PendingToolCalls, ToolDispatcher};

use crate::jobs::{Job, JobRegistry};

pub struct GenerationService {
    store: Arc<dyn ChatStore>,
    agent: Arc<AgentLoop>,
    tools: Arc<ToolRegistry>,
    delegated: Arc<DelegatedTools>,
    pending_tools: Arc<PendingToolCalls>,
    jobs: Arc<JobRegistry>,
    debounce: Duration,
    event_buffer: usize,
}

impl GenerationService {
    pub fn new(
        store: Arc<dyn ChatStore>,
        agent: Arc<AgentLoop>,
        tools: Arc<ToolRegistry>,
        jobs: Arc<JobRegistry>,
    ) -> Self {
        Self {
            store,
            agent,
            tools,
            delegated: Arc::new(DelegatedTools::empty()),
            pending_tools: Arc::new(PendingToolCalls::new()),
            jobs,
            debounce: Duration::from_millis(1500),
            event_buffer: 256,
        }
    }

    pub fn with_delegated(mut self, delegated: Arc<DelegatedTools>, pending: Arc<PendingToolCalls>) -> Self {
        self.delegated = delegated;
        self.pending_tools = pending;
        self
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn with_event_buffer(mut self, capacity: usize) -> Self {
        self.event_buffer = capacity.max(1);
        self
    }

    /// Start a generation for `message`, preempting any active job on the
    /// same conversation. Returns once `start` is in the job's log; the loop
    /// runs in the background and outlives every sink.
    pub async fn start(
        &self,
        conversation_id: Option<ConversationId>,
        message: String,
    ) -> Result<Arc<Job>, AgentError> {
        let conversation_id = conversation_id.unwrap_or_default();
        let job = self.jobs.get_or_create(&conversation_id).await;

        let history = match self.prepare_history(&conversation_id, message).await {
            Ok(history) => history,
            Err(e) => {
                error!(conversation_id = %conversation_id, error = %e, "Failed to load conversation");
                self.jobs.remove(conversation_id.as_str(), &job.id);
                job.finish();
                return Err(e.into());
            }
        };

        let buffer = PersistenceBuffer::new(
            self.store.clone(),
            conversation_id.clone(),
            history.clone(),
            self.debounce,
        )
        .with_fence(job.write_fence());
        job.publish(StreamEvent::Start {
            job_id: job.id.clone(),
            conversation_id: conversation_id.to_string(),
            message_id: buffer.message_id().to_string(),
        });
        info!(conversation_id = %conversation_id, job_id = %job.id, "Generation started");

        let (tx, rx) = mpsc::channel(self.event_buffer);
        let dispatcher = ToolDispatcher::new(self.tools.clone(), tx.clone(), job.cancel_token())
            .with_delegated(self.delegated.clone(), self.pending_tools.clone());

        tokio::spawn(drive(
            job.clone(),
            self.jobs.clone(),
            self.agent.clone(),
            dispatcher,
            buffer,
            history,
            tx,
            rx,
        ));
        Ok(job)
    }

    /// Load or create the conversation, append the user turn and persist it.
    async fn prepare_history(&self, id: &ConversationId, message: String) -> Result<Vec<Message>, StoreError> {
        let mut messages = match self.store.get_conversation(id).await? {
            Some(conversation) => conversation.messages,
            None => {
                self.store
                    .create_conversation(Conversation::with_id(id.clone()))
                    .await?;
                Vec::new()
            }
        };
        messages.push(Message::user(message));
        self.store
            .update_conversation(id, ConversationPatch::messages(messages.clone()))
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        Ok(messages)
    }
}

/// Run the loop, pump its events into the job, then tear the job down.
#[allow(clippy::too_many_arguments)]
async fn drive(
    job: Arc<Job>,
    jobs: Arc<JobRegistry>,
    agent: Arc<AgentLoop>,
    dispatcher: ToolDispatcher,
    buffer: PersistenceBuffer,
    history: Vec<Message>,
    tx: mpsc::Sender<StreamEvent>,
    mut rx: mpsc::Receiver<StreamEvent>,
) {
    let cancel = job.cancel_token();
    let run = async move {
        let outcome = agent
            .run(
                history,
                RunContext {
                    dispatcher: &dispatcher,
                    buffer: &buffer,
                    events: &tx,
                    cancel: &cancel,
                },
            )
            .await;
        // Closing every sender ends the pump below.
        drop(dispatcher);
        drop(tx);
        outcome
    };
    let pump = async {
        while let Some(event) = rx.recv().await {
            job.publish(event);
        }
    };
    let (outcome, ()) = tokio::join!(run, pump);

    if let LoopOutcome::Cancelled = outcome {
        let reason = job.cancel_reason().unwrap_or_else(|| "cancelled".into());
        job.publish(StreamEvent::Cancel { reason });
    }
    if let LoopOutcome::Failed(e) = &outcome {
        warn!(job_id = %job.id, error = %e, "Job ended with error");
    }

    jobs.remove(job.conversation_id.as_str(), &job.id);
    job.finish();
    info!(job_id = %job.id, events = job.event_count(), "Job finished");
}
