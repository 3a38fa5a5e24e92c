//! Job registry and event broadcaster.
//!
//! A [`Job`] owns the ordered, append-only event log of one in-flight
//! generation and fans every event out to its attached sinks. Attaching
//! replays the log under the same lock that `publish` takes, so a sink never
//! sees a gap or a duplicate between replay and live events. Losing every
//! sink does not end a job; only cancellation or loop termination does.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use weft_core::event::StreamEvent;
use weft_core::message::ConversationId;

/// Reason recorded on a job evicted by a newer request for its conversation.
pub const SUPERSEDED: &str = "superseded";

pub type SinkId = u64;

/// A sink's receiving end. The replayed log is already queued on `events`.
pub struct Attachment {
    pub sink_id: SinkId,
    pub events: mpsc::UnboundedReceiver<StreamEvent>,
}

struct Broadcast {
    log: Vec<StreamEvent>,
    sinks: HashMap<SinkId, mpsc::UnboundedSender<StreamEvent>>,
    next_sink: SinkId,
    closed: bool,
}

pub struct Job {
    pub id: String,
    pub conversation_id: ConversationId,
    pub created_at: DateTime<Utc>,
    cancel: CancellationToken,
    cancel_reason: Mutex<Option<String>>,
    write_fence: CancellationToken,
    broadcast: Mutex<Broadcast>,
    finished: watch::Sender<bool>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Job {
    pub fn new(conversation_id: ConversationId) -> Self {
        let (finished, _) = watch::channel(false);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id,
            created_at: Utc::now(),
            cancel: CancellationToken::new(),
            cancel_reason: Mutex::new(None),
            write_fence: CancellationToken::new(),
            broadcast: Mutex::new(Broadcast {
                log: Vec::new(),
                sinks: HashMap::new(),
                next_sink: 0,
                closed: false,
            }),
            finished,
            heartbeat: Mutex::new(None),
        }
    }

    /// Append to the log (heartbeats excepted) and forward to every sink.
    /// Sinks whose receiver is gone are dropped.
    pub fn publish(&self, event: StreamEvent) {
        let mut broadcast = lock(&self.broadcast);
        if broadcast.closed {
            return;
        }
        broadcast.sinks.retain(|_, sink| sink.send(event.clone()).is_ok());
        if !event.is_heartbeat() {
            broadcast.log.push(event);
        }
    }

    /// Register a sink, replaying the full log to it first. On a finished
    /// job the sink receives the replay and then end of stream.
    pub fn attach(&self) -> Attachment {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut broadcast = lock(&self.broadcast);
        for event in &broadcast.log {
            let _ = tx.send(event.clone());
        }
        let sink_id = broadcast.next_sink;
        broadcast.next_sink += 1;
        if !broadcast.closed {
            broadcast.sinks.insert(sink_id, tx);
        }
        debug!(job_id = %self.id, sink_id, replayed = broadcast.log.len(), "Sink attached");
        Attachment { sink_id, events: rx }
    }

    /// Remove a sink. The job keeps running.
    pub fn detach(&self, sink_id: SinkId) {
        if lock(&self.broadcast).sinks.remove(&sink_id).is_some() {
            debug!(job_id = %self.id, sink_id, "Sink detached");
        }
    }

    /// Signal cancellation. The first reason recorded wins.
    pub fn cancel(&self, reason: &str) {
        let mut current = lock(&self.cancel_reason);
        if current.is_none() {
            *current = Some(reason.to_string());
        }
        drop(current);
        self.cancel.cancel();
    }

    /// Token guarding this job's persistence writes.
    pub fn write_fence(&self) -> CancellationToken {
        self.write_fence.clone()
    }

    /// Stop this job from writing to the store, including a write in flight.
    pub fn revoke_writes(&self) {
        self.write_fence.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_reason(&self) -> Option<String> {
        lock(&self.cancel_reason).clone()
    }

    /// Close every sink and mark the job finished. Later events are ignored.
    pub fn finish(&self) {
        {
            let mut broadcast = lock(&self.broadcast);
            broadcast.closed = true;
            broadcast.sinks.clear();
        }
        if let Some(heartbeat) = lock(&self.heartbeat).take() {
            heartbeat.abort();
        }
        self.finished.send_replace(true);
    }

    pub fn is_finished(&self) -> bool {
        *self.finished.borrow()
    }

    /// Wait until `finish` has run, up to `timeout`. Returns whether it did.
    pub async fn wait_finished(&self, timeout: Duration) -> bool {
        let mut rx = self.finished.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|done| *done))
            .await
            .is_ok_and(|r| r.is_ok())
    }

    /// Snapshot of the replay log.
    pub fn events(&self) -> Vec<StreamEvent> {
        lock(&self.broadcast).log.clone()
    }

    pub fn event_count(&self) -> usize {
        lock(&self.broadcast).log.len()
    }

    pub fn sink_count(&self) -> usize {
        lock(&self.broadcast).sinks.len()
    }

    /// Broadcast a `ping` every `interval` until the job finishes.
    fn start_heartbeat(self: &Arc<Self>, interval: Duration) {
        let job: Weak<Job> = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match job.upgrade() {
                    Some(job) if !job.is_finished() => job.publish(StreamEvent::ping()),
                    _ => break,
                }
            }
        });
        *lock(&self.heartbeat) = Some(handle);
    }

    pub fn info(&self) -> JobInfo {
        let broadcast = lock(&self.broadcast);
        JobInfo {
            job_id: self.id.clone(),
            conversation_id: self.conversation_id.to_string(),
            created_at: self.created_at,
            events: broadcast.log.len(),
            sinks: broadcast.sinks.len(),
            cancelled: self.cancel.is_cancelled(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInfo {
    pub job_id: String,
    pub conversation_id: String,
    pub created_at: DateTime<Utc>,
    pub events: usize,
    pub sinks: usize,
    pub cancelled: bool,
}

/// At most one job per conversation id.
pub struct JobRegistry {
    jobs: Mutex<HashMap<String, Arc<Job>>>,
    heartbeat: Duration,
    preempt_wait: Duration,
}

impl JobRegistry {
    pub fn new(heartbeat: Duration, preempt_wait: Duration) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            heartbeat,
            preempt_wait,
        }
    }

    /// Create a job for `conversation_id`, preempting any existing one.
    ///
    /// The prior job is evicted and cancelled with reason `superseded`, then
    /// awaited (bounded by the preempt wait) so its final flush lands before
    /// the caller loads the conversation. A job that misses the wait loses
    /// its store access so a late flush cannot overwrite the new turn.
    pub async fn get_or_create(&self, conversation_id: &ConversationId) -> Arc<Job> {
        let job = Arc::new(Job::new(conversation_id.clone()));
        let prior = lock(&self.jobs).insert(conversation_id.to_string(), job.clone());
        job.start_heartbeat(self.heartbeat);

        if let Some(prior) = prior {
            info!(
                conversation_id = %conversation_id,
                prior_job = %prior.id,
                job_id = %job.id,
                "Superseding active job"
            );
            prior.cancel(SUPERSEDED);
            if !prior.wait_finished(self.preempt_wait).await {
                warn!(prior_job = %prior.id, "Superseded job did not finish in time; revoking its writes");
                prior.revoke_writes();
            }
        }
        job
    }

    pub fn get(&self, conversation_id: &str) -> Option<Arc<Job>> {
        lock(&self.jobs).get(conversation_id).cloned()
    }

    /// Remove the entry only if it still belongs to `job_id`, so a finishing
    /// job never evicts its successor.
    pub fn remove(&self, conversation_id: &str, job_id: &str) -> bool {
        let mut jobs = lock(&self.jobs);
        if jobs.get(conversation_id).is_some_and(|j| j.id == job_id) {
            jobs.remove(conversation_id);
            return true;
        }
        false
    }

    /// Cancel the active job for a conversation, if any.
    pub fn cancel(&self, conversation_id: &str, reason: &str) -> bool {
        match self.get(conversation_id) {
            Some(job) => {
                job.cancel(reason);
                true
            }
            None => false,
        }
    }

    pub fn list(&self) -> Vec<JobInfo> {
        let mut jobs: Vec<JobInfo> = lock(&self.jobs).values().map(|j| j.info()).collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        jobs
    }

    pub fn len(&self) -> usize {
        lock(&self.jobs).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
