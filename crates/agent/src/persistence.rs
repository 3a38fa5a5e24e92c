//! Debounced persistence of an in-flight response.
//!
//! Text deltas accumulate in a pending buffer and reach the store at most
//! once per debounce interval. Structural changes (`update`, `complete`)
//! flush pending text first and write immediately, so a checkpoint never
//! loses a delta that was already streamed.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use weft_core::error::StoreError;
use weft_core::message::{
    ConversationId, ConversationPatch, Message, MessageToolCall, ResponseError, ResponseMeta,
    ResponseStatus,
};
use weft_core::store::ChatStore;
use weft_core::tool::ToolCallEvent;

/// The turns produced by one generation plus the active assistant response.
#[derive(Debug, Clone)]
pub struct ResponseDraft {
    /// Id of the active assistant message; stable for the whole generation.
    pub message_id: String,

    /// Closed turns of this generation, in order.
    pub turns: Vec<Message>,

    /// Flushed text of the active assistant message.
    pub text: String,

    pub meta: ResponseMeta,
}

impl ResponseDraft {
    fn new(message_id: String) -> Self {
        Self {
            message_id,
            turns: Vec::new(),
            text: String::new(),
            meta: ResponseMeta::generating(),
        }
    }

    /// Move the active text into a closed assistant turn carrying `calls`.
    pub fn close_turn(&mut self, calls: Vec<MessageToolCall>) {
        let text = std::mem::take(&mut self.text);
        self.turns.push(Message::assistant(text).with_tool_calls(calls));
    }

    pub fn push_turn(&mut self, message: Message) {
        self.turns.push(message);
    }

    pub fn record_tool_start(&mut self, event: ToolCallEvent) {
        self.meta.tool_events.push(event);
    }

    /// Replace the tracked event with the settled one; unknown ids are appended.
    pub fn record_tool_end(&mut self, event: ToolCallEvent) {
        match self.meta.tool_events.iter_mut().find(|e| e.id == event.id) {
            Some(existing) => {
                if let Some(outcome) = event.result {
                    existing.complete(outcome);
                }
            }
            None => self.meta.tool_events.push(event),
        }
    }

    pub fn finish(
        &mut self,
        status: ResponseStatus,
        error: Option<ResponseError>,
        grounding: Option<serde_json::Value>,
    ) {
        self.meta.status = status;
        self.meta.error = error;
        if grounding.is_some() {
            self.meta.grounding = grounding;
        }
        self.meta.finished_at = Some(chrono::Utc::now());
    }

    fn active_message(&self, timestamp: chrono::DateTime<chrono::Utc>) -> Message {
        let mut message = Message::assistant(self.text.clone()).with_id(self.message_id.clone());
        message.timestamp = timestamp;
        message.response = Some(self.meta.clone());
        message
    }
}

struct Pending {
    text: String,
    timer: Option<JoinHandle<()>>,
    sealed: bool,
    fence: CancellationToken,
}

struct Draft {
    base: Vec<Message>,
    response: ResponseDraft,
    started_at: chrono::DateTime<chrono::Utc>,
}

struct Inner {
    store: Arc<dyn ChatStore>,
    conversation_id: ConversationId,
    message_id: String,
    debounce: Duration,
    pending: Mutex<Pending>,
    draft: tokio::sync::Mutex<Draft>,
    writes: AtomicUsize,
}

/// Coalesces streamed text into bounded-rate writes of the active response.
///
/// Cheap to clone; clones share the same buffer.
#[derive(Clone)]
pub struct PersistenceBuffer {
    inner: Arc<Inner>,
}

impl PersistenceBuffer {
    /// `base` is the conversation history at generation start; every write
    /// stores `base` followed by the turns of this generation.
    pub fn new(
        store: Arc<dyn ChatStore>,
        conversation_id: ConversationId,
        base: Vec<Message>,
        debounce: Duration,
    ) -> Self {
        let message_id = uuid::Uuid::new_v4().to_string();
        Self {
            inner: Arc::new(Inner {
                store,
                conversation_id,
                message_id: message_id.clone(),
                debounce,
                pending: Mutex::new(Pending {
                    text: String::new(),
                    timer: None,
                    sealed: false,
                    fence: CancellationToken::new(),
                }),
                draft: tokio::sync::Mutex::new(Draft {
                    base,
                    response: ResponseDraft::new(message_id),
                    started_at: chrono::Utc::now(),
                }),
                writes: AtomicUsize::new(0),
            }),
        }
    }

    /// Once `fence` is cancelled no further write reaches the store, and a
    /// write already waiting on the store is abandoned.
    pub fn with_fence(self, fence: CancellationToken) -> Self {
        self.inner.lock_pending().fence = fence;
        self
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.inner.conversation_id
    }

    /// Id under which the assistant response is persisted.
    pub fn message_id(&self) -> &str {
        &self.inner.message_id
    }

    /// Number of store writes performed so far.
    pub fn write_count(&self) -> usize {
        self.inner.writes.load(Ordering::SeqCst)
    }

    pub fn is_sealed(&self) -> bool {
        self.inner.lock_pending().sealed
    }

    /// Append a delta and arm the debounce timer if it is not already armed.
    /// Dropped once the buffer is sealed.
    pub fn add_text(&self, delta: &str) {
        let mut pending = self.inner.lock_pending();
        if pending.sealed {
            return;
        }
        pending.text.push_str(delta);
        if pending.timer.is_none() {
            let inner = self.inner.clone();
            pending.timer = Some(tokio::spawn(async move {
                tokio::time::sleep(inner.debounce).await;
                inner.lock_pending().timer = None;
                if let Err(e) = inner.write(false, |_| {}).await {
                    warn!(conversation_id = %inner.conversation_id, error = %e, "Debounced flush failed");
                }
            }));
        }
    }

    /// Merge pending text into the active response and persist it.
    /// A no-op when nothing is pending.
    pub async fn flush(&self) -> Result<(), StoreError> {
        self.inner.disarm();
        self.inner.write(false, |_| {}).await
    }

    /// Flush pending text, apply a structural change, and persist immediately.
    pub async fn update(&self, modifier: impl FnOnce(&mut ResponseDraft)) -> Result<(), StoreError> {
        self.inner.disarm();
        self.inner.write(true, modifier).await
    }

    /// Final checkpoint: like `update`, then seal the buffer so later text
    /// and timers are ignored.
    pub async fn complete(&self, modifier: impl FnOnce(&mut ResponseDraft)) -> Result<(), StoreError> {
        {
            let mut pending = self.inner.lock_pending();
            if pending.sealed {
                return Ok(());
            }
            if let Some(timer) = pending.timer.take() {
                timer.abort();
            }
        }
        let result = self.inner.write(true, modifier).await;
        self.inner.lock_pending().sealed = true;
        result
    }

    /// Snapshot of the draft, for inspection.
    pub async fn draft(&self) -> ResponseDraft {
        self.inner.draft.lock().await.response.clone()
    }
}

impl Inner {
    fn lock_pending(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn disarm(&self) {
        if let Some(timer) = self.lock_pending().timer.take() {
            timer.abort();
        }
    }

    /// Serialised under the draft lock so snapshots reach the store in order.
    async fn write(&self, force: bool, modifier: impl FnOnce(&mut ResponseDraft)) -> Result<(), StoreError> {
        let mut draft = self.draft.lock().await;

        let (text, fence) = {
            let mut pending = self.lock_pending();
            if pending.sealed || pending.fence.is_cancelled() {
                return Ok(());
            }
            (std::mem::take(&mut pending.text), pending.fence.clone())
        };
        if text.is_empty() && !force {
            return Ok(());
        }
        draft.response.text.push_str(&text);
        modifier(&mut draft.response);

        let mut messages = draft.base.clone();
        messages.extend(draft.response.turns.iter().cloned());
        messages.push(draft.response.active_message(draft.started_at));

        self.writes.fetch_add(1, Ordering::SeqCst);
        debug!(
            conversation_id = %self.conversation_id,
            messages = messages.len(),
            "Persisting response"
        );
        let update = self
            .store
            .update_conversation(&self.conversation_id, ConversationPatch::messages(messages));
        let updated = tokio::select! {
            biased;
            _ = fence.cancelled() => {
                warn!(conversation_id = %self.conversation_id, "Write revoked before it reached the store");
                return Ok(());
            }
            updated = update => updated?,
        };
        match updated {
            Some(_) => Ok(()),
            None => Err(StoreError::NotFound(self.conversation_id.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::message::{Conversation, Role};
    use weft_core::tool::ToolOutcome;
    use weft_store::InMemoryStore;

    async fn setup(debounce_ms: u64) -> (Arc<InMemoryStore>, ConversationId, PersistenceBuffer) {
        let store = Arc::new(InMemoryStore::new());
        let mut conv = Conversation::new();
        conv.push(Message::user("hi"));
        let id = conv.id.clone();
        let base = conv.messages.clone();
        store.create_conversation(conv).await.unwrap();
        let buffer = PersistenceBuffer::new(store.clone(), id.clone(), base, Duration::from_millis(debounce_ms));
        (store, id, buffer)
    }

    async fn persisted(store: &InMemoryStore, id: &ConversationId) -> Vec<Message> {
        store.get_conversation(id).await.unwrap().unwrap().messages
    }

    #[tokio::test(start_paused = true)]
    async fn debounce_coalesces_deltas_into_one_write() {
        let (store, id, buffer) = setup(1500).await;
        for delta in ["hel", "lo", "!"] {
            buffer.add_text(delta);
        }
        assert_eq!(buffer.write_count(), 0);

        tokio::time::sleep(Duration::from_millis(1600)).await;
        assert_eq!(buffer.write_count(), 1);

        let messages = persisted(&store, &id).await;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].content, "hello!");
        assert_eq!(messages[1].role, Role::Assistant);
        assert_eq!(messages[1].response.as_ref().unwrap().status, ResponseStatus::Generating);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_rearms_after_firing() {
        let (_store, _id, buffer) = setup(100).await;
        buffer.add_text("a");
        tokio::time::sleep(Duration::from_millis(150)).await;
        buffer.add_text("b");
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(buffer.write_count(), 2);
        assert_eq!(buffer.draft().await.text, "ab");
    }

    #[tokio::test]
    async fn update_flushes_pending_text_before_modifier() {
        let (store, id, buffer) = setup(60_000).await;
        buffer.add_text("Let me check. ");
        let call = MessageToolCall {
            id: "call-1".into(),
            name: "current_time".into(),
            arguments: "{}".into(),
        };
        let event = ToolCallEvent::start(&call);
        buffer
            .update(|d| {
                d.close_turn(vec![call.clone()]);
                d.record_tool_start(event);
            })
            .await
            .unwrap();

        let messages = persisted(&store, &id).await;
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1].content, "Let me check. ");
        assert_eq!(messages[1].tool_calls.len(), 1);
        assert_eq!(messages[2].content, "");
        assert_eq!(messages[2].response.as_ref().unwrap().tool_events.len(), 1);
        assert_eq!(buffer.write_count(), 1);
    }

    #[tokio::test]
    async fn complete_writes_once_and_seals() {
        let (store, id, buffer) = setup(60_000).await;
        buffer.add_text("partial ");
        buffer.add_text("answer");
        buffer
            .complete(|d| d.finish(ResponseStatus::Cancelled, None, None))
            .await
            .unwrap();
        assert_eq!(buffer.write_count(), 1);
        assert!(buffer.is_sealed());

        buffer.add_text("late");
        buffer.flush().await.unwrap();
        buffer.complete(|_| {}).await.unwrap();
        assert_eq!(buffer.write_count(), 1);

        let last = persisted(&store, &id).await.pop().unwrap();
        assert_eq!(last.content, "partial answer");
        let meta = last.response.unwrap();
        assert_eq!(meta.status, ResponseStatus::Cancelled);
        assert!(meta.finished_at.is_some());
    }

    #[tokio::test]
    async fn flush_without_pending_text_does_not_write() {
        let (_store, _id, buffer) = setup(60_000).await;
        buffer.flush().await.unwrap();
        assert_eq!(buffer.write_count(), 0);
    }

    #[tokio::test]
    async fn message_id_is_stable_across_writes() {
        let (store, id, buffer) = setup(60_000).await;
        let message_id = buffer.message_id().to_string();
        buffer.add_text("x");
        buffer.flush().await.unwrap();
        buffer.update(|_| {}).await.unwrap();
        let last = persisted(&store, &id).await.pop().unwrap();
        assert_eq!(last.id, message_id);
    }

    #[test]
    fn tool_end_replaces_tracked_event() {
        let mut draft = ResponseDraft::new("m".into());
        let call = MessageToolCall {
            id: "c".into(),
            name: "t".into(),
            arguments: "{}".into(),
        };
        draft.record_tool_start(ToolCallEvent::start(&call));
        let mut settled = ToolCallEvent::start(&call);
        settled.complete(ToolOutcome::success("ok"));
        draft.record_tool_end(settled);
        assert_eq!(draft.meta.tool_events.len(), 1);
        assert_eq!(draft.meta.tool_events[0].result.as_ref().unwrap().output, "ok");
    }

    #[tokio::test]
    async fn unknown_conversation_is_a_store_error() {
        let store = Arc::new(InMemoryStore::new());
        let buffer = PersistenceBuffer::new(store, ConversationId::from("missing"), vec![], Duration::from_secs(1));
        let err = buffer.update(|_| {}).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn revoked_fence_blocks_later_writes() {
        let (store, id, buffer) = setup(1500).await;
        let fence = CancellationToken::new();
        let buffer = buffer.with_fence(fence.clone());

        buffer.add_text("partial");
        buffer.flush().await.unwrap();
        assert_eq!(persisted(&store, &id).await.len(), 2);

        fence.cancel();
        buffer.add_text(" more");
        buffer
            .complete(|d| d.finish(ResponseStatus::Cancelled, None, None))
            .await
            .unwrap();
        let messages = persisted(&store, &id).await;
        assert_eq!(messages[1].content, "partial");
        assert_eq!(messages[1].response.as_ref().unwrap().status, ResponseStatus::Generating);
    }
}
