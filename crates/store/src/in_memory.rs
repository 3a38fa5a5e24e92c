//! In-memory store: useful for testing and ephemeral sessions.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;
use weft_core::error::StoreError;
use weft_core::message::{Conversation, ConversationId, ConversationPatch, ConversationSummary};
use weft_core::store::ChatStore;

/// Stores conversations in a HashMap. Counts updates so tests can assert on
/// write amplification.
pub struct InMemoryStore {
    conversations: RwLock<HashMap<ConversationId, Conversation>>,
    updates: AtomicUsize,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            conversations: RwLock::new(HashMap::new()),
            updates: AtomicUsize::new(0),
        }
    }

    /// Number of successful `update_conversation` calls so far.
    pub fn update_count(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatStore for InMemoryStore {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn create_conversation(&self, conversation: Conversation) -> Result<Conversation, StoreError> {
        let mut map = self.conversations.write().await;
        if map.contains_key(&conversation.id) {
            return Err(StoreError::Storage(format!(
                "conversation {} already exists",
                conversation.id
            )));
        }
        map.insert(conversation.id.clone(), conversation.clone());
        Ok(conversation)
    }

    async fn get_conversation(&self, id: &ConversationId) -> Result<Option<Conversation>, StoreError> {
        Ok(self.conversations.read().await.get(id).cloned())
    }

    async fn update_conversation(
        &self,
        id: &ConversationId,
        patch: ConversationPatch,
    ) -> Result<Option<Conversation>, StoreError> {
        let mut map = self.conversations.write().await;
        let Some(conversation) = map.get_mut(id) else {
            return Ok(None);
        };
        patch.apply(conversation);
        self.updates.fetch_add(1, Ordering::SeqCst);
        Ok(Some(conversation.clone()))
    }

    async fn list_conversations(&self, limit: usize) -> Result<Vec<ConversationSummary>, StoreError> {
        let map = self.conversations.read().await;
        let mut summaries: Vec<_> = map.values().map(Conversation::summary).collect();
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        summaries.truncate(limit);
        Ok(summaries)
    }

    async fn delete_conversation(&self, id: &ConversationId) -> Result<bool, StoreError> {
        Ok(self.conversations.write().await.remove(id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_core::message::Message;

    #[tokio::test]
    async fn create_get_update() {
        let store = InMemoryStore::new();
        let conv = store.create_conversation(Conversation::new()).await.unwrap();

        let updated = store
            .update_conversation(&conv.id, ConversationPatch::messages(vec![Message::user("hi")]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.messages.len(), 1);
        assert_eq!(store.update_count(), 1);

        let fetched = store.get_conversation(&conv.id).await.unwrap().unwrap();
        assert_eq!(fetched.messages[0].content, "hi");
    }

    #[tokio::test]
    async fn update_unknown_returns_none() {
        let store = InMemoryStore::new();
        let result = store
            .update_conversation(&ConversationId::from("missing"), ConversationPatch::default())
            .await
            .unwrap();
        assert!(result.is_none());
        assert_eq!(store.update_count(), 0);
    }

    #[tokio::test]
    async fn duplicate_create_is_rejected() {
        let store = InMemoryStore::new();
        let conv = Conversation::new();
        store.create_conversation(conv.clone()).await.unwrap();
        assert!(store.create_conversation(conv).await.is_err());
    }

    #[tokio::test]
    async fn list_is_most_recent_first() {
        let store = InMemoryStore::new();
        let a = store.create_conversation(Conversation::with_id(ConversationId::from("a"))).await.unwrap();
        let b = store.create_conversation(Conversation::with_id(ConversationId::from("b"))).await.unwrap();
        store
            .update_conversation(&a.id, ConversationPatch { title: Some("A".into()), ..Default::default() })
            .await
            .unwrap();

        let list = store.list_conversations(10).await.unwrap();
        assert_eq!(list[0].id, a.id);
        assert_eq!(list[1].id, b.id);
        assert_eq!(store.list_conversations(1).await.unwrap().len(), 1);

        assert!(store.delete_conversation(&b.id).await.unwrap());
        assert!(!store.delete_conversation(&b.id).await.unwrap());
    }
}
