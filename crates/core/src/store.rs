//! ChatStore trait: durable conversation storage.
//!
//! The agentic loop only needs get and partial update; the rest serves the
//! HTTP surface. Implementations live in `weft-store`.

use async_trait::async_trait;

use crate::error::StoreError;
use crate::message::{Conversation, ConversationId, ConversationPatch, ConversationSummary};

#[async_trait]
pub trait ChatStore: Send + Sync {
    /// A human-readable name for this backend (e.g., "sqlite", "file").
    fn name(&self) -> &str;

    /// Insert a new conversation. Fails if the id already exists.
    async fn create_conversation(
        &self,
        conversation: Conversation,
    ) -> std::result::Result<Conversation, StoreError>;

    async fn get_conversation(
        &self,
        id: &ConversationId,
    ) -> std::result::Result<Option<Conversation>, StoreError>;

    /// Apply a partial update. Returns `None` if the conversation is unknown.
    async fn update_conversation(
        &self,
        id: &ConversationId,
        patch: ConversationPatch,
    ) -> std::result::Result<Option<Conversation>, StoreError>;

    /// Most recently updated first.
    async fn list_conversations(
        &self,
        limit: usize,
    ) -> std::result::Result<Vec<ConversationSummary>, StoreError>;

    async fn delete_conversation(&self, id: &ConversationId) -> std::result::Result<bool, StoreError>;
}
