//! File-based store: one pretty-printed JSON document per conversation.
//!
//! Storage location: `~/.weft/conversations/<id>.json` by default.
//! Writes go to a temporary sibling and are renamed into place, so a crash
//! mid-write leaves the previous version intact.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use weft_core::error::StoreError;
use weft_core::message::{Conversation, ConversationId, ConversationPatch, ConversationSummary};
use weft_core::store::ChatStore;

pub struct FileStore {
    dir: PathBuf,
    /// Serialises read-modify-write cycles.
    write_lock: Mutex<()>,
}

impl FileStore {
    /// Create a store rooted at `dir`. The directory is created on first write.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        debug!(dir = %dir.display(), "File chat store opened");
        Self {
            dir,
            write_lock: Mutex::new(()),
        }
    }

    fn path_for(&self, id: &ConversationId) -> Result<PathBuf, StoreError> {
        let valid = !id.0.is_empty()
            && id.0.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(StoreError::Storage(format!("invalid conversation id '{id}'")));
        }
        Ok(self.dir.join(format!("{}.json", id.0)))
    }

    async fn read(path: &Path) -> Result<Option<Conversation>, StoreError> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::Storage(format!("read {}: {e}", path.display()))),
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| StoreError::Serialization(format!("{}: {e}", path.display())))
    }

    async fn write(&self, path: &Path, conversation: &Conversation) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| StoreError::Storage(format!("Failed to create store directory: {e}")))?;

        let json = serde_json::to_string_pretty(conversation)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| StoreError::Storage(format!("write {}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| StoreError::Storage(format!("rename {}: {e}", path.display())))?;
        Ok(())
    }
}

#[async_trait]
impl ChatStore for FileStore {
    fn name(&self) -> &str {
        "file"
    }

    async fn create_conversation(&self, conversation: Conversation) -> Result<Conversation, StoreError> {
        let path = self.path_for(&conversation.id)?;
        let _guard = self.write_lock.lock().await;
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(StoreError::Storage(format!(
                "conversation {} already exists",
                conversation.id
            )));
        }
        self.write(&path, &conversation).await?;
        Ok(conversation)
    }

    async fn get_conversation(&self, id: &ConversationId) -> Result<Option<Conversation>, StoreError> {
        let path = self.path_for(id)?;
        Self::read(&path).await
    }

    async fn update_conversation(
        &self,
        id: &ConversationId,
        patch: ConversationPatch,
    ) -> Result<Option<Conversation>, StoreError> {
        let path = self.path_for(id)?;
        let _guard = self.write_lock.lock().await;
        let Some(mut conversation) = Self::read(&path).await? else {
            return Ok(None);
        };
        patch.apply(&mut conversation);
        self.write(&path, &conversation).await?;
        Ok(Some(conversation))
    }

    async fn list_conversations(&self, limit: usize) -> Result<Vec<ConversationSummary>, StoreError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::Storage(e.to_string())),
        };

        let mut summaries = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::Storage(e.to_string()))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read(&path).await {
                Ok(Some(conversation)) => summaries.push(conversation.summary()),
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Skipping unreadable conversation file"),
            }
        }

        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        summaries.truncate(limit);
        Ok(summaries)
    }

    async fn delete_conversation(&self, id: &ConversationId) -> Result<bool, StoreError> {
        let path = self.path_for(id)?;
        let _guard = self.write_lock.lock().await;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::Storage(e.to_string())),
        }
    }
}
