//! Chat metadata and transcript persistence.
//!
//! Chat metadata lives at `chat:{id}`; the serialized memory steps of the
//! conversation are an append-only list at `chat:{id}:msgs` (newest first in
//! the store, returned in chronological order). Credentials are never part
//! of the persisted record.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use clerk_domain::config::{Mode, Persona};
use clerk_domain::error::Result;

use crate::keys;
use crate::kv::KvStore;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ChatMeta
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Persisted chat session metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMeta {
    pub chat_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// First user message, truncated, for list views.
    #[serde(default)]
    pub preview: Option<String>,
    #[serde(default)]
    pub mode: Mode,
    #[serde(default)]
    pub persona: Persona,
    #[serde(default)]
    pub message_count: u32,
}

const PREVIEW_MAX_CHARS: usize = 100;

impl ChatMeta {
    fn new(mode: Mode, persona: Persona) -> Self {
        let now = Utc::now();
        Self {
            chat_id: uuid::Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            preview: None,
            mode,
            persona,
            message_count: 0,
        }
    }

    /// Record a new user message: bump the counter and capture the preview
    /// from the first message.
    pub fn note_message(&mut self, content: &str) {
        self.message_count += 1;
        self.updated_at = Utc::now();
        if self.preview.is_none() {
            let preview: String = content.chars().take(PREVIEW_MAX_CHARS).collect();
            self.preview = Some(preview);
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ChatStore
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Store for chat metadata and transcripts over any [`KvStore`].
pub struct ChatStore {
    kv: Arc<dyn KvStore>,
    ttl_secs: u64,
}

impl ChatStore {
    pub fn new(kv: Arc<dyn KvStore>, ttl_secs: u64) -> Self {
        Self { kv, ttl_secs }
    }

    pub async fn create(&self, mode: Mode, persona: Persona) -> Result<ChatMeta> {
        let meta = ChatMeta::new(mode, persona);
        self.save(&meta).await?;
        tracing::info!(chat_id = %meta.chat_id, mode = mode.as_str(), "chat created");
        Ok(meta)
    }

    pub async fn save(&self, meta: &ChatMeta) -> Result<()> {
        let json = serde_json::to_string(meta)?;
        self.kv
            .set(&keys::chat(&meta.chat_id), &json, Some(self.ttl_secs))
            .await
    }

    pub async fn get(&self, chat_id: &str) -> Result<Option<ChatMeta>> {
        match self.kv.get(&keys::chat(chat_id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// List chats by recency (most recently updated first).
    pub async fn list(&self, limit: usize, offset: usize) -> Result<(Vec<ChatMeta>, usize)> {
        let mut metas = Vec::new();
        for key in self.kv.scan("chat:").await? {
            // Skip the :msgs / :commits companion keys.
            if key.matches(':').count() != 1 {
                continue;
            }
            if let Some(raw) = self.kv.get(&key).await? {
                match serde_json::from_str::<ChatMeta>(&raw) {
                    Ok(meta) => metas.push(meta),
                    Err(e) => {
                        tracing::warn!(key = %key, error = %e, "skipping malformed chat record")
                    }
                }
            }
        }
        metas.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        let total = metas.len();
        let page = metas.into_iter().skip(offset).take(limit).collect();
        Ok((page, total))
    }

    /// Delete a chat and its companion keys. Returns whether it existed.
    pub async fn delete(&self, chat_id: &str) -> Result<bool> {
        let existed = self.kv.get(&keys::chat(chat_id)).await?.is_some();
        self.kv.del(&keys::chat(chat_id)).await?;
        self.kv.del(&keys::chat_msgs(chat_id)).await?;
        self.kv.del(&keys::chat_commits(chat_id)).await?;
        Ok(existed)
    }

    // ── Transcript ────────────────────────────────────────────────

    /// Append serialized memory steps to the transcript.
    pub async fn append_steps(&self, chat_id: &str, steps: &[String]) -> Result<()> {
        let key = keys::chat_msgs(chat_id);
        for step in steps {
            self.kv.lpush(&key, step, Some(self.ttl_secs)).await?;
        }
        Ok(())
    }

    /// Read the transcript in chronological order.
    pub async fn read_steps(&self, chat_id: &str) -> Result<Vec<String>> {
        let mut items = self.kv.lrange(&keys::chat_msgs(chat_id), 0, -1).await?;
        items.reverse();
        Ok(items)
    }

    /// Replace the whole transcript (used when a run re-folds memory).
    pub async fn replace_steps(&self, chat_id: &str, steps: &[String]) -> Result<()> {
        self.kv.del(&keys::chat_msgs(chat_id)).await?;
        self.append_steps(chat_id, steps).await
    }

    /// Record a commit hash against the chat.
    pub async fn record_commit(&self, chat_id: &str, hash: &str) -> Result<()> {
        self.kv
            .lpush(&keys::chat_commits(chat_id), hash, Some(self.ttl_secs))
            .await
    }

    /// Commit hashes recorded for a chat, newest first.
    pub async fn commit_hashes(&self, chat_id: &str) -> Result<Vec<String>> {
        self.kv.lrange(&keys::chat_commits(chat_id), 0, -1).await
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;

    fn store() -> ChatStore {
        ChatStore::new(Arc::new(MemoryKv::new()), 3600)
    }

    #[tokio::test]
    async fn create_get_roundtrip() {
        let s = store();
        let meta = s.create(Mode::ReadWrite, Persona::Cautious).await.unwrap();
        let loaded = s.get(&meta.chat_id).await.unwrap().unwrap();
        assert_eq!(loaded.chat_id, meta.chat_id);
        assert_eq!(loaded.mode, Mode::ReadWrite);
        assert_eq!(loaded.persona, Persona::Cautious);
        assert_eq!(loaded.message_count, 0);
    }

    #[tokio::test]
    async fn preview_captured_from_first_message_only() {
        let s = store();
        let mut meta = s.create(Mode::ReadOnly, Persona::Default).await.unwrap();
        meta.note_message("set up an invoice queue");
        meta.note_message("actually make it two queues");
        assert_eq!(meta.preview.as_deref(), Some("set up an invoice queue"));
        assert_eq!(meta.message_count, 2);
    }

    #[tokio::test]
    async fn preview_truncates_long_messages() {
        let s = store();
        let mut meta = s.create(Mode::ReadOnly, Persona::Default).await.unwrap();
        meta.note_message(&"x".repeat(500));
        assert_eq!(meta.preview.as_ref().unwrap().chars().count(), 100);
    }

    #[tokio::test]
    async fn list_excludes_companion_keys_and_pages() {
        let s = store();
        let a = s.create(Mode::ReadOnly, Persona::Default).await.unwrap();
        let b = s.create(Mode::ReadOnly, Persona::Default).await.unwrap();
        s.append_steps(&a.chat_id, &["{\"x\":1}".into()])
            .await
            .unwrap();

        let (page, total) = s.list(10, 0).await.unwrap();
        assert_eq!(total, 2);
        assert_eq!(page.len(), 2);

        let (page, total) = s.list(1, 1).await.unwrap();
        assert_eq!(total, 2);
        assert_eq!(page.len(), 1);

        // Both chats present regardless of page order.
        let ids: Vec<_> = s
            .list(10, 0)
            .await
            .unwrap()
            .0
            .into_iter()
            .map(|m| m.chat_id)
            .collect();
        assert!(ids.contains(&a.chat_id) && ids.contains(&b.chat_id));
    }

    #[tokio::test]
    async fn transcript_is_chronological() {
        let s = store();
        s.append_steps("c1", &["first".into(), "second".into()])
            .await
            .unwrap();
        s.append_steps("c1", &["third".into()]).await.unwrap();
        let steps = s.read_steps("c1").await.unwrap();
        assert_eq!(steps, vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn delete_removes_everything() {
        let s = store();
        let meta = s.create(Mode::ReadOnly, Persona::Default).await.unwrap();
        s.append_steps(&meta.chat_id, &["step".into()]).await.unwrap();
        s.record_commit(&meta.chat_id, "abc").await.unwrap();

        assert!(s.delete(&meta.chat_id).await.unwrap());
        assert!(s.get(&meta.chat_id).await.unwrap().is_none());
        assert!(s.read_steps(&meta.chat_id).await.unwrap().is_empty());
        // Second delete reports the chat was already gone.
        assert!(!s.delete(&meta.chat_id).await.unwrap());
    }
}
