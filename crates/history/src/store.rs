//! Commit log and snapshot persistence over the KV store.

use std::sync::Arc;

use serde_json::Value;

use clerk_domain::error::Result;
use clerk_store::keys;
use clerk_store::kv::KvStore;

use crate::models::ConfigCommit;

/// TTL for commit blobs and indexes (matches chat retention).
const COMMIT_TTL_SECS: u64 = 30 * 24 * 3600;

/// TTL for entity snapshots.
pub const SNAPSHOT_TTL_SECS: u64 = 7 * 24 * 3600;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// CommitStore
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Persistence for [`ConfigCommit`] blobs plus a per-environment recency
/// index and latest-commit pointer.
pub struct CommitStore {
    kv: Arc<dyn KvStore>,
}

impl CommitStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    pub async fn save_commit(&self, commit: &ConfigCommit) -> Result<()> {
        let blob = serde_json::to_string(commit)?;
        self.kv
            .set(&keys::commit(&commit.hash), &blob, Some(COMMIT_TTL_SECS))
            .await?;
        self.kv
            .lpush(
                &keys::commit_index(&commit.environment),
                &commit.hash,
                Some(COMMIT_TTL_SECS),
            )
            .await?;
        self.kv
            .set(
                &keys::commit_latest(&commit.environment),
                &commit.hash,
                Some(COMMIT_TTL_SECS),
            )
            .await?;
        tracing::info!(
            hash = %commit.hash,
            environment = %commit.environment,
            changes = commit.changes.len(),
            "config commit saved"
        );
        Ok(())
    }

    pub async fn get_commit(&self, commit_hash: &str) -> Result<Option<ConfigCommit>> {
        match self.kv.get(&keys::commit(commit_hash)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Hash of the most recent commit for an environment.
    pub async fn latest_hash(&self, environment: &str) -> Result<Option<String>> {
        self.kv.get(&keys::commit_latest(environment)).await
    }

    /// Recent commits for an environment, newest first.
    pub async fn list_commits(&self, environment: &str, limit: usize) -> Result<Vec<ConfigCommit>> {
        let hashes = self
            .kv
            .lrange(&keys::commit_index(environment), 0, limit as i64 - 1)
            .await?;
        let mut commits = Vec::with_capacity(hashes.len());
        for hash in hashes {
            if let Some(commit) = self.get_commit(&hash).await? {
                commits.push(commit);
            }
        }
        Ok(commits)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SnapshotStore
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Entity snapshot store for point-in-time restore.
///
/// Snapshots are indexed by `(entity_type, entity_id, commit_hash)` and
/// expire after 7 days.
pub struct SnapshotStore {
    kv: Arc<dyn KvStore>,
    ttl_secs: u64,
}

impl SnapshotStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            ttl_secs: SNAPSHOT_TTL_SECS,
        }
    }

    pub fn with_ttl(kv: Arc<dyn KvStore>, ttl_secs: u64) -> Self {
        Self { kv, ttl_secs }
    }

    pub async fn save_snapshot(
        &self,
        entity_type: &str,
        entity_id: &str,
        commit_hash: &str,
        data: &Value,
    ) -> Result<()> {
        let key = keys::snapshot(entity_type, entity_id, commit_hash);
        self.kv
            .set(&key, &data.to_string(), Some(self.ttl_secs))
            .await
    }

    pub async fn get_snapshot(
        &self,
        entity_type: &str,
        entity_id: &str,
        commit_hash: &str,
    ) -> Result<Option<Value>> {
        let key = keys::snapshot(entity_type, entity_id, commit_hash);
        match self.kv.get(&key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Known snapshot versions of an entity across commits.
    pub async fn list_versions(&self, entity_type: &str, entity_id: &str) -> Result<Vec<String>> {
        let prefix = format!("snap:{entity_type}:{entity_id}:");
        let keys = self.kv.scan(&prefix).await?;
        Ok(keys
            .into_iter()
            .filter_map(|k| k.rsplit(':').next().map(str::to_owned))
            .collect())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{compute_commit_hash, EntityChange, Operation};
    use chrono::Utc;
    use clerk_store::kv::MemoryKv;

    fn sample_commit(env: &str, parent: Option<String>) -> ConfigCommit {
        let changes = vec![EntityChange {
            entity_type: "schema".into(),
            entity_id: "42".into(),
            entity_name: Some("Invoices".into()),
            operation: Operation::Update,
            before: Some(serde_json::json!({"fields": 3})),
            after: Some(serde_json::json!({"fields": 4})),
        }];
        let ts = Utc::now();
        ConfigCommit {
            hash: compute_commit_hash(&changes, ts),
            parent,
            chat_id: "chat-1".into(),
            timestamp: ts,
            message: "add a field".into(),
            user_request: "please add a field".into(),
            environment: env.into(),
            changes,
        }
    }

    #[tokio::test]
    async fn save_and_fetch_commit() {
        let kv = Arc::new(MemoryKv::new());
        let store = CommitStore::new(kv);

        let commit = sample_commit("https://api.example.com", None);
        store.save_commit(&commit).await.unwrap();

        let loaded = store.get_commit(&commit.hash).await.unwrap().unwrap();
        assert_eq!(loaded.hash, commit.hash);
        assert_eq!(
            store.latest_hash("https://api.example.com").await.unwrap(),
            Some(commit.hash.clone())
        );
    }

    #[tokio::test]
    async fn commits_list_newest_first() {
        let kv = Arc::new(MemoryKv::new());
        let store = CommitStore::new(kv);
        let env = "https://api.example.com";

        let first = sample_commit(env, None);
        store.save_commit(&first).await.unwrap();
        let second = sample_commit(env, Some(first.hash.clone()));
        store.save_commit(&second).await.unwrap();

        let commits = store.list_commits(env, 10).await.unwrap();
        assert_eq!(commits.len(), 2);
        assert_eq!(commits[0].hash, second.hash);
        assert_eq!(commits[0].parent.as_deref(), Some(first.hash.as_str()));
    }

    #[tokio::test]
    async fn snapshot_roundtrip_and_versions() {
        let kv = Arc::new(MemoryKv::new());
        let store = SnapshotStore::new(kv);

        let data = serde_json::json!({"id": 42, "fields": 4});
        store
            .save_snapshot("schema", "42", "aaa111", &data)
            .await
            .unwrap();
        store
            .save_snapshot("schema", "42", "bbb222", &data)
            .await
            .unwrap();

        let loaded = store
            .get_snapshot("schema", "42", "aaa111")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded["fields"], 4);

        let versions = store.list_versions("schema", "42").await.unwrap();
        assert_eq!(versions.len(), 2);
        assert!(versions.contains(&"aaa111".to_string()));
    }

    #[tokio::test]
    async fn missing_commit_is_none() {
        let store = CommitStore::new(Arc::new(MemoryKv::new()));
        assert!(store.get_commit("nope").await.unwrap().is_none());
    }
}
