//! Commit creation: message generation and persistence.

use chrono::Utc;

use clerk_domain::error::Result;
use clerk_providers::{ChatRequest, LlmProvider};

use crate::models::{compute_commit_hash, deduplicate_changes, ConfigCommit, EntityChange};
use crate::store::{CommitStore, SnapshotStore};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Commit messages
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn format_changes_for_message(changes: &[EntityChange]) -> String {
    changes
        .iter()
        .map(|c| {
            let name_part = c
                .entity_name
                .as_deref()
                .map(|n| format!(" ({n})"))
                .unwrap_or_default();
            format!(
                "- {} {} {}{name_part}",
                c.operation.as_str(),
                c.entity_type,
                c.entity_id
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Build a commit message without the LLM: `"create/update schema, queue"`.
fn fallback_commit_message(changes: &[EntityChange]) -> String {
    let mut ops: Vec<&str> = changes.iter().map(|c| c.operation.as_str()).collect();
    ops.sort_unstable();
    ops.dedup();
    let mut entity_types: Vec<&str> = changes.iter().map(|c| c.entity_type.as_str()).collect();
    entity_types.sort_unstable();
    entity_types.dedup();
    format!("{} {}", ops.join("/"), entity_types.join(", "))
}

/// Generate a one-line commit message with a short LLM call, falling back
/// to the deterministic summary on any failure.
async fn generate_commit_message(
    provider: &dyn LlmProvider,
    summary_model: &str,
    changes: &[EntityChange],
    user_request: &str,
) -> String {
    let prompt = format!(
        "Write a one-line git commit message (max 72 chars) for this config change.\n\n\
         User request: {user_request}\n\n\
         Changes:\n{}\n\n\
         Reply with ONLY the commit message, no quotes or prefix.",
        format_changes_for_message(changes)
    );

    let req = ChatRequest {
        messages: vec![clerk_domain::tool::Message::user(prompt)],
        max_tokens: Some(150),
        thinking_budget: Some(0),
        model: Some(summary_model.to_string()),
        ..Default::default()
    };

    match provider.chat(req).await {
        Ok(resp) if !resp.content.trim().is_empty() => {
            let mut message = resp.content.trim().to_string();
            if message.len() > 72 {
                message.truncate(69);
                message.push_str("...");
            }
            message
        }
        Ok(_) => fallback_commit_message(changes),
        Err(e) => {
            tracing::warn!(error = %e, "commit message generation failed, using fallback");
            fallback_commit_message(changes)
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// CommitService
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Turns accumulated entity changes into a persisted commit plus snapshots.
pub struct CommitService<'a> {
    commits: &'a CommitStore,
    snapshots: &'a SnapshotStore,
}

impl<'a> CommitService<'a> {
    pub fn new(commits: &'a CommitStore, snapshots: &'a SnapshotStore) -> Self {
        Self { commits, snapshots }
    }

    /// Create a commit from the given changes. Returns `None` when the
    /// deduplicated change set is empty.
    pub async fn create_commit(
        &self,
        provider: &dyn LlmProvider,
        summary_model: &str,
        changes: &[EntityChange],
        chat_id: &str,
        user_request: &str,
        environment: &str,
    ) -> Result<Option<ConfigCommit>> {
        let changes = deduplicate_changes(changes);
        if changes.is_empty() {
            return Ok(None);
        }

        let message =
            generate_commit_message(provider, summary_model, &changes, user_request).await;
        let timestamp = Utc::now();

        let commit = ConfigCommit {
            hash: compute_commit_hash(&changes, timestamp),
            parent: self.commits.latest_hash(environment).await?,
            chat_id: chat_id.to_owned(),
            timestamp,
            message,
            user_request: user_request.to_owned(),
            environment: environment.to_owned(),
            changes,
        };

        self.commits.save_commit(&commit).await?;

        // Snapshot the post-write state of every touched entity so any
        // commit can be restored without replaying the chain.
        for change in &commit.changes {
            if let Some(after) = &change.after {
                self.snapshots
                    .save_snapshot(&change.entity_type, &change.entity_id, &commit.hash, after)
                    .await?;
            }
        }

        tracing::info!(hash = %commit.hash, message = %commit.message, "config commit created");
        Ok(Some(commit))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Operation;
    use clerk_domain::stream::{BoxStream, StreamEvent};
    use clerk_providers::ChatResponse;
    use clerk_store::kv::MemoryKv;
    use std::sync::Arc;

    struct ScriptedProvider {
        reply: Option<String>,
    }

    #[async_trait::async_trait]
    impl LlmProvider for ScriptedProvider {
        async fn chat(&self, _req: ChatRequest) -> clerk_domain::Result<ChatResponse> {
            match &self.reply {
                Some(text) => Ok(ChatResponse {
                    content: text.clone(),
                    tool_calls: Vec::new(),
                    usage: None,
                    finish_reason: Some("stop".into()),
                }),
                None => Err(clerk_domain::Error::Provider {
                    provider: "scripted".into(),
                    message: "down".into(),
                }),
            }
        }

        async fn chat_stream(
            &self,
            _req: ChatRequest,
        ) -> clerk_domain::Result<BoxStream<'static, clerk_domain::Result<StreamEvent>>> {
            unimplemented!("not used in commit tests")
        }

        fn provider_id(&self) -> &str {
            "scripted"
        }
    }

    fn changes() -> Vec<EntityChange> {
        vec![EntityChange {
            entity_type: "schema".into(),
            entity_id: "42".into(),
            entity_name: Some("Invoices".into()),
            operation: Operation::Update,
            before: Some(serde_json::json!({"fields": 3})),
            after: Some(serde_json::json!({"fields": 4})),
        }]
    }

    #[tokio::test]
    async fn commit_created_with_llm_message_and_snapshots() {
        let kv: Arc<MemoryKv> = Arc::new(MemoryKv::new());
        let commits = CommitStore::new(kv.clone());
        let snapshots = SnapshotStore::new(kv);
        let service = CommitService::new(&commits, &snapshots);
        let provider = ScriptedProvider {
            reply: Some("add VAT field to invoice schema".into()),
        };

        let commit = service
            .create_commit(
                &provider,
                "small-model",
                &changes(),
                "chat-1",
                "add a VAT field",
                "https://api.example.com",
            )
            .await
            .unwrap()
            .unwrap();

        assert_eq!(commit.message, "add VAT field to invoice schema");
        assert!(commit.parent.is_none());

        let snap = snapshots
            .get_snapshot("schema", "42", &commit.hash)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snap["fields"], 4);
    }

    #[tokio::test]
    async fn fallback_message_when_provider_fails() {
        let kv: Arc<MemoryKv> = Arc::new(MemoryKv::new());
        let commits = CommitStore::new(kv.clone());
        let snapshots = SnapshotStore::new(kv);
        let service = CommitService::new(&commits, &snapshots);
        let provider = ScriptedProvider { reply: None };

        let commit = service
            .create_commit(
                &provider,
                "small-model",
                &changes(),
                "chat-1",
                "add a VAT field",
                "https://api.example.com",
            )
            .await
            .unwrap()
            .unwrap();

        assert_eq!(commit.message, "update schema");
    }

    #[tokio::test]
    async fn empty_changes_produce_no_commit() {
        let kv: Arc<MemoryKv> = Arc::new(MemoryKv::new());
        let commits = CommitStore::new(kv.clone());
        let snapshots = SnapshotStore::new(kv);
        let service = CommitService::new(&commits, &snapshots);
        let provider = ScriptedProvider { reply: None };

        let commit = service
            .create_commit(&provider, "m", &[], "chat-1", "noop", "env")
            .await
            .unwrap();
        assert!(commit.is_none());
    }

    #[tokio::test]
    async fn second_commit_chains_to_first() {
        let kv: Arc<MemoryKv> = Arc::new(MemoryKv::new());
        let commits = CommitStore::new(kv.clone());
        let snapshots = SnapshotStore::new(kv);
        let service = CommitService::new(&commits, &snapshots);
        let provider = ScriptedProvider {
            reply: Some("msg".into()),
        };

        let env = "https://api.example.com";
        let first = service
            .create_commit(&provider, "m", &changes(), "chat-1", "one", env)
            .await
            .unwrap()
            .unwrap();
        let second = service
            .create_commit(&provider, "m", &changes(), "chat-1", "two", env)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(second.parent.as_deref(), Some(first.hash.as_str()));
    }
}
