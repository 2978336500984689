//! Per-run context threaded through the agent loop and tool dispatchers.
//!
//! Everything here is an explicit handle; per-chat mutable state (output
//! dir, last memory) stays keyed by chat id inside the [`ChatRegistry`]
//! so detached tasks always observe the latest writes.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use clerk_domain::config::{Config, Mode, Persona};
use clerk_domain::tool::ToolDefinition;
use clerk_history::{CommitStore, SnapshotStore};
use clerk_mcp_client::ToolConnection;
use clerk_providers::LlmProvider;
use clerk_store::ChatStore;

use crate::knowledge::KnowledgeBase;
use crate::skills::SkillsRegistry;

use super::events::{AgentEvent, TokenLedger};
use super::registry::{CancelToken, ChatRegistry};
use super::tasks::TaskTracker;
use super::tracking::TrackedConnection;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Dynamic tool state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Per-run record of which tool categories and skills have been loaded.
/// Once loaded within a chat run, a category stays loaded.
#[derive(Default)]
pub struct DynamicTools {
    inner: Mutex<DynamicInner>,
}

#[derive(Default)]
struct DynamicInner {
    loaded_categories: HashSet<String>,
    loaded_skills: HashSet<String>,
    definitions: Vec<ToolDefinition>,
}

impl DynamicTools {
    pub fn loaded_categories(&self) -> HashSet<String> {
        self.inner.lock().loaded_categories.clone()
    }

    pub fn is_category_loaded(&self, category: &str) -> bool {
        self.inner.lock().loaded_categories.contains(category)
    }

    pub fn mark_category_loaded(&self, category: &str, defs: Vec<ToolDefinition>) {
        let mut inner = self.inner.lock();
        inner.loaded_categories.insert(category.to_owned());
        for def in defs {
            if !inner.definitions.iter().any(|d| d.name == def.name) {
                inner.definitions.push(def);
            }
        }
    }

    pub fn mark_skill_loaded(&self, name: &str) -> bool {
        self.inner.lock().loaded_skills.insert(name.to_owned())
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.inner.lock().definitions.clone()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// RunContext
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct RunContext {
    pub chat_id: String,
    pub run_id: u64,
    pub mode: Mode,
    pub persona: Persona,
    /// Downstream API base URL; the commit environment.
    pub environment: String,
    /// The user prompt driving this run (commit messages reference it).
    pub user_request: String,
    pub config: Arc<Config>,
    pub registry: Arc<ChatRegistry>,
    pub chats: Arc<ChatStore>,
    pub commits: Arc<CommitStore>,
    pub snapshots: Arc<SnapshotStore>,
    pub provider: Arc<dyn LlmProvider>,
    pub tracked: Arc<TrackedConnection>,
    /// Raw connection for catalog/discovery; `None` only in tests.
    pub connection: Option<Arc<ToolConnection>>,
    pub events: mpsc::Sender<AgentEvent>,
    pub tasks: Arc<TaskTracker>,
    pub ledger: Arc<TokenLedger>,
    pub dynamic: Arc<DynamicTools>,
    pub skills: Arc<SkillsRegistry>,
    pub knowledge: Arc<KnowledgeBase>,
    pub cancel: CancelToken,
}

impl RunContext {
    /// The run's output directory, read from the shared registry.
    pub fn output_dir(&self) -> Option<PathBuf> {
        self.registry.output_dir(&self.chat_id)
    }

    /// Deliver an event to the client, enforcing the stall ceiling: if the
    /// consumer cannot accept the event within the configured window the
    /// run is cancelled. Returns whether the event was delivered.
    pub async fn send_event(&self, event: AgentEvent) -> bool {
        let ceiling = Duration::from_secs(self.config.runtime.stall_ceiling_secs);
        match tokio::time::timeout(ceiling, self.events.send(event)).await {
            Ok(Ok(())) => true,
            Ok(Err(_)) => false, // receiver dropped; disconnect handling cancels us
            Err(_) => {
                tracing::warn!(
                    chat_id = %self.chat_id,
                    "event delivery stalled past ceiling, cancelling run"
                );
                self.cancel.cancel();
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories_stay_loaded_and_dedupe_definitions() {
        let dynamic = DynamicTools::default();
        assert!(!dynamic.is_category_loaded("queues"));

        let def = ToolDefinition {
            name: "get_queue".into(),
            description: "fetch".into(),
            parameters: serde_json::json!({}),
        };
        dynamic.mark_category_loaded("queues", vec![def.clone()]);
        dynamic.mark_category_loaded("queues", vec![def]);

        assert!(dynamic.is_category_loaded("queues"));
        assert_eq!(dynamic.definitions().len(), 1);
        assert_eq!(dynamic.loaded_categories().len(), 1);
    }

    #[test]
    fn skill_loading_is_once_per_run() {
        let dynamic = DynamicTools::default();
        assert!(dynamic.mark_skill_loaded("schema-design"));
        assert!(!dynamic.mark_skill_loaded("schema-design"));
    }
}
