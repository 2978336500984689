use std::sync::Arc;

use clerk_domain::config::Config;
use clerk_history::{CommitStore, SnapshotStore};
use clerk_providers::LlmProvider;
use clerk_store::{kv::KvStore, ChatStore};

use crate::api::ratelimit::RateLimiter;
use crate::knowledge::KnowledgeBase;
use crate::runtime::registry::ChatRegistry;
use crate::skills::SkillsRegistry;

/// Shared application state passed to all API handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub kv: Arc<dyn KvStore>,
    pub chats: Arc<ChatStore>,
    pub commits: Arc<CommitStore>,
    pub snapshots: Arc<SnapshotStore>,
    pub provider: Arc<dyn LlmProvider>,
    pub registry: Arc<ChatRegistry>,
    pub skills: Arc<SkillsRegistry>,
    pub knowledge: Arc<KnowledgeBase>,
    pub limiter: Arc<RateLimiter>,
}
