//! Change-tracking middleware around the tool-server connection.
//!
//! Every downstream call goes through [`TrackedConnection`]:
//! - writes get a pre-read (cache first) capturing the `before` snapshot,
//!   then execute with transient-failure retry, then a post-read captures
//!   `after`; the pair is recorded as an [`EntityChange`];
//! - reads in read-write mode populate the per-chat read cache so later
//!   pre-reads skip a downstream round-trip.
//!
//! The accumulated changes become a `ConfigCommit` at the end of the run.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;

use clerk_domain::error::{Error, Result};
use clerk_history::{EntityChange, Operation};
use clerk_mcp_client::ToolConnection;
use clerk_store::{keys, kv::KvStore};

use super::registry::CancelToken;

/// Read-cache entries outlive the run but not the chat retention window.
const READ_CACHE_TTL_SECS: u64 = 30 * 24 * 3600;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool-name conventions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const WRITE_PREFIXES: &[(&str, Operation)] = &[
    ("create_", Operation::Create),
    ("update_", Operation::Update),
    ("patch_", Operation::Update),
    ("delete_", Operation::Delete),
];

const READ_PREFIXES: &[&str] = &["get_", "list_"];

/// Tools that don't follow the prefix convention.
const TOOL_OVERRIDES: &[(&str, &str, Operation)] = &[
    ("prune_schema_fields", "schema", Operation::Update),
    ("create_queue_from_template", "queue", Operation::Create),
    ("create_hook_from_template", "hook", Operation::Create),
];

/// Extract the entity type from a tool name (`update_queue` → `queue`).
pub fn extract_entity_type(tool_name: &str) -> Option<&str> {
    for (name, entity_type, _) in TOOL_OVERRIDES {
        if tool_name == *name {
            return Some(entity_type);
        }
    }
    for (prefix, _) in WRITE_PREFIXES {
        if let Some(rest) = tool_name.strip_prefix(prefix) {
            return Some(rest);
        }
    }
    for prefix in READ_PREFIXES {
        if let Some(rest) = tool_name.strip_prefix(prefix) {
            return Some(rest);
        }
    }
    None
}

/// Classify a write tool's operation.
pub fn classify_operation(tool_name: &str) -> Operation {
    for (name, _, op) in TOOL_OVERRIDES {
        if tool_name == *name {
            return *op;
        }
    }
    for (prefix, op) in WRITE_PREFIXES {
        if tool_name.starts_with(prefix) {
            return *op;
        }
    }
    Operation::Update
}

/// Extract the entity id from tool arguments (`queue_id`, falling back to `id`).
pub fn extract_entity_id(entity_type: &str, arguments: &Value) -> Option<String> {
    let id_key = format!("{entity_type}_id");
    for key in [id_key.as_str(), "id"] {
        match arguments.get(key) {
            Some(Value::Number(n)) => return Some(n.to_string()),
            Some(Value::String(s)) if !s.is_empty() => return Some(s.clone()),
            _ => {}
        }
    }
    None
}

fn extract_entity_name(snapshot: Option<&Value>) -> Option<String> {
    let snapshot = snapshot?;
    for key in ["name", "label"] {
        if let Some(name) = snapshot.get(key).and_then(|v| v.as_str()) {
            return Some(name.to_string());
        }
    }
    None
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Downstream seam
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The raw downstream call surface the middleware wraps. The production
/// implementation is [`ToolConnection`]; tests script their own.
#[async_trait::async_trait]
pub trait Downstream: Send + Sync {
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value>;
}

#[async_trait::async_trait]
impl Downstream for ToolConnection {
    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value> {
        ToolConnection::call_tool(self, name, arguments).await
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// TrackedConnection
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct TrackedConnection {
    inner: Arc<dyn Downstream>,
    chat_id: String,
    kv: Arc<dyn KvStore>,
    write_tools: HashSet<String>,
    cancel: CancelToken,
    retries: u32,
    changes: Mutex<Vec<EntityChange>>,
}

impl TrackedConnection {
    pub fn new(
        inner: Arc<dyn Downstream>,
        chat_id: &str,
        kv: Arc<dyn KvStore>,
        write_tools: HashSet<String>,
        cancel: CancelToken,
        retries: u32,
    ) -> Self {
        Self {
            inner,
            chat_id: chat_id.to_owned(),
            kv,
            write_tools,
            cancel,
            retries,
            changes: Mutex::new(Vec::new()),
        }
    }

    pub fn is_write_tool(&self, name: &str) -> bool {
        self.write_tools.contains(name)
    }

    pub fn has_changes(&self) -> bool {
        !self.changes.lock().is_empty()
    }

    /// Take the accumulated changes (clearing the pending list).
    pub fn take_changes(&self) -> Vec<EntityChange> {
        std::mem::take(&mut *self.changes.lock())
    }

    /// Dispatch one downstream call with tracking.
    pub async fn call(&self, name: &str, arguments: Value) -> Result<Value> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        if self.write_tools.contains(name) {
            return self.handle_write(name, arguments).await;
        }

        let result = self.inner.call_tool(name, arguments.clone()).await?;
        self.try_cache_read(name, &arguments, &result).await;
        Ok(result)
    }

    // ── Writes ────────────────────────────────────────────────────

    async fn handle_write(&self, name: &str, arguments: Value) -> Result<Value> {
        let entity_type = extract_entity_type(name).map(str::to_owned);
        let operation = classify_operation(name);
        let mut entity_id = entity_type
            .as_deref()
            .and_then(|et| extract_entity_id(et, &arguments));

        let before = self
            .before_snapshot(entity_type.as_deref(), entity_id.as_deref(), operation)
            .await;

        let result = self
            .call_with_retry(
                name,
                &arguments,
                entity_type.as_deref(),
                entity_id.as_deref(),
            )
            .await?;

        let after = match operation {
            Operation::Create => {
                let after = result.clone();
                if entity_id.is_none() {
                    entity_id = after
                        .get("id")
                        .map(|id| match id {
                            Value::Number(n) => n.to_string(),
                            Value::String(s) => s.clone(),
                            other => other.to_string(),
                        })
                        .filter(|s| !s.is_empty());
                }
                Some(after)
            }
            Operation::Delete => None,
            Operation::Update => match (&entity_type, &entity_id) {
                (Some(et), Some(eid)) => self.fetch_snapshot(et, eid).await,
                _ => None,
            },
        };

        match (&entity_type, &entity_id) {
            (Some(et), Some(eid)) => {
                if let Some(after) = &after {
                    self.cache_set(et, eid, after).await;
                }
                let change = EntityChange {
                    entity_type: et.clone(),
                    entity_id: eid.clone(),
                    entity_name: extract_entity_name(before.as_ref())
                        .or_else(|| extract_entity_name(after.as_ref())),
                    operation,
                    before,
                    after,
                };
                tracing::info!(
                    chat_id = %self.chat_id,
                    entity_type = %et,
                    entity_id = %eid,
                    operation = operation.as_str(),
                    "tracked write"
                );
                self.changes.lock().push(change);
            }
            _ => {
                tracing::warn!(tool = name, "could not extract entity identity from write");
            }
        }

        Ok(result)
    }

    /// Execute a downstream call, retrying transient failures (412/429/5xx)
    /// with linear backoff. Before every retry the entity is re-read
    /// through its getter, so each attempt is fetch-then-patch: current
    /// state is registered with the server before the intended change is
    /// re-applied. The first attempt's read is the pre-read that captured
    /// the `before` snapshot.
    async fn call_with_retry(
        &self,
        name: &str,
        arguments: &Value,
        entity_type: Option<&str>,
        entity_id: Option<&str>,
    ) -> Result<Value> {
        let mut last_err = None;
        for attempt in 0..self.retries.max(1) {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(500 * attempt as u64)).await;
                if let (Some(et), Some(eid)) = (entity_type, entity_id) {
                    self.fetch_snapshot(et, eid).await;
                }
            }
            match self.inner.call_tool(name, arguments.clone()).await {
                Ok(result) => return Ok(result),
                Err(e) if e.is_retryable() => {
                    tracing::warn!(
                        tool = name,
                        attempt = attempt + 1,
                        error = %e,
                        "transient downstream failure, retrying"
                    );
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| Error::Other("retry budget exhausted".into())))
    }

    // ── Snapshots & cache ─────────────────────────────────────────

    async fn before_snapshot(
        &self,
        entity_type: Option<&str>,
        entity_id: Option<&str>,
        operation: Operation,
    ) -> Option<Value> {
        let (entity_type, entity_id) = (entity_type?, entity_id?);
        if let Some(cached) = self.cache_get(entity_type, entity_id).await {
            return Some(cached);
        }
        if operation == Operation::Create {
            return None;
        }
        let snapshot = self.fetch_snapshot(entity_type, entity_id).await;
        if let Some(snapshot) = &snapshot {
            self.cache_set(entity_type, entity_id, snapshot).await;
        }
        snapshot
    }

    /// Fetch current entity state through its getter tool.
    async fn fetch_snapshot(&self, entity_type: &str, entity_id: &str) -> Option<Value> {
        let getter = format!("get_{entity_type}");
        let id_key = format!("{entity_type}_id");
        let id_value = entity_id
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::String(entity_id.to_owned()));

        match self
            .inner
            .call_tool(&getter, serde_json::json!({ id_key: id_value }))
            .await
        {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                tracing::warn!(
                    getter = %getter,
                    entity_id = %entity_id,
                    error = %e,
                    "snapshot fetch failed"
                );
                None
            }
        }
    }

    async fn cache_get(&self, entity_type: &str, entity_id: &str) -> Option<Value> {
        let key = keys::read_cache(&self.chat_id, entity_type, entity_id);
        match self.kv.get(&key).await {
            Ok(Some(raw)) => serde_json::from_str(&raw).ok(),
            _ => None,
        }
    }

    async fn cache_set(&self, entity_type: &str, entity_id: &str, data: &Value) {
        let key = keys::read_cache(&self.chat_id, entity_type, entity_id);
        if let Err(e) = self
            .kv
            .set(&key, &data.to_string(), Some(READ_CACHE_TTL_SECS))
            .await
        {
            tracing::warn!(key = %key, error = %e, "read cache write failed");
        }
    }

    /// Cache a read result when it looks like a single-entity get.
    async fn try_cache_read(&self, name: &str, arguments: &Value, result: &Value) {
        if !result.is_object() {
            return;
        }
        let Some(entity_type) = extract_entity_type(name) else {
            return;
        };
        let entity_id = extract_entity_id(entity_type, arguments).or_else(|| {
            if name.starts_with("get_") {
                result.get("id").map(|id| match id {
                    Value::Number(n) => n.to_string(),
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
            } else {
                None
            }
        });
        if let Some(entity_id) = entity_id.filter(|id| !id.is_empty()) {
            self.cache_set(entity_type, &entity_id, result).await;
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
