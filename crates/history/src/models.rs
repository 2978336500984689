use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest as _, Sha256};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// EntityChange
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

/// One entity-level write captured by the tracking middleware.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityChange {
    /// queue, schema, hook, rule, ...
    pub entity_type: String,
    pub entity_id: String,
    #[serde(default)]
    pub entity_name: Option<String>,
    pub operation: Operation,
    /// `None` for creates.
    pub before: Option<Value>,
    /// `None` for deletes.
    pub after: Option<Value>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ConfigCommit
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// An atomic record of the entity writes produced by one agent run.
/// Append-only; reverts are expressed as new forward commits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigCommit {
    /// Content hash over the ordered changes and timestamp.
    pub hash: String,
    /// Previous commit hash for this environment.
    #[serde(default)]
    pub parent: Option<String>,
    pub chat_id: String,
    pub timestamp: DateTime<Utc>,
    /// LLM-generated one-line summary.
    pub message: String,
    /// Original user prompt that produced the writes.
    pub user_request: String,
    /// Downstream API base URL this commit applies to.
    pub environment: String,
    #[serde(default)]
    pub changes: Vec<EntityChange>,
}

/// Compute the commit hash: SHA-256 over the ordered
/// `(entity_type, entity_id, operation, before, after)` tuples and the
/// timestamp, truncated to 12 hex chars.
pub fn compute_commit_hash(changes: &[EntityChange], timestamp: DateTime<Utc>) -> String {
    let serialized = serde_json::json!({
        "timestamp": timestamp.to_rfc3339(),
        "changes": changes
            .iter()
            .map(|c| {
                serde_json::json!({
                    "entity_type": c.entity_type,
                    "entity_id": c.entity_id,
                    "operation": c.operation.as_str(),
                    "before": c.before,
                    "after": c.after,
                })
            })
            .collect::<Vec<_>>(),
    });

    let mut hasher = Sha256::new();
    hasher.update(serialized.to_string().as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..12].to_string()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Change deduplication
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Derive the net operation from a sequence of operations on one entity.
fn collapsed_operation(first: Operation, last: Operation) -> Operation {
    if first == last {
        return first;
    }
    match (first, last) {
        // create → update is still a create; create → delete nets to nothing
        // (the no-op is dropped by the caller once before/after are both None).
        (Operation::Create, Operation::Update) => Operation::Create,
        (Operation::Create, Operation::Delete) => Operation::Delete,
        (Operation::Update, Operation::Delete) => Operation::Delete,
        (_, last) => last,
    }
}

/// Collapse multiple changes to the same entity into one.
///
/// Only the first "before" represents the pre-commit state, and only the
/// last "after" the post-commit state. Entities created and deleted within
/// the same run (before and after both `None`) are dropped entirely.
pub fn deduplicate_changes(changes: &[EntityChange]) -> Vec<EntityChange> {
    let mut seen: std::collections::HashMap<(String, String), usize> = Default::default();
    let mut result: Vec<EntityChange> = Vec::new();

    for change in changes {
        let key = (change.entity_type.clone(), change.entity_id.clone());
        if let Some(&idx) = seen.get(&key) {
            let existing = &result[idx];
            result[idx] = EntityChange {
                entity_type: change.entity_type.clone(),
                entity_id: change.entity_id.clone(),
                entity_name: change
                    .entity_name
                    .clone()
                    .or_else(|| existing.entity_name.clone()),
                operation: collapsed_operation(existing.operation, change.operation),
                before: existing.before.clone(),
                after: change.after.clone(),
            };
        } else {
            seen.insert(key, result.len());
            result.push(change.clone());
        }
    }

    result
        .into_iter()
        .filter(|c| c.before.is_some() || c.after.is_some())
        .collect()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    fn change(et: &str, id: &str, op: Operation, before: Option<i64>, after: Option<i64>) -> EntityChange {
        EntityChange {
            entity_type: et.into(),
            entity_id: id.into(),
            entity_name: None,
            operation: op,
            before: before.map(|v| serde_json::json!({ "v": v })),
            after: after.map(|v| serde_json::json!({ "v": v })),
        }
    }

    #[test]
    fn hash_is_deterministic_and_sensitive() {
        let ts = Utc::now();
        let c1 = vec![change("schema", "1", Operation::Update, Some(1), Some(2))];
        let c2 = vec![change("schema", "1", Operation::Update, Some(1), Some(3))];

        assert_eq!(compute_commit_hash(&c1, ts), compute_commit_hash(&c1, ts));
        assert_ne!(compute_commit_hash(&c1, ts), compute_commit_hash(&c2, ts));
        assert_eq!(compute_commit_hash(&c1, ts).len(), 12);
    }

    #[test]
    fn dedupe_keeps_first_before_and_last_after() {
        let changes = vec![
            change("schema", "1", Operation::Update, Some(1), Some(2)),
            change("schema", "1", Operation::Update, Some(2), Some(3)),
        ];
        let deduped = deduplicate_changes(&changes);
        assert_eq!(deduped.len(), 1);
        assert_eq!(deduped[0].before, Some(serde_json::json!({ "v": 1 })));
        assert_eq!(deduped[0].after, Some(serde_json::json!({ "v": 3 })));
        assert_eq!(deduped[0].operation, Operation::Update);
    }

    #[test]
    fn dedupe_collapses_create_then_update_to_create() {
        let changes = vec![
            change("queue", "7", Operation::Create, None, Some(1)),
            change("queue", "7", Operation::Update, Some(1), Some(2)),
        ];
        let deduped = deduplicate_changes(&changes);
        assert_eq!(deduped.len(), 1);
        assert_eq!(deduped[0].operation, Operation::Create);
        assert!(deduped[0].before.is_none());
        assert_eq!(deduped[0].after, Some(serde_json::json!({ "v": 2 })));
    }

    #[test]
    fn dedupe_drops_create_then_delete() {
        let changes = vec![
            change("hook", "3", Operation::Create, None, Some(1)),
            change("hook", "3", Operation::Delete, Some(1), None),
        ];
        // first before (None) + last after (None) → no-op, dropped.
        let deduped = deduplicate_changes(&changes);
        assert!(deduped.is_empty());
    }

    #[test]
    fn dedupe_leaves_distinct_entities_alone() {
        let changes = vec![
            change("schema", "1", Operation::Update, Some(1), Some(2)),
            change("queue", "1", Operation::Update, Some(5), Some(6)),
        ];
        assert_eq!(deduplicate_changes(&changes).len(), 2);
    }

    #[test]
    fn commit_serde_round_trip() {
        let commit = ConfigCommit {
            hash: "abc123def456".into(),
            parent: Some("000111222333".into()),
            chat_id: "c1".into(),
            timestamp: Utc::now(),
            message: "update invoice schema".into(),
            user_request: "add a VAT field".into(),
            environment: "https://api.example.com".into(),
            changes: vec![change("schema", "1", Operation::Update, Some(1), Some(2))],
        };
        let json = serde_json::to_string(&commit).unwrap();
        let back: ConfigCommit = serde_json::from_str(&json).unwrap();
        assert_eq!(back.hash, commit.hash);
        assert_eq!(back.parent, commit.parent);
        assert_eq!(back.changes.len(), 1);
        assert_eq!(back.changes[0].operation, Operation::Update);
    }
}
