//! Pure revert computation: minimal patches and per-change revert actions.
//!
//! Execution happens in the gateway through the tracked tool connection so
//! that reverts themselves produce a new forward commit.

use serde_json::Value;

use crate::models::{EntityChange, Operation};

/// Fields that are server-managed and must never appear in a revert patch.
const READ_ONLY_FIELDS: &[&str] = &[
    "url",
    "id",
    "organization",
    "created_at",
    "modified_at",
    "modified_by",
    "created_by",
];

/// Compute the minimal PATCH payload that restores `after` → `before`.
///
/// Only fields that differ are included, and read-only fields are dropped.
pub fn compute_revert_patch(before: &Value, after: &Value) -> Value {
    let mut patch = serde_json::Map::new();
    let (Some(before_obj), Some(after_obj)) = (before.as_object(), after.as_object()) else {
        return Value::Object(patch);
    };

    for (key, before_val) in before_obj {
        if READ_ONLY_FIELDS.contains(&key.as_str()) {
            continue;
        }
        if after_obj.get(key) != Some(before_val) {
            patch.insert(key.clone(), before_val.clone());
        }
    }
    Value::Object(patch)
}

/// Strip read-only fields from a snapshot so it can be used as a create body.
pub fn strip_read_only_fields(snapshot: &Value) -> Value {
    match snapshot.as_object() {
        Some(obj) => Value::Object(
            obj.iter()
                .filter(|(k, _)| !READ_ONLY_FIELDS.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        ),
        None => snapshot.clone(),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// RevertAction
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The inverse operation for a single tracked change.
#[derive(Debug, Clone)]
pub enum RevertAction {
    /// Patch changed fields back to the before state.
    Patch {
        entity_type: String,
        entity_id: String,
        patch: Value,
    },
    /// Recreate a deleted entity from its before snapshot.
    Recreate {
        entity_type: String,
        body: Value,
    },
    /// Delete an entity that was created.
    Delete {
        entity_type: String,
        entity_id: String,
    },
    /// The change nets out to nothing.
    Noop {
        entity_type: String,
        entity_id: String,
    },
}

/// Build the inverse action for one deduplicated change.
pub fn revert_action(change: &EntityChange) -> RevertAction {
    match change.operation {
        Operation::Update => match (&change.before, &change.after) {
            (Some(before), Some(after)) => {
                let patch = compute_revert_patch(before, after);
                if patch.as_object().is_some_and(|m| m.is_empty()) {
                    RevertAction::Noop {
                        entity_type: change.entity_type.clone(),
                        entity_id: change.entity_id.clone(),
                    }
                } else {
                    RevertAction::Patch {
                        entity_type: change.entity_type.clone(),
                        entity_id: change.entity_id.clone(),
                        patch,
                    }
                }
            }
            _ => RevertAction::Noop {
                entity_type: change.entity_type.clone(),
                entity_id: change.entity_id.clone(),
            },
        },
        Operation::Delete => match &change.before {
            Some(before) => RevertAction::Recreate {
                entity_type: change.entity_type.clone(),
                body: strip_read_only_fields(before),
            },
            None => RevertAction::Noop {
                entity_type: change.entity_type.clone(),
                entity_id: change.entity_id.clone(),
            },
        },
        Operation::Create => RevertAction::Delete {
            entity_type: change.entity_type.clone(),
            entity_id: change.entity_id.clone(),
        },
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_contains_only_changed_writable_fields() {
        let before = serde_json::json!({
            "id": 1,
            "url": "https://api.example.com/schemas/1",
            "name": "Invoices",
            "content": [{"category": "section"}],
            "modified_at": "2026-01-01T00:00:00Z",
        });
        let after = serde_json::json!({
            "id": 1,
            "url": "https://api.example.com/schemas/1",
            "name": "Invoices v2",
            "content": [{"category": "section"}],
            "modified_at": "2026-02-01T00:00:00Z",
        });

        let patch = compute_revert_patch(&before, &after);
        let obj = patch.as_object().unwrap();
        assert_eq!(obj.len(), 1);
        assert_eq!(obj["name"], "Invoices");
    }

    #[test]
    fn identical_snapshots_yield_empty_patch() {
        let snap = serde_json::json!({"name": "same", "id": 9});
        let patch = compute_revert_patch(&snap, &snap);
        assert!(patch.as_object().unwrap().is_empty());
    }

    #[test]
    fn update_action_is_patch() {
        let change = EntityChange {
            entity_type: "queue".into(),
            entity_id: "5".into(),
            entity_name: None,
            operation: Operation::Update,
            before: Some(serde_json::json!({"name": "old"})),
            after: Some(serde_json::json!({"name": "new"})),
        };
        match revert_action(&change) {
            RevertAction::Patch {
                entity_id, patch, ..
            } => {
                assert_eq!(entity_id, "5");
                assert_eq!(patch["name"], "old");
            }
            other => panic!("expected Patch, got {other:?}"),
        }
    }

    #[test]
    fn delete_action_recreates_without_read_only_fields() {
        let change = EntityChange {
            entity_type: "hook".into(),
            entity_id: "8".into(),
            entity_name: None,
            operation: Operation::Delete,
            before: Some(serde_json::json!({
                "id": 8,
                "url": "https://api.example.com/hooks/8",
                "name": "notifier",
                "config": {"url": "https://hooks.example.com"},
            })),
            after: None,
        };
        match revert_action(&change) {
            RevertAction::Recreate { body, .. } => {
                assert!(body.get("id").is_none());
                assert!(body.get("url").is_none());
                assert_eq!(body["name"], "notifier");
                // Nested objects keep their own keys.
                assert_eq!(body["config"]["url"], "https://hooks.example.com");
            }
            other => panic!("expected Recreate, got {other:?}"),
        }
    }

    #[test]
    fn create_action_is_delete() {
        let change = EntityChange {
            entity_type: "workspace".into(),
            entity_id: "3".into(),
            entity_name: None,
            operation: Operation::Create,
            before: None,
            after: Some(serde_json::json!({"id": 3})),
        };
        assert!(matches!(
            revert_action(&change),
            RevertAction::Delete { entity_id, .. } if entity_id == "3"
        ));
    }
}
