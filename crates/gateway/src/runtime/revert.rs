//! The `revert_commit` tool — applies inverse operations for a commit.
//!
//! Reverts run through the tracked connection, so every inverse write is
//! captured as a fresh change and the run ends with a new forward commit
//! whose `after` state equals the target commit's `before` state. Entity
//! reverts are staggered to avoid concurrent-modification conflicts, and
//! each write inherits the middleware's fetch-then-patch 412 retry.

use std::time::Duration;

use serde_json::Value;

use clerk_history::{deduplicate_changes, revert_action, RevertAction};

use super::context::RunContext;
use super::tools::flush_pending_commit;

pub async fn dispatch_revert_commit(ctx: &RunContext, arguments: &Value) -> (String, bool) {
    let Some(hash) = arguments.get("commit_hash").and_then(|v| v.as_str()) else {
        return ("missing required argument: commit_hash".into(), true);
    };

    // Changes from earlier in this run must be committed first, both so the
    // target hash can reference them and so the revert starts a clean set.
    if let Err(e) = flush_pending_commit(ctx).await {
        tracing::warn!(error = %e, "pre-revert flush failed");
    }

    let commit = match ctx.commits.get_commit(hash).await {
        Ok(Some(commit)) => commit,
        Ok(None) => return (format!("Commit {hash} not found"), true),
        Err(e) => return (format!("commit lookup failed: {e}"), true),
    };

    let deduped = deduplicate_changes(&commit.changes);
    let stagger = Duration::from_millis(ctx.config.runtime.write_stagger_ms);

    let mut reverted: Vec<Value> = Vec::new();
    let mut skipped: Vec<Value> = Vec::new();
    let mut errors: Vec<Value> = Vec::new();

    for (i, change) in deduped.iter().enumerate() {
        if ctx.cancel.is_cancelled() {
            errors.push(serde_json::json!({ "error": "revert cancelled" }));
            break;
        }
        if i > 0 {
            // Successive writes to the platform need breathing room or the
            // API answers 412 for the whole batch.
            tokio::time::sleep(stagger).await;
        }

        let outcome = match revert_action(change) {
            RevertAction::Noop {
                entity_type,
                entity_id,
            } => {
                skipped.push(serde_json::json!({
                    "entity_type": entity_type,
                    "entity_id": entity_id,
                    "reason": "nothing to restore",
                }));
                continue;
            }
            RevertAction::Patch {
                entity_type,
                entity_id,
                patch,
            } => {
                let tool = format!("update_{entity_type}");
                let mut args = serde_json::Map::new();
                args.insert(
                    format!("{entity_type}_id"),
                    id_value(&entity_id),
                );
                for (k, v) in patch.as_object().into_iter().flatten() {
                    args.insert(k.clone(), v.clone());
                }
                ctx.tracked
                    .call(&tool, Value::Object(args))
                    .await
                    .map(|_| {
                        serde_json::json!({
                            "status": "reverted",
                            "entity_type": entity_type,
                            "entity_id": entity_id,
                        })
                    })
            }
            RevertAction::Recreate { entity_type, body } => ctx
                .tracked
                .call(&format!("create_{entity_type}"), body)
                .await
                .map(|result| {
                    serde_json::json!({
                        "status": "recreated",
                        "entity_type": entity_type,
                        "new_entity_id": result.get("id").cloned().unwrap_or(Value::Null),
                    })
                }),
            RevertAction::Delete {
                entity_type,
                entity_id,
            } => {
                let tool = format!("delete_{entity_type}");
                let mut args = serde_json::Map::new();
                args.insert(format!("{entity_type}_id"), id_value(&entity_id));
                ctx.tracked.call(&tool, Value::Object(args)).await.map(|_| {
                    serde_json::json!({
                        "status": "deleted",
                        "entity_type": entity_type,
                        "entity_id": entity_id,
                    })
                })
            }
        };

        match outcome {
            Ok(entry) => reverted.push(entry),
            Err(e) => {
                tracing::warn!(
                    entity_type = %change.entity_type,
                    entity_id = %change.entity_id,
                    error = %e,
                    "entity revert failed"
                );
                errors.push(serde_json::json!({
                    "entity_type": change.entity_type,
                    "entity_id": change.entity_id,
                    "error": e.to_string(),
                }));
            }
        }
    }

    let is_error = reverted.is_empty() && !errors.is_empty();
    (
        serde_json::json!({
            "commit": hash,
            "message": commit.message,
            "reverted": reverted,
            "skipped": skipped,
            "errors": errors,
        })
        .to_string(),
        is_error,
    )
}

fn id_value(entity_id: &str) -> Value {
    entity_id
        .parse::<i64>()
        .map(Value::from)
        .unwrap_or_else(|_| Value::String(entity_id.to_owned()))
}
