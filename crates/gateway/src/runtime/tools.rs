//! Tool runtime — catalog, dynamic category loading, and dispatch.
//!
//! The base surface is deliberately small: built-in tools plus
//! `load_tool_category`. Downstream categories load on demand (explicitly
//! by the model, or keyword-preloaded from the user's first message) and
//! stay loaded for the rest of the chat run. Read-only mode excludes write
//! tools from the schema and refuses them at dispatch.

use std::time::Duration;

use serde_json::Value;

use clerk_domain::error::Result;
use clerk_domain::tool::ToolDefinition;
use clerk_history::ConfigCommit;
use clerk_mcp_client::CategoryInfo;

use super::context::RunContext;
use super::events::{AgentEvent, FileCreatedEvent, TaskSnapshotEvent};
use super::subagent;
use super::tasks::TaskStatus;

/// Built-in tools that mutate downstream state (or replay it, for revert).
/// Excluded from the schema and refused at dispatch in read-only mode.
const BUILTIN_WRITE_TOOLS: &[&str] = &["patch_schema", "create_schema", "revert_commit"];

/// Downstream tools hidden from the model. Raw schema replacement is too
/// easy to misuse; the patch_schema sub-agent owns that path.
const HIDDEN_TOOLS: &[&str] = &["update_schema"];

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Definitions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub fn is_builtin_write_tool(name: &str) -> bool {
    BUILTIN_WRITE_TOOLS.contains(&name)
}

fn def(name: &str, description: &str, parameters: Value) -> ToolDefinition {
    ToolDefinition {
        name: name.into(),
        description: description.into(),
        parameters,
    }
}

fn builtin_definitions(ctx: &RunContext) -> Vec<ToolDefinition> {
    let mut defs = vec![
        def(
            "write_output_file",
            "Write a file into the chat's output directory so the user can download it.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "filename": { "type": "string", "description": "File name, no directories" },
                    "content": { "type": "string", "description": "File content (UTF-8)" }
                },
                "required": ["filename", "content"]
            }),
        ),
        def(
            "search_knowledge_base",
            "Search the product knowledge base. Pass `objective` to run a deeper analysis of the matching articles.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string", "description": "Search query" },
                    "objective": { "type": "string", "description": "Optional: what the analysis should figure out" }
                },
                "required": ["query"]
            }),
        ),
        def(
            "create_task",
            "Create a task to track progress on a multi-step operation.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "subject": { "type": "string", "description": "Brief imperative title" },
                    "description": { "type": "string", "description": "What needs to be done" }
                },
                "required": ["subject"]
            }),
        ),
        def(
            "update_task",
            "Update a task's status or subject.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "task_id": { "type": "string" },
                    "status": { "type": "string", "enum": ["pending", "in_progress", "completed"] },
                    "subject": { "type": "string" }
                },
                "required": ["task_id"]
            }),
        ),
        def(
            "list_tasks",
            "List all tracked tasks with their current status.",
            serde_json::json!({ "type": "object", "properties": {} }),
        ),
        def(
            "load_skill",
            "Load the full playbook for a skill listed in the system prompt.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "name": { "type": "string", "description": "Skill name" }
                },
                "required": ["name"]
            }),
        ),
        def(
            "list_tool_categories",
            "List the downstream tool categories that can be loaded.",
            serde_json::json!({ "type": "object", "properties": {} }),
        ),
        def(
            "load_tool_category",
            "Load downstream tools from one or more categories. Once loaded, the tools become available for use.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "categories": {
                        "type": "array",
                        "items": { "type": "string" },
                        "description": "Category names to load (e.g. ['queues', 'schemas'])"
                    }
                },
                "required": ["categories"]
            }),
        ),
        def(
            "show_change_history",
            "Show recent configuration commits made through this assistant.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "limit": { "type": "integer", "description": "Max commits to show (default 10)" }
                }
            }),
        ),
        def(
            "show_commit_details",
            "Show full details and before/after snapshots for one commit.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "commit_hash": { "type": "string" }
                },
                "required": ["commit_hash"]
            }),
        ),
        def(
            "suggest_lookup_field",
            "Analyze a schema and suggest how to configure a lookup field for the given objective.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "schema_id": { "type": "integer" },
                    "objective": { "type": "string", "description": "What the lookup field should achieve" }
                },
                "required": ["schema_id", "objective"]
            }),
        ),
    ];

    if !ctx.mode.is_read_only() {
        defs.push(def(
            "patch_schema",
            "Apply a described change to a schema. Runs a focused sub-agent that patches and verifies the result.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "schema_id": { "type": "integer" },
                    "instructions": { "type": "string", "description": "The change to apply, in plain language" }
                },
                "required": ["schema_id", "instructions"]
            }),
        ));
        defs.push(def(
            "create_schema",
            "Create a new schema from a description. Runs a focused sub-agent that builds and verifies it.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "name": { "type": "string" },
                    "instructions": { "type": "string", "description": "What the schema should contain" }
                },
                "required": ["name", "instructions"]
            }),
        ));
        defs.push(def(
            "revert_commit",
            "Revert a configuration commit by applying inverse operations. Produces a new forward commit.",
            serde_json::json!({
                "type": "object",
                "properties": {
                    "commit_hash": { "type": "string" }
                },
                "required": ["commit_hash"]
            }),
        ));
    }

    defs
}

/// The full tool schema for the current iteration: builtins plus loaded
/// category tools (deduplicated; builtins win on name collisions).
pub fn definitions(ctx: &RunContext) -> Vec<ToolDefinition> {
    let mut defs = builtin_definitions(ctx);
    for dynamic in ctx.dynamic.definitions() {
        if HIDDEN_TOOLS.contains(&dynamic.name.as_str()) {
            continue;
        }
        if defs.iter().any(|d| d.name == dynamic.name) {
            continue;
        }
        defs.push(dynamic);
    }
    defs
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Display names
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Compact `name(args preview)` label for tool_start events.
pub fn display_tool_name(name: &str, arguments: &Value) -> String {
    if name == "load_tool_category" {
        if let Some(cats) = arguments.get("categories").and_then(|v| v.as_array()) {
            let names: Vec<&str> = cats.iter().filter_map(|c| c.as_str()).collect();
            if !names.is_empty() {
                return format!("{name}({})", names.join(", "));
            }
        }
        return name.to_string();
    }
    for key in ["query", "objective", "filename", "subject", "commit_hash", "instructions"] {
        if let Some(val) = arguments.get(key).and_then(|v| v.as_str()) {
            let cleaned = val.split_whitespace().collect::<Vec<_>>().join(" ");
            let preview: String = cleaned.chars().take(50).collect();
            let ellipsis = if cleaned.chars().count() > 50 { "..." } else { "" };
            return format!("{name}({preview}{ellipsis})");
        }
    }
    name.to_string()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Keyword pre-loading
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Suggest categories whose keywords appear as whole words in the request.
pub fn suggest_categories(catalog: &[CategoryInfo], request_text: &str) -> Vec<String> {
    let words: std::collections::HashSet<String> = request_text
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_owned)
        .collect();

    catalog
        .iter()
        .filter(|category| {
            category
                .keywords
                .iter()
                .any(|kw| words.contains(&kw.to_lowercase()))
        })
        .map(|category| category.name.clone())
        .collect()
}

/// Load categories into the run's dynamic tool set. Returns a summary for
/// the model. In read-only mode write tools are excluded.
pub async fn load_categories(ctx: &RunContext, categories: &[String]) -> String {
    let Some(connection) = &ctx.connection else {
        return "Error: tool server connection not available".into();
    };

    let catalog = match connection.catalog().await {
        Ok(c) => c.to_vec(),
        Err(e) => return format!("Error: could not fetch tool catalog: {e}"),
    };

    let valid: std::collections::HashSet<&str> =
        catalog.iter().map(|c| c.name.as_str()).collect();
    let invalid: Vec<&String> = categories.iter().filter(|c| !valid.contains(c.as_str())).collect();
    if !invalid.is_empty() {
        let mut names: Vec<&str> = valid.into_iter().collect();
        names.sort_unstable();
        return format!("Error: unknown categories {invalid:?}. Valid: {names:?}");
    }

    let to_load: Vec<&String> = categories
        .iter()
        .filter(|c| !ctx.dynamic.is_category_loaded(c))
        .collect();
    if to_load.is_empty() {
        return format!("Categories already loaded: {categories:?}");
    }

    let mut loaded_names: Vec<String> = Vec::new();
    for category in &to_load {
        let tools = match connection.tools_in_category(category).await {
            Ok(t) => t,
            Err(e) => return format!("Error: tool discovery failed: {e}"),
        };
        let defs: Vec<ToolDefinition> = tools
            .into_iter()
            .filter(|t| !HIDDEN_TOOLS.contains(&t.name.as_str()))
            .filter(|t| !(ctx.mode.is_read_only() && !t.read_only))
            .map(|t| ToolDefinition {
                name: t.name.clone(),
                description: t.description.clone(),
                parameters: t.input_schema.clone(),
            })
            .collect();
        loaded_names.extend(defs.iter().map(|d| d.name.clone()));
        ctx.dynamic.mark_category_loaded(category, defs);
    }

    loaded_names.sort_unstable();
    let mode_suffix = if ctx.mode.is_read_only() {
        " (read-only mode)"
    } else {
        ""
    };
    tracing::info!(
        chat_id = %ctx.chat_id,
        categories = ?to_load,
        tools = loaded_names.len(),
        "loaded tool categories"
    );
    format!(
        "Loaded {} tools from {:?}{}: {}",
        loaded_names.len(),
        to_load,
        mode_suffix,
        loaded_names.join(", ")
    )
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Dispatch
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Dispatch a single tool call. Returns `(result_content, is_error)` — tool
/// failures are data for the model, not control flow.
pub async fn dispatch_tool(ctx: &RunContext, name: &str, arguments: &Value) -> (String, bool) {
    // Read-only gate: refuse writes even if one slipped into the schema.
    if ctx.mode.is_read_only()
        && (is_builtin_write_tool(name) || ctx.tracked.is_write_tool(name))
    {
        return (
            format!("Tool '{name}' modifies configuration and is not available in read-only mode."),
            true,
        );
    }

    match name {
        "write_output_file" => dispatch_write_output_file(ctx, arguments).await,
        "search_knowledge_base" => dispatch_knowledge_search(ctx, arguments).await,
        "create_task" => dispatch_create_task(ctx, arguments).await,
        "update_task" => dispatch_update_task(ctx, arguments).await,
        "list_tasks" => (
            serde_json::to_string(&ctx.tasks.snapshot()).unwrap_or_else(|_| "[]".into()),
            false,
        ),
        "load_skill" => dispatch_load_skill(ctx, arguments),
        "list_tool_categories" => dispatch_list_categories(ctx).await,
        "load_tool_category" => {
            let categories: Vec<String> = arguments
                .get("categories")
                .and_then(|v| v.as_array())
                .map(|arr| {
                    arr.iter()
                        .filter_map(|c| c.as_str().map(str::to_owned))
                        .collect()
                })
                .unwrap_or_default();
            if categories.is_empty() {
                return ("missing required argument: categories".into(), true);
            }
            (load_categories(ctx, &categories).await, false)
        }
        "show_change_history" => dispatch_show_history(ctx, arguments).await,
        "show_commit_details" => dispatch_commit_details(ctx, arguments).await,
        "revert_commit" => super::revert::dispatch_revert_commit(ctx, arguments).await,
        "patch_schema" => subagent::run_patch_schema(ctx, arguments).await,
        "create_schema" => subagent::run_create_schema(ctx, arguments).await,
        "suggest_lookup_field" => subagent::run_suggest_lookup_field(ctx, arguments).await,
        _ => dispatch_downstream(ctx, name, arguments).await,
    }
}

async fn dispatch_downstream(ctx: &RunContext, name: &str, arguments: &Value) -> (String, bool) {
    let timeout = Duration::from_secs(ctx.config.runtime.tool_timeout_secs);
    let call = ctx.tracked.call(name, arguments.clone());
    match tokio::time::timeout(timeout, call).await {
        Ok(Ok(result)) => (to_result_string(result), false),
        Ok(Err(e)) => (e.to_string(), true),
        Err(_) => (
            format!(
                "tool '{name}' timed out after {}s",
                ctx.config.runtime.tool_timeout_secs
            ),
            true,
        ),
    }
}

fn to_result_string(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => serde_json::to_string(&other).unwrap_or_default(),
    }
}

// ── Builtins ─────────────────────────────────────────────────────────

/// Reject anything that could escape the output directory.
pub fn safe_filename(name: &str) -> Option<&str> {
    if name.is_empty()
        || name.contains('/')
        || name.contains('\\')
        || name.contains("..")
        || name.starts_with('.')
    {
        return None;
    }
    Some(name)
}

async fn dispatch_write_output_file(ctx: &RunContext, arguments: &Value) -> (String, bool) {
    let Some(filename) = arguments
        .get("filename")
        .and_then(|v| v.as_str())
        .and_then(safe_filename)
    else {
        return ("invalid filename".into(), true);
    };
    let content = arguments
        .get("content")
        .and_then(|v| v.as_str())
        .unwrap_or_default();

    let Some(dir) = ctx.output_dir() else {
        return ("output directory not available".into(), true);
    };
    let path = dir.join(filename);
    if let Err(e) = tokio::fs::write(&path, content).await {
        return (format!("failed to write {filename}: {e}"), true);
    }

    ctx.send_event(AgentEvent::FileCreated(FileCreatedEvent {
        filename: filename.to_string(),
        url: format!("/api/v1/chats/{}/files/{filename}", ctx.chat_id),
    }))
    .await;

    (
        serde_json::json!({
            "path": path.display().to_string(),
            "bytes": content.len(),
        })
        .to_string(),
        false,
    )
}

async fn dispatch_knowledge_search(ctx: &RunContext, arguments: &Value) -> (String, bool) {
    let query = arguments.get("query").and_then(|v| v.as_str()).unwrap_or("");
    if query.is_empty() {
        return ("missing required argument: query".into(), true);
    }

    if arguments.get("objective").and_then(|v| v.as_str()).is_some() {
        return subagent::run_knowledge_analysis(ctx, arguments).await;
    }

    let hits = ctx.knowledge.search(query, 5);
    if hits.is_empty() {
        return (
            serde_json::json!({ "message": "no matching articles" }).to_string(),
            false,
        );
    }
    let results: Vec<Value> = hits
        .iter()
        .map(|h| {
            serde_json::json!({
                "slug": h.slug,
                "title": h.title,
                "score": h.score,
                "excerpt": h.excerpt,
            })
        })
        .collect();
    (
        serde_json::to_string(&results).unwrap_or_else(|_| "[]".into()),
        false,
    )
}

async fn dispatch_create_task(ctx: &RunContext, arguments: &Value) -> (String, bool) {
    let subject = arguments.get("subject").and_then(|v| v.as_str()).unwrap_or("");
    if subject.is_empty() {
        return ("missing required argument: subject".into(), true);
    }
    let description = arguments
        .get("description")
        .and_then(|v| v.as_str())
        .unwrap_or("");

    let (task, snapshot) = ctx.tasks.create(subject, description);
    ctx.send_event(AgentEvent::TaskSnapshot(TaskSnapshotEvent { tasks: snapshot }))
        .await;
    (
        serde_json::to_string(&task).unwrap_or_default(),
        false,
    )
}

async fn dispatch_update_task(ctx: &RunContext, arguments: &Value) -> (String, bool) {
    let task_id = arguments.get("task_id").and_then(|v| v.as_str()).unwrap_or("");
    if task_id.is_empty() {
        return ("missing required argument: task_id".into(), true);
    }
    let status = match arguments.get("status").and_then(|v| v.as_str()) {
        Some(raw) => match TaskStatus::parse(raw) {
            Some(s) => Some(s),
            None => {
                return (
                    format!(
                        "invalid status '{raw}'. Must be one of: pending, in_progress, completed"
                    ),
                    true,
                )
            }
        },
        None => None,
    };
    let subject = arguments.get("subject").and_then(|v| v.as_str());

    match ctx.tasks.update(task_id, status, subject) {
        Ok((task, snapshot)) => {
            ctx.send_event(AgentEvent::TaskSnapshot(TaskSnapshotEvent { tasks: snapshot }))
                .await;
            (serde_json::to_string(&task).unwrap_or_default(), false)
        }
        Err(message) => (message, true),
    }
}

fn dispatch_load_skill(ctx: &RunContext, arguments: &Value) -> (String, bool) {
    let name = arguments.get("name").and_then(|v| v.as_str()).unwrap_or("");
    match ctx.skills.get(name) {
        Some(skill) => {
            if !ctx.dynamic.mark_skill_loaded(name) {
                return (format!("Skill '{name}' is already loaded."), false);
            }
            (skill.body.clone(), false)
        }
        None => (format!("skill not found: {name}"), true),
    }
}

async fn dispatch_list_categories(ctx: &RunContext) -> (String, bool) {
    let Some(connection) = &ctx.connection else {
        return ("tool server connection not available".into(), true);
    };
    match connection.catalog().await {
        Ok(catalog) => {
            let listing: Vec<Value> = catalog
                .iter()
                .map(|c| {
                    serde_json::json!({
                        "name": c.name,
                        "keywords": c.keywords,
                        "tool_count": c.tools.len(),
                        "loaded": ctx.dynamic.is_category_loaded(&c.name),
                    })
                })
                .collect();
            (
                serde_json::to_string(&listing).unwrap_or_else(|_| "[]".into()),
                false,
            )
        }
        Err(e) => (format!("could not fetch tool catalog: {e}"), true),
    }
}

// ── Change history builtins ──────────────────────────────────────────

/// Commit any pending tracked changes so history queries and reverts see
/// writes made earlier in the same run.
pub async fn flush_pending_commit(ctx: &RunContext) -> Result<Option<ConfigCommit>> {
    if !ctx.tracked.has_changes() {
        return Ok(None);
    }
    let changes = ctx.tracked.take_changes();
    let service = clerk_history::CommitService::new(&ctx.commits, &ctx.snapshots);
    let commit = service
        .create_commit(
            ctx.provider.as_ref(),
            &ctx.config.llm.summary_model,
            &changes,
            &ctx.chat_id,
            &ctx.user_request,
            &ctx.environment,
        )
        .await?;
    if let Some(commit) = &commit {
        ctx.chats.record_commit(&ctx.chat_id, &commit.hash).await?;
    }
    Ok(commit)
}

async fn dispatch_show_history(ctx: &RunContext, arguments: &Value) -> (String, bool) {
    if let Err(e) = flush_pending_commit(ctx).await {
        tracing::warn!(error = %e, "pre-history flush failed");
    }

    let limit = arguments
        .get("limit")
        .and_then(|v| v.as_u64())
        .unwrap_or(10) as usize;
    match ctx.commits.list_commits(&ctx.environment, limit).await {
        Ok(commits) if commits.is_empty() => (
            serde_json::json!({ "message": "No configuration changes recorded" }).to_string(),
            false,
        ),
        Ok(commits) => {
            let listing: Vec<Value> = commits
                .iter()
                .map(|c| {
                    serde_json::json!({
                        "hash": c.hash,
                        "message": c.message,
                        "timestamp": c.timestamp.to_rfc3339(),
                        "changes": c.changes.len(),
                        "user_request": c.user_request.chars().take(100).collect::<String>(),
                    })
                })
                .collect();
            (
                serde_json::to_string(&listing).unwrap_or_else(|_| "[]".into()),
                false,
            )
        }
        Err(e) => (format!("history unavailable: {e}"), true),
    }
}

async fn dispatch_commit_details(ctx: &RunContext, arguments: &Value) -> (String, bool) {
    let Some(hash) = arguments.get("commit_hash").and_then(|v| v.as_str()) else {
        return ("missing required argument: commit_hash".into(), true);
    };
    match ctx.commits.get_commit(hash).await {
        Ok(Some(commit)) => (
            serde_json::to_string(&commit).unwrap_or_default(),
            false,
        ),
        Ok(None) => (format!("Commit {hash} not found"), true),
        Err(e) => (format!("commit lookup failed: {e}"), true),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
