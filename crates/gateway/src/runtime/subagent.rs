//! Sub-agents — bounded nested agent loops invoked as tools.
//!
//! Each sub-agent runs its own iteration loop against a distinct system
//! prompt and a restricted tool subset, with isolated memory, a child
//! cancel token, a wall-clock timeout, and per-tool token accounting.
//! Progress and text stream out as `sub_agent_progress` / `sub_agent_text`
//! events tagged with the parent tool name.

use std::time::Duration;

use futures_util::StreamExt;
use serde_json::Value;

use clerk_domain::stream::StreamEvent;
use clerk_domain::tool::{ContentPart, Message, ToolCall, ToolDefinition};
use clerk_providers::ChatRequest;

use super::context::RunContext;
use super::events::{AgentEvent, SubAgentProgressEvent, SubAgentTextEvent};
use super::registry::CancelToken;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Spec
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct SubAgentSpec {
    /// The parent tool name; tags events and the token ledger entry.
    tool_name: &'static str,
    system_prompt: String,
    /// Downstream tools this sub-agent may call. `knowledge_lookup` is
    /// resolved locally against the knowledge base.
    allowed_tools: Vec<String>,
    max_iterations: u32,
}

const KNOWLEDGE_LOOKUP_TOOL: &str = "knowledge_lookup";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Entry points for the builtin sub-agent tools
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn run_knowledge_analysis(ctx: &RunContext, arguments: &Value) -> (String, bool) {
    let query = arguments.get("query").and_then(|v| v.as_str()).unwrap_or("");
    let objective = arguments
        .get("objective")
        .and_then(|v| v.as_str())
        .unwrap_or("");

    let spec = SubAgentSpec {
        tool_name: "search_knowledge_base",
        system_prompt: "You analyze product documentation for a document-processing \
             platform. Use the knowledge_lookup tool to pull in relevant articles, \
             then answer the objective concisely with concrete configuration guidance."
            .into(),
        allowed_tools: vec![KNOWLEDGE_LOOKUP_TOOL.to_string()],
        max_iterations: ctx.config.runtime.subagent_max_iterations.min(3),
    };
    let task = format!("Search topic: {query}\n\nObjective: {objective}");
    run_sub_agent(ctx, spec, task).await
}

pub async fn run_patch_schema(ctx: &RunContext, arguments: &Value) -> (String, bool) {
    let Some(schema_id) = arguments.get("schema_id").and_then(|v| v.as_i64()) else {
        return ("missing required argument: schema_id".into(), true);
    };
    let instructions = arguments
        .get("instructions")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    if instructions.is_empty() {
        return ("missing required argument: instructions".into(), true);
    }

    let spec = SubAgentSpec {
        tool_name: "patch_schema",
        system_prompt: "You apply precise schema changes on a document-processing \
             platform. Fetch the schema with get_schema, apply the requested change \
             with update_schema passing the FULL updated content (never a partial \
             tree), then fetch it again to verify the change landed. Report exactly \
             what changed."
            .into(),
        allowed_tools: vec!["get_schema".into(), "update_schema".into()],
        max_iterations: ctx.config.runtime.subagent_max_iterations,
    };
    let task = format!("Schema id: {schema_id}\n\nRequested change:\n{instructions}");
    run_sub_agent(ctx, spec, task).await
}

pub async fn run_create_schema(ctx: &RunContext, arguments: &Value) -> (String, bool) {
    let name = arguments.get("name").and_then(|v| v.as_str()).unwrap_or("");
    let instructions = arguments
        .get("instructions")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    if name.is_empty() || instructions.is_empty() {
        return ("missing required arguments: name, instructions".into(), true);
    }

    let spec = SubAgentSpec {
        tool_name: "create_schema",
        system_prompt: "You design schemas for a document-processing platform. \
             Build the datapoint tree the user described, create it with \
             create_schema, then fetch it back with get_schema to verify. Keep \
             sections flat and ids snake_case."
            .into(),
        allowed_tools: vec!["create_schema".into(), "get_schema".into()],
        max_iterations: ctx.config.runtime.subagent_max_iterations,
    };
    let task = format!("Schema name: {name}\n\nContents:\n{instructions}");
    run_sub_agent(ctx, spec, task).await
}

pub async fn run_suggest_lookup_field(ctx: &RunContext, arguments: &Value) -> (String, bool) {
    let Some(schema_id) = arguments.get("schema_id").and_then(|v| v.as_i64()) else {
        return ("missing required argument: schema_id".into(), true);
    };
    let objective = arguments
        .get("objective")
        .and_then(|v| v.as_str())
        .unwrap_or("");

    let spec = SubAgentSpec {
        tool_name: "suggest_lookup_field",
        system_prompt: "You advise on lookup-field configuration for a \
             document-processing platform. Inspect the schema with get_schema and \
             propose a concrete lookup field definition (id, label, dataset \
             binding, match columns) for the objective. Do not modify anything."
            .into(),
        allowed_tools: vec!["get_schema".into()],
        max_iterations: ctx.config.runtime.subagent_max_iterations,
    };
    let task = format!("Schema id: {schema_id}\n\nObjective: {objective}");
    run_sub_agent(ctx, spec, task).await
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// The loop
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn run_sub_agent(ctx: &RunContext, spec: SubAgentSpec, task: String) -> (String, bool) {
    let cancel = ctx.cancel.child();
    let timeout = Duration::from_secs(ctx.config.runtime.subagent_timeout_secs);

    match tokio::time::timeout(timeout, sub_agent_loop(ctx, &spec, task, &cancel)).await {
        Ok(result) => result,
        Err(_) => {
            cancel.cancel();
            emit_progress(ctx, &spec, spec.max_iterations, None, &[], "completed").await;
            (
                format!(
                    "[{} timed out after {}s]",
                    spec.tool_name, ctx.config.runtime.subagent_timeout_secs
                ),
                true,
            )
        }
    }
}

async fn sub_agent_loop(
    ctx: &RunContext,
    spec: &SubAgentSpec,
    task: String,
    cancel: &CancelToken,
) -> (String, bool) {
    let tool_defs = resolve_tool_defs(ctx, spec).await;
    let mut messages = vec![Message::user(task)];
    let mut last_text = String::new();

    for iteration in 1..=spec.max_iterations {
        if cancel.is_cancelled() {
            return ("[sub-agent cancelled]".into(), true);
        }

        emit_progress(ctx, spec, iteration, None, &[], "thinking").await;

        let req = ChatRequest {
            system: spec.system_prompt.clone(),
            messages: messages.clone(),
            tools: tool_defs.clone(),
            max_tokens: Some(16_384),
            thinking_budget: Some(0),
            model: None,
            cache: true,
        };

        let mut stream = match ctx.provider.chat_stream(req).await {
            Ok(s) => s,
            Err(e) => return (format!("sub-agent model call failed: {e}"), true),
        };

        let mut text_buf = String::new();
        let mut tool_calls: Vec<ToolCall> = Vec::new();

        while let Some(event) = stream.next().await {
            if cancel.is_cancelled() {
                return ("[sub-agent cancelled]".into(), true);
            }
            match event {
                Ok(StreamEvent::Token { text }) => {
                    text_buf.push_str(&text);
                    ctx.send_event(AgentEvent::SubAgentText(SubAgentTextEvent {
                        tool_name: spec.tool_name.to_string(),
                        text: text_buf.clone(),
                        is_final: false,
                    }))
                    .await;
                }
                Ok(StreamEvent::ToolCallFinished {
                    call_id,
                    tool_name,
                    arguments,
                }) => {
                    tool_calls.push(ToolCall {
                        call_id,
                        tool_name,
                        arguments,
                    });
                }
                Ok(StreamEvent::Done { usage, .. }) => {
                    if let Some(usage) = usage {
                        ctx.ledger.record(spec.tool_name, &usage);
                    }
                }
                Ok(StreamEvent::Error { message }) => {
                    return (format!("sub-agent stream error: {message}"), true);
                }
                Ok(_) => {}
                Err(e) => return (format!("sub-agent stream failed: {e}"), true),
            }
        }

        last_text = text_buf.clone();

        if tool_calls.is_empty() {
            emit_progress(ctx, spec, iteration, None, &[], "completed").await;
            ctx.send_event(AgentEvent::SubAgentText(SubAgentTextEvent {
                tool_name: spec.tool_name.to_string(),
                text: last_text.clone(),
                is_final: true,
            }))
            .await;
            let analysis = if last_text.is_empty() {
                "No analysis provided".to_string()
            } else {
                last_text
            };
            return (analysis, false);
        }

        // Record the assistant turn, then execute the calls sequentially
        // (sub-agent batches are small and often dependent).
        let mut assistant_parts: Vec<ContentPart> = Vec::new();
        if !text_buf.is_empty() {
            assistant_parts.push(ContentPart::Text { text: text_buf });
        }
        assistant_parts.extend(tool_calls.iter().map(|tc| ContentPart::ToolUse {
            id: tc.call_id.clone(),
            name: tc.tool_name.clone(),
            input: tc.arguments.clone(),
        }));
        messages.push(Message::assistant_parts(assistant_parts));

        let call_labels: Vec<String> = tool_calls
            .iter()
            .map(|tc| super::tools::display_tool_name(&tc.tool_name, &tc.arguments))
            .collect();

        let mut result_parts: Vec<ContentPart> = Vec::new();
        for (tc, label) in tool_calls.iter().zip(&call_labels) {
            if cancel.is_cancelled() {
                return ("[sub-agent cancelled]".into(), true);
            }
            emit_progress(
                ctx,
                spec,
                iteration,
                Some(label.clone()),
                &call_labels,
                "running_tool",
            )
            .await;

            let (content, is_error) = execute_sub_tool(ctx, spec, &tc.tool_name, &tc.arguments).await;
            result_parts.push(ContentPart::ToolResult {
                tool_use_id: tc.call_id.clone(),
                content,
                is_error,
            });
        }
        messages.push(Message::tool_results(result_parts));

        emit_progress(ctx, spec, iteration, None, &call_labels, "reasoning").await;
    }

    tracing::warn!(
        tool = spec.tool_name,
        max_iterations = spec.max_iterations,
        "sub-agent hit iteration cap"
    );
    let analysis = if last_text.is_empty() {
        "Max iterations reached".to_string()
    } else {
        last_text
    };
    (analysis, false)
}

/// Tool definitions for the restricted subset, resolved against discovery.
async fn resolve_tool_defs(ctx: &RunContext, spec: &SubAgentSpec) -> Vec<ToolDefinition> {
    let mut defs = Vec::new();

    for name in &spec.allowed_tools {
        if name == KNOWLEDGE_LOOKUP_TOOL {
            defs.push(ToolDefinition {
                name: KNOWLEDGE_LOOKUP_TOOL.into(),
                description: "Look up articles in the product knowledge base.".into(),
                parameters: serde_json::json!({
                    "type": "object",
                    "properties": {
                        "query": { "type": "string" }
                    },
                    "required": ["query"]
                }),
            });
            continue;
        }
        if let Some(connection) = &ctx.connection {
            if let Ok(tools) = connection.tools().await {
                if let Some(tool) = tools.iter().find(|t| &t.name == name) {
                    defs.push(ToolDefinition {
                        name: tool.name.clone(),
                        description: tool.description.clone(),
                        parameters: tool.input_schema.clone(),
                    });
                }
            }
        }
    }

    defs
}

/// Execute one sub-agent tool call: local knowledge lookup, or a tracked
/// downstream call (writes made here are captured like any other).
async fn execute_sub_tool(
    ctx: &RunContext,
    spec: &SubAgentSpec,
    name: &str,
    arguments: &Value,
) -> (String, bool) {
    if !spec.allowed_tools.iter().any(|t| t == name) {
        return (format!("tool '{name}' is not available to this sub-agent"), true);
    }

    if name == KNOWLEDGE_LOOKUP_TOOL {
        let query = arguments.get("query").and_then(|v| v.as_str()).unwrap_or("");
        let hits = ctx.knowledge.search(query, 3);
        if hits.is_empty() {
            return ("no matching articles".into(), false);
        }
        let text = hits
            .iter()
            .map(|h| format!("## {} ({})\n{}", h.title, h.slug, h.excerpt))
            .collect::<Vec<_>>()
            .join("\n\n");
        return (text, false);
    }

    let timeout = Duration::from_secs(ctx.config.runtime.tool_timeout_secs);
    match tokio::time::timeout(timeout, ctx.tracked.call(name, arguments.clone())).await {
        Ok(Ok(result)) => match result {
            Value::String(s) => (s, false),
            other => (other.to_string(), false),
        },
        Ok(Err(e)) => (e.to_string(), true),
        Err(_) => (format!("tool '{name}' timed out"), true),
    }
}

async fn emit_progress(
    ctx: &RunContext,
    spec: &SubAgentSpec,
    iteration: u32,
    current_tool: Option<String>,
    tool_calls: &[String],
    status: &str,
) {
    ctx.send_event(AgentEvent::SubAgentProgress(SubAgentProgressEvent {
        tool_name: spec.tool_name.to_string(),
        iteration,
        max_iterations: spec.max_iterations,
        current_tool,
        tool_calls: tool_calls.to_vec(),
        status: status.to_string(),
    }))
    .await;
}
