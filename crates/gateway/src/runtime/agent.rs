//! The agent loop — model call → tool dispatch → result fold, repeated
//! until a final answer, the iteration cap, cancellation, or an error.
//!
//! Entry point: [`run_message`] spawns the loop on a worker task and
//! returns a channel of [`AgentEvent`]s for the SSE gateway to fan out.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use futures_util::stream::FuturesUnordered;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;

use clerk_domain::config::{Mode, Persona};
use clerk_domain::stream::StreamEvent;
use clerk_domain::tool::{ContentPart, ToolCall};
use clerk_mcp_client::ToolConnection;
use clerk_providers::ChatRequest;
use clerk_store::ChatMeta;

use crate::state::AppState;

use super::context::{DynamicTools, RunContext};
use super::events::{
    AgentEvent, DoneEvent, FileCreatedEvent, StepEvent, TokenLedger, MAIN_AGENT_SOURCE,
};
use super::memory::{AgentMemory, MemoryStep, ThinkingBlock, ToolResultRecord};
use super::prompts;
use super::registry::RunHandle;
use super::tasks::TaskTracker;
use super::tools;
use super::tracking::{extract_entity_type, TrackedConnection};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Inputs
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Bearer credentials forwarded from the client; held in memory only.
#[derive(Clone)]
pub struct Credentials {
    pub token: String,
    pub base_url: String,
}

#[derive(Clone)]
pub struct ImageAttachment {
    pub media_type: String,
    /// Base64-encoded image bytes.
    pub data: String,
}

#[derive(Clone)]
pub struct DocumentAttachment {
    pub filename: String,
    /// Base64-encoded PDF bytes.
    pub data: String,
}

/// One user message to drive through the loop.
pub struct MessageInput {
    pub chat_id: String,
    pub content: String,
    pub images: Vec<ImageAttachment>,
    pub documents: Vec<DocumentAttachment>,
    pub platform_url: Option<String>,
    pub mode: Mode,
    pub persona: Persona,
    pub credentials: Credentials,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// run_message
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Start the agent loop for one message. The returned receiver yields
/// events ending with `done`; the channel closing terminates the stream.
pub fn run_message(
    state: AppState,
    meta: ChatMeta,
    input: MessageInput,
) -> mpsc::Receiver<AgentEvent> {
    let (tx, rx) = mpsc::channel::<AgentEvent>(64);

    tokio::spawn(async move {
        run_message_worker(state, meta, input, tx).await;
    });

    rx
}

async fn run_message_worker(
    state: AppState,
    meta: ChatMeta,
    input: MessageInput,
    tx: mpsc::Sender<AgentEvent>,
) {
    let chat_id = input.chat_id.clone();

    let output_dir = state
        .config
        .workspace
        .output_dir
        .join(&chat_id)
        .join(uuid::Uuid::new_v4().to_string());
    if let Err(e) = tokio::fs::create_dir_all(&output_dir).await {
        let _ = tx
            .send(AgentEvent::Step(StepEvent::error(
                1,
                format!("could not create output directory: {e}"),
            )))
            .await;
        let _ = tx.send(AgentEvent::Done(DoneEvent::default())).await;
        return;
    }

    // Supersede any in-flight run for this chat before doing real work.
    let handle = state.registry.start_run(&chat_id, output_dir).await;

    tracing::info!(
        chat_id = %chat_id,
        run_id = handle.run_id,
        mode = input.mode.as_str(),
        "agent run started"
    );

    // Per-run tool server with the caller's credentials in its environment.
    let connection = match ToolConnection::connect(
        &state.config.tool_server,
        &input.credentials.token,
        &input.credentials.base_url,
        input.mode,
    )
    .await
    {
        Ok(conn) => Arc::new(conn),
        Err(e) => {
            tracing::error!(chat_id = %chat_id, error = %e, "tool server connection failed");
            let _ = tx
                .send(AgentEvent::Step(StepEvent::error(
                    1,
                    format!("could not reach the platform tool server: {e}"),
                )))
                .await;
            let _ = tx.send(AgentEvent::Done(DoneEvent::default())).await;
            handle.finish();
            return;
        }
    };

    let ctx = build_context(&state, &handle, &connection, &input, tx.clone()).await;

    let done = drive_agent(&ctx, &meta, &input).await;
    let _ = tx.send(AgentEvent::Done(done)).await;

    connection.shutdown().await;
    handle.finish();
    tracing::info!(chat_id = %chat_id, "agent run finished");
}

async fn build_context(
    state: &AppState,
    handle: &RunHandle,
    connection: &Arc<ToolConnection>,
    input: &MessageInput,
    events: mpsc::Sender<AgentEvent>,
) -> RunContext {
    // Write-tool names come from downstream discovery; a failure leaves the
    // set empty (reads still work, tracking records nothing).
    let write_tools: HashSet<String> = match connection.write_tools().await {
        Ok(names) => names.into_iter().collect(),
        Err(e) => {
            tracing::warn!(error = %e, "write-tool discovery failed");
            HashSet::new()
        }
    };

    let tracked = Arc::new(TrackedConnection::new(
        connection.clone(),
        &input.chat_id,
        state.kv.clone(),
        write_tools,
        handle.cancel.clone(),
        state.config.runtime.downstream_retries,
    ));

    RunContext {
        chat_id: input.chat_id.clone(),
        run_id: handle.run_id,
        mode: input.mode,
        persona: input.persona,
        environment: input.credentials.base_url.trim_end_matches('/').to_string(),
        user_request: input.content.clone(),
        config: state.config.clone(),
        registry: state.registry.clone(),
        chats: state.chats.clone(),
        commits: state.commits.clone(),
        snapshots: state.snapshots.clone(),
        provider: state.provider.clone(),
        tracked,
        connection: Some(connection.clone()),
        events,
        tasks: Arc::new(TaskTracker::new()),
        ledger: Arc::new(TokenLedger::new()),
        dynamic: Arc::new(DynamicTools::default()),
        skills: state.skills.clone(),
        knowledge: state.knowledge.clone(),
        cancel: handle.cancel.clone(),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Setup helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Decode uploaded documents into the output directory; returns their paths.
async fn save_documents(ctx: &RunContext, documents: &[DocumentAttachment]) -> Vec<String> {
    let Some(dir) = ctx.output_dir() else {
        return Vec::new();
    };
    let mut saved = Vec::new();
    for doc in documents {
        let Some(filename) = tools::safe_filename(&doc.filename) else {
            tracing::warn!(filename = %doc.filename, "rejecting unsafe document filename");
            continue;
        };
        let bytes = match base64::engine::general_purpose::STANDARD.decode(&doc.data) {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(filename = %filename, error = %e, "document decode failed");
                continue;
            }
        };
        let path = dir.join(filename);
        match tokio::fs::write(&path, bytes).await {
            Ok(()) => {
                ctx.send_event(AgentEvent::FileCreated(FileCreatedEvent {
                    filename: filename.to_string(),
                    url: format!("/api/v1/chats/{}/files/{filename}", ctx.chat_id),
                }))
                .await;
                saved.push(path.display().to_string());
            }
            Err(e) => {
                tracing::warn!(filename = %filename, error = %e, "document save failed");
            }
        }
    }
    saved
}

/// Assemble the user turn: images, a note pointing at saved documents,
/// then the prompt text.
fn build_user_parts(input: &MessageInput, document_paths: &[String]) -> Vec<ContentPart> {
    let mut parts = Vec::new();
    for image in &input.images {
        parts.push(ContentPart::Image {
            media_type: image.media_type.clone(),
            data: image.data.clone(),
        });
    }
    if !document_paths.is_empty() {
        let listing = document_paths
            .iter()
            .map(|p| format!("- {p}"))
            .collect::<Vec<_>>()
            .join("\n");
        parts.push(ContentPart::Text {
            text: format!("[Uploaded documents available for processing:\n{listing}]"),
        });
    }
    parts.push(ContentPart::Text {
        text: input.content.clone(),
    });
    parts
}

/// Keyword-based category pre-loading from the user's message.
async fn preload_categories(ctx: &RunContext, content: &str) {
    let Some(connection) = &ctx.connection else {
        return;
    };
    let catalog = match connection.catalog().await {
        Ok(c) => c.to_vec(),
        Err(e) => {
            tracing::debug!(error = %e, "catalog unavailable for keyword pre-loading");
            return;
        }
    };
    let suggested = tools::suggest_categories(&catalog, content);
    if suggested.is_empty() {
        return;
    }
    let summary = tools::load_categories(ctx, &suggested).await;
    tracing::info!(categories = ?suggested, result = %summary, "pre-loaded tool categories");
}

/// Per-call dispatch delays: writes hitting the same entity category are
/// staggered so the downstream API doesn't reject the batch with 412s.
fn stagger_delays(ctx: &RunContext, calls: &[ToolCall]) -> Vec<u64> {
    let stagger_ms = ctx.config.runtime.write_stagger_ms;
    let mut seen_per_category: HashMap<String, u64> = HashMap::new();
    calls
        .iter()
        .map(|tc| {
            let is_write = ctx.tracked.is_write_tool(&tc.tool_name)
                || tools::is_builtin_write_tool(&tc.tool_name);
            if !is_write {
                return 0;
            }
            let category = extract_entity_type(&tc.tool_name)
                .unwrap_or(&tc.tool_name)
                .to_string();
            let position = seen_per_category.entry(category).or_insert(0);
            let delay = *position * stagger_ms;
            *position += 1;
            delay
        })
        .collect()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// The loop
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn drive_agent(ctx: &RunContext, meta: &ChatMeta, input: &MessageInput) -> DoneEvent {
    let document_paths = save_documents(ctx, &input.documents).await;

    // Restore memory from the persisted transcript and add the new turn.
    let stored = match ctx.chats.read_steps(&ctx.chat_id).await {
        Ok(lines) => lines,
        Err(e) => {
            tracing::warn!(error = %e, "transcript load failed, starting fresh");
            Vec::new()
        }
    };
    let mut memory = AgentMemory::from_stored(&stored);
    memory.add_task(build_user_parts(input, &document_paths));

    preload_categories(ctx, &input.content).await;

    let system_prompt = prompts::compose(
        input.mode,
        input.persona,
        &ctx.skills,
        input.platform_url.as_deref(),
    );

    let max_steps = ctx.config.runtime.max_steps;
    let mut step_number: u32 = 0;

    'outer: while step_number < max_steps {
        if ctx.cancel.is_cancelled() {
            break;
        }
        step_number += 1;

        let req = ChatRequest {
            system: system_prompt.clone(),
            messages: memory.write_to_messages(),
            tools: tools::definitions(ctx),
            max_tokens: None,
            thinking_budget: None,
            model: None,
            cache: true,
        };

        let mut stream = match ctx.provider.chat_stream(req).await {
            Ok(s) => s,
            Err(e) => {
                ctx.send_event(AgentEvent::Step(StepEvent::error(
                    step_number,
                    format!("model call failed: {e}"),
                )))
                .await;
                break;
            }
        };

        // ── Consume the stream ─────────────────────────────────────
        let mut thinking_buf = String::new();
        let mut thinking_blocks: Vec<ThinkingBlock> = Vec::new();
        let mut text_buf = String::new();
        let mut pending: Vec<ToolCall> = Vec::new();
        // call_id -> (name, partial args) for providers without a
        // finished event.
        let mut tc_bufs: HashMap<String, (String, String)> = HashMap::new();

        while let Some(event) = stream.next().await {
            if ctx.cancel.is_cancelled() {
                break 'outer;
            }
            match event {
                Ok(StreamEvent::Thinking { text }) => {
                    thinking_buf.push_str(&text);
                    ctx.send_event(AgentEvent::Step(StepEvent::thinking(
                        step_number,
                        thinking_buf.clone(),
                    )))
                    .await;
                }
                Ok(StreamEvent::ThinkingFinished {
                    thinking,
                    signature,
                }) => {
                    thinking_blocks.push(ThinkingBlock {
                        thinking,
                        signature,
                    });
                }
                Ok(StreamEvent::Token { text }) => {
                    text_buf.push_str(&text);
                    ctx.send_event(AgentEvent::Step(StepEvent::intermediate(
                        step_number,
                        text_buf.clone(),
                    )))
                    .await;
                }
                Ok(StreamEvent::ToolCallStarted { call_id, tool_name }) => {
                    tc_bufs.insert(call_id, (tool_name, String::new()));
                }
                Ok(StreamEvent::ToolCallDelta { call_id, delta }) => {
                    if let Some((_, args)) = tc_bufs.get_mut(&call_id) {
                        args.push_str(&delta);
                    }
                }
                Ok(StreamEvent::ToolCallFinished {
                    call_id,
                    tool_name,
                    arguments,
                }) => {
                    tc_bufs.remove(&call_id);
                    pending.push(ToolCall {
                        call_id,
                        tool_name,
                        arguments,
                    });
                }
                Ok(StreamEvent::Done { usage, .. }) => {
                    if let Some(usage) = usage {
                        ctx.ledger.record(MAIN_AGENT_SOURCE, &usage);
                    }
                }
                Ok(StreamEvent::Error { message }) => {
                    ctx.send_event(AgentEvent::Step(StepEvent::error(step_number, message)))
                        .await;
                    break 'outer;
                }
                Err(e) => {
                    ctx.send_event(AgentEvent::Step(StepEvent::error(
                        step_number,
                        format!("model stream failed: {e}"),
                    )))
                    .await;
                    break 'outer;
                }
            }
        }

        // Assemble calls that only came through start/delta.
        for (call_id, (name, args_str)) in tc_bufs.drain() {
            let arguments = if args_str.trim().is_empty() {
                Value::Object(Default::default())
            } else {
                serde_json::from_str(&args_str).unwrap_or_else(|e| {
                    tracing::warn!(call_id = %call_id, error = %e, "malformed tool arguments");
                    Value::Object(Default::default())
                })
            };
            pending.push(ToolCall {
                call_id,
                tool_name: name,
                arguments,
            });
        }

        // ── Final answer: no tool calls ────────────────────────────
        if pending.is_empty() {
            memory.add_step(MemoryStep {
                step_number,
                text: Some(text_buf.clone()),
                tool_calls: Vec::new(),
                tool_results: Vec::new(),
                thinking: thinking_blocks,
                input_tokens: 0,
                output_tokens: 0,
            });
            ctx.send_event(AgentEvent::Step(StepEvent::final_answer(
                step_number,
                text_buf,
            )))
            .await;
            break;
        }

        // ── Read-only hard stop on write intent ────────────────────
        if ctx.mode.is_read_only() {
            if let Some(write_call) = pending.iter().find(|tc| {
                ctx.tracked.is_write_tool(&tc.tool_name)
                    || tools::is_builtin_write_tool(&tc.tool_name)
            }) {
                ctx.send_event(AgentEvent::Step(StepEvent::error(
                    step_number,
                    format!(
                        "This chat is in read-only mode, so '{}' was not executed. \
                         Switch the chat to read-write mode to apply changes.",
                        write_call.tool_name
                    ),
                )))
                .await;
                break;
            }
        }

        // ── Parallel tool dispatch ─────────────────────────────────
        let total = pending.len() as u32;
        for (idx, tc) in pending.iter().enumerate() {
            ctx.send_event(AgentEvent::Step(StepEvent::tool_start(
                step_number,
                tools::display_tool_name(&tc.tool_name, &tc.arguments),
                tc.arguments.clone(),
                (idx as u32 + 1, total),
                tc.call_id.clone(),
            )))
            .await;
        }

        let delays = stagger_delays(ctx, &pending);
        let mut in_flight: FuturesUnordered<_> = pending
            .iter()
            .enumerate()
            .map(|(idx, tc)| {
                let delay = delays[idx];
                async move {
                    if delay > 0 {
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                    }
                    let (content, is_error) =
                        tools::dispatch_tool(ctx, &tc.tool_name, &tc.arguments).await;
                    (idx, content, is_error)
                }
            })
            .collect();

        // Results stream to the client in completion order...
        let mut results: Vec<Option<(String, bool)>> = vec![None; pending.len()];
        while let Some((idx, content, is_error)) = in_flight.next().await {
            let tc = &pending[idx];
            ctx.send_event(AgentEvent::Step(StepEvent::tool_result(
                step_number,
                tools::display_tool_name(&tc.tool_name, &tc.arguments),
                content.clone(),
                is_error,
                tc.call_id.clone(),
            )))
            .await;
            results[idx] = Some((content, is_error));
        }
        drop(in_flight);

        if ctx.cancel.is_cancelled() {
            break;
        }

        // ...and fold into memory in input order.
        let tool_results: Vec<ToolResultRecord> = pending
            .iter()
            .zip(results)
            .map(|(tc, result)| {
                let (content, is_error) =
                    result.unwrap_or_else(|| ("tool dispatch was dropped".into(), true));
                ToolResultRecord {
                    tool_call_id: tc.call_id.clone(),
                    name: tc.tool_name.clone(),
                    content,
                    is_error,
                }
            })
            .collect();

        memory.add_step(MemoryStep {
            step_number,
            text: if text_buf.is_empty() {
                None
            } else {
                Some(text_buf)
            },
            tool_calls: pending,
            tool_results,
            thinking: thinking_blocks,
            input_tokens: 0,
            output_tokens: 0,
        });

        if step_number == max_steps {
            ctx.send_event(AgentEvent::Step(StepEvent::error(
                step_number,
                format!("iteration limit reached ({max_steps} steps)"),
            )))
            .await;
        }
    }

    finalize_run(ctx, meta, input, &mut memory, step_number).await
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Finalization
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn format_commit_summary(commit: &clerk_history::ConfigCommit) -> String {
    let mut lines = vec![format!("✓ {} — {}", commit.hash, commit.message)];
    for change in &commit.changes {
        let icon = match change.operation {
            clerk_history::Operation::Create => "+",
            clerk_history::Operation::Update => "~",
            clerk_history::Operation::Delete => "-",
        };
        let name = change.entity_name.as_deref().unwrap_or(&change.entity_id);
        lines.push(format!("  [{icon}] {} \"{name}\"", change.entity_type));
    }
    lines.join("\n")
}

async fn finalize_run(
    ctx: &RunContext,
    meta: &ChatMeta,
    input: &MessageInput,
    memory: &mut AgentMemory,
    step_number: u32,
) -> DoneEvent {
    let cancelled = ctx.cancel.is_cancelled();
    let mut commit = None;

    if !cancelled {
        // A run that ends with tracked writes becomes one commit.
        match tools::flush_pending_commit(ctx).await {
            Ok(created) => commit = created,
            Err(e) => tracing::warn!(error = %e, "commit creation failed"),
        }

        if let Some(commit) = &commit {
            ctx.send_event(AgentEvent::Step(StepEvent::final_answer(
                step_number + 1,
                format_commit_summary(commit),
            )))
            .await;
        }

        // Persist the folded transcript and updated chat metadata.
        if let Err(e) = ctx
            .chats
            .replace_steps(&ctx.chat_id, &memory.to_stored())
            .await
        {
            tracing::warn!(error = %e, "transcript persist failed");
        }
        let mut meta = meta.clone();
        meta.note_message(&input.content);
        meta.mode = input.mode;
        meta.persona = input.persona;
        if let Err(e) = ctx.chats.save(&meta).await {
            tracing::warn!(error = %e, "chat metadata persist failed");
        }

        ctx.registry
            .set_last_memory(&ctx.chat_id, ctx.run_id, memory.clone());
    } else {
        tracing::info!(chat_id = %ctx.chat_id, "run cancelled, skipping persistence and commit");
    }

    let totals = ctx.ledger.totals();
    DoneEvent {
        total_steps: step_number,
        input_tokens: totals.input_tokens,
        output_tokens: totals.output_tokens,
        cache_creation_input_tokens: totals.cache_creation_input_tokens,
        cache_read_input_tokens: totals.cache_read_input_tokens,
        token_usage_breakdown: ctx.ledger.breakdown(),
        config_commit_hash: commit.as_ref().map(|c| c.hash.clone()),
        config_commit_message: commit.as_ref().map(|c| c.message.clone()),
        config_changes_count: commit.as_ref().map(|c| c.changes.len() as u32).unwrap_or(0),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    use parking_lot::Mutex;

    use clerk_domain::config::Config;
    use clerk_domain::stream::{BoxStream, Usage};
    use clerk_providers::{ChatResponse, LlmProvider};
    use clerk_store::kv::MemoryKv;
    use clerk_store::ChatStore;

    use crate::knowledge::KnowledgeBase;
    use crate::runtime::events::StepType;
    use crate::runtime::registry::ChatRegistry;
    use crate::runtime::tracking::Downstream;
    use crate::skills::SkillsRegistry;
    use clerk_history::{CommitStore, SnapshotStore};

    // ── Scripted provider ─────────────────────────────────────────

    struct ScriptedProvider {
        turns: Mutex<VecDeque<Vec<StreamEvent>>>,
    }

    impl ScriptedProvider {
        fn new(turns: Vec<Vec<StreamEvent>>) -> Self {
            Self {
                turns: Mutex::new(turns.into()),
            }
        }
    }

    #[async_trait::async_trait]
    impl LlmProvider for ScriptedProvider {
        async fn chat(&self, _req: ChatRequest) -> clerk_domain::Result<ChatResponse> {
            Ok(ChatResponse {
                content: "scripted commit message".into(),
                tool_calls: Vec::new(),
                usage: None,
                finish_reason: Some("stop".into()),
            })
        }

        async fn chat_stream(
            &self,
            _req: ChatRequest,
        ) -> clerk_domain::Result<BoxStream<'static, clerk_domain::Result<StreamEvent>>> {
            let turn = self.turns.lock().pop_front().unwrap_or_else(|| {
                vec![
                    StreamEvent::Token {
                        text: "out of script".into(),
                    },
                    StreamEvent::Done {
                        usage: None,
                        finish_reason: Some("stop".into()),
                    },
                ]
            });
            Ok(Box::pin(futures_util::stream::iter(
                turn.into_iter().map(Ok),
            )))
        }

        fn provider_id(&self) -> &str {
            "scripted"
        }
    }

    // ── Scripted downstream ───────────────────────────────────────

    struct FakePlatform {
        calls: Mutex<Vec<String>>,
    }

    impl FakePlatform {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
            }
        }

        fn call_names(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    #[async_trait::async_trait]
    impl Downstream for FakePlatform {
        async fn call_tool(
            &self,
            name: &str,
            _arguments: Value,
        ) -> clerk_domain::Result<Value> {
            self.calls.lock().push(name.to_string());
            if name.starts_with("get_") {
                return Ok(serde_json::json!({"id": 7, "name": "Invoices", "state": "a"}));
            }
            Ok(serde_json::json!({"id": 7, "state": "b"}))
        }
    }

    // ── Harness ───────────────────────────────────────────────────

    struct Harness {
        ctx: RunContext,
        rx: mpsc::Receiver<AgentEvent>,
        meta: ChatMeta,
        input: MessageInput,
        platform: Arc<FakePlatform>,
        _handle: RunHandle,
    }

    async fn harness(
        mode: Mode,
        turns: Vec<Vec<StreamEvent>>,
        write_tools: &[&str],
    ) -> Harness {
        let config = Arc::new(Config::default());
        let kv: Arc<MemoryKv> = Arc::new(MemoryKv::new());
        let chats = Arc::new(ChatStore::new(kv.clone(), 3600));
        let commits = Arc::new(CommitStore::new(kv.clone()));
        let snapshots = Arc::new(SnapshotStore::new(kv.clone()));
        let registry = Arc::new(ChatRegistry::new(Duration::from_millis(100)));
        let provider: Arc<dyn LlmProvider> = Arc::new(ScriptedProvider::new(turns));
        let platform = Arc::new(FakePlatform::new());

        let meta = chats.create(mode, Persona::Default).await.unwrap();
        let out_dir = std::env::temp_dir().join(format!("clerk-test-{}", meta.chat_id));
        tokio::fs::create_dir_all(&out_dir).await.unwrap();
        let handle = registry.start_run(&meta.chat_id, out_dir).await;

        let tracked = Arc::new(TrackedConnection::new(
            platform.clone(),
            &meta.chat_id,
            kv.clone(),
            write_tools.iter().map(|s| s.to_string()).collect(),
            handle.cancel.clone(),
            3,
        ));

        let (tx, rx) = mpsc::channel(64);
        let input = MessageInput {
            chat_id: meta.chat_id.clone(),
            content: "check queue seven".into(),
            images: Vec::new(),
            documents: Vec::new(),
            platform_url: None,
            mode,
            persona: Persona::Default,
            credentials: Credentials {
                token: "t".into(),
                base_url: "https://api.example.com".into(),
            },
        };

        let ctx = RunContext {
            chat_id: meta.chat_id.clone(),
            run_id: handle.run_id,
            mode,
            persona: Persona::Default,
            environment: "https://api.example.com".into(),
            user_request: input.content.clone(),
            config,
            registry: registry.clone(),
            chats,
            commits,
            snapshots,
            provider,
            tracked,
            connection: None,
            events: tx,
            tasks: Arc::new(TaskTracker::new()),
            ledger: Arc::new(TokenLedger::new()),
            dynamic: Arc::new(DynamicTools::default()),
            skills: Arc::new(SkillsRegistry::empty()),
            knowledge: Arc::new(KnowledgeBase::empty()),
            cancel: handle.cancel.clone(),
        };

        Harness {
            ctx,
            rx,
            meta,
            input,
            platform,
            _handle: handle,
        }
    }

    fn tool_call(call_id: &str, name: &str, args: Value) -> StreamEvent {
        StreamEvent::ToolCallFinished {
            call_id: call_id.into(),
            tool_name: name.into(),
            arguments: args,
        }
    }

    fn done_event(input_tokens: u32, output_tokens: u32) -> StreamEvent {
        StreamEvent::Done {
            usage: Some(Usage {
                input_tokens,
                output_tokens,
                cache_creation_input_tokens: 0,
                cache_read_input_tokens: 0,
            }),
            finish_reason: None,
        }
    }

    async fn collect_steps(harness: Harness) -> (Vec<StepEvent>, DoneEvent) {
        let Harness {
            ctx,
            mut rx,
            meta,
            input,
            platform: _platform,
            _handle,
        } = harness;
        let done = drive_agent(&ctx, &meta, &input).await;
        drop(ctx);
        let mut steps = Vec::new();
        while let Some(event) = rx.recv().await {
            if let AgentEvent::Step(step) = event {
                steps.push(step);
            }
        }
        (steps, done)
    }

    // ── Scenarios ─────────────────────────────────────────────────

    #[tokio::test]
    async fn parallel_tool_starts_precede_results() {
        let turns = vec![
            vec![
                tool_call("tc_1", "get_queue", serde_json::json!({"queue_id": 1})),
                tool_call("tc_2", "get_queue", serde_json::json!({"queue_id": 2})),
                done_event(100, 20),
            ],
            vec![
                StreamEvent::Token {
                    text: "Both queues look healthy.".into(),
                },
                done_event(150, 30),
            ],
        ];
        let h = harness(Mode::ReadOnly, turns, &[]).await;
        let (steps, done) = collect_steps(h).await;

        let starts: Vec<usize> = steps
            .iter()
            .enumerate()
            .filter(|(_, s)| s.step_type == StepType::ToolStart)
            .map(|(i, _)| i)
            .collect();
        let results: Vec<usize> = steps
            .iter()
            .enumerate()
            .filter(|(_, s)| s.step_type == StepType::ToolResult)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(starts.len(), 2);
        assert_eq!(results.len(), 2);
        // Both tool_start events appear before either tool_result.
        assert!(starts.iter().max() < results.iter().min());

        // Pairing by tool_call_id: each start has exactly one result.
        for id in ["tc_1", "tc_2"] {
            let paired = steps
                .iter()
                .filter(|s| {
                    s.step_type == StepType::ToolResult
                        && s.tool_call_id.as_deref() == Some(id)
                })
                .count();
            assert_eq!(paired, 1, "expected one result for {id}");
        }

        // Step numbers never decrease.
        let numbers: Vec<u32> = steps.iter().map(|s| s.step_number).collect();
        assert!(numbers.windows(2).all(|w| w[0] <= w[1]));

        let final_answer = steps
            .iter()
            .find(|s| s.step_type == StepType::FinalAnswer)
            .expect("final answer");
        assert!(final_answer.is_final);
        assert_eq!(
            final_answer.content.as_deref(),
            Some("Both queues look healthy.")
        );

        assert_eq!(done.total_steps, 2);
        assert_eq!(done.input_tokens, 250);
        assert_eq!(done.output_tokens, 50);
        assert!(done.config_commit_hash.is_none());
    }

    #[tokio::test]
    async fn read_only_write_intent_stops_before_dispatch() {
        let turns = vec![vec![
            tool_call("tc_w", "update_queue", serde_json::json!({"queue_id": 1})),
            done_event(50, 10),
        ]];
        let h = harness(Mode::ReadOnly, turns, &["update_queue"]).await;
        let platform = h.platform.clone();
        let (steps, done) = collect_steps(h).await;

        let error = steps
            .iter()
            .find(|s| s.step_type == StepType::Error)
            .expect("warning step");
        assert!(error.content.as_deref().unwrap().contains("read-only"));
        assert!(error.is_final);

        // Nothing reached the platform and no commit was produced.
        assert!(platform.call_names().is_empty());
        assert!(done.config_commit_hash.is_none());
        assert_eq!(done.config_changes_count, 0);
    }

    #[tokio::test]
    async fn tracked_write_produces_commit_with_snapshot() {
        let turns = vec![
            vec![
                tool_call("tc_w", "update_queue", serde_json::json!({"queue_id": 7})),
                done_event(80, 15),
            ],
            vec![
                StreamEvent::Token {
                    text: "Renamed the queue.".into(),
                },
                done_event(90, 20),
            ],
        ];
        let h = harness(Mode::ReadWrite, turns, &["update_queue"]).await;
        let commits = h.ctx.commits.clone();
        let snapshots = h.ctx.snapshots.clone();
        let chats = h.ctx.chats.clone();
        let chat_id = h.ctx.chat_id.clone();
        let (steps, done) = collect_steps(h).await;

        let hash = done.config_commit_hash.expect("commit hash");
        assert_eq!(
            done.config_commit_message.as_deref(),
            Some("scripted commit message")
        );
        assert_eq!(done.config_changes_count, 1);

        // The commit summary is surfaced as a trailing final_answer step.
        assert!(steps.iter().any(|s| {
            s.step_type == StepType::FinalAnswer
                && s.content.as_deref().is_some_and(|c| c.contains(&hash))
        }));

        let commit = commits.get_commit(&hash).await.unwrap().expect("commit");
        assert_eq!(commit.changes[0].entity_type, "queue");
        assert_eq!(commit.changes[0].entity_id, "7");

        // Snapshot indexed under (entity_type, entity_id, hash).
        let snap = snapshots
            .get_snapshot("queue", "7", &hash)
            .await
            .unwrap()
            .expect("snapshot");
        assert_eq!(snap["name"], "Invoices");

        // And the chat records the commit hash.
        let hashes = chats.commit_hashes(&chat_id).await.unwrap();
        assert_eq!(hashes, vec![hash]);
    }

    #[tokio::test]
    async fn cancelled_run_skips_persistence_and_commit() {
        let turns = vec![vec![
            tool_call("tc_w", "update_queue", serde_json::json!({"queue_id": 7})),
            done_event(10, 5),
        ]];
        let h = harness(Mode::ReadWrite, turns, &["update_queue"]).await;
        h.ctx.cancel.cancel();
        let chats = h.ctx.chats.clone();
        let chat_id = h.ctx.chat_id.clone();
        let (steps, done) = collect_steps(h).await;

        assert!(steps.is_empty());
        assert_eq!(done.total_steps, 0);
        assert!(done.config_commit_hash.is_none());
        assert!(chats.read_steps(&chat_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn transcript_and_memory_persist_after_success() {
        let turns = vec![vec![
            StreamEvent::Thinking {
                text: "user just wants a summary".into(),
            },
            StreamEvent::ThinkingFinished {
                thinking: "user just wants a summary".into(),
                signature: "sig".into(),
            },
            StreamEvent::Token {
                text: "Here's the summary.".into(),
            },
            done_event(40, 12),
        ]];
        let h = harness(Mode::ReadOnly, turns, &[]).await;
        let chats = h.ctx.chats.clone();
        let registry = h.ctx.registry.clone();
        let chat_id = h.ctx.chat_id.clone();
        let (steps, done) = collect_steps(h).await;

        // Thinking streamed before the final answer.
        assert!(steps.iter().any(|s| s.step_type == StepType::Thinking
            && s.is_streaming));
        assert_eq!(done.total_steps, 1);

        // Transcript holds the task step and the answer step.
        let stored = chats.read_steps(&chat_id).await.unwrap();
        assert_eq!(stored.len(), 2);
        // Thinking never persists.
        assert!(!stored.iter().any(|s| s.contains("sig")));

        // The folded memory is parked in the registry for the chat.
        assert!(registry.pop_last_memory(&chat_id).is_some());

        let meta = chats.get(&chat_id).await.unwrap().unwrap();
        assert_eq!(meta.message_count, 1);
        assert_eq!(meta.preview.as_deref(), Some("check queue seven"));
    }

    #[test]
    fn user_parts_order_images_documents_text() {
        let input = MessageInput {
            chat_id: "c1".into(),
            content: "process this".into(),
            images: vec![ImageAttachment {
                media_type: "image/png".into(),
                data: "aGk=".into(),
            }],
            documents: vec![],
            platform_url: None,
            mode: Mode::ReadOnly,
            persona: Persona::Default,
            credentials: Credentials {
                token: "t".into(),
                base_url: "https://api.example.com".into(),
            },
        };

        let parts = build_user_parts(&input, &["/out/invoice.pdf".to_string()]);
        assert_eq!(parts.len(), 3);
        assert!(matches!(&parts[0], ContentPart::Image { .. }));
        assert!(matches!(&parts[1], ContentPart::Text { text } if text.contains("invoice.pdf")));
        assert!(matches!(&parts[2], ContentPart::Text { text } if text == "process this"));
    }

    #[test]
    fn commit_summary_lists_changes() {
        let commit = clerk_history::ConfigCommit {
            hash: "abc123def456".into(),
            parent: None,
            chat_id: "c1".into(),
            timestamp: chrono::Utc::now(),
            message: "update invoice schema".into(),
            user_request: "add VAT".into(),
            environment: "https://api.example.com".into(),
            changes: vec![clerk_history::EntityChange {
                entity_type: "schema".into(),
                entity_id: "42".into(),
                entity_name: Some("Invoices".into()),
                operation: clerk_history::Operation::Update,
                before: None,
                after: None,
            }],
        };
        let summary = format_commit_summary(&commit);
        assert!(summary.starts_with("✓ abc123def456 — update invoice schema"));
        assert!(summary.contains("[~] schema \"Invoices\""));
    }
}
