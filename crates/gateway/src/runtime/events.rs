//! Event types streamed to clients over SSE.
//!
//! Streaming contract: events of type `thinking` / `intermediate` /
//! `final_answer` may repeat with the same `(step_number, type)` and
//! `is_streaming = true`; later events replace earlier ones and consumers
//! commit the last seen payload when the tuple changes. `tool_result` is
//! emitted exactly once per call with `is_streaming = false`; `error` is
//! terminal. Pair `tool_start` with `tool_result` by `tool_call_id`, falling
//! back to `step_number` for legacy events without one.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use clerk_domain::stream::Usage;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// StepEvent
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Thinking,
    Intermediate,
    ToolStart,
    ToolResult,
    FinalAnswer,
    Error,
}

/// One agent step, serialized as the `step` SSE event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepEvent {
    #[serde(rename = "type")]
    pub step_type: StepType,
    pub step_number: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_arguments: Option<Value>,
    /// (current, total) position within a parallel tool batch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_progress: Option<(u32, u32)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub is_streaming: bool,
    #[serde(default)]
    pub is_final: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl StepEvent {
    fn base(step_type: StepType, step_number: u32) -> Self {
        Self {
            step_type,
            step_number,
            content: None,
            tool_name: None,
            tool_arguments: None,
            tool_progress: None,
            result: None,
            is_error: false,
            is_streaming: false,
            is_final: false,
            tool_call_id: None,
        }
    }

    pub fn thinking(step_number: u32, content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            is_streaming: true,
            ..Self::base(StepType::Thinking, step_number)
        }
    }

    pub fn intermediate(step_number: u32, content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            is_streaming: true,
            ..Self::base(StepType::Intermediate, step_number)
        }
    }

    pub fn tool_start(
        step_number: u32,
        tool_name: impl Into<String>,
        arguments: Value,
        progress: (u32, u32),
        tool_call_id: impl Into<String>,
    ) -> Self {
        Self {
            tool_name: Some(tool_name.into()),
            tool_arguments: Some(arguments),
            tool_progress: Some(progress),
            tool_call_id: Some(tool_call_id.into()),
            is_streaming: true,
            ..Self::base(StepType::ToolStart, step_number)
        }
    }

    pub fn tool_result(
        step_number: u32,
        tool_name: impl Into<String>,
        result: impl Into<String>,
        is_error: bool,
        tool_call_id: impl Into<String>,
    ) -> Self {
        Self {
            tool_name: Some(tool_name.into()),
            result: Some(result.into()),
            is_error,
            tool_call_id: Some(tool_call_id.into()),
            ..Self::base(StepType::ToolResult, step_number)
        }
    }

    pub fn final_answer(step_number: u32, content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            is_final: true,
            ..Self::base(StepType::FinalAnswer, step_number)
        }
    }

    pub fn error(step_number: u32, message: impl Into<String>) -> Self {
        Self {
            content: Some(message.into()),
            is_final: true,
            ..Self::base(StepType::Error, step_number)
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sub-agent / task / file events
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubAgentProgressEvent {
    pub tool_name: String,
    pub iteration: u32,
    pub max_iterations: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_tool: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<String>,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubAgentTextEvent {
    pub tool_name: String,
    pub text: String,
    #[serde(default)]
    pub is_final: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshotEvent {
    pub tasks: Vec<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileCreatedEvent {
    pub filename: String,
    pub url: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Done event
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Terminal event: token usage breakdown plus the committed config-change
/// summary, if any.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DoneEvent {
    pub total_steps: u32,
    pub input_tokens: u32,
    pub output_tokens: u32,
    #[serde(default)]
    pub cache_creation_input_tokens: u32,
    #[serde(default)]
    pub cache_read_input_tokens: u32,
    /// Per-source usage: `main` plus one entry per sub-agent tool.
    #[serde(default)]
    pub token_usage_breakdown: HashMap<String, TokenUsageBySource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_commit_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_commit_message: Option<String>,
    #[serde(default)]
    pub config_changes_count: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsageBySource {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub total_tokens: u32,
    #[serde(default)]
    pub cache_creation_input_tokens: u32,
    #[serde(default)]
    pub cache_read_input_tokens: u32,
}

impl From<&Usage> for TokenUsageBySource {
    fn from(u: &Usage) -> Self {
        Self {
            input_tokens: u.input_tokens,
            output_tokens: u.output_tokens,
            total_tokens: u.total(),
            cache_creation_input_tokens: u.cache_creation_input_tokens,
            cache_read_input_tokens: u.cache_read_input_tokens,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// AgentEvent — what flows over the run channel
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Everything the run worker can emit, mapped 1:1 onto SSE event names.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    Step(StepEvent),
    SubAgentProgress(SubAgentProgressEvent),
    SubAgentText(SubAgentTextEvent),
    TaskSnapshot(TaskSnapshotEvent),
    FileCreated(FileCreatedEvent),
    Done(DoneEvent),
}

impl AgentEvent {
    /// The SSE `event:` name.
    pub fn name(&self) -> &'static str {
        match self {
            AgentEvent::Step(_) => "step",
            AgentEvent::SubAgentProgress(_) => "sub_agent_progress",
            AgentEvent::SubAgentText(_) => "sub_agent_text",
            AgentEvent::TaskSnapshot(_) => "task_snapshot",
            AgentEvent::FileCreated(_) => "file_created",
            AgentEvent::Done(_) => "done",
        }
    }

    /// The SSE `data:` payload (single-line JSON).
    pub fn data(&self) -> String {
        let result = match self {
            AgentEvent::Step(e) => serde_json::to_string(e),
            AgentEvent::SubAgentProgress(e) => serde_json::to_string(e),
            AgentEvent::SubAgentText(e) => serde_json::to_string(e),
            AgentEvent::TaskSnapshot(e) => serde_json::to_string(e),
            AgentEvent::FileCreated(e) => serde_json::to_string(e),
            AgentEvent::Done(e) => serde_json::to_string(e),
        };
        result.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "failed to serialize agent event");
            "{}".into()
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// TokenLedger
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Source name for the main agent loop in the usage breakdown.
pub const MAIN_AGENT_SOURCE: &str = "main";

/// Accumulates token usage per source (main loop + each sub-agent tool).
#[derive(Default)]
pub struct TokenLedger {
    entries: Mutex<HashMap<String, Usage>>,
}

impl TokenLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, source: &str, usage: &Usage) {
        let mut entries = self.entries.lock();
        entries.entry(source.to_owned()).or_default().add(usage);
    }

    /// Usage of the main agent alone.
    pub fn main_usage(&self) -> Usage {
        self.entries
            .lock()
            .get(MAIN_AGENT_SOURCE)
            .cloned()
            .unwrap_or_default()
    }

    /// Sum across all sources.
    pub fn totals(&self) -> Usage {
        let entries = self.entries.lock();
        let mut total = Usage::default();
        for usage in entries.values() {
            total.add(usage);
        }
        total
    }

    pub fn breakdown(&self) -> HashMap<String, TokenUsageBySource> {
        self.entries
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), TokenUsageBySource::from(v)))
            .collect()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_event_serde_round_trip() {
        let event = StepEvent::tool_start(
            3,
            "get_queue",
            serde_json::json!({"queue_id": 42}),
            (1, 2),
            "tc_abc",
        );
        let json = serde_json::to_string(&event).unwrap();
        let back: StepEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.step_type, StepType::ToolStart);
        assert_eq!(back.step_number, 3);
        assert_eq!(back.tool_progress, Some((1, 2)));
        assert_eq!(back.tool_call_id.as_deref(), Some("tc_abc"));
        assert!(back.is_streaming);
    }

    #[test]
    fn step_type_uses_snake_case_tags() {
        let event = StepEvent::final_answer(5, "done");
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"final_answer\""));
        assert!(json.contains("\"is_final\":true"));
    }

    #[test]
    fn error_steps_are_final() {
        let event = StepEvent::error(1, "boom");
        assert!(event.is_final);
        assert!(!event.is_streaming);
    }

    #[test]
    fn tool_result_is_not_streaming() {
        let event = StepEvent::tool_result(2, "get_queue", "{}", false, "tc_1");
        assert!(!event.is_streaming);
        assert!(!event.is_final);
    }

    #[test]
    fn agent_event_names_match_taxonomy() {
        assert_eq!(AgentEvent::Step(StepEvent::error(0, "x")).name(), "step");
        assert_eq!(AgentEvent::Done(DoneEvent::default()).name(), "done");
        assert_eq!(
            AgentEvent::TaskSnapshot(TaskSnapshotEvent { tasks: vec![] }).name(),
            "task_snapshot"
        );
    }

    #[test]
    fn done_event_round_trip() {
        let mut breakdown = HashMap::new();
        breakdown.insert(
            "main".to_string(),
            TokenUsageBySource {
                input_tokens: 100,
                output_tokens: 50,
                total_tokens: 150,
                cache_creation_input_tokens: 10,
                cache_read_input_tokens: 90,
            },
        );
        let done = DoneEvent {
            total_steps: 4,
            input_tokens: 100,
            output_tokens: 50,
            cache_creation_input_tokens: 10,
            cache_read_input_tokens: 90,
            token_usage_breakdown: breakdown,
            config_commit_hash: Some("abc123def456".into()),
            config_commit_message: Some("update schema".into()),
            config_changes_count: 2,
        };
        let json = serde_json::to_string(&done).unwrap();
        let back: DoneEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.config_commit_hash.as_deref(), Some("abc123def456"));
        assert_eq!(back.token_usage_breakdown["main"].total_tokens, 150);
    }

    #[test]
    fn ledger_accumulates_per_source() {
        let ledger = TokenLedger::new();
        let usage = Usage {
            input_tokens: 10,
            output_tokens: 5,
            cache_creation_input_tokens: 0,
            cache_read_input_tokens: 0,
        };
        ledger.record(MAIN_AGENT_SOURCE, &usage);
        ledger.record(MAIN_AGENT_SOURCE, &usage);
        ledger.record("search_knowledge_base", &usage);

        assert_eq!(ledger.main_usage().input_tokens, 20);
        assert_eq!(ledger.totals().input_tokens, 30);
        let breakdown = ledger.breakdown();
        assert_eq!(breakdown.len(), 2);
        assert_eq!(breakdown["search_knowledge_base"].total_tokens, 15);
    }
}
