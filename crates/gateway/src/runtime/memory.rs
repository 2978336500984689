//! Agent memory — structured steps folded into provider messages.
//!
//! The transcript is stored as structured steps, not raw messages, and the
//! prompt is rebuilt fresh on every iteration:
//! - thinking blocks are kept for steps produced in the current run (the
//!   provider needs them to continue a tool-use turn) but are not serialized,
//!   so they never replay across turns;
//! - repeated results of collapsible tools are summarized — only the most
//!   recent result is sent in full;
//! - images ride along in task steps for the whole conversation;
//! - a final assistant text with no tool calls becomes the answer anchor.

use serde::{Deserialize, Serialize};

use clerk_domain::tool::{ContentPart, Message, ToolCall};

/// Tools whose repeated results are collapsed to a one-line descriptor.
const COLLAPSIBLE_TOOLS: &[&str] = &["patch_schema"];

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Steps
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A thinking block captured during the current run. Not persisted.
#[derive(Debug, Clone)]
pub struct ThinkingBlock {
    pub thinking: String,
    pub signature: String,
}

/// The result of one tool call, as stored in memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResultRecord {
    pub tool_call_id: String,
    pub name: String,
    pub content: String,
    #[serde(default)]
    pub is_error: bool,
}

/// The initial user turn (text plus optional images / document references).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStep {
    pub task: Vec<ContentPart>,
}

/// One completed agent iteration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryStep {
    pub step_number: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default)]
    pub tool_results: Vec<ToolResultRecord>,
    /// In-turn chain-of-thought; intentionally skipped by serde so thinking
    /// is never replayed across turns.
    #[serde(skip)]
    pub thinking: Vec<ThinkingBlock>,
    #[serde(default)]
    pub input_tokens: u32,
    #[serde(default)]
    pub output_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Step {
    #[serde(rename = "task_step")]
    Task(TaskStep),
    #[serde(rename = "memory_step")]
    Memory(MemoryStep),
}

impl Step {
    fn to_messages(&self) -> Vec<Message> {
        match self {
            Step::Task(task) => vec![Message::user_parts(task.task.clone())],
            Step::Memory(step) => step.to_messages(),
        }
    }
}

impl MemoryStep {
    fn to_messages(&self) -> Vec<Message> {
        let mut messages = Vec::new();

        if !self.tool_calls.is_empty() {
            let mut parts: Vec<ContentPart> = self
                .thinking
                .iter()
                .map(|tb| ContentPart::Thinking {
                    thinking: tb.thinking.clone(),
                    signature: tb.signature.clone(),
                })
                .collect();

            if let Some(text) = &self.text {
                if !text.is_empty() {
                    parts.push(ContentPart::Text { text: text.clone() });
                }
            }

            parts.extend(self.tool_calls.iter().map(|tc| ContentPart::ToolUse {
                id: tc.call_id.clone(),
                name: tc.tool_name.clone(),
                input: tc.arguments.clone(),
            }));

            messages.push(Message::assistant_parts(parts));

            if !self.tool_results.is_empty() {
                let result_parts = self
                    .tool_results
                    .iter()
                    .map(|tr| ContentPart::ToolResult {
                        tool_use_id: tr.tool_call_id.clone(),
                        content: tr.content.clone(),
                        is_error: tr.is_error,
                    })
                    .collect();
                messages.push(Message::tool_results(result_parts));
            }
        } else if let Some(text) = &self.text {
            if !text.is_empty() {
                messages.push(Message::assistant(text.clone()));
            }
        }

        messages
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// AgentMemory
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Default)]
pub struct AgentMemory {
    pub steps: Vec<Step>,
}

impl AgentMemory {
    pub fn add_task(&mut self, task: Vec<ContentPart>) {
        self.steps.push(Step::Task(TaskStep { task }));
    }

    pub fn add_step(&mut self, step: MemoryStep) {
        self.steps.push(Step::Memory(step));
    }

    /// Fold all steps into provider messages, collapsing stale results of
    /// collapsible tools.
    pub fn write_to_messages(&self) -> Vec<Message> {
        let mut messages: Vec<Message> =
            self.steps.iter().flat_map(|s| s.to_messages()).collect();
        collapse_tool_results(&mut messages);
        messages
    }

    /// Serialize every step for persistence (thinking is dropped by serde).
    pub fn to_stored(&self) -> Vec<String> {
        self.steps
            .iter()
            .filter_map(|step| match serde_json::to_string(step) {
                Ok(json) => Some(json),
                Err(e) => {
                    tracing::warn!(error = %e, "failed to serialize memory step");
                    None
                }
            })
            .collect()
    }

    /// Restore memory from persisted step lines, skipping malformed entries.
    pub fn from_stored(lines: &[String]) -> Self {
        let steps = lines
            .iter()
            .filter_map(|line| match serde_json::from_str::<Step>(line) {
                Ok(step) => Some(step),
                Err(e) => {
                    tracing::warn!(error = %e, "skipping malformed memory step");
                    None
                }
            })
            .collect();
        Self { steps }
    }

    /// The last assistant text with no tool calls, if the conversation
    /// currently ends on one.
    pub fn final_answer_anchor(&self) -> Option<&str> {
        match self.steps.last() {
            Some(Step::Memory(step)) if step.tool_calls.is_empty() => step.text.as_deref(),
            _ => None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Collapse
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Replace earlier tool_result contents of collapsible tools with a short
/// descriptor; only the latest result per tool is kept in full.
fn collapse_tool_results(messages: &mut [Message]) {
    use clerk_domain::tool::MessageContent;

    // tool_use_id -> tool name, for collapsible tools only.
    let mut id_to_name: std::collections::HashMap<String, String> = Default::default();
    for msg in messages.iter() {
        if let MessageContent::Parts(parts) = &msg.content {
            for part in parts {
                if let ContentPart::ToolUse { id, name, .. } = part {
                    if COLLAPSIBLE_TOOLS.contains(&name.as_str()) {
                        id_to_name.insert(id.clone(), name.clone());
                    }
                }
            }
        }
    }
    if id_to_name.is_empty() {
        return;
    }

    // Positions of collapsible results: (msg_idx, part_idx, tool name).
    let mut positions: Vec<(usize, usize, String)> = Vec::new();
    for (msg_idx, msg) in messages.iter().enumerate() {
        if let MessageContent::Parts(parts) = &msg.content {
            for (part_idx, part) in parts.iter().enumerate() {
                if let ContentPart::ToolResult { tool_use_id, .. } = part {
                    if let Some(name) = id_to_name.get(tool_use_id) {
                        positions.push((msg_idx, part_idx, name.clone()));
                    }
                }
            }
        }
    }
    if positions.len() <= 1 {
        return;
    }

    // Keep the last occurrence per tool name, collapse the rest.
    let mut last_per_tool: std::collections::HashMap<&str, usize> = Default::default();
    for (idx, (_, _, name)) in positions.iter().enumerate() {
        last_per_tool.insert(name.as_str(), idx);
    }
    let keep: std::collections::HashSet<usize> = last_per_tool.into_values().collect();

    for (pos_idx, (msg_idx, part_idx, name)) in positions.iter().enumerate() {
        if keep.contains(&pos_idx) {
            continue;
        }
        if let MessageContent::Parts(parts) = &mut messages[*msg_idx].content {
            if let ContentPart::ToolResult { content, .. } = &mut parts[*part_idx] {
                *content = format!("[Result collapsed — superseded by later {name} call]");
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use clerk_domain::tool::{MessageContent, Role};

    fn patch_step(step_number: u32, call_id: &str, result: &str) -> MemoryStep {
        MemoryStep {
            step_number,
            text: Some("patching".into()),
            tool_calls: vec![ToolCall {
                call_id: call_id.into(),
                tool_name: "patch_schema".into(),
                arguments: serde_json::json!({"schema_id": 1}),
            }],
            tool_results: vec![ToolResultRecord {
                tool_call_id: call_id.into(),
                name: "patch_schema".into(),
                content: result.into(),
                is_error: false,
            }],
            thinking: Vec::new(),
            input_tokens: 0,
            output_tokens: 0,
        }
    }

    fn result_contents(messages: &[Message]) -> Vec<String> {
        messages
            .iter()
            .filter_map(|m| match &m.content {
                MessageContent::Parts(parts) => Some(parts),
                _ => None,
            })
            .flatten()
            .filter_map(|p| match p {
                ContentPart::ToolResult { content, .. } => Some(content.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn earlier_collapsible_results_are_summarized() {
        let mut memory = AgentMemory::default();
        memory.add_task(vec![ContentPart::Text {
            text: "patch the schema twice".into(),
        }]);
        memory.add_step(patch_step(1, "tc_1", "full result one"));
        memory.add_step(patch_step(2, "tc_2", "full result two"));
        memory.add_step(patch_step(3, "tc_3", "full result three"));

        let messages = memory.write_to_messages();
        let results = result_contents(&messages);
        assert_eq!(results.len(), 3);
        assert!(results[0].contains("collapsed"));
        assert!(results[1].contains("collapsed"));
        assert_eq!(results[2], "full result three");
    }

    #[test]
    fn non_collapsible_results_stay_full() {
        let mut memory = AgentMemory::default();
        memory.add_task(vec![ContentPart::Text {
            text: "look at two queues".into(),
        }]);
        for (i, id) in ["tc_1", "tc_2"].iter().enumerate() {
            memory.add_step(MemoryStep {
                step_number: i as u32 + 1,
                text: None,
                tool_calls: vec![ToolCall {
                    call_id: (*id).into(),
                    tool_name: "get_queue".into(),
                    arguments: serde_json::json!({}),
                }],
                tool_results: vec![ToolResultRecord {
                    tool_call_id: (*id).into(),
                    name: "get_queue".into(),
                    content: format!("queue {i}"),
                    is_error: false,
                }],
                thinking: Vec::new(),
                input_tokens: 0,
                output_tokens: 0,
            });
        }

        let results = result_contents(&memory.write_to_messages());
        assert_eq!(results, vec!["queue 0", "queue 1"]);
    }

    #[test]
    fn thinking_blocks_fold_in_turn_but_do_not_persist() {
        let mut step = patch_step(1, "tc_1", "ok");
        step.thinking = vec![ThinkingBlock {
            thinking: "consider the schema".into(),
            signature: "sig".into(),
        }];

        let mut memory = AgentMemory::default();
        memory.add_task(vec![ContentPart::Text { text: "go".into() }]);
        memory.add_step(step);

        // In-turn fold includes the thinking part.
        let messages = memory.write_to_messages();
        let has_thinking = messages.iter().any(|m| {
            matches!(&m.content, MessageContent::Parts(parts)
                if parts.iter().any(|p| matches!(p, ContentPart::Thinking { .. })))
        });
        assert!(has_thinking);

        // Persist + restore drops it.
        let restored = AgentMemory::from_stored(&memory.to_stored());
        let messages = restored.write_to_messages();
        let has_thinking = messages.iter().any(|m| {
            matches!(&m.content, MessageContent::Parts(parts)
                if parts.iter().any(|p| matches!(p, ContentPart::Thinking { .. })))
        });
        assert!(!has_thinking);
        // Tool calls and results survive.
        assert_eq!(result_contents(&messages), vec!["ok"]);
    }

    #[test]
    fn images_survive_persistence() {
        let mut memory = AgentMemory::default();
        memory.add_task(vec![
            ContentPart::Image {
                media_type: "image/png".into(),
                data: "aGVsbG8=".into(),
            },
            ContentPart::Text {
                text: "what's in this screenshot".into(),
            },
        ]);

        let restored = AgentMemory::from_stored(&memory.to_stored());
        let messages = restored.write_to_messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, Role::User);
        let MessageContent::Parts(parts) = &messages[0].content else {
            panic!("expected parts");
        };
        assert!(matches!(&parts[0], ContentPart::Image { media_type, .. } if media_type == "image/png"));
    }

    #[test]
    fn final_answer_anchor() {
        let mut memory = AgentMemory::default();
        memory.add_task(vec![ContentPart::Text { text: "hi".into() }]);
        assert!(memory.final_answer_anchor().is_none());

        memory.add_step(MemoryStep {
            step_number: 1,
            text: Some("the answer".into()),
            ..Default::default()
        });
        assert_eq!(memory.final_answer_anchor(), Some("the answer"));
    }

    #[test]
    fn malformed_stored_lines_are_skipped() {
        let lines = vec![
            "not json".to_string(),
            r#"{"type":"memory_step","step_number":1,"text":"kept"}"#.to_string(),
        ];
        let memory = AgentMemory::from_stored(&lines);
        assert_eq!(memory.steps.len(), 1);
    }
}
