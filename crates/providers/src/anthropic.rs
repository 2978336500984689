//! Anthropic Messages API adapter.
//!
//! Implements streaming with interleaved thinking/text/tool-use blocks,
//! prompt caching via `cache_control` breakpoints, and the Anthropic message
//! structure where the system prompt goes in a separate top-level field.

use serde_json::Value;

use clerk_domain::config::LlmConfig;
use clerk_domain::error::{Error, Result};
use clerk_domain::stream::{BoxStream, StreamEvent, Usage};
use clerk_domain::tool::{ContentPart, Message, MessageContent, Role, ToolCall, ToolDefinition};

use crate::sse::sse_response_stream;
use crate::traits::{ChatRequest, ChatResponse, LlmProvider};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Constants
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const ANTHROPIC_VERSION: &str = "2023-06-01";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter struct
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// An LLM provider adapter for the Anthropic Messages API.
pub struct AnthropicProvider {
    id: String,
    base_url: String,
    api_key: String,
    default_model: String,
    max_output_tokens: u32,
    thinking_budget: u32,
    client: reqwest::Client,
}

impl AnthropicProvider {
    /// Create a new provider from config, resolving the API key from the
    /// configured environment variable.
    pub fn from_config(cfg: &LlmConfig) -> Result<Self> {
        let api_key = std::env::var(&cfg.api_key_env).map_err(|_| {
            Error::Config(format!(
                "LLM API key not found in environment variable {}",
                cfg.api_key_env
            ))
        })?;

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(cfg.request_timeout_secs))
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;

        Ok(Self {
            id: "anthropic".into(),
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key,
            default_model: cfg.model.clone(),
            max_output_tokens: cfg.max_output_tokens,
            thinking_budget: cfg.thinking_budget_tokens,
            client,
        })
    }

    // ── Internal helpers ───────────────────────────────────────────

    fn authed_post(&self, url: &str) -> reqwest::RequestBuilder {
        self.client
            .post(url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
    }

    fn build_messages_body(&self, req: &ChatRequest, stream: bool) -> Value {
        let model = req
            .model
            .clone()
            .unwrap_or_else(|| self.default_model.clone());

        let mut api_messages: Vec<Value> = req.messages.iter().map(message_to_anthropic).collect();

        // Cache breakpoint on the last content block of the last message so
        // the conversation prefix is reusable on the next iteration.
        if req.cache {
            if let Some(last) = api_messages.last_mut() {
                mark_last_block_cacheable(last);
            }
        }

        let mut body = serde_json::json!({
            "model": model,
            "messages": api_messages,
            "stream": stream,
            "max_tokens": req.max_tokens.unwrap_or(self.max_output_tokens),
        });

        if !req.system.is_empty() {
            body["system"] = if req.cache {
                serde_json::json!([{
                    "type": "text",
                    "text": req.system,
                    "cache_control": { "type": "ephemeral" },
                }])
            } else {
                Value::String(req.system.clone())
            };
        }

        if !req.tools.is_empty() {
            let mut tools: Vec<Value> = req.tools.iter().map(tool_to_anthropic).collect();
            if req.cache {
                if let Some(last) = tools.last_mut() {
                    last["cache_control"] = serde_json::json!({ "type": "ephemeral" });
                }
            }
            body["tools"] = Value::Array(tools);
        }

        let budget = req.thinking_budget.unwrap_or(self.thinking_budget);
        if budget > 0 {
            body["thinking"] = serde_json::json!({
                "type": "enabled",
                "budget_tokens": budget,
            });
        }

        body
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Message serialization helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn message_to_anthropic(msg: &Message) -> Value {
    let role = match msg.role {
        Role::User => "user",
        Role::Assistant => "assistant",
    };
    match &msg.content {
        MessageContent::Text(t) => serde_json::json!({
            "role": role,
            "content": t,
        }),
        MessageContent::Parts(parts) => {
            let content: Vec<Value> = parts.iter().map(part_to_anthropic).collect();
            serde_json::json!({
                "role": role,
                "content": content,
            })
        }
    }
}

fn part_to_anthropic(part: &ContentPart) -> Value {
    match part {
        ContentPart::Text { text } => serde_json::json!({
            "type": "text",
            "text": text,
        }),
        ContentPart::Thinking {
            thinking,
            signature,
        } => serde_json::json!({
            "type": "thinking",
            "thinking": thinking,
            "signature": signature,
        }),
        ContentPart::ToolUse { id, name, input } => serde_json::json!({
            "type": "tool_use",
            "id": id,
            "name": name,
            "input": input,
        }),
        ContentPart::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => serde_json::json!({
            "type": "tool_result",
            "tool_use_id": tool_use_id,
            "content": content,
            "is_error": is_error,
        }),
        ContentPart::Image { media_type, data } => serde_json::json!({
            "type": "image",
            "source": {
                "type": "base64",
                "media_type": media_type,
                "data": data,
            }
        }),
    }
}

fn tool_to_anthropic(tool: &ToolDefinition) -> Value {
    serde_json::json!({
        "name": tool.name,
        "description": tool.description,
        "input_schema": tool.parameters,
    })
}

fn mark_last_block_cacheable(message: &mut Value) {
    match message.get_mut("content") {
        Some(Value::Array(blocks)) => {
            if let Some(last) = blocks.last_mut() {
                last["cache_control"] = serde_json::json!({ "type": "ephemeral" });
            }
        }
        Some(Value::String(text)) => {
            // String content can't carry cache_control; promote to a block.
            let block = serde_json::json!([{
                "type": "text",
                "text": text,
                "cache_control": { "type": "ephemeral" },
            }]);
            message["content"] = block;
        }
        _ => {}
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Response deserialization
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn parse_response(body: &Value) -> Result<ChatResponse> {
    let empty = Vec::new();
    let content_arr = body
        .get("content")
        .and_then(|v| v.as_array())
        .unwrap_or(&empty);

    let mut text_parts: Vec<String> = Vec::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();

    for block in content_arr {
        match block.get("type").and_then(|v| v.as_str()).unwrap_or("") {
            "text" => {
                if let Some(t) = block.get("text").and_then(|v| v.as_str()) {
                    text_parts.push(t.to_string());
                }
            }
            "tool_use" => {
                tool_calls.push(ToolCall {
                    call_id: block
                        .get("id")
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_string(),
                    tool_name: block
                        .get("name")
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_string(),
                    arguments: block
                        .get("input")
                        .cloned()
                        .unwrap_or(Value::Object(Default::default())),
                });
            }
            _ => {}
        }
    }

    let finish_reason = body
        .get("stop_reason")
        .and_then(|v| v.as_str())
        .map(map_stop_reason);

    Ok(ChatResponse {
        content: text_parts.join(""),
        tool_calls,
        usage: body.get("usage").map(parse_usage),
        finish_reason,
    })
}

fn map_stop_reason(s: &str) -> String {
    match s {
        "end_turn" => "stop".to_string(),
        "tool_use" => "tool_calls".to_string(),
        other => other.to_string(),
    }
}

fn parse_usage(v: &Value) -> Usage {
    let field = |name: &str| v.get(name).and_then(|n| n.as_u64()).unwrap_or(0) as u32;
    Usage {
        input_tokens: field("input_tokens"),
        output_tokens: field("output_tokens"),
        cache_creation_input_tokens: field("cache_creation_input_tokens"),
        cache_read_input_tokens: field("cache_read_input_tokens"),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Streaming SSE parser
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Per-stream assembly state across SSE payloads.
struct StreamState {
    /// Active tool call per block index: (call_id, name, args_buffer).
    active_tool_calls: std::collections::HashMap<u64, (String, String, String)>,
    /// Active thinking block per index: (thinking_buffer, signature_buffer).
    active_thinking: std::collections::HashMap<u64, (String, String)>,
    /// Usage from message_start, updated by message_delta.
    usage: Option<Usage>,
    done_emitted: bool,
}

impl StreamState {
    fn new() -> Self {
        Self {
            active_tool_calls: std::collections::HashMap::new(),
            active_thinking: std::collections::HashMap::new(),
            usage: None,
            done_emitted: false,
        }
    }
}

/// Parse a single Anthropic SSE data payload and produce zero or more stream events.
fn parse_sse(data: &str, state: &mut StreamState) -> Vec<Result<StreamEvent>> {
    let mut events = Vec::new();

    let v: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => {
            events.push(Err(Error::Json(e)));
            return events;
        }
    };

    match v.get("type").and_then(|v| v.as_str()).unwrap_or("") {
        "message_start" => {
            if let Some(msg) = v.get("message") {
                state.usage = msg.get("usage").map(parse_usage);
            }
        }

        "content_block_start" => {
            let idx = v.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
            if let Some(block) = v.get("content_block") {
                match block.get("type").and_then(|v| v.as_str()).unwrap_or("") {
                    "tool_use" => {
                        let call_id = block
                            .get("id")
                            .and_then(|v| v.as_str())
                            .unwrap_or("")
                            .to_string();
                        let name = block
                            .get("name")
                            .and_then(|v| v.as_str())
                            .unwrap_or("")
                            .to_string();
                        events.push(Ok(StreamEvent::ToolCallStarted {
                            call_id: call_id.clone(),
                            tool_name: name.clone(),
                        }));
                        state
                            .active_tool_calls
                            .insert(idx, (call_id, name, String::new()));
                    }
                    "thinking" => {
                        state
                            .active_thinking
                            .insert(idx, (String::new(), String::new()));
                    }
                    _ => {}
                }
            }
        }

        "content_block_delta" => {
            let idx = v.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
            if let Some(delta) = v.get("delta") {
                match delta.get("type").and_then(|v| v.as_str()).unwrap_or("") {
                    "text_delta" => {
                        if let Some(text) = delta.get("text").and_then(|v| v.as_str()) {
                            if !text.is_empty() {
                                events.push(Ok(StreamEvent::Token {
                                    text: text.to_string(),
                                }));
                            }
                        }
                    }
                    "thinking_delta" => {
                        if let Some(text) = delta.get("thinking").and_then(|v| v.as_str()) {
                            if let Some(t) = state.active_thinking.get_mut(&idx) {
                                t.0.push_str(text);
                            }
                            if !text.is_empty() {
                                events.push(Ok(StreamEvent::Thinking {
                                    text: text.to_string(),
                                }));
                            }
                        }
                    }
                    "signature_delta" => {
                        if let Some(sig) = delta.get("signature").and_then(|v| v.as_str()) {
                            if let Some(t) = state.active_thinking.get_mut(&idx) {
                                t.1.push_str(sig);
                            }
                        }
                    }
                    "input_json_delta" => {
                        if let Some(partial) = delta.get("partial_json").and_then(|v| v.as_str()) {
                            if let Some(tc) = state.active_tool_calls.get_mut(&idx) {
                                tc.2.push_str(partial);
                                events.push(Ok(StreamEvent::ToolCallDelta {
                                    call_id: tc.0.clone(),
                                    delta: partial.to_string(),
                                }));
                            }
                        }
                    }
                    _ => {}
                }
            }
        }

        "content_block_stop" => {
            let idx = v.get("index").and_then(|v| v.as_u64()).unwrap_or(0);
            if let Some((call_id, tool_name, args_str)) = state.active_tool_calls.remove(&idx) {
                let arguments: Value =
                    serde_json::from_str(&args_str).unwrap_or(Value::Object(Default::default()));
                events.push(Ok(StreamEvent::ToolCallFinished {
                    call_id,
                    tool_name,
                    arguments,
                }));
            }
            if let Some((thinking, signature)) = state.active_thinking.remove(&idx) {
                events.push(Ok(StreamEvent::ThinkingFinished {
                    thinking,
                    signature,
                }));
            }
        }

        "message_delta" => {
            if let Some(usage_val) = v.get("usage") {
                if let Some(output) = usage_val.get("output_tokens").and_then(|v| v.as_u64()) {
                    if let Some(ref mut u) = state.usage {
                        u.output_tokens = output as u32;
                    }
                }
            }
            let stop_reason = v
                .get("delta")
                .and_then(|d| d.get("stop_reason"))
                .and_then(|v| v.as_str())
                .map(map_stop_reason);
            if stop_reason.is_some() {
                state.done_emitted = true;
                events.push(Ok(StreamEvent::Done {
                    usage: state.usage.clone(),
                    finish_reason: stop_reason,
                }));
            }
        }

        "message_stop" => {
            if !state.done_emitted {
                state.done_emitted = true;
                events.push(Ok(StreamEvent::Done {
                    usage: state.usage.clone(),
                    finish_reason: Some("stop".into()),
                }));
            }
        }

        "error" => {
            let msg = v
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(|v| v.as_str())
                .unwrap_or("unknown error");
            events.push(Ok(StreamEvent::Error {
                message: msg.to_string(),
            }));
        }

        _ => {
            // ping or unknown event types -- ignore.
        }
    }

    events
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trait implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
impl LlmProvider for AnthropicProvider {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse> {
        let url = format!("{}/v1/messages", self.base_url);
        let body = self.build_messages_body(&req, false);

        tracing::debug!(provider = %self.id, url = %url, "chat request");

        let resp = self
            .authed_post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        let status = resp.status();
        let resp_text = resp.text().await.map_err(|e| Error::Http(e.to_string()))?;

        if !status.is_success() {
            return Err(Error::Provider {
                provider: self.id.clone(),
                message: format!("HTTP {} - {}", status.as_u16(), resp_text),
            });
        }

        let resp_json: Value = serde_json::from_str(&resp_text)?;
        parse_response(&resp_json)
    }

    async fn chat_stream(
        &self,
        req: ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        let url = format!("{}/v1/messages", self.base_url);
        let body = self.build_messages_body(&req, true);
        let provider_id = self.id.clone();

        tracing::debug!(provider = %self.id, url = %url, "stream request");

        let resp = self
            .authed_post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let err_text = resp.text().await.map_err(|e| Error::Http(e.to_string()))?;
            return Err(Error::Provider {
                provider: provider_id,
                message: format!("HTTP {} - {}", status.as_u16(), err_text),
            });
        }

        let mut state = StreamState::new();
        Ok(sse_response_stream(resp, move |data| {
            parse_sse(data, &mut state)
        }))
    }

    fn provider_id(&self) -> &str {
        &self.id
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(state: &mut StreamState, payloads: &[&str]) -> Vec<StreamEvent> {
        payloads
            .iter()
            .flat_map(|p| parse_sse(p, state))
            .map(|r| r.unwrap())
            .collect()
    }

    #[test]
    fn thinking_block_assembly() {
        let mut state = StreamState::new();
        let events = collect(
            &mut state,
            &[
                r#"{"type":"content_block_start","index":0,"content_block":{"type":"thinking"}}"#,
                r#"{"type":"content_block_delta","index":0,"delta":{"type":"thinking_delta","thinking":"check the "}}"#,
                r#"{"type":"content_block_delta","index":0,"delta":{"type":"thinking_delta","thinking":"queue"}}"#,
                r#"{"type":"content_block_delta","index":0,"delta":{"type":"signature_delta","signature":"sig_x"}}"#,
                r#"{"type":"content_block_stop","index":0}"#,
            ],
        );

        assert!(matches!(&events[0], StreamEvent::Thinking { text } if text == "check the "));
        assert!(matches!(&events[1], StreamEvent::Thinking { text } if text == "queue"));
        match &events[2] {
            StreamEvent::ThinkingFinished {
                thinking,
                signature,
            } => {
                assert_eq!(thinking, "check the queue");
                assert_eq!(signature, "sig_x");
            }
            other => panic!("expected ThinkingFinished, got {other:?}"),
        }
    }

    #[test]
    fn tool_call_assembly() {
        let mut state = StreamState::new();
        let events = collect(
            &mut state,
            &[
                r#"{"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"tc_9","name":"get_queue"}}"#,
                r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"queue_id\":"}}"#,
                r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"42}"}}"#,
                r#"{"type":"content_block_stop","index":1}"#,
            ],
        );

        assert!(
            matches!(&events[0], StreamEvent::ToolCallStarted { call_id, tool_name }
                if call_id == "tc_9" && tool_name == "get_queue")
        );
        match events.last().unwrap() {
            StreamEvent::ToolCallFinished {
                call_id, arguments, ..
            } => {
                assert_eq!(call_id, "tc_9");
                assert_eq!(arguments["queue_id"], 42);
            }
            other => panic!("expected ToolCallFinished, got {other:?}"),
        }
    }

    #[test]
    fn usage_carries_cache_counters() {
        let mut state = StreamState::new();
        let events = collect(
            &mut state,
            &[
                r#"{"type":"message_start","message":{"usage":{"input_tokens":12,"output_tokens":0,"cache_creation_input_tokens":800,"cache_read_input_tokens":2000}}}"#,
                r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":55}}"#,
            ],
        );

        match events.last().unwrap() {
            StreamEvent::Done { usage, finish_reason } => {
                let u = usage.as_ref().unwrap();
                assert_eq!(u.input_tokens, 12);
                assert_eq!(u.output_tokens, 55);
                assert_eq!(u.cache_creation_input_tokens, 800);
                assert_eq!(u.cache_read_input_tokens, 2000);
                assert_eq!(finish_reason.as_deref(), Some("stop"));
            }
            other => panic!("expected Done, got {other:?}"),
        }
    }

    #[test]
    fn message_stop_without_delta_emits_done_once() {
        let mut state = StreamState::new();
        let events = collect(
            &mut state,
            &[
                r#"{"type":"message_delta","delta":{"stop_reason":"tool_use"},"usage":{"output_tokens":9}}"#,
                r#"{"type":"message_stop"}"#,
            ],
        );
        let dones = events
            .iter()
            .filter(|e| matches!(e, StreamEvent::Done { .. }))
            .count();
        assert_eq!(dones, 1);
    }

    #[test]
    fn body_includes_thinking_and_cache_breakpoints() {
        let provider = AnthropicProvider {
            id: "anthropic".into(),
            base_url: "https://api.anthropic.com".into(),
            api_key: "test-key".into(),
            default_model: "claude-sonnet-4-20250514".into(),
            max_output_tokens: 8192,
            thinking_budget: 2048,
            client: reqwest::Client::new(),
        };

        let req = ChatRequest {
            system: "You are a helpful assistant.".into(),
            messages: vec![Message::user("list my queues")],
            tools: vec![ToolDefinition {
                name: "get_queue".into(),
                description: "Fetch a queue".into(),
                parameters: serde_json::json!({"type":"object","properties":{}}),
            }],
            max_tokens: None,
            thinking_budget: None,
            model: None,
            cache: true,
        };

        let body = provider.build_messages_body(&req, true);
        assert_eq!(body["thinking"]["budget_tokens"], 2048);
        assert_eq!(body["system"][0]["cache_control"]["type"], "ephemeral");
        assert_eq!(body["tools"][0]["cache_control"]["type"], "ephemeral");
        // The single user message got promoted to a cacheable block.
        assert_eq!(
            body["messages"][0]["content"][0]["cache_control"]["type"],
            "ephemeral"
        );
        assert_eq!(body["max_tokens"], 8192);
    }

    #[test]
    fn parse_non_streaming_response() {
        let body = serde_json::json!({
            "content": [
                {"type": "text", "text": "Here you go."},
                {"type": "tool_use", "id": "tc_1", "name": "list_queues", "input": {}}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 10, "output_tokens": 4}
        });
        let resp = parse_response(&body).unwrap();
        assert_eq!(resp.content, "Here you go.");
        assert_eq!(resp.tool_calls.len(), 1);
        assert_eq!(resp.finish_reason.as_deref(), Some("tool_calls"));
    }
}
