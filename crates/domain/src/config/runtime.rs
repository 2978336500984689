use serde::{Deserialize, Serialize};

use super::Mode;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Agent runtime
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Hard cap on model↔tool iterations per message.
    #[serde(default = "d_max_steps")]
    pub max_steps: u32,
    /// Mode applied to chats that don't specify one.
    #[serde(default)]
    pub default_mode: Mode,
    /// How long a new run waits for a superseded predecessor to wind down.
    #[serde(default = "d_grace_period")]
    pub grace_period_ms: u64,
    /// SSE keepalive comment interval. Must stay below proxy idle timeouts.
    #[serde(default = "d_keepalive")]
    pub keepalive_secs: u64,
    /// A run whose event cannot be delivered for this long is cancelled.
    #[serde(default = "d_stall_ceiling")]
    pub stall_ceiling_secs: u64,
    /// Per-call timeout for regular tool dispatches.
    #[serde(default = "d_tool_timeout")]
    pub tool_timeout_secs: u64,
    /// Wall-clock timeout for one sub-agent execution.
    #[serde(default = "d_subagent_timeout")]
    pub subagent_timeout_secs: u64,
    /// Max iterations inside a sub-agent loop.
    #[serde(default = "d_subagent_iterations")]
    pub subagent_max_iterations: u32,
    /// Delay between dispatches of same-category writes, to avoid
    /// concurrent-modification conflicts downstream.
    #[serde(default = "d_write_stagger")]
    pub write_stagger_ms: u64,
    /// Retry budget for transient downstream failures (412/429/5xx).
    #[serde(default = "d_retries")]
    pub downstream_retries: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_steps: d_max_steps(),
            default_mode: Mode::default(),
            grace_period_ms: d_grace_period(),
            keepalive_secs: d_keepalive(),
            stall_ceiling_secs: d_stall_ceiling(),
            tool_timeout_secs: d_tool_timeout(),
            subagent_timeout_secs: d_subagent_timeout(),
            subagent_max_iterations: d_subagent_iterations(),
            write_stagger_ms: d_write_stagger(),
            downstream_retries: d_retries(),
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_max_steps() -> u32 {
    30
}
fn d_grace_period() -> u64 {
    2_000
}
fn d_keepalive() -> u64 {
    15
}
fn d_stall_ceiling() -> u64 {
    30
}
fn d_tool_timeout() -> u64 {
    120
}
fn d_subagent_timeout() -> u64 {
    60
}
fn d_subagent_iterations() -> u32 {
    5
}
fn d_write_stagger() -> u64 {
    500
}
fn d_retries() -> u32 {
    5
}
