use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LLM provider
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "d_base_url")]
    pub base_url: String,
    /// Name of the environment variable holding the provider API key.
    #[serde(default = "d_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "d_model")]
    pub model: String,
    /// Smaller model for short auxiliary calls (commit messages).
    #[serde(default = "d_summary_model")]
    pub summary_model: String,
    #[serde(default = "d_max_output_tokens")]
    pub max_output_tokens: u32,
    /// Extended-thinking budget in tokens. 0 disables thinking.
    #[serde(default = "d_thinking_budget")]
    pub thinking_budget_tokens: u32,
    #[serde(default = "d_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: d_base_url(),
            api_key_env: d_api_key_env(),
            model: d_model(),
            summary_model: d_summary_model(),
            max_output_tokens: d_max_output_tokens(),
            thinking_budget_tokens: d_thinking_budget(),
            request_timeout_secs: d_request_timeout(),
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_base_url() -> String {
    "https://api.anthropic.com".into()
}
fn d_api_key_env() -> String {
    "ANTHROPIC_API_KEY".into()
}
fn d_model() -> String {
    "claude-sonnet-4-20250514".into()
}
fn d_summary_model() -> String {
    "claude-3-5-haiku-20241022".into()
}
fn d_max_output_tokens() -> u32 {
    16_384
}
fn d_thinking_budget() -> u32 {
    4_096
}
fn d_request_timeout() -> u64 {
    300
}
