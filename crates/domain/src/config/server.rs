use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_port")]
    pub port: u16,
    #[serde(default = "d_host")]
    pub host: String,
    /// Rate limit for chat creation, requests per minute per credential.
    #[serde(default = "d_create_limit")]
    pub chat_create_per_minute: u32,
    /// Rate limit for messages, requests per minute per credential.
    #[serde(default = "d_message_limit")]
    pub message_per_minute: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: d_port(),
            host: d_host(),
            chat_create_per_minute: d_create_limit(),
            message_per_minute: d_message_limit(),
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_port() -> u16 {
    8000
}
fn d_host() -> String {
    "127.0.0.1".into()
}
fn d_create_limit() -> u32 {
    30
}
fn d_message_limit() -> u32 {
    10
}
