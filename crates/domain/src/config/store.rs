use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Persistence store (Redis)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "d_host")]
    pub host: String,
    #[serde(default = "d_port")]
    pub port: u16,
    /// TTL for chat metadata and transcripts, in seconds.
    #[serde(default = "d_chat_ttl")]
    pub chat_ttl_secs: u64,
    /// TTL for entity snapshots, in seconds.
    #[serde(default = "d_snapshot_ttl")]
    pub snapshot_ttl_secs: u64,
}

impl StoreConfig {
    pub fn url(&self) -> String {
        format!("redis://{}:{}/", self.host, self.port)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            host: d_host(),
            port: d_port(),
            chat_ttl_secs: d_chat_ttl(),
            snapshot_ttl_secs: d_snapshot_ttl(),
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_host() -> String {
    "127.0.0.1".into()
}
fn d_port() -> u16 {
    6379
}
fn d_chat_ttl() -> u64 {
    30 * 24 * 3600
}
fn d_snapshot_ttl() -> u64 {
    7 * 24 * 3600
}
