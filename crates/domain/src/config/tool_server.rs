use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Downstream tool server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The downstream platform API is reached through an MCP-style tool server
/// spawned per chat run with the caller's credentials in its environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolServerConfig {
    #[serde(default = "d_command")]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Fallback credential when the request carries no `X-API-Token`.
    #[serde(default)]
    pub default_api_token: Option<String>,
    /// Fallback base URL when the request carries no `X-API-Base-URL`.
    #[serde(default)]
    pub default_api_base_url: Option<String>,
}

impl Default for ToolServerConfig {
    fn default() -> Self {
        Self {
            command: d_command(),
            args: Vec::new(),
            default_api_token: None,
            default_api_base_url: None,
        }
    }
}

fn d_command() -> String {
    "clerk-tools".into()
}
