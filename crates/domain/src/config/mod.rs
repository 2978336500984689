//! Clerk configuration.
//!
//! Loaded from `config.toml` (path via `CLERK_CONFIG`), with every section
//! optional and defaulted. A handful of environment variables override the
//! file for deployment ergonomics: `API_TOKEN`, `API_BASE_URL`, `MODE`,
//! `REDIS_HOST`, `REDIS_PORT`.

mod llm;
mod runtime;
mod server;
mod store;
mod tool_server;
mod workspace;

pub use llm::LlmConfig;
pub use runtime::RuntimeConfig;
pub use server::ServerConfig;
pub use store::StoreConfig;
pub use tool_server::ToolServerConfig;
pub use workspace::WorkspaceConfig;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// The access mode for a chat: read-only chats never see write tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Mode {
    #[default]
    #[serde(rename = "read-only")]
    ReadOnly,
    #[serde(rename = "read-write")]
    ReadWrite,
}

impl Mode {
    pub fn is_read_only(self) -> bool {
        matches!(self, Mode::ReadOnly)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Mode::ReadOnly => "read-only",
            Mode::ReadWrite => "read-write",
        }
    }
}

impl std::str::FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "read-only" => Ok(Mode::ReadOnly),
            "read-write" => Ok(Mode::ReadWrite),
            other => Err(Error::Config(format!(
                "invalid mode '{other}' (expected read-only or read-write)"
            ))),
        }
    }
}

/// Prompt persona: `cautious` adds confirmation-before-write guidance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Persona {
    #[default]
    Default,
    Cautious,
}

impl Persona {
    pub fn as_str(self) -> &'static str {
        match self {
            Persona::Default => "default",
            Persona::Cautious => "cautious",
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub tool_server: ToolServerConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub workspace: WorkspaceConfig,
}

impl Config {
    /// Apply environment-variable overrides on top of the parsed file.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(host) = std::env::var("REDIS_HOST") {
            self.store.host = host;
        }
        if let Ok(port) = std::env::var("REDIS_PORT") {
            self.store.port = port
                .parse()
                .map_err(|_| Error::Config(format!("REDIS_PORT '{port}' is not a port")))?;
        }
        if let Ok(token) = std::env::var("API_TOKEN") {
            self.tool_server.default_api_token = Some(token);
        }
        if let Ok(url) = std::env::var("API_BASE_URL") {
            self.tool_server.default_api_base_url = Some(url);
        }
        if let Ok(mode) = std::env::var("MODE") {
            self.runtime.default_mode = mode.parse()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.runtime.max_steps, 30);
        assert!(config.runtime.default_mode.is_read_only());
        assert_eq!(config.store.host, "127.0.0.1");
        assert_eq!(config.store.port, 6379);
    }

    #[test]
    fn mode_parses() {
        assert_eq!("read-only".parse::<Mode>().unwrap(), Mode::ReadOnly);
        assert_eq!("read-write".parse::<Mode>().unwrap(), Mode::ReadWrite);
        assert!("yolo".parse::<Mode>().is_err());
    }

    #[test]
    fn mode_serde_uses_kebab_case() {
        let json = serde_json::to_string(&Mode::ReadWrite).unwrap();
        assert_eq!(json, "\"read-write\"");
        let back: Mode = serde_json::from_str("\"read-only\"").unwrap();
        assert_eq!(back, Mode::ReadOnly);
    }

    #[test]
    fn partial_section_keeps_other_defaults() {
        let config: Config = toml::from_str(
            r#"
            [server]
            port = 9001
            "#,
        )
        .unwrap();
        assert_eq!(config.server.port, 9001);
        assert_eq!(config.server.host, "127.0.0.1");
    }
}
