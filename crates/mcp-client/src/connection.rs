//! Per-run connection to the tool server.
//!
//! Each chat run spawns its own server process so the caller's credentials
//! and access mode live only in that child's environment. The connection
//! performs the initialize handshake, caches tool discovery, and normalizes
//! `tools/call` results.

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::OnceCell;

use clerk_domain::config::{Mode, ToolServerConfig};
use clerk_domain::error::{Error, Result};

use crate::protocol::{self, CategoryInfo, McpToolDef, ToolCallResult, ToolsListResult};
use crate::transport::{StdioTransport, TransportError};

fn transport_err(e: TransportError) -> Error {
    match e {
        TransportError::Timeout => Error::Timeout("tool server request".into()),
        other => Error::ToolServer(other.to_string()),
    }
}

/// A live connection to a spawned tool server process.
pub struct ToolConnection {
    transport: StdioTransport,
    tools: OnceCell<Vec<McpToolDef>>,
    catalog: OnceCell<Vec<CategoryInfo>>,
}

impl ToolConnection {
    /// Spawn the tool server with the caller's credentials in its
    /// environment and perform the MCP handshake.
    pub async fn connect(
        config: &ToolServerConfig,
        api_token: &str,
        api_base_url: &str,
        mode: Mode,
    ) -> Result<Self> {
        let mut env = HashMap::new();
        env.insert("API_TOKEN".to_string(), api_token.to_string());
        env.insert(
            "API_BASE_URL".to_string(),
            api_base_url.trim_end_matches('/').to_string(),
        );
        env.insert("MODE".to_string(), mode.as_str().to_string());

        let transport =
            StdioTransport::spawn(&config.command, &config.args, &env).map_err(transport_err)?;

        let init_params = serde_json::to_value(protocol::initialize_params())?;
        let resp = transport
            .send_request("initialize", Some(init_params))
            .await
            .map_err(transport_err)?;
        if let Some(err) = resp.error {
            return Err(Error::ToolServer(format!("initialize failed: {err}")));
        }

        transport
            .send_notification("notifications/initialized")
            .await
            .map_err(transport_err)?;

        tracing::info!(command = %config.command, "tool server connected");

        Ok(Self {
            transport,
            tools: OnceCell::new(),
            catalog: OnceCell::new(),
        })
    }

    /// All tools the server advertises (cached after the first call).
    pub async fn tools(&self) -> Result<&[McpToolDef]> {
        let tools = self
            .tools
            .get_or_try_init(|| async {
                let resp = self
                    .transport
                    .send_request("tools/list", None)
                    .await
                    .map_err(transport_err)?;
                let value = resp
                    .into_result()
                    .map_err(|e| Error::ToolServer(e.to_string()))?;
                let parsed: ToolsListResult = serde_json::from_value(value)?;
                tracing::info!(tool_count = parsed.tools.len(), "tool discovery complete");
                Ok::<_, Error>(parsed.tools)
            })
            .await?;
        Ok(tools)
    }

    /// Tools in one category.
    pub async fn tools_in_category(&self, category: &str) -> Result<Vec<McpToolDef>> {
        Ok(self
            .tools()
            .await?
            .iter()
            .filter(|t| t.category.as_deref() == Some(category))
            .cloned()
            .collect())
    }

    /// Names of all write tools (read_only = false).
    pub async fn write_tools(&self) -> Result<Vec<String>> {
        Ok(self
            .tools()
            .await?
            .iter()
            .filter(|t| !t.read_only)
            .map(|t| t.name.clone())
            .collect())
    }

    /// The category catalog, fetched via the server's `list_tool_categories`
    /// tool (cached after the first call).
    pub async fn catalog(&self) -> Result<&[CategoryInfo]> {
        let catalog = self
            .catalog
            .get_or_try_init(|| async {
                let value = self.call_tool("list_tool_categories", Value::Null).await?;
                let categories = parse_catalog(value)?;
                tracing::info!(categories = categories.len(), "tool catalog fetched");
                Ok::<_, Error>(categories)
            })
            .await?;
        Ok(catalog)
    }

    /// Call a tool and normalize the result.
    ///
    /// Error results become [`Error::Downstream`] when the server reported
    /// an HTTP status (so the caller can classify retryability), otherwise
    /// [`Error::ToolServer`].
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value> {
        let params = serde_json::json!({
            "name": name,
            "arguments": if arguments.is_null() { serde_json::json!({}) } else { arguments },
        });

        tracing::debug!(tool = name, "calling tool server");
        let resp = self
            .transport
            .send_request("tools/call", Some(params))
            .await
            .map_err(transport_err)?;
        let value = resp
            .into_result()
            .map_err(|e| Error::ToolServer(format!("tools/call failed: {e}")))?;

        let result: ToolCallResult = serde_json::from_value(value)?;
        if result.is_error {
            let status = result.error_status();
            let message = match result.into_value() {
                Value::String(s) => s,
                other => other.to_string(),
            };
            return Err(match status {
                Some(status) => Error::Downstream { status, message },
                None => Error::ToolServer(message),
            });
        }

        Ok(result.into_value())
    }

    pub fn is_alive(&self) -> bool {
        self.transport.is_alive()
    }

    pub async fn shutdown(&self) {
        self.transport.shutdown().await;
    }
}

/// Parse the `list_tool_categories` result, tolerating string-wrapped JSON
/// and a `{"result": ...}` envelope.
fn parse_catalog(mut value: Value) -> Result<Vec<CategoryInfo>> {
    if let Value::String(s) = &value {
        value = serde_json::from_str(s)?;
    }
    if let Some(inner) = value.get("result") {
        value = inner.clone();
        if let Value::String(s) = &value {
            value = serde_json::from_str(s)?;
        }
    }
    serde_json::from_value(value).map_err(Error::Json)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_parses_plain_array() {
        let value = serde_json::json!([
            {"name": "queues", "keywords": ["queue"], "tools": [{"name": "get_queue"}]}
        ]);
        let categories = parse_catalog(value).unwrap();
        assert_eq!(categories.len(), 1);
        assert_eq!(categories[0].name, "queues");
    }

    #[test]
    fn catalog_unwraps_result_envelope() {
        let value = serde_json::json!({
            "result": [{"name": "schemas", "keywords": [], "tools": []}]
        });
        let categories = parse_catalog(value).unwrap();
        assert_eq!(categories[0].name, "schemas");
    }

    #[test]
    fn catalog_parses_string_wrapped_json() {
        let value = Value::String(r#"[{"name": "hooks", "keywords": [], "tools": []}]"#.into());
        let categories = parse_catalog(value).unwrap();
        assert_eq!(categories[0].name, "hooks");
    }

    #[test]
    fn catalog_rejects_garbage() {
        assert!(parse_catalog(serde_json::json!(42)).is_err());
    }
}
