//! `clerk-mcp-client` — client for the downstream platform tool server.
//!
//! The tool server is an MCP-style JSON-RPC 2.0 process spoken to over
//! stdio. One connection is spawned per chat run, with the caller's
//! credentials and access mode passed through the child environment.
//!
//! This crate provides:
//! - JSON-RPC 2.0 protocol types, including the `read_only` / `category`
//!   tool metadata the runtime's gating and dynamic loading depend on.
//! - A stdio transport that spawns the child process.
//! - A [`ToolConnection`] that performs the handshake, caches discovery,
//!   and dispatches `tools/call`.

pub mod connection;
pub mod protocol;
pub mod transport;

pub use connection::ToolConnection;
pub use protocol::{CategoryInfo, McpToolDef};
pub use transport::{StdioTransport, TransportError};
