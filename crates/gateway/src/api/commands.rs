//! Slash-command palette for UI auto-complete (`GET /api/v1/commands`).

use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct CommandInfo {
    pub name: &'static str,
    pub description: &'static str,
}

/// The commands the UI offers; execution happens client-side by rewriting
/// the message (e.g. `/revert abc123` → a revert request).
pub const COMMANDS: &[CommandInfo] = &[
    CommandInfo {
        name: "/read-only",
        description: "Switch this chat to read-only mode",
    },
    CommandInfo {
        name: "/read-write",
        description: "Switch this chat to read-write mode (changes become revertible commits)",
    },
    CommandInfo {
        name: "/history",
        description: "Show recent configuration commits",
    },
    CommandInfo {
        name: "/revert",
        description: "Revert a configuration commit by hash",
    },
    CommandInfo {
        name: "/tasks",
        description: "Show the task tracker for the current run",
    },
    CommandInfo {
        name: "/help",
        description: "Explain what this assistant can do",
    },
];

pub async fn list_commands() -> Response {
    Json(serde_json::json!({ "commands": COMMANDS })).into_response()
}
