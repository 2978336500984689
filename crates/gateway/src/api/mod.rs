//! HTTP API surface.

pub mod auth;
pub mod chats;
pub mod commands;
pub mod files;
pub mod messages;
pub mod ratelimit;

use axum::response::{IntoResponse, Json};
use axum::routing::{delete, get, post};
use axum::Router;

use crate::state::AppState;

/// Build the full API router, mounted under `/api/v1`.
pub fn router() -> Router<AppState> {
    let v1 = Router::new()
        // Chats
        .route("/chats", post(chats::create_chat))
        .route("/chats", get(chats::list_chats))
        .route("/chats/:id", get(chats::get_chat))
        .route("/chats/:id", delete(chats::delete_chat))
        // Messages (SSE) + cancel
        .route("/chats/:id/messages", post(messages::send_message))
        .route("/chats/:id/cancel", post(messages::cancel_message))
        // Output files
        .route("/chats/:id/files", get(files::list_files))
        .route("/chats/:id/files/:name", get(files::download_file))
        // UI support
        .route("/commands", get(commands::list_commands))
        .route("/health", get(health));

    Router::new().nest("/api/v1", v1)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
