//! Chat session CRUD endpoints.
//!
//! - `POST   /api/v1/chats`       — create (rate limited)
//! - `GET    /api/v1/chats`       — list by recency with paging
//! - `GET    /api/v1/chats/:id`   — details + transcript
//! - `DELETE /api/v1/chats/:id`   — delete (cancels any active run)

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;
use serde_json::Value;

use clerk_domain::config::{Mode, Persona};

use crate::api::auth::{api_error, extract_credentials};
use crate::api::ratelimit::credential_key;
use crate::state::AppState;

#[derive(Debug, Deserialize, Default)]
pub struct CreateChatRequest {
    #[serde(default)]
    pub mode: Option<Mode>,
    #[serde(default)]
    pub persona: Option<Persona>,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default = "d_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

fn d_limit() -> usize {
    50
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handlers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn create_chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Option<Json<CreateChatRequest>>,
) -> Response {
    let credentials = match extract_credentials(&headers, &state.config) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let limit = state.config.server.chat_create_per_minute;
    if !state
        .limiter
        .check("chat_create", &credential_key(&credentials.token), limit)
    {
        return api_error(StatusCode::TOO_MANY_REQUESTS, "chat creation rate limit exceeded");
    }

    let body = body.map(|Json(b)| b).unwrap_or_default();
    let mode = body.mode.unwrap_or(state.config.runtime.default_mode);
    let persona = body.persona.unwrap_or_default();

    match state.chats.create(mode, persona).await {
        Ok(meta) => (
            StatusCode::CREATED,
            Json(serde_json::json!({
                "chat_id": meta.chat_id,
                "created_at": meta.created_at,
            })),
        )
            .into_response(),
        Err(e) => api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("chat creation failed: {e}"),
        ),
    }
}

pub async fn list_chats(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Response {
    let limit = query.limit.clamp(1, 100);
    match state.chats.list(limit, query.offset).await {
        Ok((chats, total)) => {
            let items: Vec<Value> = chats
                .iter()
                .map(|meta| {
                    serde_json::json!({
                        "chat_id": meta.chat_id,
                        "created_at": meta.created_at,
                        "updated_at": meta.updated_at,
                        "preview": meta.preview,
                        "mode": meta.mode,
                        "persona": meta.persona,
                        "message_count": meta.message_count,
                    })
                })
                .collect();
            Json(serde_json::json!({
                "chats": items,
                "total": total,
                "limit": limit,
                "offset": query.offset,
            }))
            .into_response()
        }
        Err(e) => api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("chat listing failed: {e}"),
        ),
    }
}

pub async fn get_chat(State(state): State<AppState>, Path(chat_id): Path<String>) -> Response {
    let meta = match state.chats.get(&chat_id).await {
        Ok(Some(meta)) => meta,
        Ok(None) => return api_error(StatusCode::NOT_FOUND, format!("Chat {chat_id} not found")),
        Err(e) => {
            return api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("chat lookup failed: {e}"),
            )
        }
    };

    let steps: Vec<Value> = match state.chats.read_steps(&chat_id).await {
        Ok(lines) => lines
            .iter()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect(),
        Err(e) => {
            tracing::warn!(chat_id = %chat_id, error = %e, "transcript read failed");
            Vec::new()
        }
    };

    let commits = state.chats.commit_hashes(&chat_id).await.unwrap_or_default();

    Json(serde_json::json!({
        "chat_id": meta.chat_id,
        "created_at": meta.created_at,
        "updated_at": meta.updated_at,
        "preview": meta.preview,
        "mode": meta.mode,
        "persona": meta.persona,
        "message_count": meta.message_count,
        "messages": steps,
        "config_commits": commits,
        "is_running": state.registry.is_running(&chat_id),
    }))
    .into_response()
}

pub async fn delete_chat(State(state): State<AppState>, Path(chat_id): Path<String>) -> Response {
    // Any in-flight run dies with the chat.
    state.registry.remove(&chat_id);

    match state.chats.delete(&chat_id).await {
        Ok(true) => Json(serde_json::json!({ "deleted": true })).into_response(),
        Ok(false) => api_error(StatusCode::NOT_FOUND, format!("Chat {chat_id} not found")),
        Err(e) => api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("chat deletion failed: {e}"),
        ),
    }
}
