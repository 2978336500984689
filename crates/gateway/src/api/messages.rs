//! Message dispatch with SSE streaming, plus explicit cancel.
//!
//! - `POST /api/v1/chats/:id/messages` — run the agent, stream events
//! - `POST /api/v1/chats/:id/cancel`   — cancel the active run
//!
//! Each SSE frame is `event: <name>\ndata: <json>\n\n`; a `:ka` comment
//! goes out every keepalive interval with no outbound event. Client
//! disconnects drop the stream, which cancels the run through a guard.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use futures_util::stream::Stream;
use serde::Deserialize;

use clerk_domain::config::{Mode, Persona};

use crate::api::auth::{api_error, extract_credentials};
use crate::api::ratelimit::credential_key;
use crate::runtime::agent::{
    run_message, DocumentAttachment, ImageAttachment, MessageInput,
};
use crate::runtime::events::AgentEvent;
use crate::runtime::registry::ChatRegistry;
use crate::state::AppState;

const MAX_CONTENT_CHARS: usize = 50_000;
const MAX_ATTACHMENTS: usize = 5;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request shape
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct ImageBody {
    pub media_type: String,
    pub data: String,
}

#[derive(Debug, Deserialize)]
pub struct DocumentBody {
    pub filename: String,
    pub data: String,
}

#[derive(Debug, Deserialize)]
pub struct MessageRequest {
    pub content: String,
    #[serde(default)]
    pub images: Vec<ImageBody>,
    #[serde(default)]
    pub documents: Vec<DocumentBody>,
    /// Optional platform URL the user is currently viewing.
    #[serde(default)]
    pub platform_url: Option<String>,
    /// Mode override; persists for this and subsequent messages.
    #[serde(default)]
    pub mode: Option<Mode>,
    #[serde(default)]
    pub persona: Option<Persona>,
}

fn validate(body: &MessageRequest) -> Result<(), String> {
    if body.content.is_empty() {
        return Err("content must not be empty".into());
    }
    if body.content.chars().count() > MAX_CONTENT_CHARS {
        return Err(format!("content exceeds {MAX_CONTENT_CHARS} characters"));
    }
    if body.images.len() > MAX_ATTACHMENTS {
        return Err(format!("at most {MAX_ATTACHMENTS} images per message"));
    }
    if body.documents.len() > MAX_ATTACHMENTS {
        return Err(format!("at most {MAX_ATTACHMENTS} documents per message"));
    }
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Disconnect guard
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Cancels the run when the SSE stream is dropped before `done` was sent
/// (the HTTP server drops the body stream on client disconnect).
struct DisconnectGuard {
    registry: Arc<ChatRegistry>,
    chat_id: String,
    completed: bool,
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        if !self.completed {
            tracing::info!(chat_id = %self.chat_id, "client disconnected, cancelling run");
            self.registry.cancel_run(&self.chat_id);
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /chats/:id/messages
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn send_message(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<MessageRequest>,
) -> Response {
    let credentials = match extract_credentials(&headers, &state.config) {
        Ok(c) => c,
        Err(resp) => return resp,
    };

    let limit = state.config.server.message_per_minute;
    if !state
        .limiter
        .check("message", &credential_key(&credentials.token), limit)
    {
        return api_error(StatusCode::TOO_MANY_REQUESTS, "message rate limit exceeded");
    }

    if let Err(message) = validate(&body) {
        return api_error(StatusCode::BAD_REQUEST, message);
    }

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

    let input = MessageInput {
        chat_id: chat_id.clone(),
        content: body.content,
        images: body
            .images
            .into_iter()
            .map(|i| ImageAttachment {
                media_type: i.media_type,
                data: i.data,
            })
            .collect(),
        documents: body
            .documents
            .into_iter()
            .map(|d| DocumentAttachment {
                filename: d.filename,
                data: d.data,
            })
            .collect(),
        platform_url: body.platform_url,
        mode: body.mode.unwrap_or(meta.mode),
        persona: body.persona.unwrap_or(meta.persona),
        credentials,
    };

    let keepalive_secs = state.config.runtime.keepalive_secs;
    let registry = state.registry.clone();
    let rx = run_message(state, meta, input);

    let stream = make_sse_stream(rx, registry, chat_id);

    Sse::new(stream)
        .keep_alive(
            KeepAlive::new()
                .interval(std::time::Duration::from_secs(keepalive_secs))
                .text("ka"),
        )
        .into_response()
}

fn make_sse_stream(
    mut rx: tokio::sync::mpsc::Receiver<AgentEvent>,
    registry: Arc<ChatRegistry>,
    chat_id: String,
) -> impl Stream<Item = Result<Event, std::convert::Infallible>> {
    async_stream::stream! {
        let mut guard = DisconnectGuard {
            registry,
            chat_id,
            completed: false,
        };

        // Initial comment frame so proxies flush headers immediately.
        yield Ok(Event::default().comment("stream open"));

        while let Some(event) = rx.recv().await {
            let is_done = matches!(&event, AgentEvent::Done(_));
            yield Ok(Event::default().event(event.name()).data(event.data()));
            if is_done {
                guard.completed = true;
                break;
            }
        }
        // guard drops here: a break via `done` is a clean close, anything
        // else (client disconnect) cancels the run.
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// POST /chats/:id/cancel
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn cancel_message(
    State(state): State<AppState>,
    Path(chat_id): Path<String>,
) -> Response {
    match state.chats.get(&chat_id).await {
        Ok(Some(_)) => {}
        Ok(None) => return api_error(StatusCode::NOT_FOUND, format!("Chat {chat_id} not found")),
        Err(e) => {
            return api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("chat lookup failed: {e}"),
            )
        }
    }

    let cancelled = state.registry.cancel_run(&chat_id);
    Json(serde_json::json!({ "cancelled": cancelled })).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(content: &str) -> MessageRequest {
        MessageRequest {
            content: content.into(),
            images: Vec::new(),
            documents: Vec::new(),
            platform_url: None,
            mode: None,
            persona: None,
        }
    }

    #[test]
    fn validation_rejects_empty_and_oversized_content() {
        assert!(validate(&request("hi")).is_ok());
        assert!(validate(&request("")).is_err());
        assert!(validate(&request(&"x".repeat(MAX_CONTENT_CHARS + 1))).is_err());
    }

    #[test]
    fn validation_caps_attachments() {
        let mut body = request("look at these");
        for _ in 0..6 {
            body.images.push(ImageBody {
                media_type: "image/png".into(),
                data: "aGk=".into(),
            });
        }
        assert!(validate(&body).is_err());
    }
}
