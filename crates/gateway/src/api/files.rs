//! Output-file endpoints.
//!
//! - `GET /api/v1/chats/:id/files`       — list the run's output files
//! - `GET /api/v1/chats/:id/files/:name` — download one (path-traversal
//!   validated)

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use serde_json::Value;

use crate::api::auth::api_error;
use crate::runtime::tools::safe_filename;
use crate::state::AppState;

fn mime_type(filename: &str) -> &'static str {
    match filename.rsplit('.').next().unwrap_or("") {
        "json" => "application/json",
        "csv" => "text/csv",
        "md" => "text/markdown",
        "txt" => "text/plain",
        "pdf" => "application/pdf",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        _ => "application/octet-stream",
    }
}

pub async fn list_files(State(state): State<AppState>, Path(chat_id): Path<String>) -> Response {
    let Some(dir) = state.registry.output_dir(&chat_id) else {
        // No run yet — an existing chat simply has no files.
        return match state.chats.get(&chat_id).await {
            Ok(Some(_)) => Json(serde_json::json!({ "files": [] })).into_response(),
            Ok(None) => api_error(StatusCode::NOT_FOUND, format!("Chat {chat_id} not found")),
            Err(e) => api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("chat lookup failed: {e}"),
            ),
        };
    };

    let mut files: Vec<Value> = Vec::new();
    match tokio::fs::read_dir(&dir).await {
        Ok(mut entries) => {
            while let Ok(Some(entry)) = entries.next_entry().await {
                let Ok(metadata) = entry.metadata().await else {
                    continue;
                };
                if !metadata.is_file() {
                    continue;
                }
                let filename = entry.file_name().to_string_lossy().to_string();
                files.push(serde_json::json!({
                    "filename": filename,
                    "size": metadata.len(),
                    "mime_type": mime_type(&filename),
                    "url": format!("/api/v1/chats/{chat_id}/files/{filename}"),
                }));
            }
        }
        Err(e) => {
            tracing::debug!(chat_id = %chat_id, error = %e, "output dir unreadable");
        }
    }

    Json(serde_json::json!({ "files": files })).into_response()
}

pub async fn download_file(
    State(state): State<AppState>,
    Path((chat_id, filename)): Path<(String, String)>,
) -> Response {
    let Some(name) = safe_filename(&filename) else {
        return api_error(StatusCode::BAD_REQUEST, "invalid filename");
    };

    let Some(dir) = state.registry.output_dir(&chat_id) else {
        return api_error(StatusCode::NOT_FOUND, format!("Chat {chat_id} has no files"));
    };

    let path = dir.join(name);
    match tokio::fs::read(&path).await {
        Ok(bytes) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, mime_type(name).to_string()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"{name}\""),
                ),
            ],
            bytes,
        )
            .into_response(),
        Err(_) => api_error(StatusCode::NOT_FOUND, format!("File {name} not found")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mime_types() {
        assert_eq!(mime_type("report.csv"), "text/csv");
        assert_eq!(mime_type("notes.md"), "text/markdown");
        assert_eq!(mime_type("blob"), "application/octet-stream");
    }
}
