//! Credential extraction.
//!
//! Bearer credentials are forwarded per-request via `X-API-Token` and
//! `X-API-Base-URL` headers (falling back to configured defaults). They
//! are held in memory for the duration of a run and never persisted;
//! validation is the downstream platform's job.

use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};

use clerk_domain::config::Config;

use crate::runtime::agent::Credentials;

pub const TOKEN_HEADER: &str = "x-api-token";
pub const BASE_URL_HEADER: &str = "x-api-base-url";

/// Build a standardized JSON error response: `{ "error": "<message>" }`.
pub fn api_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

/// Resolve credentials from headers, falling back to configured defaults.
pub fn extract_credentials(headers: &HeaderMap, config: &Config) -> Result<Credentials, Response> {
    let token = headers
        .get(TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
        .or_else(|| config.tool_server.default_api_token.clone());

    let base_url = headers
        .get(BASE_URL_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
        .or_else(|| config.tool_server.default_api_base_url.clone());

    match (token, base_url) {
        (Some(token), Some(base_url)) if !token.is_empty() && !base_url.is_empty() => {
            Ok(Credentials { token, base_url })
        }
        _ => Err(api_error(
            StatusCode::UNAUTHORIZED,
            "missing credentials: provide X-API-Token and X-API-Base-URL headers",
        )),
    }
}
