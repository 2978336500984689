/// Shared error type used across all Clerk crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP: {0}")]
    Http(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("provider {provider}: {message}")]
    Provider { provider: String, message: String },

    #[error("store: {0}")]
    Store(String),

    #[error("tool server: {0}")]
    ToolServer(String),

    /// Downstream API rejected the call with an HTTP status. 412/429/5xx
    /// are retryable; other 4xx are not.
    #[error("downstream HTTP {status}: {message}")]
    Downstream { status: u16, message: String },

    #[error("chat not found: {0}")]
    ChatNotFound(String),

    #[error("config: {0}")]
    Config(String),

    #[error("auth: {0}")]
    Auth(String),

    #[error("run cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether a failed downstream call may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Downstream { status, .. } => {
                *status == 412 || *status == 429 || *status >= 500
            }
            Error::Timeout(_) | Error::Http(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
