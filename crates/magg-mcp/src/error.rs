//! Error type for the MCP client and transports.

use thiserror::Error;

use magg_core::MaggError;

/// Errors from driving a downstream MCP connection.
#[derive(Debug, Error)]
pub enum McpError {
    #[error("failed to spawn backend process: {0}")]
    SpawnFailed(String),

    #[error("transport I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport closed")]
    Closed,

    #[error("JSON encoding failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("request cancelled")]
    Cancelled,

    #[error("backend returned error {code}: {message}")]
    Server {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    #[error("HTTP transport failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("not connected")]
    NotConnected,

    #[error("invalid transport configuration: {0}")]
    InvalidConfig(String),
}

impl From<McpError> for MaggError {
    fn from(err: McpError) -> Self {
        match err {
            McpError::Cancelled => Self::Cancelled,
            McpError::Timeout(d) => Self::Timeout(format!("backend request after {d:?}")),
            McpError::Protocol(msg) => Self::Protocol(msg),
            McpError::Json(e) => Self::Protocol(e.to_string()),
            McpError::InvalidConfig(msg) => Self::Validation(msg),
            McpError::Server { code, message, .. } => {
                Self::Protocol(format!("backend error {code}: {message}"))
            }
            other => Self::Transport(other.to_string()),
        }
    }
}
