//! Shared error taxonomy for the aggregator.
//!
//! Subsystems keep their own error enums where they help (the catalog store,
//! the kit manager), but everything that crosses the server boundary is
//! collapsed into [`MaggError`] so it can be mapped onto a JSON-RPC error
//! code in one place.

use thiserror::Error;

/// Errors surfaced to MCP clients or the CLI.
#[derive(Debug, Clone, Error)]
pub enum MaggError {
    /// Malformed config, duplicate prefix, missing transport, bad proxy
    /// parameters, invalid kit file.
    #[error("validation error: {0}")]
    Validation(String),

    /// Process spawn failure, dead stdio pipe, refused HTTP connection,
    /// handshake timeout.
    #[error("transport error: {0}")]
    Transport(String),

    /// The downstream server sent something unparseable or unexpected.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Two enabled backends claim the same aggregated name.
    #[error("name collision: {0}")]
    Collision(String),

    /// Unknown server, capability, kit, or resource.
    #[error("not found: {0}")]
    NotFound(String),

    /// The request was cancelled by the client or by shutdown.
    #[error("request cancelled")]
    Cancelled,

    /// A bounded operation exceeded its budget.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Missing, malformed, expired, or wrong-audience token.
    #[error("authentication error: {0}")]
    Auth(String),

    /// Mutating operation attempted in read-only mode.
    #[error("read-only mode: {0}")]
    ReadOnly(String),
}

impl MaggError {
    /// JSON-RPC error code for this error when it reaches a client.
    ///
    /// Validation errors map to invalid-params; everything else is a
    /// server-defined code in the -32000 range so clients can tell the
    /// kinds apart.
    #[must_use]
    pub const fn jsonrpc_code(&self) -> i32 {
        match self {
            Self::Validation(_) => -32602,
            Self::NotFound(_) => -32001,
            Self::Transport(_) => -32002,
            Self::Protocol(_) => -32003,
            Self::Collision(_) => -32004,
            Self::Timeout(_) => -32005,
            Self::Auth(_) => -32006,
            Self::ReadOnly(_) => -32007,
            Self::Cancelled => -32800,
        }
    }

    /// Whether this error indicates the backend itself is unhealthy (as
    /// opposed to a bad individual request).
    #[must_use]
    pub const fn is_backend_fault(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Protocol(_))
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_maps_to_invalid_params() {
        assert_eq!(MaggError::validation("x").jsonrpc_code(), -32602);
    }

    #[test]
    fn cancelled_uses_mcp_cancelled_code() {
        assert_eq!(MaggError::Cancelled.jsonrpc_code(), -32800);
    }

    #[test]
    fn backend_fault_classification() {
        assert!(MaggError::Transport("pipe".into()).is_backend_fault());
        assert!(MaggError::Protocol("junk".into()).is_backend_fault());
        assert!(!MaggError::not_found("x").is_backend_fault());
        assert!(!MaggError::Cancelled.is_backend_fault());
    }
}
