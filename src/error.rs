//! Error types for Conduit
//!
//! Centralized error handling using thiserror. The enum is `Clone` so a single
//! failure can be handed to every waiter of a settled gate.

use std::sync::Arc;

use thiserror::Error;

/// All error types that can occur in Conduit
#[derive(Debug, Clone, Error)]
pub enum ConduitError {
    /// Request exceeded its deadline; the caller may retry
    #[error("request '{method}' (id {id}) timed out after {timeout_ms}ms")]
    Timeout { method: String, id: String, timeout_ms: u64 },

    /// Transport torn down while the request was pending
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    /// Transport came up but the capability listing failed
    #[error("Health check failed: {0}")]
    HealthCheckFailed(String),

    /// A buffered log record could not be committed
    #[error("Log write error: {0}")]
    LogWrite(String),

    /// A bus subscriber failed while processing an event
    #[error("Handler error: {0}")]
    Handler(String),

    /// The remote end answered with an error body
    #[error("Remote error from '{method}': {message}")]
    Remote { method: String, message: String },

    /// Transport-level failure (spawn, write, HTTP status)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Invalid state transition or operation
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Invalid configuration
    #[error("Config error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(Arc<serde_json::Error>),
}

impl ConduitError {
    /// Whether a caller can reasonably retry the failed operation
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ConduitError::Timeout { .. } | ConduitError::ConnectionClosed(_) | ConduitError::Transport(_)
        )
    }
}

impl From<std::io::Error> for ConduitError {
    fn from(err: std::io::Error) -> Self {
        ConduitError::Io(Arc::new(err))
    }
}

impl From<serde_json::Error> for ConduitError {
    fn from(err: serde_json::Error) -> Self {
        ConduitError::Json(Arc::new(err))
    }
}

/// Result type alias for Conduit operations
pub type Result<T> = std::result::Result<T, ConduitError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_error_names_method_id_and_duration() {
        let err = ConduitError::Timeout {
            method: "thread/start".to_string(),
            id: "7".to_string(),
            timeout_ms: 50,
        };
        let msg = err.to_string();
        assert!(msg.contains("thread/start"));
        assert!(msg.contains("id 7"));
        assert!(msg.contains("50ms"));
    }

    #[test]
    fn test_connection_closed_error() {
        let err = ConduitError::ConnectionClosed("server exited".to_string());
        assert_eq!(err.to_string(), "Connection closed: server exited");
    }

    #[test]
    fn test_health_check_failed_error() {
        let err = ConduitError::HealthCheckFailed("tools/list rejected".to_string());
        assert_eq!(err.to_string(), "Health check failed: tools/list rejected");
    }

    #[test]
    fn test_remote_error() {
        let err = ConduitError::Remote {
            method: "tools/call".to_string(),
            message: "no such tool".to_string(),
        };
        assert_eq!(err.to_string(), "Remote error from 'tools/call': no such tool");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: ConduitError = io_err.into();
        assert!(matches!(err, ConduitError::Io(_)));
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("invalid").unwrap_err();
        let err: ConduitError = json_err.into();
        assert!(matches!(err, ConduitError::Json(_)));
    }

    #[test]
    fn test_clone_preserves_message() {
        let err: ConduitError = std::io::Error::other("disk full").into();
        let cloned = err.clone();
        assert_eq!(err.to_string(), cloned.to_string());
    }

    #[test]
    fn test_retryable() {
        assert!(ConduitError::ConnectionClosed("x".into()).is_retryable());
        assert!(ConduitError::Transport("x".into()).is_retryable());
        assert!(!ConduitError::HealthCheckFailed("x".into()).is_retryable());
        assert!(!ConduitError::LogWrite("x".into()).is_retryable());
    }
}
