/// Error types for the notification and messaging core
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RealtimeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Request error: {0}")]
    Request(String),

    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Push channel unavailable")]
    PushUnavailable,
}

impl RealtimeError {
    /// Whether re-invoking the failed operation may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            RealtimeError::Io(_)
            | RealtimeError::Transport(_)
            | RealtimeError::Request(_)
            | RealtimeError::Timeout(_) => true,
            RealtimeError::Http { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, RealtimeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(RealtimeError::Timeout("slow".into()).is_retryable());
        assert!(RealtimeError::Http { status: 503, body: String::new() }.is_retryable());
        assert!(!RealtimeError::Http { status: 404, body: String::new() }.is_retryable());
        assert!(!RealtimeError::Validation("empty".into()).is_retryable());
    }
}
