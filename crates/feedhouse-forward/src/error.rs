//! Error types for aggregate forwarding.

use thiserror::Error;

/// Errors that can occur while delivering an aggregate.
#[derive(Debug, Error)]
pub enum ForwardError {
    /// Invalid or missing destination configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Local file I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An aggregate or rolled output could not be read or written.
    #[error("Container error: {0}")]
    Container(#[from] feedhouse_core::Error),

    /// Transport-level HTTP failure.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The destination answered but refused the aggregate.
    #[error("Destination '{destination}' rejected delivery: {reason}")]
    Rejected { destination: String, reason: String },

    /// A blocking file task panicked or was cancelled.
    #[error("Blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Result type alias for forwarding operations.
pub type Result<T> = std::result::Result<T, ForwardError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejected_display() {
        let err = ForwardError::Rejected {
            destination: "downstream".to_string(),
            reason: "HTTP 503".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Destination 'downstream' rejected delivery: HTTP 503"
        );
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: ForwardError = io.into();
        assert!(matches!(err, ForwardError::Io(_)));
    }
}
