//! Transport error types.

use std::time::Duration;

/// Transport errors.
///
/// Plain request/response calls never surface these: they resolve to a status
/// (0 for no response). Only opening a push stream can fail with one.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The server answered the stream request with a non-success status.
    #[error("HTTP error: {status} - {message}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body or reason.
        message: String,
    },

    /// Opening the stream did not complete in time.
    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    /// Stream framing was invalid.
    #[error("SSE error: {0}")]
    Sse(String),

    /// A pending frame grew beyond the allowed size.
    #[error("Buffer overflow: {size} bytes exceeds limit of {limit}")]
    BufferOverflow {
        /// Current size.
        size: usize,
        /// Maximum allowed size.
        limit: usize,
    },

    /// URL could not be built.
    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    /// HTTP client error.
    #[error("HTTP client error: {0}")]
    Reqwest(#[from] reqwest::Error),
}

impl TransportError {
    /// HTTP-equivalent status for outcome classification (0 when no response).
    #[must_use]
    pub const fn status(&self) -> u16 {
        match self {
            Self::Status { status, .. } => *status,
            _ => 0,
        }
    }
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_display() {
        let err = TransportError::Status {
            status: 503,
            message: "busy".into(),
        };
        assert_eq!(err.to_string(), "HTTP error: 503 - busy");
        assert_eq!(err.status(), 503);
    }

    #[test]
    fn timeout_has_no_status() {
        let err = TransportError::Timeout(Duration::from_secs(8));
        assert_eq!(err.to_string(), "Timeout after 8s");
        assert_eq!(err.status(), 0);
    }

    #[test]
    fn overflow_display() {
        let err = TransportError::BufferOverflow {
            size: 70_000,
            limit: 65_536,
        };
        assert_eq!(
            err.to_string(),
            "Buffer overflow: 70000 bytes exceeds limit of 65536"
        );
    }
}
