//! Error types for the edge-relay core

use http::StatusCode;
use std::error::Error as _;
use thiserror::Error;

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;

/// Error types that can occur while driving a request through the core
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Configuration error: {0}")]
    Config(String),

    /// Translation, WAS or HTTP client spoke garbage on the wire
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Upstream server timed out")]
    Timeout,

    #[error("Upstream server failed: {0}")]
    SocketProtocol(String),

    /// `If-Match` mismatch on a file
    #[error("Precondition failed")]
    PreconditionFailed,

    /// `If-None-Match` or `If-Modified-Since` hit on a file
    #[error("Not modified")]
    NotModified,

    #[error("Not found")]
    NotFound,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Range outside the entity; carries the entity size for `Content-Range: bytes */N`
    #[error("Requested range not satisfiable (size {size})")]
    RangeNotSatisfiable { size: u64 },

    #[error("Method not allowed")]
    MethodNotAllowed { allow: &'static str },

    /// Spawn/child limits hit
    #[error("Resources exhausted: {0}")]
    ResourceExhausted(String),

    /// A handler short-circuits the request to a specific status
    #[error("{message}")]
    Message { status: StatusCode, message: String },

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayError {
    /// Short-circuit helper used by the request state machine
    pub fn message(status: StatusCode, message: impl Into<String>) -> Self {
        RelayError::Message {
            status,
            message: message.into(),
        }
    }

    /// Map this error to the HTTP status served to the client
    ///
    /// Low-level IO errors are classified by kind the same way the file
    /// handler classifies errno: the ENOENT family becomes 404, EACCES
    /// becomes 403, everything else 500.
    pub fn to_http_status(&self) -> StatusCode {
        match self {
            RelayError::Protocol(_) => StatusCode::BAD_GATEWAY,
            RelayError::Timeout => StatusCode::BAD_GATEWAY,
            RelayError::SocketProtocol(_) => StatusCode::BAD_GATEWAY,
            RelayError::PreconditionFailed => StatusCode::PRECONDITION_FAILED,
            RelayError::NotModified => StatusCode::NOT_MODIFIED,
            RelayError::NotFound => StatusCode::NOT_FOUND,
            RelayError::Forbidden(_) => StatusCode::FORBIDDEN,
            RelayError::RangeNotSatisfiable { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            RelayError::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
            RelayError::ResourceExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
            RelayError::Message { status, .. } => *status,
            RelayError::Io(e) => match e.kind() {
                std::io::ErrorKind::NotFound => StatusCode::NOT_FOUND,
                std::io::ErrorKind::PermissionDenied => StatusCode::FORBIDDEN,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            RelayError::Config(_) | RelayError::Cache(_) | RelayError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// The canonical short phrase served as the plain-text error body
    /// when `verbose_response` is disabled
    pub fn canonical_phrase(&self) -> &'static str {
        match self {
            RelayError::Protocol(_) => "Bad gateway",
            RelayError::Timeout => "Upstream server timed out",
            RelayError::SocketProtocol(_) => "Upstream server failed",
            RelayError::PreconditionFailed => "Precondition failed",
            RelayError::NotModified => "",
            RelayError::NotFound => "Not found",
            RelayError::Forbidden(_) => "Forbidden",
            RelayError::RangeNotSatisfiable { .. } => "Requested range not satisfiable",
            RelayError::MethodNotAllowed { .. } => "Method not allowed",
            RelayError::ResourceExhausted(_) => "Service unavailable",
            RelayError::Message { .. } => "",
            _ => "Internal server error",
        }
    }

    /// The full message chain, used when `verbose_response` is enabled
    pub fn verbose_message(&self) -> String {
        let mut out = self.to_string();
        let mut current: Option<&(dyn std::error::Error + 'static)> = self.source();
        while let Some(e) = current {
            out.push_str(": ");
            out.push_str(&e.to_string());
            current = e.source();
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            RelayError::Timeout.to_http_status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(RelayError::NotFound.to_http_status(), StatusCode::NOT_FOUND);
        assert_eq!(
            RelayError::RangeNotSatisfiable { size: 5 }.to_http_status(),
            StatusCode::RANGE_NOT_SATISFIABLE
        );
        assert_eq!(
            RelayError::message(StatusCode::TOO_MANY_REQUESTS, "slow down").to_http_status(),
            StatusCode::TOO_MANY_REQUESTS
        );
    }

    #[test]
    fn test_io_classification() {
        let e = RelayError::Io(std::io::Error::from(std::io::ErrorKind::NotFound));
        assert_eq!(e.to_http_status(), StatusCode::NOT_FOUND);

        let e = RelayError::Io(std::io::Error::from(std::io::ErrorKind::PermissionDenied));
        assert_eq!(e.to_http_status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn test_message_phrase() {
        let e = RelayError::message(StatusCode::BAD_GATEWAY, "Too many consecutive CHECK packets");
        assert_eq!(e.to_string(), "Too many consecutive CHECK packets");
    }
}
