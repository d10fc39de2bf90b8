//! Proxy error taxonomy and its mapping onto HTTP responses

use crate::mitm::error::MitmError;
use http::StatusCode;
use thiserror::Error;

/// Errors raised while forwarding a request or establishing a tunnel
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Request-target or scheme cannot be resolved
    #[error("Malformed input: {0}")]
    MalformedInput(String),

    /// Header that must be singular appeared more than once
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Effective target scheme is neither `http:` nor `https:`
    #[error("Unsupported scheme: {0}")]
    UnsupportedScheme(String),

    /// DNS, connect, or handshake failure towards the true destination
    #[error("Upstream connection to {target} failed: {reason}")]
    UpstreamConnect { target: String, reason: String },

    /// Leaf issuance failed during interception
    #[error("Certificate issuance failed: {0}")]
    CertificateIssuance(#[from] MitmError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedInput(msg.into())
    }

    pub fn upstream(target: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::UpstreamConnect {
            target: target.into(),
            reason: reason.to_string(),
        }
    }

    /// Status surfaced to the client when no response headers were sent yet
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::MalformedInput(_)
            | ProxyError::ProtocolViolation(_)
            | ProxyError::UnsupportedScheme(_) => StatusCode::BAD_REQUEST,
            ProxyError::UpstreamConnect { .. } => StatusCode::BAD_GATEWAY,
            ProxyError::CertificateIssuance(_) | ProxyError::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Plain-text response body
    pub fn response_message(&self) -> String {
        match self {
            ProxyError::MalformedInput(msg) => format!("Bad request: {}", msg),
            ProxyError::ProtocolViolation(msg) => format!("Bad request: {}", msg),
            ProxyError::UnsupportedScheme(scheme) => {
                format!("Bad request: unsupported scheme {}", scheme)
            }
            ProxyError::UpstreamConnect { target, .. } => {
                format!("Bad gateway: could not reach {}", target)
            }
            ProxyError::CertificateIssuance(_) | ProxyError::Io(_) => {
                "Internal proxy error".to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ProxyError::malformed("no colon").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ProxyError::ProtocolViolation("Duplicate Host header".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ProxyError::UnsupportedScheme("ftp:".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ProxyError::upstream("localhost:1", "connection refused").status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ProxyError::from(MitmError::NoHosts).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_messages_name_the_cause() {
        assert!(ProxyError::UnsupportedScheme("ftp:".into())
            .response_message()
            .contains("ftp:"));
        assert!(
            ProxyError::ProtocolViolation("Duplicate Content-Length header".into())
                .response_message()
                .contains("Content-Length")
        );
        // Upstream detail stays in the logs.
        let err = ProxyError::upstream("db.internal:5432", "connection refused");
        assert!(!err.response_message().contains("refused"));
        assert!(err.to_string().contains("refused"));
    }
}
