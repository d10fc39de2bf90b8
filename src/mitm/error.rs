//! MITM error types

use thiserror::Error;

/// Result type for MITM operations
pub type Result<T> = std::result::Result<T, MitmError>;

/// Errors raised by the certificate authority, its store and the TLS layer
#[derive(Error, Debug)]
pub enum MitmError {
    /// Root key pair or self-signed root certificate could not be produced
    #[error("Failed to generate CA certificate: {0}")]
    CaGenerationFailed(String),

    /// Persisted root could not be parsed
    #[error("Failed to load CA certificate: {0}")]
    CaLoadFailed(String),

    /// Leaf key generation or signing failed
    #[error("Failed to generate certificate for {domain}: {reason}")]
    CertGenerationFailed { domain: String, reason: String },

    /// Leaf requested without any host
    #[error("Certificate requested for an empty host list")]
    NoHosts,

    /// Certificate store could not be read or written
    #[error("Certificate store error: {0}")]
    StoreFailed(String),

    /// TLS configuration could not be built from the issued material
    #[error("TLS configuration failed: {0}")]
    TlsConfigFailed(String),

    /// Blocking issuance task was cancelled or panicked
    #[error("Certificate issuance task failed: {0}")]
    TaskFailed(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl MitmError {
    /// Create a CA generation error
    pub fn ca_generation(msg: impl Into<String>) -> Self {
        Self::CaGenerationFailed(msg.into())
    }

    /// Create a CA load error
    pub fn ca_load(msg: impl Into<String>) -> Self {
        Self::CaLoadFailed(msg.into())
    }

    /// Create a certificate generation error
    pub fn cert_generation(domain: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::CertGenerationFailed {
            domain: domain.into(),
            reason: msg.into(),
        }
    }

    /// Create a store error
    pub fn store(msg: impl Into<String>) -> Self {
        Self::StoreFailed(msg.into())
    }

    /// Create a TLS configuration error
    pub fn tls_config(msg: impl Into<String>) -> Self {
        Self::TlsConfigFailed(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cert_generation_message_names_domain() {
        let err = MitmError::cert_generation("example.com", "rng exhausted");
        assert_eq!(
            err.to_string(),
            "Failed to generate certificate for example.com: rng exhausted"
        );
    }
}
