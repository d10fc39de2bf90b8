//! Tapwire - Forward HTTP proxy with on-the-fly TLS interception
//!
//! Tapwire relays plain HTTP requests to their effective target and handles
//! `CONNECT` tunnels either as a raw byte relay or by terminating TLS with
//! leaf certificates issued on demand by a private certificate authority.
//!
//! ## Features
//!
//! - **Forwarding**: absolute-form, origin-form and asterisk-form request
//!   targets, hop-by-hop stripping, streamed bodies in both directions
//! - **Request smuggling guard**: duplicated `Host` / `Content-Length` rejected
//! - **CONNECT tunnels**: transparent relay with early-data replay
//! - **Interception**: SNI-driven leaf selection, cached per hostname
//! - **Certificate Authority**: RSA-2048 root and leaves, optional persistence
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tapwire::{CertificateAuthority, Proxy, ProxyOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let ca = Arc::new(CertificateAuthority::initialize().await?);
//!     println!("{}", ca.root_certificate_pem());
//!
//!     let proxy = Proxy::new(ProxyOptions::new()?.with_authority(ca));
//!     proxy.listen().await?;
//!     println!("Listening on {:?}", proxy.url());
//!
//!     tokio::signal::ctrl_c().await?;
//!     proxy.close().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - `headers` - header normalization and hop-by-hop handling
//! - `effective_uri` - request-target resolution
//! - `transport` - plain and TLS outbound transports
//! - `forwarder` - the plain HTTP proxy path
//! - `head_audit` - raw request-head audit under hyper's parser
//! - `listener` - bind / accept / dispatch / close
//! - `proxy` - the assembled proxy instance
//! - `mitm` - certificate authority and CONNECT interception

// Core proxy modules
pub mod body;
pub mod config;
pub mod effective_uri;
pub mod error;
pub mod forwarder;
pub mod head_audit;
pub mod headers;
pub mod listener;
pub mod proxy;
pub mod transport;

// TLS interception
pub mod mitm;

// Re-export commonly used types

/// Configuration types
pub use config::Config;

/// Errors
pub use error::ProxyError;

/// Proxy assembly
pub use proxy::{Proxy, ProxyOptions};

/// Forwarding building blocks
pub use effective_uri::{resolve as resolve_effective_uri, EffectiveRequestTarget};
pub use forwarder::{OutboundRequestSpec, RequestForwarder};
pub use headers::NormalizedHeaderMap;
pub use listener::{ListenOptions, Listener, ListenerError};
pub use transport::{OutboundTransport, PlainTransport, TlsTransport, Transports};

/// MITM types and functionality
pub use mitm::{
    CacheStats, CertificateAuthority, CertificateStore, ConnectInterceptor, ConnectState,
    FileCertificateStore, LeafCertificateRecord, MitmError, RootIdentity, UpstreamTlsConfig,
};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
        assert_eq!(NAME, "tapwire");
    }
}
