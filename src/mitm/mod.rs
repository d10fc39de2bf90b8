//! MITM (Man-in-the-Middle) interception module
//!
//! This module provides TLS interception for CONNECT tunnels.
//! It includes:
//! - Certificate Authority: root lifecycle and per-host leaf issuance
//! - Leaf cache with a per-host issuance lock
//! - Root persistence behind a store interface
//! - TLS configuration (client-facing and upstream)
//! - The CONNECT interceptor state machine

pub mod cert_cache;
pub mod cert_store;
pub mod certificate_authority;
pub mod error;
pub mod interceptor;
pub mod tls_config;

// Re-export main types
pub use cert_cache::LeafCache;
pub use cert_store::{CertificateStore, FileCertificateStore, StoredRoot};
pub use certificate_authority::{
    CacheStats, CertificateAuthority, LeafCertificateRecord, RootIdentity,
};
pub use error::MitmError;
pub use interceptor::{parse_authority, ConnectInterceptor, ConnectSession, ConnectState, InterceptMode};
pub use tls_config::{ClientTlsConfig, SniUtils, UpstreamTlsConfig};
