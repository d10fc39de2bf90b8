//! rustls configuration for both legs of an intercepted tunnel
//!
//! The client-facing leg presents a leaf issued by the authority; the
//! upstream leg verifies the origin against webpki roots plus any extra
//! roots the operator trusts. Both sides negotiate TLS 1.2 or 1.3 using the aws-lc-rs provider. The
//! client-facing side only advertises `http/1.1`: the decrypted stream is
//! served by an HTTP/1.1 connection handler.

use crate::mitm::certificate_authority::LeafCertificateRecord;
use crate::mitm::error::{MitmError, Result};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::version::{TLS12, TLS13};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::sync::Arc;
use tracing::debug;
use webpki_roots::TLS_SERVER_ROOTS;

const ALPN_HTTP_1_1: &[u8] = b"http/1.1";

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}

/// Client-facing TLS config (proxy acts as server with an issued leaf)
pub struct ClientTlsConfig {
    config: Arc<ServerConfig>,
}

impl ClientTlsConfig {
    /// Build server config from DER certificate chain and key
    pub fn new(
        cert_chain: Vec<CertificateDer<'static>>,
        private_key: PrivateKeyDer<'static>,
    ) -> Result<Self> {
        let mut config = ServerConfig::builder_with_provider(provider())
            .with_protocol_versions(&[&TLS12, &TLS13])
            .map_err(|e| MitmError::tls_config(e.to_string()))?
            .with_no_client_auth()
            .with_single_cert(cert_chain, private_key)
            .map_err(|e| MitmError::tls_config(e.to_string()))?;

        config.alpn_protocols = vec![ALPN_HTTP_1_1.to_vec()];

        Ok(Self {
            config: Arc::new(config),
        })
    }

    /// Build server config presenting `leaf`
    pub fn from_leaf(leaf: &LeafCertificateRecord) -> Result<Self> {
        let cert_chain = parse_certificates(&leaf.certificate_pem)?;
        let private_key = parse_private_key(&leaf.private_key_pem)?;

        debug!(hosts = ?leaf.hostnames, "Client-facing TLS config created");
        Self::new(cert_chain, private_key)
    }

    pub fn server_config(&self) -> Arc<ServerConfig> {
        Arc::clone(&self.config)
    }
}

/// Trust store and protocol settings for `https:` destinations
#[derive(Clone)]
pub struct UpstreamTlsConfig {
    config: Arc<ClientConfig>,
}

impl UpstreamTlsConfig {
    /// Build client config trusting the Mozilla root bundle
    pub fn new() -> Result<Self> {
        Self::with_extra_roots(Vec::new())
    }

    /// Build client config trusting the Mozilla bundle plus `extra_roots`
    pub fn with_extra_roots(extra_roots: Vec<CertificateDer<'static>>) -> Result<Self> {
        let mut roots = RootCertStore::empty();
        roots.extend(TLS_SERVER_ROOTS.iter().cloned());

        let extra_count = extra_roots.len();
        let (added, ignored) = roots.add_parsable_certificates(extra_roots);
        if ignored > 0 {
            return Err(MitmError::tls_config(format!(
                "{} of {} extra root certificates could not be parsed",
                ignored, extra_count
            )));
        }

        let config = ClientConfig::builder_with_provider(provider())
            .with_protocol_versions(&[&TLS12, &TLS13])
            .map_err(|e| MitmError::tls_config(e.to_string()))?
            .with_root_certificates(roots)
            .with_no_client_auth();

        debug!(
            webpki_roots = TLS_SERVER_ROOTS.len(),
            extra_roots = added,
            "Upstream trust store ready"
        );

        Ok(Self {
            config: Arc::new(config),
        })
    }

    /// Build client config trusting the Mozilla bundle plus PEM-encoded roots
    pub fn with_extra_roots_pem(pem: &str) -> Result<Self> {
        Self::with_extra_roots(parse_certificates(pem)?)
    }

    pub fn client_config(&self) -> Arc<ClientConfig> {
        Arc::clone(&self.config)
    }
}

/// Server-name helpers for outbound handshakes
pub struct SniUtils;

impl SniUtils {
    /// DNS names become SNI; IP literals (bracketed or not) are verified
    /// against the certificate's iPAddress SAN and send no SNI
    pub fn parse_server_name(hostname: &str) -> Result<ServerName<'static>> {
        let bare = hostname.trim_start_matches('[').trim_end_matches(']');
        ServerName::try_from(bare.to_owned())
            .map_err(|e| MitmError::tls_config(format!("Invalid server name {}: {}", hostname, e)))
    }
}

/// Decode every certificate in a PEM bundle
pub fn parse_certificates(pem: &str) -> Result<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut pem.as_bytes())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| MitmError::tls_config(format!("Invalid certificate PEM: {}", e)))?;
    if certs.is_empty() {
        return Err(MitmError::tls_config("No certificate found in PEM"));
    }
    Ok(certs)
}

fn parse_private_key(pem: &str) -> Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut pem.as_bytes())
        .map_err(|e| MitmError::tls_config(format!("Invalid private key PEM: {}", e)))?
        .ok_or_else(|| MitmError::tls_config("No private key found in PEM"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mitm::certificate_authority::CertificateAuthority;

    #[test]
    fn test_server_name_dns_and_ip() {
        assert!(SniUtils::parse_server_name("example.com").is_ok());
        assert!(matches!(
            SniUtils::parse_server_name("192.168.1.1").unwrap(),
            ServerName::IpAddress(_)
        ));
        assert!(matches!(
            SniUtils::parse_server_name("[::1]").unwrap(),
            ServerName::IpAddress(_)
        ));
        assert!(SniUtils::parse_server_name("").is_err());
    }

    #[test]
    fn test_upstream_default_roots() {
        assert!(UpstreamTlsConfig::new().is_ok());
    }

    #[test]
    fn test_upstream_rejects_garbage_pem() {
        assert!(UpstreamTlsConfig::with_extra_roots_pem("not a certificate").is_err());
    }

    #[tokio::test]
    async fn test_client_facing_config_from_issued_leaf() {
        let ca = CertificateAuthority::initialize().await.unwrap();
        let leaf = ca.leaf_for_host("example.com").await.unwrap();

        let config = ClientTlsConfig::from_leaf(&leaf).unwrap();
        assert_eq!(
            config.server_config().alpn_protocols,
            vec![b"http/1.1".to_vec()]
        );

        // The root itself is a valid extra trust anchor upstream.
        assert!(UpstreamTlsConfig::with_extra_roots_pem(ca.root_certificate_pem()).is_ok());
    }
}
