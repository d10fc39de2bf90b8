//! Outbound transports, selected by the effective target's scheme

use crate::error::ProxyError;
use crate::mitm::tls_config::{SniUtils, UpstreamTlsConfig};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::debug;

/// Byte stream to an upstream, plain or encrypted
pub trait UpstreamStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> UpstreamStream for T {}

pub type BoxedStream = Box<dyn UpstreamStream>;

/// Opens connections to the true destination
#[async_trait]
pub trait OutboundTransport: Send + Sync {
    /// Scheme this transport serves, with trailing colon
    fn scheme(&self) -> &'static str;

    async fn connect(&self, hostname: &str, port: u16) -> Result<BoxedStream, ProxyError>;
}

async fn connect_tcp(
    hostname: &str,
    port: u16,
    connect_timeout: Duration,
) -> Result<TcpStream, ProxyError> {
    let target = format!("{}:{}", hostname, port);
    let stream = timeout(connect_timeout, TcpStream::connect((hostname, port)))
        .await
        .map_err(|_| ProxyError::upstream(&target, "connect timed out"))?
        .map_err(|e| ProxyError::upstream(&target, e))?;
    stream.set_nodelay(true)?;
    debug!(upstream = %target, "Upstream TCP connected");
    Ok(stream)
}

/// `http:` - plain TCP
#[derive(Debug, Clone)]
pub struct PlainTransport {
    connect_timeout: Duration,
}

impl PlainTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl OutboundTransport for PlainTransport {
    fn scheme(&self) -> &'static str {
        "http:"
    }

    async fn connect(&self, hostname: &str, port: u16) -> Result<BoxedStream, ProxyError> {
        let stream = connect_tcp(hostname, port, self.connect_timeout).await?;
        Ok(Box::new(stream))
    }
}

/// `https:` - TCP plus a verified TLS handshake using the hostname as SNI
#[derive(Clone)]
pub struct TlsTransport {
    connector: TlsConnector,
    connect_timeout: Duration,
}

impl TlsTransport {
    pub fn new(upstream: &UpstreamTlsConfig, connect_timeout: Duration) -> Self {
        Self {
            connector: TlsConnector::from(upstream.client_config()),
            connect_timeout,
        }
    }
}

#[async_trait]
impl OutboundTransport for TlsTransport {
    fn scheme(&self) -> &'static str {
        "https:"
    }

    async fn connect(&self, hostname: &str, port: u16) -> Result<BoxedStream, ProxyError> {
        let target = format!("{}:{}", hostname, port);
        let server_name = SniUtils::parse_server_name(hostname)
            .map_err(|e| ProxyError::upstream(&target, e))?;

        let stream = connect_tcp(hostname, port, self.connect_timeout).await?;
        let tls_stream = timeout(self.connect_timeout, self.connector.connect(server_name, stream))
            .await
            .map_err(|_| ProxyError::upstream(&target, "TLS handshake timed out"))?
            .map_err(|e| ProxyError::upstream(&target, format!("TLS handshake failed: {}", e)))?;

        debug!(upstream = %target, "Upstream TLS established");
        Ok(Box::new(tls_stream))
    }
}

/// The two supported transports
#[derive(Clone)]
pub struct Transports {
    plain: PlainTransport,
    tls: TlsTransport,
}

impl Transports {
    pub fn new(upstream: &UpstreamTlsConfig, connect_timeout: Duration) -> Self {
        Self {
            plain: PlainTransport::new(connect_timeout),
            tls: TlsTransport::new(upstream, connect_timeout),
        }
    }

    /// Transport for `scheme` (`http:` or `https:`)
    pub fn select(&self, scheme: &str) -> Result<&dyn OutboundTransport, ProxyError> {
        match scheme {
            "http:" => Ok(&self.plain),
            "https:" => Ok(&self.tls),
            other => Err(ProxyError::UnsupportedScheme(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn transports() -> Transports {
        Transports::new(&UpstreamTlsConfig::new().unwrap(), Duration::from_secs(5))
    }

    #[test]
    fn test_select_by_scheme() {
        let transports = transports();
        assert_eq!(transports.select("http:").unwrap().scheme(), "http:");
        assert_eq!(transports.select("https:").unwrap().scheme(), "https:");
        match transports.select("ftp:") {
            Err(ProxyError::UnsupportedScheme(scheme)) => assert_eq!(scheme, "ftp:"),
            _ => panic!("ftp: must be rejected"),
        }
    }

    #[tokio::test]
    async fn test_plain_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"ping").await.unwrap();
        });

        let transports = transports();
        let mut stream = transports
            .select("http:")
            .unwrap()
            .connect("127.0.0.1", port)
            .await
            .unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_refused_connect_is_upstream_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let transports = transports();
        let result = transports.select("http:").unwrap().connect("127.0.0.1", port).await;
        assert!(matches!(result, Err(ProxyError::UpstreamConnect { .. })));
    }
}
