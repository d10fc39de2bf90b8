//! Proxy instance - wires the listener to the forwarder and the interceptor
//!
//! Every piece of state (listener handle, authority, leaf cache) lives inside
//! the [`Proxy`] value, so several proxies can run side by side in one
//! process.

use crate::config::Config;
use crate::forwarder::RequestForwarder;
use crate::listener::{handler, ListenOptions, Listener, ListenerError};
use crate::mitm::certificate_authority::CertificateAuthority;
use crate::mitm::error::MitmError;
use crate::mitm::interceptor::{ConnectInterceptor, InterceptMode};
use crate::mitm::tls_config::UpstreamTlsConfig;
use crate::transport::{PlainTransport, Transports};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Construction parameters for a [`Proxy`]
#[derive(Clone)]
pub struct ProxyOptions {
    pub listen: ListenOptions,
    /// Interception is enabled by providing an authority
    pub authority: Option<Arc<CertificateAuthority>>,
    pub upstream_tls: UpstreamTlsConfig,
    pub connect_timeout: Duration,
}

impl ProxyOptions {
    /// Transparent-tunnel proxy on `localhost` with an ephemeral port
    pub fn new() -> Result<Self, MitmError> {
        Ok(Self {
            listen: ListenOptions::default(),
            authority: None,
            upstream_tls: UpstreamTlsConfig::new()?,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        })
    }

    /// Options derived from `config`; the authority is attached separately
    pub fn from_config(config: &Config, upstream_tls: UpstreamTlsConfig) -> Self {
        Self {
            listen: config.listen_options(),
            authority: None,
            upstream_tls,
            connect_timeout: config.connect_timeout(),
        }
    }

    pub fn with_listen(mut self, hostname: impl Into<String>, port: u16) -> Self {
        self.listen = ListenOptions {
            hostname: hostname.into(),
            port,
        };
        self
    }

    pub fn with_authority(mut self, authority: Arc<CertificateAuthority>) -> Self {
        self.authority = Some(authority);
        self
    }

    pub fn with_upstream_tls(mut self, upstream_tls: UpstreamTlsConfig) -> Self {
        self.upstream_tls = upstream_tls;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

/// A forward proxy instance
pub struct Proxy {
    listener: Listener,
    authority: Option<Arc<CertificateAuthority>>,
}

impl Proxy {
    pub fn new(options: ProxyOptions) -> Self {
        let forwarder = RequestForwarder::new(Transports::new(
            &options.upstream_tls,
            options.connect_timeout,
        ));
        let mode = match &options.authority {
            Some(ca) => InterceptMode::Intercept(Arc::clone(ca)),
            None => InterceptMode::Transparent,
        };
        let interceptor = ConnectInterceptor::new(
            mode,
            forwarder.clone(),
            PlainTransport::new(options.connect_timeout),
        );
        debug!(intercept_tls = interceptor.is_intercepting(), "Proxy assembled");

        let on_request = handler(move |req| {
            let forwarder = forwarder.clone();
            async move { Ok(forwarder.forward(req, "http:", None).await) }
        });
        let on_connect = handler(move |req| {
            let interceptor = interceptor.clone();
            async move { interceptor.handle(req).await }
        });

        Self {
            listener: Listener::new(options.listen, on_request, on_connect),
            authority: options.authority,
        }
    }

    /// Bind and start serving
    pub async fn listen(&self) -> Result<SocketAddr, ListenerError> {
        let addr = self.listener.listen().await?;
        info!(
            address = %addr,
            intercept_tls = self.authority.is_some(),
            "Proxy listening"
        );
        Ok(addr)
    }

    /// Stop accepting connections
    pub async fn close(&self) {
        self.listener.close().await;
    }

    /// `http://hostname:port`, `None` before `listen()`
    pub fn url(&self) -> Option<String> {
        self.listener.url()
    }

    pub fn hostname(&self) -> &str {
        self.listener.hostname()
    }

    /// Bound port, `None` before `listen()`
    pub fn port(&self) -> Option<u16> {
        self.listener.port()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr()
    }

    /// Authority used for interception, if enabled
    pub fn authority(&self) -> Option<&Arc<CertificateAuthority>> {
        self.authority.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_defaults() {
        let proxy = Proxy::new(ProxyOptions::new().unwrap());
        assert_eq!(proxy.hostname(), "localhost");
        assert_eq!(proxy.port(), None);
        assert!(proxy.authority().is_none());
    }

    #[tokio::test]
    async fn test_instances_coexist() {
        let first = Proxy::new(ProxyOptions::new().unwrap().with_listen("127.0.0.1", 0));
        let second = Proxy::new(ProxyOptions::new().unwrap().with_listen("127.0.0.1", 0));

        let a = first.listen().await.unwrap();
        let b = second.listen().await.unwrap();
        assert_ne!(a.port(), b.port());

        first.close().await;
        assert_eq!(first.port(), None);
        assert_eq!(second.port(), Some(b.port()));
        second.close().await;
    }

    #[test]
    fn test_options_from_config() {
        let config = Config {
            host: "0.0.0.0".to_string(),
            port: 8089,
            connect_timeout_seconds: 3,
            ..Config::default()
        };
        let options = ProxyOptions::from_config(&config, UpstreamTlsConfig::new().unwrap());
        assert_eq!(options.listen.port, 8089);
        assert_eq!(options.connect_timeout, Duration::from_secs(3));
        assert!(options.authority.is_none());
    }
}
