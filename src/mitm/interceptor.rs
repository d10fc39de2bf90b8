//! CONNECT Interceptor - tunnel establishment and TLS termination
//!
//! A `CONNECT host:port` request walks through
//! `TunnelRequested → Establishing → {Bridged | TlsTerminating} → Closed`:
//!
//! - **Transparent mode**: connect to the destination first, answer
//!   `200 Connection Established`, replay any bytes the client sent ahead of
//!   the response, then splice both sockets byte for byte.
//! - **Interception mode**: answer `200 Connection Established`, read the
//!   ClientHello to learn the SNI hostname, complete the handshake with a
//!   leaf issued for that hostname, and serve the decrypted HTTP/1.1 stream
//!   through the request forwarder with `https:` as the outbound scheme.
//!
//! Failures after the 200 has been sent close the connection: the client
//! already holds what it believes is a raw tunnel.

use crate::body::{empty, ProxyBody};
use crate::error::ProxyError;
use crate::forwarder::RequestForwarder;
use crate::head_audit::AuditedStream;
use crate::mitm::certificate_authority::CertificateAuthority;
use crate::mitm::tls_config::ClientTlsConfig;
use crate::transport::{OutboundTransport, PlainTransport};
use bytes::Bytes;
use http::{Request, Response, StatusCode};
use hyper::body::Incoming;
use hyper::ext::ReasonPhrase;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::LazyConfigAcceptor;
use tracing::{debug, info, warn};

const CONNECTION_ESTABLISHED: &[u8] = b"Connection Established";

/// Lifecycle of one CONNECT tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectState {
    TunnelRequested,
    Establishing,
    Bridged,
    TlsTerminating,
    Closed,
}

impl ConnectState {
    pub fn can_transition_to(self, next: ConnectState) -> bool {
        use ConnectState::*;
        matches!(
            (self, next),
            (TunnelRequested, Establishing)
                | (Establishing, Bridged)
                | (Establishing, TlsTerminating)
                | (_, Closed)
        ) && self != Closed
    }
}

impl fmt::Display for ConnectState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectState::TunnelRequested => "TUNNEL_REQUESTED",
            ConnectState::Establishing => "ESTABLISHING",
            ConnectState::Bridged => "BRIDGED",
            ConnectState::TlsTerminating => "TLS_TERMINATING",
            ConnectState::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

/// One CONNECT tunnel and its current state
#[derive(Debug)]
pub struct ConnectSession {
    authority: String,
    host: String,
    port: u16,
    state: ConnectState,
}

impl ConnectSession {
    pub fn new(authority: &str) -> Result<Self, ProxyError> {
        let (host, port) = parse_authority(authority).map_err(ProxyError::MalformedInput)?;
        Ok(Self {
            authority: authority.to_string(),
            host,
            port,
            state: ConnectState::TunnelRequested,
        })
    }

    pub fn state(&self) -> ConnectState {
        self.state
    }

    /// Hostname without IPv6 brackets
    pub fn hostname(&self) -> &str {
        self.host.trim_start_matches('[').trim_end_matches(']')
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }

    fn transition(&mut self, next: ConnectState) {
        if !self.state.can_transition_to(next) {
            debug!(
                target_host = %self.authority,
                from = %self.state,
                to = %next,
                "Ignoring invalid tunnel transition"
            );
            return;
        }
        debug!(target_host = %self.authority, from = %self.state, to = %next, "Tunnel state");
        self.state = next;
    }
}

/// How CONNECT tunnels are handled
#[derive(Clone)]
pub enum InterceptMode {
    /// Raw byte relay to the destination
    Transparent,
    /// Terminate TLS with leaves from this authority
    Intercept(Arc<CertificateAuthority>),
}

/// Handles CONNECT requests
#[derive(Clone)]
pub struct ConnectInterceptor {
    mode: InterceptMode,
    forwarder: RequestForwarder,
    tunnel_transport: PlainTransport,
}

impl ConnectInterceptor {
    pub fn new(
        mode: InterceptMode,
        forwarder: RequestForwarder,
        tunnel_transport: PlainTransport,
    ) -> Self {
        Self {
            mode,
            forwarder,
            tunnel_transport,
        }
    }

    pub fn is_intercepting(&self) -> bool {
        matches!(self.mode, InterceptMode::Intercept(_))
    }

    /// Answer a CONNECT request
    ///
    /// An `Err` means the connection is closed without a response.
    pub async fn handle(&self, req: Request<Incoming>) -> Result<Response<ProxyBody>, ProxyError> {
        let authority = req
            .uri()
            .authority()
            .map(|a| a.as_str().to_string())
            .ok_or_else(|| ProxyError::malformed("CONNECT requires a host:port authority"))?;

        let mut session = ConnectSession::new(&authority).map_err(|e| {
            warn!(target_host = %authority, error = %e, "Invalid CONNECT authority");
            e
        })?;
        info!(target_host = %authority, "CONNECT from client");
        session.transition(ConnectState::Establishing);

        match &self.mode {
            InterceptMode::Transparent => self.establish_tunnel(req, session).await,
            InterceptMode::Intercept(ca) => {
                let ca = Arc::clone(ca);
                let forwarder = self.forwarder.clone();
                tokio::spawn(async move {
                    match hyper::upgrade::on(req).await {
                        Ok(upgraded) => {
                            if let Err(e) =
                                terminate_tls(upgraded, &mut session, &ca, &forwarder).await
                            {
                                warn!(target_host = %session.authority, error = %e, "Interception failed");
                            }
                        }
                        Err(e) => {
                            warn!(target_host = %session.authority, error = %e, "Upgrade failed")
                        }
                    }
                    session.transition(ConnectState::Closed);
                });
                Ok(connection_established())
            }
        }
    }

    async fn establish_tunnel(
        &self,
        req: Request<Incoming>,
        mut session: ConnectSession,
    ) -> Result<Response<ProxyBody>, ProxyError> {
        let upstream = self
            .tunnel_transport
            .connect(session.hostname(), session.port())
            .await
            .map_err(|e| {
                warn!(target_host = %session.authority, error = %e, "Tunnel connect failed");
                e
            })?;
        info!(target_host = %session.authority, "Connected to upstream");

        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    session.transition(ConnectState::Bridged);
                    match splice(upgraded, upstream).await {
                        Ok((bytes_up, bytes_down)) => info!(
                            target_host = %session.authority,
                            bytes_up,
                            bytes_down,
                            "Tunnel completed"
                        ),
                        Err(e) => {
                            debug!(target_host = %session.authority, error = %e, "Tunnel closed with error")
                        }
                    }
                }
                Err(e) => warn!(target_host = %session.authority, error = %e, "Upgrade failed"),
            }
            session.transition(ConnectState::Closed);
        });

        Ok(connection_established())
    }
}

/// `200 Connection Established` with an empty body
fn connection_established() -> Response<ProxyBody> {
    let mut response = Response::new(empty());
    *response.status_mut() = StatusCode::OK;
    response
        .extensions_mut()
        .insert(ReasonPhrase::from_static(CONNECTION_ESTABLISHED));
    response
}

/// Relay bytes both ways until either side closes
///
/// Bytes the client pipelined behind the CONNECT request are written to the
/// destination before anything else.
async fn splice<U>(upgraded: Upgraded, mut upstream: U) -> std::io::Result<(u64, u64)>
where
    U: AsyncRead + AsyncWrite + Unpin,
{
    match upgraded.downcast::<TokioIo<AuditedStream<TcpStream>>>() {
        Ok(parts) => {
            let early_data: Bytes = parts.read_buf;
            if !early_data.is_empty() {
                debug!(bytes = early_data.len(), "Replaying early data");
                upstream.write_all(&early_data).await?;
            }
            let mut client = parts.io.into_inner().into_inner();
            let (up, down) = tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
            Ok((up + early_data.len() as u64, down))
        }
        // Any other transport replays its buffered bytes on read.
        Err(upgraded) => {
            let mut client = TokioIo::new(upgraded);
            tokio::io::copy_bidirectional(&mut client, &mut upstream).await
        }
    }
}

/// Terminate TLS on the upgraded stream and serve the decrypted requests
async fn terminate_tls(
    upgraded: Upgraded,
    session: &mut ConnectSession,
    ca: &CertificateAuthority,
    forwarder: &RequestForwarder,
) -> Result<(), ProxyError> {
    let acceptor = LazyConfigAcceptor::new(
        rustls::server::Acceptor::default(),
        TokioIo::new(upgraded),
    );
    let start = acceptor.await?;

    // IP-literal destinations carry no SNI.
    let server_name = start
        .client_hello()
        .server_name()
        .map(str::to_string)
        .unwrap_or_else(|| session.hostname().to_string());
    debug!(target_host = %session.authority, sni = %server_name, "ClientHello received");

    let leaf = ca.leaf_for_host(&server_name).await?;
    let tls_config = ClientTlsConfig::from_leaf(&leaf)?;
    let tls_stream = start.into_stream(tls_config.server_config()).await?;

    session.transition(ConnectState::TlsTerminating);
    info!(target_host = %session.authority, sni = %server_name, "TLS terminated");

    let (tls_stream, audits) = AuditedStream::new(tls_stream);
    let authority = session.authority.clone();
    let forwarder = forwarder.clone();
    let service = service_fn(move |mut req: Request<Incoming>| {
        audits.attach_next(&mut req);
        let forwarder = forwarder.clone();
        let authority = authority.clone();
        async move {
            Ok::<_, Infallible>(forwarder.forward(req, "https:", Some(&authority)).await)
        }
    });

    if let Err(e) = http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .serve_connection(TokioIo::new(tls_stream), service)
        .await
    {
        debug!(target_host = %session.authority, error = %e, "Intercepted connection closed with error");
    }

    info!(target_host = %session.authority, "Interception completed");
    Ok(())
}

/// Parse and validate CONNECT authority (host:port)
///
/// IPv6 literals keep their brackets: `[::1]:443` → (`[::1]`, 443).
pub fn parse_authority(authority: &str) -> Result<(String, u16), String> {
    let (host, port_str) = authority
        .rsplit_once(':')
        .ok_or_else(|| "Authority must be in host:port format".to_string())?;

    if host.is_empty() || host == "[]" {
        return Err("Host cannot be empty".to_string());
    }
    if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
        return Err("IPv6 hosts must be bracketed".to_string());
    }

    let port: u16 = port_str.parse().map_err(|_| {
        format!(
            "Invalid port '{}': must be a number between 1 and 65535",
            port_str
        )
    })?;
    if port == 0 {
        return Err("Invalid port: must be between 1 and 65535".to_string());
    }

    Ok((host.to_string(), port))
}
