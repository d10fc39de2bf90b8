//! Listener lifecycle - bind, accept, dispatch, close
//!
//! A [`Listener`] is built with exactly two handlers: one for `CONNECT`
//! requests and one for everything else. Each accepted connection is served
//! as HTTP/1.1 with upgrades enabled so CONNECT handlers can take over the
//! raw socket.
//!
//! Every connection is read through an [`AuditedStream`], so each request
//! reaches its handler with the [`RequestHeadAudit`] of its raw head.
//!
//! [`RequestHeadAudit`]: crate::head_audit::RequestHeadAudit
//!
//! A handler returning `Err` makes hyper drop the connection without writing
//! a response.

use crate::body::ProxyBody;
use crate::error::ProxyError;
use crate::head_audit::AuditedStream;
use http::{Method, Request, Response};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub type HandlerFuture =
    Pin<Box<dyn Future<Output = Result<Response<ProxyBody>, ProxyError>> + Send>>;

/// Request callback registered at construction time
pub type Handler = Arc<dyn Fn(Request<Incoming>) -> HandlerFuture + Send + Sync>;

/// Wrap an async closure as a [`Handler`]
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Request<Incoming>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response<ProxyBody>, ProxyError>> + Send + 'static,
{
    Arc::new(move |req| Box::pin(f(req)) as HandlerFuture)
}

/// Error type for listener operations
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("Failed to bind {address}: {source}")]
    Bind {
        address: String,
        source: std::io::Error,
    },

    #[error("Listener is already listening on {0}")]
    AlreadyListening(SocketAddr),
}

/// Where to listen; port 0 asks for an ephemeral port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenOptions {
    pub hostname: String,
    pub port: u16,
}

impl Default for ListenOptions {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            port: 0,
        }
    }
}

struct Running {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    accept_loop: JoinHandle<()>,
}

/// Accepts connections and dispatches requests to the registered handlers
pub struct Listener {
    options: ListenOptions,
    on_request: Handler,
    on_connect: Handler,
    running: Mutex<Option<Running>>,
}

impl Listener {
    pub fn new(options: ListenOptions, on_request: Handler, on_connect: Handler) -> Self {
        Self {
            options,
            on_request,
            on_connect,
            running: Mutex::new(None),
        }
    }

    /// Bind and start accepting; resolves once the socket accepts connections
    pub async fn listen(&self) -> Result<SocketAddr, ListenerError> {
        if let Some(addr) = self.local_addr() {
            return Err(ListenerError::AlreadyListening(addr));
        }

        let address = format!("{}:{}", self.options.hostname, self.options.port);
        let listener = TcpListener::bind((self.options.hostname.as_str(), self.options.port))
            .await
            .map_err(|source| ListenerError::Bind {
                address: address.clone(),
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| ListenerError::Bind {
            address: address.clone(),
            source,
        })?;

        info!(address = %local_addr, "Listener bound");

        let shutdown = CancellationToken::new();
        let accept_loop = tokio::spawn(accept_loop(
            listener,
            shutdown.clone(),
            Arc::clone(&self.on_request),
            Arc::clone(&self.on_connect),
        ));

        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = running.as_ref() {
            // Lost a race with a concurrent listen().
            shutdown.cancel();
            return Err(ListenerError::AlreadyListening(existing.local_addr));
        }
        *running = Some(Running {
            local_addr,
            shutdown,
            accept_loop,
        });

        Ok(local_addr)
    }

    /// Stop accepting and release the socket
    ///
    /// Connections already accepted keep running until they finish.
    pub async fn close(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        if let Some(running) = running {
            running.shutdown.cancel();
            if let Err(e) = running.accept_loop.await {
                warn!(error = %e, "Accept loop ended abnormally");
            }
            info!(address = %running.local_addr, "Listener closed");
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|running| running.local_addr)
    }

    /// Configured hostname
    pub fn hostname(&self) -> &str {
        &self.options.hostname
    }

    /// Bound port, `None` until `listen()` succeeds
    pub fn port(&self) -> Option<u16> {
        self.local_addr().map(|addr| addr.port())
    }

    /// `http://hostname:port`, `None` until `listen()` succeeds
    pub fn url(&self) -> Option<String> {
        self.port()
            .map(|port| format!("http://{}:{}", self.options.hostname, port))
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Ok(mut running) = self.running.lock() {
            if let Some(running) = running.take() {
                running.shutdown.cancel();
            }
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    shutdown: CancellationToken,
    on_request: Handler,
    on_connect: Handler,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(peer_addr = %peer, "Connection accepted");
                    tokio::spawn(serve_connection(
                        stream,
                        peer,
                        Arc::clone(&on_request),
                        Arc::clone(&on_connect),
                    ));
                }
                Err(e) => warn!(error = %e, "Failed to accept connection"),
            }
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    on_request: Handler,
    on_connect: Handler,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(peer_addr = %peer, error = %e, "Failed to set TCP_NODELAY");
    }

    let (stream, audits) = AuditedStream::new(stream);
    let service = service_fn(move |mut req: Request<Incoming>| {
        audits.attach_next(&mut req);
        if req.method() == Method::CONNECT {
            on_connect(req)
        } else {
            on_request(req)
        }
    });

    if let Err(e) = http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .serve_connection(TokioIo::new(stream), service)
        .with_upgrades()
        .await
    {
        debug!(peer_addr = %peer, error = %e, "Connection closed with error");
    }
}
