//! Shared fixtures for integration tests.
#![allow(dead_code)]

use bytes::Bytes;
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tapwire::mitm::{CertificateAuthority, ClientTlsConfig, UpstreamTlsConfig};
use tapwire::{Proxy, ProxyOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;

/// Stub origin server answering `"Hello " + body` (trimmed)
///
/// The response also lists the request header names it received in
/// `x-received-headers` and the `Host` value in `x-received-host`.
pub struct BackendServer {
    addr: SocketAddr,
    connections: Arc<AtomicUsize>,
}

impl BackendServer {
    pub async fn start() -> Self {
        Self::start_inner(None).await
    }

    /// Same stub behind TLS, presenting `leaf_hosts` signed by `ca`
    pub async fn start_tls(ca: &CertificateAuthority, leaf_hosts: &[&str]) -> Self {
        let hosts: Vec<String> = leaf_hosts.iter().map(|h| h.to_string()).collect();
        let leaf = ca.issue_for_hosts(hosts).await.unwrap();
        let acceptor = TlsAcceptor::from(ClientTlsConfig::from_leaf(&leaf).unwrap().server_config());
        Self::start_inner(Some(acceptor)).await
    }

    async fn start_inner(tls: Option<TlsAcceptor>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connections = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&connections);

        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                let tls = tls.clone();
                tokio::spawn(async move {
                    match tls {
                        Some(acceptor) => {
                            if let Ok(stream) = acceptor.accept(socket).await {
                                serve_hello(stream).await;
                            }
                        }
                        None => serve_hello(socket).await,
                    }
                });
            }
        });

        Self { addr, connections }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// `localhost:port`
    pub fn host_and_port(&self) -> String {
        format!("localhost:{}", self.port())
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.host_and_port())
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

async fn serve_hello<S>(stream: S)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let _ = hyper::server::conn::http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service_fn(hello))
        .await;
}

async fn hello(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    let names: Vec<String> = req.headers().keys().map(|k| k.to_string()).collect();
    let host = req
        .headers()
        .get(http::header::HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let body = req
        .into_body()
        .collect()
        .await
        .map(|b| b.to_bytes())
        .unwrap_or_default();

    let text = format!("Hello {}", String::from_utf8_lossy(&body));
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/plain")
        .header("x-received-headers", names.join(","))
        .header("x-received-host", host)
        .body(Full::new(Bytes::from(text.trim().to_string())))
        .unwrap())
}

/// Raw TCP server echoing every byte back
pub async fn start_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

/// A port with nothing listening on it
pub async fn unused_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

/// Proxy on 127.0.0.1 with an ephemeral port, already listening
pub async fn start_proxy(options: ProxyOptions) -> Proxy {
    let proxy = Proxy::new(
        options
            .with_listen("127.0.0.1", 0)
            .with_connect_timeout(Duration::from_secs(5)),
    );
    proxy.listen().await.unwrap();
    proxy
}

/// Proxy trusting `backend_ca` upstream and intercepting with `proxy_ca`
pub async fn start_intercepting_proxy(
    proxy_ca: Arc<CertificateAuthority>,
    backend_ca: &CertificateAuthority,
) -> Proxy {
    let upstream = UpstreamTlsConfig::with_extra_roots_pem(backend_ca.root_certificate_pem()).unwrap();
    start_proxy(
        ProxyOptions::new()
            .unwrap()
            .with_upstream_tls(upstream)
            .with_authority(proxy_ca),
    )
    .await
}

/// Response head plus the fully read body
pub struct ResponseWithBody {
    pub response: http::response::Parts,
    pub body: Bytes,
}

/// Perform one request over `stream` and read the whole body
pub async fn send_request<S>(stream: S, request: Request<Full<Bytes>>) -> ResponseWithBody
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .unwrap();
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let response = sender.send_request(request).await.unwrap();
    let (parts, body) = response.into_parts();
    let body = body.collect().await.unwrap().to_bytes();
    ResponseWithBody {
        response: parts,
        body,
    }
}

/// Perform one request through the proxy at `proxy` (absolute-form URI)
pub async fn http_request(
    proxy: SocketAddr,
    method: &str,
    url: &str,
    body: &str,
) -> ResponseWithBody {
    let stream = TcpStream::connect(proxy).await.unwrap();
    let uri: http::Uri = url.parse().unwrap();
    let host = uri.authority().unwrap().to_string();
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header(http::header::HOST, host)
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap();
    send_request(stream, request).await
}

/// Write raw bytes and read until the peer closes
pub async fn raw_exchange(addr: SocketAddr, request: &[u8]) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request).await.unwrap();
    let mut response = Vec::new();
    let _ = tokio::time::timeout(Duration::from_secs(10), stream.read_to_end(&mut response)).await;
    String::from_utf8_lossy(&response).to_string()
}

/// Send `CONNECT authority` (plus `early_data`) and read the response head
pub async fn open_tunnel(
    proxy: SocketAddr,
    authority: &str,
    early_data: &[u8],
) -> (TcpStream, String) {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    let mut request = format!(
        "CONNECT {} HTTP/1.1\r\nHost: {}\r\n\r\n",
        authority, authority
    )
    .into_bytes();
    request.extend_from_slice(early_data);
    stream.write_all(&request).await.unwrap();

    let head = read_head(&mut stream).await;
    (stream, head)
}

/// Read byte by byte up to and including the blank line ending a response head
pub async fn read_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte).await {
            Ok(0) | Err(_) => break,
            Ok(_) => head.push(byte[0]),
        }
    }
    String::from_utf8_lossy(&head).to_string()
}

/// rustls client config trusting only `ca`'s root
pub fn client_trusting(ca: &CertificateAuthority) -> Arc<rustls::ClientConfig> {
    let mut roots = rustls::RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut ca.root_certificate_pem().as_bytes()) {
        roots.add(cert.unwrap()).unwrap();
    }
    let mut config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::aws_lc_rs::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_root_certificates(roots)
    .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Arc::new(config)
}
