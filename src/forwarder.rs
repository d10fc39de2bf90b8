//! Request forwarding - the plain HTTP proxy path
//!
//! One inbound request becomes one outbound connection:
//!
//! 1. Normalize headers, reject duplicated `Host` / `Content-Length`
//! 2. Resolve the effective target from request-target + `Host`
//! 3. Build an [`OutboundRequestSpec`] (hop-by-hop stripped, `Host` rewritten)
//! 4. Pick the transport by scheme and connect
//! 5. Stream the request body out and the response body back
//!
//! Inbound and outbound lifetimes are linked through a cancellation token:
//! the outbound connection task lives exactly as long as the inbound side
//! still wants the response.

use crate::body::{text_response, ProxyBody};
use crate::effective_uri::{self, EffectiveRequestTarget};
use crate::error::ProxyError;
use crate::head_audit::RequestHeadAudit;
use crate::headers::{is_hop_by_hop, strip_hop_by_hop, NormalizedHeaderMap};
use crate::transport::Transports;
use http::header::{HeaderMap, HeaderName, HOST};
use http::{Extensions, HeaderValue, Method, Request, Response, Uri};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Everything needed to issue the outbound request
#[derive(Debug, Clone)]
pub struct OutboundRequestSpec {
    /// `http:` or `https:`
    pub scheme: String,
    /// Value of the outbound `Host` header
    pub host: String,
    pub hostname: String,
    pub port: u16,
    /// Origin-form request-target
    pub path: String,
    pub method: Method,
    pub headers: HeaderMap,
}

impl OutboundRequestSpec {
    /// Derive the outbound request from normalized inbound headers and the resolved target
    pub fn build(
        method: &Method,
        inbound: &NormalizedHeaderMap,
        target: &EffectiveRequestTarget,
    ) -> Result<Self, ProxyError> {
        let port = target
            .port
            .ok_or_else(|| ProxyError::UnsupportedScheme(target.scheme.clone()))?;

        let nominated = inbound.connection_tokens();
        let mut headers = HeaderMap::with_capacity(inbound.len());
        for (name, values) in inbound.iter() {
            if name == HOST.as_str() || is_hop_by_hop(name) || nominated.iter().any(|t| t == name)
            {
                continue;
            }
            let header = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| ProxyError::malformed(format!("Invalid header name {}", name)))?;
            for value in values {
                headers.append(header.clone(), value.clone());
            }
        }

        let host = HeaderValue::from_str(&target.host)
            .map_err(|_| ProxyError::malformed(format!("Invalid host {}", target.host)))?;
        headers.insert(HOST, host);

        Ok(Self {
            scheme: target.scheme.clone(),
            host: target.host.clone(),
            hostname: target.hostname.clone(),
            port,
            path: target.path.clone(),
            method: method.clone(),
            headers,
        })
    }

    /// Outbound request carrying `body`
    ///
    /// `extensions` carries hyper's header-case map across, so names go out
    /// with the casing they arrived with.
    pub fn into_request<B>(self, body: B, extensions: Extensions) -> Result<Request<B>, ProxyError> {
        let uri: Uri = self
            .path
            .parse()
            .map_err(|_| ProxyError::malformed(format!("Invalid path {}", self.path)))?;

        let mut request = Request::new(body);
        *request.method_mut() = self.method;
        *request.uri_mut() = uri;
        *request.headers_mut() = self.headers;
        *request.extensions_mut() = extensions;
        Ok(request)
    }
}

/// Forwards non-CONNECT requests to their effective target
#[derive(Clone)]
pub struct RequestForwarder {
    transports: Arc<Transports>,
}

impl RequestForwarder {
    pub fn new(transports: Transports) -> Self {
        Self {
            transports: Arc::new(transports),
        }
    }

    /// Forward `req`, mapping every failure onto a response
    ///
    /// `scheme` is the scheme the request arrived over (`http:` on the proxy
    /// listener, `https:` inside an intercepted tunnel). `fallback_host`
    /// stands in for a missing `Host` header.
    pub async fn forward(
        &self,
        req: Request<Incoming>,
        scheme: &str,
        fallback_host: Option<&str>,
    ) -> Response<ProxyBody> {
        let method = req.method().clone();
        let uri = req.uri().clone();

        match self.try_forward(req, scheme, fallback_host).await {
            Ok(response) => {
                debug!(
                    method = %method,
                    uri = %uri,
                    status = response.status().as_u16(),
                    "Request forwarded"
                );
                response
            }
            Err(e) => {
                match &e {
                    ProxyError::UpstreamConnect { .. } => {
                        error!(method = %method, uri = %uri, error = %e, "Upstream request failed")
                    }
                    _ => warn!(method = %method, uri = %uri, error = %e, "Request rejected"),
                }
                text_response(e.status_code(), e.response_message())
            }
        }
    }

    pub async fn try_forward(
        &self,
        req: Request<Incoming>,
        scheme: &str,
        fallback_host: Option<&str>,
    ) -> Result<Response<ProxyBody>, ProxyError> {
        let inbound = NormalizedHeaderMap::from_header_map(req.headers());
        inbound.ensure_singular(HOST.as_str())?;
        inbound.ensure_singular(http::header::CONTENT_LENGTH.as_str())?;
        // hyper folds equal repeated Content-Length values; the raw head still shows them.
        if let Some(audit) = req.extensions().get::<RequestHeadAudit>() {
            audit.ensure_singular_framing()?;
        }

        let host = match inbound.get(HOST.as_str()) {
            Some(value) => Some(
                value
                    .to_str()
                    .map_err(|_| ProxyError::malformed("Host header is not valid ASCII"))?,
            ),
            None => fallback_host,
        };
        let request_target = req.uri().to_string();
        let target = effective_uri::resolve(scheme, &request_target, host)?;

        let spec = OutboundRequestSpec::build(req.method(), &inbound, &target)?;
        let transport = self.transports.select(&spec.scheme)?;
        let upstream = format!("{}:{}", spec.hostname, spec.port);

        let stream = transport.connect(&spec.hostname, spec.port).await?;
        let (mut sender, conn) = http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(true)
            .handshake(TokioIo::new(stream))
            .await
            .map_err(|e| ProxyError::upstream(&upstream, e))?;

        // Cancelled when the inbound side lets go: either this future is
        // dropped before the response arrives, or the response body is.
        let token = CancellationToken::new();
        let abort = token.clone();
        let conn_target = upstream.clone();
        tokio::spawn(async move {
            tokio::select! {
                result = conn => {
                    if let Err(e) = result {
                        debug!(upstream = %conn_target, error = %e, "Upstream connection closed with error");
                    }
                }
                _ = abort.cancelled() => {
                    debug!(upstream = %conn_target, "Upstream connection aborted by inbound side");
                }
            }
        });
        let guard = token.drop_guard();

        let (parts, body) = req.into_parts();
        let outbound = spec.into_request(body, parts.extensions)?;

        debug!(url = %target, method = %parts.method, "Sending outbound request");
        let response = sender
            .send_request(outbound)
            .await
            .map_err(|e| ProxyError::upstream(&upstream, e))?;

        let (mut parts, body) = response.into_parts();
        parts.headers = strip_hop_by_hop(&parts.headers);
        let body = body
            .map_frame(move |frame| {
                let _linked = &guard;
                frame
            })
            .boxed();

        Ok(Response::from_parts(parts, body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec_for(raw: &[&str], target: &str) -> OutboundRequestSpec {
        let inbound = NormalizedHeaderMap::from_raw(raw).unwrap();
        let host = inbound.get("host").map(|h| h.to_str().unwrap().to_string());
        let target = effective_uri::resolve("http:", target, host.as_deref()).unwrap();
        OutboundRequestSpec::build(&Method::GET, &inbound, &target).unwrap()
    }

    #[test]
    fn test_host_rewritten_to_absolute_target() {
        let spec = spec_for(
            &["Host", "ignored.example", "Accept", "*/*"],
            "http://real.example:8080/a?b=1",
        );
        assert_eq!(spec.headers[HOST], "real.example:8080");
        assert_eq!(spec.hostname, "real.example");
        assert_eq!(spec.port, 8080);
        assert_eq!(spec.path, "/a?b=1");
        assert_eq!(spec.headers["accept"], "*/*");
    }

    #[test]
    fn test_hop_by_hop_stripped() {
        let spec = spec_for(
            &[
                "Host",
                "example.com",
                "Connection",
                "keep-alive, X-Hop",
                "Proxy-Connection",
                "keep-alive",
                "Proxy-Authorization",
                "Basic Zm9vOmJhcg==",
                "Keep-Alive",
                "timeout=5",
                "TE",
                "trailers",
                "X-Hop",
                "1",
                "X-End-To-End",
                "2",
            ],
            "/",
        );
        assert_eq!(spec.headers.len(), 2);
        assert!(spec.headers.contains_key("x-end-to-end"));
        assert!(!spec.headers.contains_key("x-hop"));
        assert!(!spec.headers.contains_key("proxy-authorization"));
    }

    #[test]
    fn test_duplicate_end_to_end_headers_kept() {
        let spec = spec_for(
            &["Host", "example.com", "Cookie", "a=1", "cookie", "b=2"],
            "/",
        );
        assert_eq!(spec.headers.get_all("cookie").iter().count(), 2);
    }

    #[test]
    fn test_into_request_uses_origin_form() {
        let spec = spec_for(&["Host", "example.com"], "http://example.com/x?y");
        let request = spec.into_request((), Extensions::new()).unwrap();
        assert_eq!(request.uri(), "/x?y");
        assert_eq!(request.method(), Method::GET);
        assert_eq!(request.headers()[HOST], "example.com");
    }

    #[test]
    fn test_unknown_scheme_without_port_rejected() {
        let inbound = NormalizedHeaderMap::new();
        let target = effective_uri::resolve("http:", "gopher+x://h/", None).unwrap();
        assert!(matches!(
            OutboundRequestSpec::build(&Method::GET, &inbound, &target),
            Err(ProxyError::UnsupportedScheme(_))
        ));
    }
}
