//! Effective request URI resolution (RFC 7230 § 5.5)
//!
//! A forward proxy sees three request-target forms: absolute-form
//! (`GET http://host/path`), origin-form (`GET /path` plus a `Host` header,
//! as sent inside an intercepted TLS tunnel) and asterisk-form (`OPTIONS *`).
//! All of them resolve to one absolute URI here.

use crate::error::ProxyError;
use std::fmt;
use url::Url;

/// Absolute target of a request, fixed once resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectiveRequestTarget {
    url: Url,
    /// Scheme with its trailing colon (`http:`)
    pub scheme: String,
    /// Hostname plus explicit port, as it belongs in a `Host` header
    pub host: String,
    /// Hostname without port; IPv6 literals lose their brackets
    pub hostname: String,
    /// Explicit port, else the scheme's default (`None` for unknown schemes)
    pub port: Option<u16>,
    /// Origin-form path including the query
    pub path: String,
}

impl EffectiveRequestTarget {
    fn from_url(url: Url) -> Result<Self, ProxyError> {
        let bracketed = url
            .host_str()
            .ok_or_else(|| ProxyError::malformed(format!("Target {} has no host", url)))?
            .to_string();
        let host = match url.port() {
            Some(port) => format!("{}:{}", bracketed, port),
            None => bracketed.clone(),
        };
        let hostname = bracketed
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let path = match url.query() {
            Some(query) => format!("{}?{}", url.path(), query),
            None => url.path().to_string(),
        };

        Ok(Self {
            scheme: format!("{}:", url.scheme()),
            host,
            hostname,
            port: url.port_or_known_default(),
            path,
            url,
        })
    }
}

impl fmt::Display for EffectiveRequestTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.url.fmt(f)
    }
}

/// Resolve `request_target` received over `scheme` with the given `Host` value
///
/// `scheme` carries its trailing colon (`"http:"`). An absolute-form target
/// is authoritative and `host` is ignored; otherwise the target is resolved
/// against `scheme//host`.
pub fn resolve(
    scheme: &str,
    request_target: &str,
    host: Option<&str>,
) -> Result<EffectiveRequestTarget, ProxyError> {
    if !scheme.ends_with(':') {
        return Err(ProxyError::malformed(format!(
            "Scheme {:?} must end with a colon",
            scheme
        )));
    }

    let reference = if request_target == "*" {
        ""
    } else {
        request_target
    };

    if let Ok(absolute) = Url::parse(reference) {
        if absolute.has_host() {
            return EffectiveRequestTarget::from_url(absolute);
        }
    }

    let host = host.ok_or_else(|| {
        ProxyError::malformed(format!("No Host header for request target {}", request_target))
    })?;
    let base = Url::parse(&format!("{}//{}", scheme, host))
        .map_err(|e| ProxyError::malformed(format!("Invalid Host {:?}: {}", host, e)))?;
    let resolved = base.join(reference).map_err(|e| {
        ProxyError::malformed(format!("Invalid request target {:?}: {}", request_target, e))
    })?;

    EffectiveRequestTarget::from_url(resolved)
}
