//! Header normalization and hop-by-hop handling
//!
//! The transport layer delivers headers as they were sent: original casing,
//! duplicates intact. Forwarding decisions need a case-insensitive view that
//! still exposes every duplicate, so a smuggled second `Host` or
//! `Content-Length` can be detected instead of silently collapsed.

use crate::error::ProxyError;
use http::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION};
use tracing::warn;

/// Lowercase header name → values in the order they were seen
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedHeaderMap {
    entries: Vec<(String, Vec<HeaderValue>)>,
}

impl NormalizedHeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from an alternating `[name, value, name, value, ...]` list
    pub fn from_raw<S: AsRef<str>>(raw: &[S]) -> Result<Self, ProxyError> {
        if raw.len() % 2 != 0 {
            return Err(ProxyError::malformed(
                "Raw header list has a name without a value",
            ));
        }

        let mut map = Self::new();
        for pair in raw.chunks_exact(2) {
            let value = HeaderValue::from_str(pair[1].as_ref()).map_err(|_| {
                ProxyError::malformed(format!("Invalid value for header {}", pair[0].as_ref()))
            })?;
            map.append(pair[0].as_ref(), value);
        }
        Ok(map)
    }

    /// Build from a parsed header map
    pub fn from_header_map(headers: &HeaderMap) -> Self {
        let mut map = Self::new();
        for (name, value) in headers {
            map.append(name.as_str(), value.clone());
        }
        map
    }

    /// First occurrence creates the entry, later ones append to it
    pub fn append(&mut self, name: &str, value: HeaderValue) {
        let key = name.to_ascii_lowercase();
        match self.entries.iter_mut().find(|(existing, _)| *existing == key) {
            Some((_, values)) => values.push(value),
            None => self.entries.push((key, vec![value])),
        }
    }

    pub fn get_all(&self, name: &str) -> &[HeaderValue] {
        let key = name.to_ascii_lowercase();
        self.entries
            .iter()
            .find(|(existing, _)| *existing == key)
            .map(|(_, values)| values.as_slice())
            .unwrap_or(&[])
    }

    pub fn get(&self, name: &str) -> Option<&HeaderValue> {
        self.get_all(name).first()
    }

    pub fn count(&self, name: &str) -> usize {
        self.get_all(name).len()
    }

    /// Reject a header that appeared more than once
    pub fn ensure_singular(&self, name: &str) -> Result<(), ProxyError> {
        match self.count(name) {
            count if count > 1 => Err(duplicated_header(name, count)),
            _ => Ok(()),
        }
    }

    /// Entries in first-seen order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[HeaderValue])> {
        self.entries
            .iter()
            .map(|(name, values)| (name.as_str(), values.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Names listed in `Connection`, lowercased
    pub fn connection_tokens(&self) -> Vec<String> {
        connection_tokens(self.get_all(CONNECTION.as_str()).iter())
    }
}

/// Check if header is hop-by-hop (RFC 7230 § 6.1)
pub fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
            | "proxy-connection"
    )
}

fn connection_tokens<'a>(values: impl Iterator<Item = &'a HeaderValue>) -> Vec<String> {
    values
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|token| token.trim().to_ascii_lowercase())
        .filter(|token| !token.is_empty())
        .collect()
}

/// Copy `headers` without hop-by-hop headers or names listed in `Connection`
///
/// Duplicates are kept.
pub fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let nominated = connection_tokens(headers.get_all(CONNECTION).iter());
    let mut filtered = HeaderMap::with_capacity(headers.len());

    for (name, value) in headers {
        if is_hop_by_hop(name.as_str()) || nominated.iter().any(|t| t == name.as_str()) {
            continue;
        }
        filtered.append(name.clone(), value.clone());
    }

    filtered
}

/// `ProtocolViolation` for a singular header seen `count` times
pub(crate) fn duplicated_header(name: &str, count: usize) -> ProxyError {
    warn!(header = %name, count, "Rejecting duplicated singular header");
    ProxyError::ProtocolViolation(format!("Duplicate {} header", canonical_name(name)))
}

fn canonical_name(name: &str) -> String {
    match HeaderName::from_bytes(name.as_bytes()) {
        Ok(header) if header == http::header::HOST => "Host".to_string(),
        Ok(header) if header == http::header::CONTENT_LENGTH => "Content-Length".to_string(),
        _ => name.to_string(),
    }
}
