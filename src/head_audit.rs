//! Raw request-head audit
//!
//! hyper folds repeated, equal `Content-Length` fields into one before a
//! service ever sees the request, so a duplicate cannot be detected from the
//! parsed `HeaderMap`. [`AuditedStream`] sits between the socket and hyper,
//! parses every request head with `httparse` as the bytes go past, and queues
//! one [`RequestHeadAudit`] per head. The connection's service takes them in
//! order and attaches each to its request's extensions.
//!
//! Message framing (`Content-Length`, chunked) is followed to find the next
//! head. Auditing stops after a `CONNECT` head or anything that cannot be
//! framed; requests past that point carry no audit.

use crate::error::ProxyError;
use crate::headers::duplicated_header;
use http::Request;
use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::debug;

/// Same limit hyper applies by default
const MAX_HEADERS: usize = 100;
const MAX_PENDING_BYTES: usize = 64 * 1024;

/// Field counts taken from one raw request head
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestHeadAudit {
    pub host_fields: usize,
    pub content_length_fields: usize,
}

impl RequestHeadAudit {
    /// Reject a head that repeated `Host` or `Content-Length`
    pub fn ensure_singular_framing(&self) -> Result<(), ProxyError> {
        if self.host_fields > 1 {
            return Err(duplicated_header("host", self.host_fields));
        }
        if self.content_length_fields > 1 {
            return Err(duplicated_header(
                "content-length",
                self.content_length_fields,
            ));
        }
        Ok(())
    }
}

/// Audits of one connection, in request order
#[derive(Debug, Clone, Default)]
pub struct HeadAudits {
    queue: Arc<Mutex<VecDeque<RequestHeadAudit>>>,
}

impl HeadAudits {
    /// Attach the audit of the next request head, if one was taken
    pub fn attach_next<B>(&self, req: &mut Request<B>) {
        let next = self
            .queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        if let Some(audit) = next {
            req.extensions_mut().insert(audit);
        }
    }

    fn extend(&self, audits: Vec<RequestHeadAudit>) {
        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(audits);
    }
}

#[derive(Debug)]
enum Framing {
    Head(Vec<u8>),
    Body(u64),
    ChunkSize(Vec<u8>),
    /// Chunk payload plus its trailing CRLF
    ChunkData(u64),
    Trailers(Vec<u8>),
    Passthrough,
}

enum HeadParse {
    Complete {
        len: usize,
        audit: RequestHeadAudit,
        next: Framing,
    },
    Partial,
    Invalid,
}

/// Incremental scanner over the inbound byte stream
#[derive(Debug)]
struct HeadScanner {
    state: Framing,
}

impl HeadScanner {
    fn new() -> Self {
        Self {
            state: Framing::Head(Vec::new()),
        }
    }

    fn is_passthrough(&self) -> bool {
        matches!(self.state, Framing::Passthrough)
    }

    fn feed(&mut self, mut input: &[u8], audits: &mut Vec<RequestHeadAudit>) {
        while !input.is_empty() {
            match &mut self.state {
                Framing::Passthrough => return,
                Framing::Body(remaining) | Framing::ChunkData(remaining) => {
                    let take = (*remaining).min(input.len() as u64);
                    *remaining -= take;
                    input = &input[take as usize..];
                    if *remaining == 0 {
                        self.state = match self.state {
                            Framing::ChunkData(_) => Framing::ChunkSize(Vec::new()),
                            _ => Framing::Head(Vec::new()),
                        };
                    }
                }
                Framing::Head(pending) => {
                    let start = pending.len();
                    pending.extend_from_slice(input);
                    match parse_head(pending) {
                        HeadParse::Complete { len, audit, next } => {
                            audits.push(audit);
                            input = &input[len.saturating_sub(start)..];
                            self.state = next;
                        }
                        HeadParse::Partial => {
                            if pending.len() > MAX_PENDING_BYTES {
                                self.give_up("request head too large");
                            }
                            return;
                        }
                        HeadParse::Invalid => {
                            self.give_up("unparsable request head");
                            return;
                        }
                    }
                }
                Framing::ChunkSize(pending) => {
                    let start = pending.len();
                    pending.extend_from_slice(input);
                    match httparse::parse_chunk_size(pending) {
                        Ok(httparse::Status::Complete((len, size))) => {
                            input = &input[len.saturating_sub(start)..];
                            self.state = if size == 0 {
                                Framing::Trailers(Vec::new())
                            } else {
                                Framing::ChunkData(size.saturating_add(2))
                            };
                        }
                        Ok(httparse::Status::Partial) => {
                            if pending.len() > MAX_PENDING_BYTES {
                                self.give_up("chunk size line too large");
                            }
                            return;
                        }
                        Err(_) => {
                            self.give_up("invalid chunk size");
                            return;
                        }
                    }
                }
                Framing::Trailers(pending) => {
                    let start = pending.len();
                    pending.extend_from_slice(input);
                    let end = if pending.starts_with(b"\r\n") {
                        Some(2)
                    } else {
                        pending
                            .windows(4)
                            .position(|w| w == b"\r\n\r\n")
                            .map(|at| at + 4)
                    };
                    match end {
                        Some(end) => {
                            input = &input[end.saturating_sub(start)..];
                            self.state = Framing::Head(Vec::new());
                        }
                        None => {
                            if pending.len() > MAX_PENDING_BYTES {
                                self.give_up("trailers too large");
                            }
                            return;
                        }
                    }
                }
            }
        }
    }

    fn give_up(&mut self, reason: &str) {
        debug!(reason, "Request head audit stopped for this connection");
        self.state = Framing::Passthrough;
    }
}

fn parse_head(buf: &[u8]) -> HeadParse {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut request = httparse::Request::new(&mut headers);
    let len = match request.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return HeadParse::Partial,
        Err(_) => return HeadParse::Invalid,
    };

    let mut audit = RequestHeadAudit::default();
    let mut content_length = None;
    let mut chunked = false;
    for header in request.headers.iter() {
        if header.name.eq_ignore_ascii_case("host") {
            audit.host_fields += 1;
        } else if header.name.eq_ignore_ascii_case("content-length") {
            audit.content_length_fields += 1;
            if content_length.is_none() {
                content_length = std::str::from_utf8(header.value)
                    .ok()
                    .and_then(|v| v.trim().parse::<u64>().ok());
            }
        } else if header.name.eq_ignore_ascii_case("transfer-encoding") {
            chunked |= String::from_utf8_lossy(header.value)
                .to_ascii_lowercase()
                .contains("chunked");
        }
    }

    let next = if request.method == Some("CONNECT") {
        Framing::Passthrough
    } else if chunked {
        Framing::ChunkSize(Vec::new())
    } else {
        match content_length {
            Some(n) if n > 0 => Framing::Body(n),
            _ => Framing::Head(Vec::new()),
        }
    };

    HeadParse::Complete { len, audit, next }
}

/// Stream wrapper that audits inbound request heads as hyper reads them
pub struct AuditedStream<S> {
    inner: S,
    scanner: HeadScanner,
    audits: HeadAudits,
}

impl<S> AuditedStream<S> {
    pub fn new(inner: S) -> (Self, HeadAudits) {
        let audits = HeadAudits::default();
        let stream = Self {
            inner,
            scanner: HeadScanner::new(),
            audits: audits.clone(),
        };
        (stream, audits)
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    fn observe(&mut self, bytes: &[u8]) {
        if self.scanner.is_passthrough() {
            return;
        }
        let mut found = Vec::new();
        self.scanner.feed(bytes, &mut found);
        if !found.is_empty() {
            self.audits.extend(found);
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for AuditedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                this.observe(&buf.filled()[before..]);
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for AuditedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn scan(chunks: &[&[u8]]) -> (Vec<RequestHeadAudit>, HeadScanner) {
        let mut scanner = HeadScanner::new();
        let mut audits = Vec::new();
        for chunk in chunks {
            scanner.feed(chunk, &mut audits);
        }
        (audits, scanner)
    }

    #[test]
    fn test_counts_repeated_content_length() {
        let (audits, _) = scan(&[
            b"POST / HTTP/1.1\r\nHost: a\r\nContent-Length: 5\r\ncontent-length: 5\r\n\r\nhello",
        ]);
        assert_eq!(
            audits,
            vec![RequestHeadAudit {
                host_fields: 1,
                content_length_fields: 2,
            }]
        );

        let err = audits[0].ensure_singular_framing().unwrap_err();
        assert!(matches!(err, ProxyError::ProtocolViolation(_)));
        assert_eq!(err.response_message(), "Bad request: Duplicate Content-Length header");
    }

    #[test]
    fn test_single_fields_pass() {
        let (audits, _) = scan(&[b"GET / HTTP/1.1\r\nHost: a\r\n\r\n"]);
        assert!(audits[0].ensure_singular_framing().is_ok());
    }

    #[test]
    fn test_follows_content_length_to_next_head() {
        let (audits, _) = scan(&[
            b"POST / HTTP/1.1\r\nHost: a\r\nContent-Length: 18\r\n\r\n",
            b"GET / HTTP/1.1\r\n\r\n",
            b"GET / HTTP/1.1\r\nHost: b\r\nHost: c\r\n\r\n",
        ]);
        assert_eq!(audits.len(), 2);
        assert_eq!(audits[1].host_fields, 2);
    }

    #[test]
    fn test_follows_chunked_body_to_next_head() {
        let (audits, _) = scan(&[
            b"POST / HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\n\r\n",
            b"5\r\nhello\r\n0\r\nX-Trailer: 1\r\n\r\n",
            b"GET / HTTP/1.1\r\nHost: a\r\nContent-Length: 0\r\nContent-Length: 0\r\n\r\n",
        ]);
        assert_eq!(audits.len(), 2);
        assert_eq!(audits[1].content_length_fields, 2);
    }

    #[test]
    fn test_byte_at_a_time() {
        let raw: &[u8] = b"POST / HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n0\r\n\r\nGET / HTTP/1.1\r\nHost: a\r\n\r\n";
        let chunks: Vec<&[u8]> = raw.chunks(1).collect();
        let (audits, scanner) = scan(&chunks);
        assert_eq!(audits.len(), 2);
        assert!(matches!(scanner.state, Framing::Head(ref pending) if pending.is_empty()));
    }

    #[test]
    fn test_connect_stops_auditing() {
        let (audits, scanner) = scan(&[
            b"CONNECT a:443 HTTP/1.1\r\nHost: a:443\r\n\r\n",
            b"GET / HTTP/1.1\r\nHost: a\r\n\r\n",
        ]);
        assert_eq!(audits.len(), 1);
        assert!(scanner.is_passthrough());
    }

    #[test]
    fn test_garbage_stops_auditing() {
        let (audits, scanner) = scan(&[b"\x16\x03\x01 not http\r\n\r\n"]);
        assert!(audits.is_empty());
        assert!(scanner.is_passthrough());
    }

    #[tokio::test]
    async fn test_stream_queues_audits_in_order() {
        let (client, server) = tokio::io::duplex(1024);
        let (mut audited, audits) = AuditedStream::new(server);
        let mut client = client;

        client
            .write_all(b"GET /a HTTP/1.1\r\nHost: a\r\n\r\nGET /b HTTP/1.1\r\nHost: a\r\nHost: b\r\n\r\n")
            .await
            .unwrap();
        drop(client);

        let mut seen = Vec::new();
        audited.read_to_end(&mut seen).await.unwrap();

        let mut first = Request::new(());
        let mut second = Request::new(());
        let mut third = Request::new(());
        audits.attach_next(&mut first);
        audits.attach_next(&mut second);
        audits.attach_next(&mut third);

        assert_eq!(first.extensions().get::<RequestHeadAudit>().unwrap().host_fields, 1);
        assert_eq!(second.extensions().get::<RequestHeadAudit>().unwrap().host_fields, 2);
        assert!(third.extensions().get::<RequestHeadAudit>().is_none());
    }
}
