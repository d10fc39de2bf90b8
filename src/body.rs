//! Response body type shared by every handler

use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{Response, StatusCode};
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};

/// Body of every response the proxy produces
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

pub fn full(chunk: impl Into<Bytes>) -> ProxyBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn empty() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

/// Plain-text response with the given status
pub fn text_response(status: StatusCode, message: impl Into<String>) -> Response<ProxyBody> {
    let message = message.into();
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(full(message.clone()))
        .unwrap_or_else(|_| {
            let mut response = Response::new(full(message));
            *response.status_mut() = status;
            response
        })
}
