//! Relaying upstream responses to the client.
//!
//! The relay never buffers the upstream body: each chunk read from the
//! backend becomes one data frame of the downstream chunked body, so chunk
//! boundaries survive the hop. Dropping the downstream body (client went
//! away) drops the upstream response and releases its connection.

use axum::body::{boxed, StreamBody};
use axum::http::header::{
    HeaderMap, HeaderName, HeaderValue, CONTENT_ENCODING, CONTENT_LENGTH, TRANSFER_ENCODING,
};
use axum::response::Response;
use futures::StreamExt;
use tracing::warn;

/// Upstream framing headers that must not reach the client: the relay
/// re-frames the body as chunked transfer encoding.
const STRIPPED_RESPONSE_HEADERS: [HeaderName; 3] =
    [CONTENT_LENGTH, TRANSFER_ENCODING, CONTENT_ENCODING];

/// Copies the upstream headers minus the framing set, then marks the
/// response as chunked.
pub fn filter_response_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(upstream.len() + 1);
    for (name, value) in upstream {
        if STRIPPED_RESPONSE_HEADERS.contains(name) {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
    headers
}

/// Turns an upstream response into the client response: upstream status,
/// filtered headers, and the body streamed chunk for chunk.
pub fn relay(upstream: reqwest::Response) -> Response {
    let status = upstream.status();
    let headers = filter_response_headers(upstream.headers());

    let body = upstream.bytes_stream().map(|chunk| {
        chunk.map_err(|e| {
            warn!(error = %e, "Upstream body ended early");
            axum::BoxError::from(e)
        })
    });

    let mut response = Response::builder()
        .status(status)
        .body(boxed(StreamBody::new(body)))
        .expect("Failed to build relay response");
    *response.headers_mut() = headers;
    response
}
