//! Core data structures for the proxy.
//!
//! This module defines `Backend`, which describes a single upstream
//! inference server together with its in-flight queue counter, and
//! `ProxyError`, the set of failures the dispatcher answers locally
//! instead of relaying an upstream response.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Authentication failed")]
    Unauthorized,
    #[error("Missing 'model' in request")]
    MissingModel,
    #[error("No servers support the requested model.")]
    NoModelBackend,
    #[error("No available servers could handle the request.")]
    AllBackendsFailed,
    #[error("Default server is not available.")]
    NoDefaultBackend,
    #[error("Failed to forward request to default server.")]
    DefaultForwardFailed,
    #[error("Internal server error")]
    Internal,
}

impl IntoResponse for ProxyError {
    /// Maps each locally generated failure to its wire representation.
    /// Auth failures carry an empty body; everything else answers with the
    /// plain-text message from the `Display` impl.
    fn into_response(self) -> Response {
        match self {
            ProxyError::Unauthorized => StatusCode::FORBIDDEN.into_response(),
            ProxyError::MissingModel => {
                (StatusCode::BAD_REQUEST, self.to_string()).into_response()
            }
            ProxyError::NoModelBackend
            | ProxyError::AllBackendsFailed
            | ProxyError::NoDefaultBackend
            | ProxyError::DefaultForwardFailed => {
                (StatusCode::SERVICE_UNAVAILABLE, self.to_string()).into_response()
            }
            ProxyError::Config(_) | ProxyError::Internal => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response()
            }
        }
    }
}

/// One upstream inference server.
///
/// The `in_flight` counter is shared behind an `Arc` so that a refreshed
/// snapshot can keep accounting for requests that were dispatched against
/// the previous definition of the same backend.
#[derive(Debug)]
pub struct Backend {
    /// Stable identifier used in logs and metrics. Falls back to the URL.
    pub name: String,
    /// Base URL (scheme + host + port, no path, no trailing slash).
    pub url: String,
    /// Model names this backend can serve.
    pub models: HashSet<String>,
    /// Per-attempt upstream deadline in seconds.
    pub timeout_secs: u64,
    in_flight: Arc<AtomicUsize>,
}

impl Backend {
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        models: impl IntoIterator<Item = String>,
        timeout_secs: u64,
    ) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            models: models.into_iter().collect(),
            timeout_secs,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn serves(&self, model: &str) -> bool {
        self.models.contains(model)
    }

    /// Adopts `other`'s queue counter so both definitions account against
    /// the same in-flight total. Used when a refresh changes a backend's
    /// definition while requests dispatched under the old one are still
    /// running.
    pub fn share_queue_with(&mut self, other: &Backend) {
        self.in_flight = Arc::clone(&other.in_flight);
    }

    /// Increments the in-flight counter and returns the depth after the
    /// increment.
    pub fn inc_in_flight(&self) -> usize {
        self.in_flight.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Decrements the in-flight counter and returns the depth after the
    /// decrement.
    pub fn dec_in_flight(&self) -> usize {
        self.in_flight
            .fetch_sub(1, Ordering::AcqRel)
            .saturating_sub(1)
    }

    /// Current queue depth. Only used for load ordering; the value may be
    /// stale by the time it is acted on.
    pub fn depth(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::body::to_bytes;

    fn backend(models: &[&str]) -> Backend {
        Backend::new(
            "node-1",
            "http://127.0.0.1:11434",
            models.iter().map(|m| m.to_string()),
            300,
        )
    }

    #[test]
    fn queue_depth_tracks_inc_and_dec() {
        let b = backend(&["m1"]);
        assert_eq!(b.depth(), 0);
        assert_eq!(b.inc_in_flight(), 1);
        assert_eq!(b.inc_in_flight(), 2);
        assert_eq!(b.depth(), 2);
        assert_eq!(b.dec_in_flight(), 1);
        assert_eq!(b.dec_in_flight(), 0);
        assert_eq!(b.depth(), 0);
    }

    #[test]
    fn serves_matches_exact_model_names() {
        let b = backend(&["m1", "m2"]);
        assert!(b.serves("m1"));
        assert!(b.serves("m2"));
        assert!(!b.serves("m3"));
        assert!(!b.serves("M1"));
    }

    #[test]
    fn shared_queue_counts_across_definitions() {
        let old = backend(&["m1"]);
        old.inc_in_flight();

        let mut renewed = backend(&["m1", "m2"]);
        renewed.share_queue_with(&old);
        assert_eq!(renewed.depth(), 1);

        // A decrement against the old definition is visible in the new one.
        old.dec_in_flight();
        assert_eq!(renewed.depth(), 0);
    }

    #[tokio::test]
    async fn unauthorized_maps_to_empty_403() {
        let response = ProxyError::Unauthorized.into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body = to_bytes(response.into_body()).await.unwrap();
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn missing_model_maps_to_400_with_message() {
        let response = ProxyError::MissingModel.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = to_bytes(response.into_body()).await.unwrap();
        assert_eq!(&body[..], b"Missing 'model' in request");
    }

    #[tokio::test]
    async fn unavailable_variants_map_to_503_texts() {
        for (err, expected) in [
            (
                ProxyError::NoModelBackend,
                "No servers support the requested model.",
            ),
            (
                ProxyError::AllBackendsFailed,
                "No available servers could handle the request.",
            ),
            (
                ProxyError::NoDefaultBackend,
                "Default server is not available.",
            ),
            (
                ProxyError::DefaultForwardFailed,
                "Failed to forward request to default server.",
            ),
        ] {
            let response = err.into_response();
            assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
            let body = to_bytes(response.into_body()).await.unwrap();
            assert_eq!(&body[..], expected.as_bytes());
        }
    }

    #[tokio::test]
    async fn internal_maps_to_500() {
        let response = ProxyError::Internal.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = to_bytes(response.into_body()).await.unwrap();
        assert_eq!(&body[..], b"Internal server error");
    }
}
