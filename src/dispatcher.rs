//! The request dispatch state machine.
//!
//! Every inbound request flows through one call to [`dispatch`]:
//! authenticate against the current snapshot, parse the URL/query/body,
//! pick the candidate backends for the requested model (or the default
//! backend for plain paths), then walk the candidates in load order
//! (probe, account, forward) and stream the first upstream response back
//! to the client. Concurrency lives across requests; within one request
//! the pipeline is strictly sequential.

use std::net::{IpAddr, SocketAddr};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::header::{AUTHORIZATION, CONTENT_LENGTH, HOST};
use axum::http::{HeaderMap, Method, Request, Uri};
use axum::response::{IntoResponse, Response};
use futures::FutureExt;
use parking_lot::RwLock;
use reqwest::Client;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::access_log::{Access, AccessEvent, AccessLog};
use crate::backend::{Backend, ProxyError};
use crate::config::{
    ConfigSnapshot, StorePaths, DEFAULT_CONNECT_TIMEOUT_MS, DEFAULT_POOL_IDLE_TIMEOUT_SECS,
    DEFAULT_POOL_MAX_IDLE_PER_HOST,
};
use crate::forwarder;
use crate::metrics::{
    FORWARD_FAILURES, IN_FLIGHT, PROBE_FAILURES, RELAYED_RESPONSES, REQUESTS_REJECTED,
    REQUESTS_TOTAL,
};
use crate::probe;
use crate::relay;

/// Paths where model selection is required and load-aware backend picking
/// applies.
pub const MODEL_ENDPOINTS: [&str; 4] = ["/api/generate", "/api/chat", "/generate", "/chat"];

/// Shared proxy state: the refreshable configuration snapshot, the pooled
/// upstream client, and the access log handle.
pub struct ProxyServer {
    snapshot: RwLock<Arc<ConfigSnapshot>>,
    pub client: Client,
    pub access_log: AccessLog,
    pub store: StorePaths,
    pub security_disabled: bool,
}

impl ProxyServer {
    pub fn new(store: StorePaths, security_disabled: bool, access_log: AccessLog) -> Self {
        let client = Client::builder()
            .tcp_nodelay(true)
            .connect_timeout(Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS))
            .pool_idle_timeout(Some(Duration::from_secs(DEFAULT_POOL_IDLE_TIMEOUT_SECS)))
            .pool_max_idle_per_host(DEFAULT_POOL_MAX_IDLE_PER_HOST)
            .build()
            .expect("Failed to create HTTP client");

        let snapshot = ConfigSnapshot {
            security_disabled,
            ..Default::default()
        };

        Self {
            snapshot: RwLock::new(Arc::new(snapshot)),
            client,
            access_log,
            store,
            security_disabled,
        }
    }

    /// The snapshot a request should use for its whole lifetime. Cloning
    /// the `Arc` keeps the view coherent even if the refresher swaps the
    /// pointer mid-request.
    pub fn snapshot(&self) -> Arc<ConfigSnapshot> {
        self.snapshot.read().clone()
    }

    /// Atomically publishes a new snapshot. Only affects requests that
    /// start after the swap.
    pub fn install_snapshot(&self, next: Arc<ConfigSnapshot>) {
        *self.snapshot.write() = next;
    }
}

/// Top-level handler for every method and path. Panics inside the pipeline
/// are contained here and answered with a plain 500.
pub async fn dispatch(
    State(proxy): State<Arc<ProxyServer>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Response {
    match AssertUnwindSafe(handle(proxy, peer, request))
        .catch_unwind()
        .await
    {
        Ok(response) => response,
        Err(_) => {
            error!("Request handler panicked");
            ProxyError::Internal.into_response()
        }
    }
}

async fn handle(proxy: Arc<ProxyServer>, peer: SocketAddr, request: Request<Body>) -> Response {
    let snapshot = proxy.snapshot();
    REQUESTS_TOTAL.inc();

    let user = if snapshot.security_disabled {
        "unknown".to_string()
    } else {
        match authenticate(request.headers(), &snapshot) {
            AuthOutcome::Granted(user) => user,
            AuthOutcome::Denied(presented) => {
                warn!(ip = %peer.ip(), "Rejected unauthorized request");
                REQUESTS_REJECTED.inc();
                proxy.access_log.append(
                    AccessEvent::Rejected,
                    &presented,
                    Some(peer.ip()),
                    Access::Denied,
                    "None",
                    -1,
                    "Authentication failed",
                );
                return ProxyError::Unauthorized.into_response();
            }
        }
    };

    let (parts, body) = request.into_parts();
    let method = parts.method;
    let path = parts.uri.path().to_string();
    let query = parse_query(&parts.uri);
    let upstream_headers = filter_request_headers(&parts.headers);

    info!(ip = %peer.ip(), method = %method, path = %path, user = %user, "Incoming request");

    let body_json = if method == Method::POST {
        read_json_body(body).await
    } else {
        Value::Object(Default::default())
    };

    let model = extract_model(&body_json, &query);

    let (kind, mut candidates) = if MODEL_ENDPOINTS.contains(&path.as_str()) {
        let Some(model) = model else {
            warn!(path = %path, "Request is missing a model");
            return ProxyError::MissingModel.into_response();
        };
        let candidates = snapshot.candidates_for(&model);
        if candidates.is_empty() {
            warn!(model = %model, "No backend serves the requested model");
            return ProxyError::NoModelBackend.into_response();
        }
        info!(model = %model, candidates = candidates.len(), "Selected model candidates");
        (RouteKind::Model, candidates)
    } else {
        match snapshot.default_backend() {
            Some(backend) => (RouteKind::Default, vec![backend]),
            None => return ProxyError::NoDefaultBackend.into_response(),
        }
    };

    while !candidates.is_empty() {
        // Stable sort: equal depths keep snapshot order, so ties break
        // deterministically toward the earlier backend.
        candidates.sort_by_key(|b| b.depth());
        let backend = candidates.remove(0);

        if !probe::probe(&proxy.client, &backend).await {
            PROBE_FAILURES.with_label_values(&[&backend.name]).inc();
            warn!(backend = %backend.name, "Backend failed liveness probe, trying next candidate");
            continue;
        }

        info!(
            backend = %backend.name,
            depth = backend.depth(),
            "Dispatching to least-loaded live backend"
        );

        let outcome = {
            let _accounting =
                QueueGuard::acquire(&proxy.access_log, backend.clone(), &user, peer.ip());
            forwarder::forward(
                &proxy.client,
                &backend,
                method.clone(),
                &path,
                &query,
                &body_json,
                upstream_headers.clone(),
                snapshot.retry_attempts,
                Duration::from_secs(backend.timeout_secs),
            )
            .await
        };

        match outcome {
            Some(upstream) => {
                RELAYED_RESPONSES.with_label_values(&[&backend.name]).inc();
                info!(
                    backend = %backend.name,
                    status = %upstream.status(),
                    "Relaying upstream response"
                );
                return relay::relay(upstream);
            }
            None => {
                FORWARD_FAILURES.with_label_values(&[&backend.name]).inc();
                warn!(backend = %backend.name, "Forwarding exhausted all attempts, dropping candidate");
            }
        }
    }

    match kind {
        RouteKind::Model => ProxyError::AllBackendsFailed.into_response(),
        RouteKind::Default => ProxyError::DefaultForwardFailed.into_response(),
    }
}

enum RouteKind {
    Model,
    Default,
}

enum AuthOutcome {
    Granted(String),
    /// Carries the presented identity (the raw token, or `unknown` when no
    /// bearer token was sent) for the rejection log entry.
    Denied(String),
}

/// Validates `Authorization: Bearer <user>:<key>` against the snapshot.
/// The token splits on the first colon; the stored key must match byte for
/// byte.
fn authenticate(headers: &HeaderMap, snapshot: &ConfigSnapshot) -> AuthOutcome {
    let token = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    let Some(token) = token else {
        return AuthOutcome::Denied("unknown".to_string());
    };
    let Some((user, key)) = token.split_once(':') else {
        return AuthOutcome::Denied(token.to_string());
    };

    if snapshot.users.get(user).map(String::as_str) == Some(key) {
        AuthOutcome::Granted(user.to_string())
    } else {
        AuthOutcome::Denied(token.to_string())
    }
}

/// Decodes the query string into ordered (name, value) pairs. Repeated
/// names accumulate in first-seen order.
fn parse_query(uri: &Uri) -> Vec<(String, String)> {
    uri.query()
        .map(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .into_owned()
                .collect()
        })
        .unwrap_or_default()
}

fn first_query_value<'a>(query: &'a [(String, String)], name: &str) -> Option<&'a str> {
    query
        .iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.as_str())
}

/// The model comes from the body when present, else from the first `model`
/// query parameter.
fn extract_model(body: &Value, query: &[(String, String)]) -> Option<String> {
    body.get("model")
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| first_query_value(query, "model").map(str::to_string))
}

/// Reads and decodes the POST body. A body that is not valid JSON is
/// treated as absent; the request still goes upstream.
async fn read_json_body(body: Body) -> Value {
    match hyper::body::to_bytes(body).await {
        Ok(bytes) if !bytes.is_empty() => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
            warn!(error = %e, "Request body is not valid JSON, forwarding without a payload");
            Value::Object(Default::default())
        }),
        Ok(_) => Value::Object(Default::default()),
        Err(e) => {
            warn!(error = %e, "Failed to read request body");
            Value::Object(Default::default())
        }
    }
}

/// Client headers passed upstream. `Authorization` stays at the proxy
/// boundary, and `Host`/`Content-Length` are owned by the upstream client,
/// which sets them for the rewritten URL and re-serialized body.
fn filter_request_headers(headers: &HeaderMap) -> HeaderMap {
    let mut filtered = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if name == AUTHORIZATION || name == HOST || name == CONTENT_LENGTH {
            continue;
        }
        filtered.append(name.clone(), value.clone());
    }
    filtered
}

/// Queue accounting frame for one forward attempt. Increments on
/// construction and emits `gen_request`; the `Drop` impl decrements and
/// emits `gen_done`, so the counter is restored on every exit path,
/// panics included.
struct QueueGuard {
    log: AccessLog,
    backend: Arc<Backend>,
    user: String,
    ip: IpAddr,
}

impl QueueGuard {
    fn acquire(log: &AccessLog, backend: Arc<Backend>, user: &str, ip: IpAddr) -> Self {
        let depth = backend.inc_in_flight();
        IN_FLIGHT
            .with_label_values(&[&backend.name])
            .set(depth as i64);
        log.append(
            AccessEvent::GenRequest,
            user,
            Some(ip),
            Access::Authorized,
            &backend.name,
            depth as i64,
            "",
        );
        Self {
            log: log.clone(),
            backend,
            user: user.to_string(),
            ip,
        }
    }
}

impl Drop for QueueGuard {
    fn drop(&mut self) {
        let depth = self.backend.dec_in_flight();
        IN_FLIGHT
            .with_label_values(&[&self.backend.name])
            .set(depth as i64);
        self.log.append(
            AccessEvent::GenDone,
            &self.user,
            Some(self.ip),
            Access::Authorized,
            &self.backend.name,
            depth as i64,
            "",
        );
    }
}
