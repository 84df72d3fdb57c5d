use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge_vec, Encoder, IntCounter,
    IntCounterVec, IntGaugeVec, TextEncoder,
};
use std::sync::LazyLock;
use tracing::error;

/// Total number of requests accepted by the dispatcher.
///
/// Example query: `rate(proxy_requests_total[5m])`.
pub static REQUESTS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!("proxy_requests_total", "Total number of dispatched requests").unwrap()
});

/// Requests rejected by bearer-token authentication.
pub static REQUESTS_REJECTED: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "proxy_requests_rejected_total",
        "Total number of requests rejected by authentication"
    )
    .unwrap()
});

/// Liveness probes that came back dead, per backend. A rising rate means
/// the candidate loop is spending time skipping an unhealthy node.
pub static PROBE_FAILURES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "proxy_probe_failures_total",
        "Total number of failed liveness probes per backend",
        &["backend"]
    )
    .unwrap()
});

/// Forwards that exhausted every retry attempt without a response, per
/// backend.
pub static FORWARD_FAILURES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "proxy_forward_failures_total",
        "Total number of forwards that exhausted all attempts per backend",
        &["backend"]
    )
    .unwrap()
});

/// Upstream responses relayed to clients, per backend.
pub static RELAYED_RESPONSES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "proxy_relayed_responses_total",
        "Total number of upstream responses relayed per backend",
        &["backend"]
    )
    .unwrap()
});

/// Current queue depth per backend, mirroring the dispatcher's in-flight
/// counters.
pub static IN_FLIGHT: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    register_int_gauge_vec!(
        "proxy_in_flight_requests",
        "Requests currently dispatched per backend",
        &["backend"]
    )
    .unwrap()
});

/// Serves the Prometheus text exposition. Mounted on its own listener:
/// the proxy port forwards every path to the backends, so `/metrics`
/// cannot live there.
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, encoder.format_type().to_string())],
            buffer,
        ),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(header::CONTENT_TYPE, "text/plain".to_string())],
                format!("Error encoding metrics: {}", e).into_bytes(),
            )
        }
    }
}
