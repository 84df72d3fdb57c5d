//! Liveness probing of backends.
//!
//! A probe is a single bounded HEAD request against the backend's root
//! URL issued right before a dispatch attempt. There is no health history:
//! a backend is live for this attempt or it is not.

use std::time::Duration;

use reqwest::Client;
use tokio::time::timeout;
use tracing::warn;

use crate::backend::Backend;

/// Hard wall-clock deadline for one probe.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Returns true iff the backend answers 2xx within [`PROBE_TIMEOUT`].
pub async fn probe(client: &Client, backend: &Backend) -> bool {
    probe_with_deadline(client, backend, PROBE_TIMEOUT).await
}

pub(crate) async fn probe_with_deadline(
    client: &Client,
    backend: &Backend,
    deadline: Duration,
) -> bool {
    match timeout(deadline, client.head(&backend.url).send()).await {
        Ok(Ok(response)) => {
            let live = response.status().is_success();
            if !live {
                warn!(
                    backend = %backend.name,
                    status = %response.status(),
                    "Liveness probe got a non-success status"
                );
            }
            live
        }
        Ok(Err(e)) => {
            warn!(backend = %backend.name, error = %e, "Liveness probe failed");
            false
        }
        Err(_) => {
            warn!(
                backend = %backend.name,
                deadline_secs = deadline.as_secs(),
                "Liveness probe timed out"
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::Router;
    use std::net::SocketAddr;

    async fn spawn_upstream(router: Router) -> SocketAddr {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::Server::from_tcp(listener)
                .unwrap()
                .serve(router.into_make_service())
                .await
                .unwrap();
        });
        addr
    }

    fn backend_at(addr: SocketAddr) -> Backend {
        Backend::new("probe-target", format!("http://{}", addr), [], 300)
    }

    #[tokio::test]
    async fn live_backend_probes_true() {
        let addr = spawn_upstream(Router::new().fallback(|| async { "ok" })).await;
        let client = Client::new();
        assert!(probe(&client, &backend_at(addr)).await);
    }

    #[tokio::test]
    async fn non_success_status_probes_false() {
        let addr = spawn_upstream(
            Router::new().fallback(|| async { StatusCode::INTERNAL_SERVER_ERROR }),
        )
        .await;
        let client = Client::new();
        assert!(!probe(&client, &backend_at(addr)).await);
    }

    #[tokio::test]
    async fn unreachable_backend_probes_false() {
        // Bind then drop to get a port nothing is listening on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = Client::new();
        assert!(!probe(&client, &backend_at(addr)).await);
    }

    #[tokio::test]
    async fn slow_backend_hits_the_deadline() {
        let addr = spawn_upstream(Router::new().fallback(|| async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            "late"
        }))
        .await;

        let client = Client::new();
        let backend = backend_at(addr);
        assert!(!probe_with_deadline(&client, &backend, Duration::from_millis(20)).await);
    }
}
