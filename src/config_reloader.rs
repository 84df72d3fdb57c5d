//! Periodic refresh of the configuration snapshot.
//!
//! The refresher re-reads the backend table and the users file, builds a
//! fresh immutable snapshot, and publishes it with a single pointer swap.
//! Backends that survive a refresh keep their in-flight queue counter, so
//! accounting for requests dispatched under the previous snapshot stays
//! intact. A failed load leaves the previous snapshot in place.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::config::{self, ConfigError, ConfigSnapshot};
use crate::dispatcher::ProxyServer;

/// What one refresh changed, for logging and the boot banner.
#[derive(Debug, Default)]
pub struct ReloadSummary {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub kept: usize,
    pub backends: usize,
    pub users: usize,
}

impl ReloadSummary {
    pub fn changed(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty()
    }
}

/// Loads the store, builds the next snapshot, and installs it. Returns an
/// error without touching the current snapshot when either store file
/// cannot be loaded.
pub fn reload(proxy: &ProxyServer) -> Result<ReloadSummary, ConfigError> {
    let store = config::try_load_store(&proxy.store.config)?;
    let users = config::load_authorized_users(&proxy.store.users)?;

    let retry_attempts = store
        .proxy
        .unwrap_or_default()
        .retry_attempts
        .unwrap_or(config::DEFAULT_RETRY_ATTEMPTS)
        .max(1);

    let validated = config::validate_backends(store.backends);
    let current = proxy.snapshot();

    let mut summary = ReloadSummary {
        users: users.len(),
        ..Default::default()
    };

    let mut backends = Vec::with_capacity(validated.len());
    for mut next in validated {
        match current.backends.iter().find(|b| b.name == next.name) {
            Some(existing)
                if existing.url == next.url
                    && existing.models == next.models
                    && existing.timeout_secs == next.timeout_secs =>
            {
                // Unchanged: reuse the whole backend, counter included.
                backends.push(existing.clone());
                summary.kept += 1;
            }
            Some(existing) => {
                // Redefined: new definition, same queue counter.
                next.share_queue_with(existing);
                backends.push(Arc::new(next));
                summary.kept += 1;
            }
            None => {
                summary.added.push(next.name.clone());
                backends.push(Arc::new(next));
            }
        }
    }
    for old in &current.backends {
        if !backends.iter().any(|b| b.name == old.name) {
            summary.removed.push(old.name.clone());
        }
    }
    summary.backends = backends.len();

    proxy.install_snapshot(Arc::new(ConfigSnapshot {
        backends,
        users,
        retry_attempts,
        security_disabled: proxy.security_disabled,
    }));

    Ok(summary)
}

/// Background task: refresh every [`config::DEFAULT_REFRESH_INTERVAL_SECS`]
/// seconds until shutdown.
pub async fn refresh_loop(proxy: Arc<ProxyServer>, mut shutdown_rx: watch::Receiver<()>) {
    let mut ticker = interval(Duration::from_secs(config::DEFAULT_REFRESH_INTERVAL_SECS));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.changed() => {
                info!("Config refresher received shutdown signal, exiting.");
                return;
            }
            _ = ticker.tick() => {
                match reload(&proxy) {
                    Ok(summary) => {
                        if summary.changed() {
                            info!(
                                added = summary.added.len(),
                                removed = summary.removed.len(),
                                kept = summary.kept,
                                backends = summary.backends,
                                users = summary.users,
                                "Configuration snapshot refreshed"
                            );
                        } else {
                            debug!(backends = summary.backends, users = summary.users, "Configuration snapshot unchanged");
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "Config refresh failed, keeping previous snapshot");
                    }
                }
            }
        }
    }
}
