//! Coordinated shutdown of background tasks.
//!
//! The proxy runs a handful of long-lived tasks next to the accept loop
//! (snapshot refresher, access-log writer, metrics listener). The
//! coordinator hands each one a shutdown receiver and joins them with a
//! bounded wait once the server has drained, so a wedged task cannot keep
//! the process alive forever.

use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum ShutdownError {
    #[error("A background task panicked while shutting down")]
    Panic(#[from] JoinError),
    #[error("Shutdown did not complete within {0:?}")]
    Timeout(Duration),
}

pub struct ShutdownCoordinator {
    tasks: JoinSet<()>,
    signal_tx: watch::Sender<()>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (signal_tx, _) = watch::channel(());
        Self {
            tasks: JoinSet::new(),
            signal_tx,
        }
    }

    /// A receiver the task should select on; it resolves once shutdown
    /// begins.
    pub fn subscribe(&self) -> watch::Receiver<()> {
        self.signal_tx.subscribe()
    }

    pub fn spawn<F>(&mut self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.tasks.spawn(task);
    }

    /// Signals every subscribed task and waits for all of them, up to
    /// `timeout`. Remaining tasks are aborted when the deadline passes.
    pub async fn shutdown(self, timeout: Duration) -> Result<(), ShutdownError> {
        let ShutdownCoordinator {
            mut tasks,
            signal_tx,
        } = self;

        info!(tasks = tasks.len(), "Signalling background tasks to stop");
        drop(signal_tx);

        let join_all = async {
            while let Some(result) = tasks.join_next().await {
                result?;
            }
            Ok(())
        };

        match tokio::time::timeout(timeout, join_all).await {
            Ok(Ok(())) => {
                info!("All background tasks stopped cleanly");
                Ok(())
            }
            Ok(Err(e)) => {
                error!(error = %e, "Background task panicked during shutdown");
                Err(ShutdownError::Panic(e))
            }
            Err(_) => {
                error!(timeout = ?timeout, "Shutdown deadline passed, aborting remaining tasks");
                tasks.abort_all();
                Err(ShutdownError::Timeout(timeout))
            }
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    #[tokio::test]
    async fn tasks_that_honor_the_signal_join_cleanly() {
        let mut coordinator = ShutdownCoordinator::new();
        let mut rx = coordinator.subscribe();
        coordinator.spawn(async move {
            let _ = rx.changed().await;
        });
        let mut rx2 = coordinator.subscribe();
        coordinator.spawn(async move {
            let _ = rx2.changed().await;
        });

        let result = coordinator.shutdown(Duration::from_secs(1)).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn deaf_task_trips_the_deadline() {
        let mut coordinator = ShutdownCoordinator::new();
        coordinator.spawn(async {
            sleep(Duration::from_secs(30)).await;
        });

        let result = coordinator.shutdown(Duration::from_millis(50)).await;
        assert!(matches!(result, Err(ShutdownError::Timeout(_))));
    }

    #[tokio::test]
    async fn panicking_task_is_reported() {
        let mut coordinator = ShutdownCoordinator::new();
        coordinator.spawn(async {
            panic!("task blew up");
        });

        let result = coordinator.shutdown(Duration::from_secs(1)).await;
        assert!(matches!(result, Err(ShutdownError::Panic(_))));
    }

    #[tokio::test]
    async fn shutdown_with_no_tasks_is_immediate() {
        let coordinator = ShutdownCoordinator::new();
        assert!(coordinator.shutdown(Duration::from_secs(1)).await.is_ok());
    }
}
