//! Graceful shutdown via a shared `CancellationToken`.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Owns the root token every long-lived task watches: the HTTP server, the
/// registry actor, connection pumps and waiting catch-up readers.
#[derive(Clone, Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Cancel the token, then wait up to `timeout` for `tasks` to finish.
    /// Tasks still running afterwards are aborted.
    pub async fn graceful_shutdown(&self, tasks: Vec<JoinHandle<()>>, timeout: Duration) {
        self.token.cancel();
        info!(tasks = tasks.len(), timeout_secs = timeout.as_secs(), "shutting down");

        let aborts: Vec<_> = tasks.iter().map(JoinHandle::abort_handle).collect();
        if tokio::time::timeout(timeout, futures::future::join_all(tasks))
            .await
            .is_err()
        {
            warn!("shutdown timed out after {timeout:?}, aborting remaining tasks");
            for handle in aborts {
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_share_cancellation() {
        let coord = ShutdownCoordinator::new();
        let a = coord.token();
        let b = coord.clone().token();
        assert!(!coord.token().is_cancelled());
        a.cancel();
        assert!(b.is_cancelled());
        assert!(coord.token().is_cancelled());
    }

    #[tokio::test]
    async fn waits_for_cooperative_tasks() {
        let coord = ShutdownCoordinator::new();
        let token = coord.token();
        let task = tokio::spawn(async move { token.cancelled().await });

        coord.graceful_shutdown(vec![task], Duration::from_secs(1)).await;
        assert!(coord.token().is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn aborts_stuck_tasks_after_timeout() {
        let coord = ShutdownCoordinator::new();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let stuck = tokio::spawn(async move {
            let _tx = tx;
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });

        coord
            .graceful_shutdown(vec![stuck], Duration::from_millis(100))
            .await;
        // Aborting drops the task's future and with it the sender.
        assert!(rx.await.is_err());
    }
}
