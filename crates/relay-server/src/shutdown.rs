//! Process shutdown: one `CancellationToken` observed by the HTTP server,
//! then a bounded wait for the serving task to drain.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// How a graceful shutdown ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Every tracked task finished.
    Drained,
    /// The timeout elapsed; remaining tasks were aborted.
    TimedOut,
}

/// Owner of the process-wide shutdown token.
#[derive(Debug, Clone, Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    /// Coordinator with an uncancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// A handle on the shutdown token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Begin shutdown.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// `true` once [`ShutdownCoordinator::shutdown`] ran.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancel the token, then wait up to `timeout` for `handles`.
    ///
    /// Tasks still running at the deadline are aborted.
    pub async fn graceful_shutdown(
        &self,
        handles: Vec<JoinHandle<()>>,
        timeout: Option<Duration>,
    ) -> ShutdownOutcome {
        let timeout = timeout.unwrap_or(DEFAULT_DRAIN_TIMEOUT);
        self.shutdown();
        info!(tasks = handles.len(), ?timeout, "draining");

        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
        match tokio::time::timeout(timeout, futures::future::join_all(handles)).await {
            Ok(_) => ShutdownOutcome::Drained,
            Err(_) => {
                warn!(?timeout, "shutdown drain timed out, aborting remaining tasks");
                for handle in aborts {
                    handle.abort();
                }
                ShutdownOutcome::TimedOut
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_running() {
        assert!(!ShutdownCoordinator::new().is_shutting_down());
    }

    #[test]
    fn shutdown_cancels_every_token_clone() {
        let coord = ShutdownCoordinator::new();
        let a = coord.token();
        let b = coord.clone().token();
        coord.shutdown();
        coord.shutdown();
        assert!(coord.is_shutting_down());
        assert!(a.is_cancelled());
        assert!(b.is_cancelled());
    }

    #[tokio::test]
    async fn drains_cooperative_tasks() {
        let coord = ShutdownCoordinator::new();
        let token = coord.token();
        let handle = tokio::spawn(async move { token.cancelled().await });

        let outcome = coord.graceful_shutdown(vec![handle], None).await;
        assert_eq!(outcome, ShutdownOutcome::Drained);
    }

    #[tokio::test(start_paused = true)]
    async fn aborts_tasks_that_ignore_cancellation() {
        let coord = ShutdownCoordinator::new();
        let handle = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(300)).await;
        });

        let outcome = coord
            .graceful_shutdown(vec![handle], Some(Duration::from_millis(100)))
            .await;
        assert_eq!(outcome, ShutdownOutcome::TimedOut);
        assert!(coord.is_shutting_down());
    }
}
