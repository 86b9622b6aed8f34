//! Signal-driven shutdown of the scheduled dump loop

use std::future::Future;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Waits for a termination signal and stops the scheduled dump loop
///
/// Stopping is a token cancellation: it never blocks, and it does not wait
/// for a tick in progress. The metrics exporter is left running.
pub struct ShutdownCoordinator {
    stop: CancellationToken,
}

impl ShutdownCoordinator {
    /// Coordinator cancelling `stop` on signal
    pub fn new(stop: CancellationToken) -> Self {
        Self { stop }
    }

    /// Wait for `signal`, then cancel the stop token
    pub async fn run<F>(self, signal: F)
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            _ = signal => {
                info!("Received shutdown signal");
                self.stop.cancel();
            }
            // Someone else already stopped the loop
            _ = self.stop.cancelled() => {}
        }
    }
}

/// Resolves on Ctrl+C or, on unix, SIGTERM
///
/// If a handler cannot be installed the failure is logged and that signal
/// is never delivered.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::profiling::{ProfileDumper, ProfileKind, ProfileRequest};
    use crate::system::scheduler::ScheduledDumpLoop;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_signal_cancels_token() {
        let stop = CancellationToken::new();
        let (tx, rx) = oneshot::channel::<()>();
        let coordinator = tokio::spawn(
            ShutdownCoordinator::new(stop.clone()).run(async move {
                let _ = rx.await;
            }),
        );

        assert!(!stop.is_cancelled());
        tx.send(()).unwrap();
        coordinator.await.unwrap();
        assert!(stop.is_cancelled());
    }

    #[tokio::test]
    async fn test_returns_when_already_stopped() {
        let stop = CancellationToken::new();
        stop.cancel();
        tokio::time::timeout(
            Duration::from_secs(1),
            ShutdownCoordinator::new(stop).run(std::future::pending::<()>()),
        )
        .await
        .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_no_ticks_after_signal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("threads.prof");
        let interval = Duration::from_millis(200);
        let request = ProfileRequest::new(ProfileKind::ThreadCreate, &path);

        let stop = CancellationToken::new();
        let dump_loop = tokio::spawn(
            ScheduledDumpLoop::new(Arc::new(ProfileDumper::default()), request, interval)
                .run(stop.clone()),
        );

        let (tx, rx) = oneshot::channel::<()>();
        tokio::spawn(ShutdownCoordinator::new(stop.clone()).run(async move {
            let _ = rx.await;
        }));

        // Between the second and third tick
        tokio::time::sleep(interval * 2 + interval / 2).await;
        tx.send(()).unwrap();
        let ticks = dump_loop.await.unwrap();
        assert_eq!(ticks, 2);

        let modified = std::fs::metadata(&path).unwrap().modified().unwrap();
        tokio::time::sleep(interval * 2).await;
        assert_eq!(std::fs::metadata(&path).unwrap().modified().unwrap(), modified);
    }
}
