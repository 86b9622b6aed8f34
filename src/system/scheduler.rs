//! Timer-driven profile dumping
//!
//! Each tick logs a memory snapshot and then writes the configured profile.
//! A failed dump is logged and the loop carries on. Cancellation is only
//! observed between ticks, so a dump in progress always runs to completion.

use crate::system::profiling::{ProfileDumper, ProfileRequest};
use crate::system::stats;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Periodically writes one profile to one file
pub struct ScheduledDumpLoop {
    dumper: Arc<ProfileDumper>,
    request: ProfileRequest,
    interval: Duration,
}

impl ScheduledDumpLoop {
    /// Create a loop dumping `request` every `interval`
    pub fn new(dumper: Arc<ProfileDumper>, request: ProfileRequest, interval: Duration) -> Self {
        Self { dumper, request, interval }
    }

    /// Run until `stop` is cancelled; returns the number of ticks executed
    ///
    /// The first tick fires one interval after start. Ticks that come due
    /// while a dump is still running (a CPU capture longer than the interval)
    /// are skipped rather than queued.
    pub async fn run(self, stop: CancellationToken) -> u64 {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            profile = %self.request.kind,
            path = %self.request.path.display(),
            interval = ?self.interval,
            "scheduled profile dumps started"
        );

        let mut ticks = 0u64;
        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {}
            }
            ticks += 1;

            let snapshot = stats::capture();
            info!(?snapshot, "Memory Stats");

            self.dump_once().await;
        }

        info!(ticks, "scheduled profile dumps stopped");
        ticks
    }

    async fn dump_once(&self) {
        let dumper = Arc::clone(&self.dumper);
        let request = self.request.clone();
        let kind = request.kind;

        let result = tokio::task::spawn_blocking(move || dumper.dump(request.kind, &request.path)).await;
        match result {
            Ok(Ok(())) => debug!(profile = %kind, "profile written"),
            Ok(Err(e)) => error!(profile = %kind, error = %e, "Error dumping {} profile", kind),
            Err(e) => error!(profile = %kind, error = %e, "profile dump task failed"),
        }
    }
}
