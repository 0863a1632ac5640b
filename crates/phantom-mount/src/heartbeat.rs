//! Heartbeat: periodic aggregate counters so a quiet mount is
//! distinguishable from a wedged one.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

use phantom_config::logging::TELEMETRY_TARGET;

use crate::MountContext;

/// Wake interval.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Runs until the mount's cancellation token fires.
pub async fn run_heartbeat(ctx: Arc<MountContext>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; skip it so the first beat
    // reflects a full interval.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let snapshot = ctx.counters.snapshot_and_reset();
                info!(
                    target: TELEMETRY_TARGET,
                    callbacks = snapshot.callbacks_served,
                    objects_fetched = snapshot.objects_fetched,
                    bytes_downloaded = snapshot.bytes_downloaded,
                    journal_appends = snapshot.journal_appends,
                    background_ops = snapshot.background_ops,
                    fetches_inflight = snapshot.fetches_inflight,
                    modified_paths = ctx.journal.count(),
                    "heartbeat"
                );
            }
        }
    }
}
