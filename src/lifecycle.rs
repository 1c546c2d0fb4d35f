//! Periodic stale-session sweep.
//!
//! Grace timers live on the sessions themselves; this task is the backstop
//! for sessions whose timer never fired (suspended process, lost timer).

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::session::SessionRegistry;

/// Spawn the sweeper. Every `every`, sessions with no connections that have
/// been idle longer than `stale_after` are destroyed. Stops on `cancel`.
pub fn spawn_sweeper(
    registry: SessionRegistry,
    every: Duration,
    stale_after: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("stale sweep stopped");
                    break;
                }
                _ = ticker.tick() => {
                    let swept = registry.sweep_stale(stale_after);
                    if !swept.is_empty() {
                        tracing::info!(count = swept.len(), sessions = ?swept, "swept stale sessions");
                    }
                }
            }
        }
    })
}
