//! Periodic expired-entry sweep shared by both tiers.

use std::time::Duration;
use tokio::time::{self, Instant};

use crate::lifecycle::cancel::CancelToken;
use crate::observability::metrics::CacheTier;

/// Call `sweep` every `interval` until `cancel` fires. `sweep` returns the
/// number of entries removed and the number left. A zero interval disables
/// the loop.
pub(crate) async fn run_sweep_loop<F>(tier: CacheTier, interval: Duration, cancel: CancelToken, sweep: F)
where
    F: Fn() -> (usize, usize),
{
    if interval.is_zero() {
        tracing::info!(tier = tier.as_str(), "Cache sweeper disabled");
        return;
    }

    tracing::info!(tier = tier.as_str(), interval = ?interval, "Cache sweeper starting");
    let mut ticker = time::interval_at(Instant::now() + interval, interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let (removed, remaining) = sweep();
                if removed > 0 {
                    tracing::debug!(tier = tier.as_str(), removed, remaining, "Swept expired entries");
                }
            }
            _ = cancel.cancelled() => {
                tracing::info!(tier = tier.as_str(), "Cache sweeper received shutdown signal, exiting loop");
                break;
            }
        }
    }
}
