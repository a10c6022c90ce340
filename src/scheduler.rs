use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::engine::Engine;

/// Interval between WAL size checks.
const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Level-triggered lifecycle scan: starts appointments whose window has
/// opened and completes those whose window has closed. A missed tick is
/// corrected by the next one.
pub async fn run_lifecycle_scan(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let applied = engine.apply_due_transitions().await;
        if applied > 0 {
            info!(applied, "automatic transitions applied");
        } else {
            debug!("lifecycle scan: nothing due");
        }
    }
}

/// Compact the WAL once at least `threshold` records were appended
/// since the last compaction.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACT_CHECK_INTERVAL);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        compact_if_needed(&engine, threshold).await;
    }
}

async fn compact_if_needed(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => {
            info!(appends, "WAL compacted");
            true
        }
        Err(e) => {
            warn!(error = %e, "WAL compaction failed");
            false
        }
    }
}
