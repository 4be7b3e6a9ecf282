use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::engine::Engine;

/// Background task that compacts the WAL once `threshold` appends accumulate,
/// or as soon as a failed flush has closed the log.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, period: Duration) {
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        compact_if_due(&engine, threshold).await;
    }
}

/// One compactor pass. Returns whether a compaction ran.
pub async fn compact_if_due(engine: &Engine, threshold: u64) -> bool {
    let status = engine.wal_status().await;
    let appends = status.appends_since_compact;
    if status.healthy && appends < threshold {
        debug!("compactor: {appends}/{threshold} appends, skipping");
        return false;
    }
    if !status.healthy {
        warn!("compactor: log closed after a failed flush, rewriting it");
    }
    match engine.compact_wal().await {
        Ok(_) => true,
        Err(e) => {
            warn!("compaction failed: {e}");
            false
        }
    }
}
