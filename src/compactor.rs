use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::engine::Engine;

const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Rewrite the tenant's WAL once `threshold` appends have piled up since the
/// last compaction. Returns whether it compacted.
pub async fn compact_if_due(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => {
            tracing::info!("compacted WAL after {appends} appends");
            true
        }
        Err(e) => {
            tracing::error!("WAL compaction failed: {e}");
            false
        }
    }
}

/// Background task per tenant. Holds only a weak handle so a dropped engine
/// ends the loop.
pub async fn run_compactor(engine: Weak<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    interval.tick().await;
    loop {
        interval.tick().await;
        let Some(engine) = engine.upgrade() else {
            tracing::debug!("engine dropped, compactor exiting");
            return;
        };
        compact_if_due(&engine, threshold).await;
    }
}

/// Spawn [`run_compactor`] for `engine`.
pub fn spawn(engine: &Arc<Engine>, threshold: u64) {
    tokio::spawn(run_compactor(Arc::downgrade(engine), threshold));
}
