use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::engine::Engine;
use crate::model::*;

/// Actor recorded on reservations cancelled by the expiry policy.
pub const SYSTEM_ACTOR_ID: Ulid = Ulid::nil();

const EXPIRY_INTERVAL: Duration = Duration::from_secs(30);
const COMPACT_INTERVAL: Duration = Duration::from_secs(10);

/// Cancel every pending reservation made more than `ttl` ago. Returns how
/// many were cancelled. Ones that moved on in the meantime are skipped.
pub async fn expire_stale_pending(engine: &Engine, ttl: Duration, now: Ms) -> usize {
    let cutoff = now - i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
    let system = Actor::admin(SYSTEM_ACTOR_ID);
    let mut cancelled = 0;
    for id in engine.collect_stale_pending(cutoff).await {
        match engine.cancel(id, &system).await {
            Ok(_) => {
                info!(reservation = %id, "expired stale pending reservation");
                cancelled += 1;
            }
            Err(e) => debug!(reservation = %id, error = %e, "expiry skipped"),
        }
    }
    cancelled
}

/// Background task applying the pending-reservation TTL.
pub async fn run_expiry(engine: Arc<Engine>, ttl: Duration) {
    let mut interval = tokio::time::interval(EXPIRY_INTERVAL.min(ttl));
    loop {
        interval.tick().await;
        expire_stale_pending(&engine, ttl, now_ms()).await;
    }
}

/// Background task compacting the WAL once enough appends have piled up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACT_INTERVAL);
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        if let Err(e) = engine.compact_wal().await {
            warn!(appends, error = %e, "WAL compaction failed");
        }
    }
}
