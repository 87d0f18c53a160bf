//! Per-entry retry counter.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::error::StoreResult;
use crate::store::CounterStore;

/// Retry counter keyed by `<streamKey>:<entryId>` with a TTL.
///
/// Increment and TTL refresh are two separate store calls. A crash between
/// them leaves a counter without a fresh TTL; it still expires with the
/// previous one, or lives until cleared on success or quarantine.
#[derive(Clone)]
pub struct AttemptCounter {
    store: Arc<dyn CounterStore>,
    ttl: Duration,
}

impl AttemptCounter {
    pub fn new(store: Arc<dyn CounterStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Count one more attempt and refresh the TTL. Returns the new count.
    pub async fn increment(&self, key: &str) -> StoreResult<u64> {
        let attempts = self.store.increment(key).await?;
        self.store.expire(key, self.ttl).await?;
        debug!(key = %key, attempts, "Attempt counted");
        Ok(attempts)
    }

    /// Drop the counter once the entry reached a terminal state.
    pub async fn clear(&self, key: &str) -> StoreResult<()> {
        self.store.remove(key).await
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

impl std::fmt::Debug for AttemptCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttemptCounter")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}
