//! Stream store collaborator contract.
//!
//! The engine never talks to a concrete log directly. Everything it needs
//! (append, consumer groups, pending-entry accounting, per-entry
//! acknowledgment and a TTL-bound counter) goes through the traits below.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::entry::{Entry, EntryId, EntryRange, PendingEntry, PendingSummary, StartPosition};
use crate::error::StoreResult;

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis_store;

pub use memory::InMemoryStreamStore;
#[cfg(feature = "redis")]
pub use redis_store::RedisStreamStore;

/// Append-only per-key log with consumer groups and pending-entry tracking.
#[async_trait]
pub trait StreamStore: Send + Sync {
    /// Create a consumer group.
    ///
    /// Fails with `StoreError::StreamMissing` when the stream does not exist
    /// and `StoreError::GroupExists` when the group was already created.
    async fn create_group(&self, stream: &str, group: &str, start: StartPosition) -> StoreResult<()>;

    /// Append an entry, creating the stream if needed.
    ///
    /// With `id = None` the store assigns the next id. An explicit id must be
    /// greater than the stream's last id.
    async fn append(
        &self,
        stream: &str,
        id: Option<EntryId>,
        fields: &BTreeMap<String, String>,
    ) -> StoreResult<EntryId>;

    /// Deliver entries the group has never seen to `consumer`.
    ///
    /// Delivered entries join the group's pending list. Waits up to `block`
    /// when nothing new is available and returns an empty batch on timeout.
    async fn read_new(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> StoreResult<Vec<Entry>>;

    /// Remove an entry from the group's pending list.
    ///
    /// Returns false if the entry was not pending.
    async fn acknowledge(&self, stream: &str, group: &str, id: EntryId) -> StoreResult<bool>;

    /// Summary of the group's pending list.
    async fn pending_summary(&self, stream: &str, group: &str) -> StoreResult<PendingSummary>;

    /// Pending entries owned by `consumer`, ascending by id.
    async fn list_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        range: EntryRange,
        limit: usize,
    ) -> StoreResult<Vec<PendingEntry>>;

    /// Fetch a single entry by id. `None` when it was trimmed or never existed.
    async fn lookup(&self, stream: &str, id: EntryId) -> StoreResult<Option<Entry>>;
}

/// Integer counters with a time-to-live.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment the counter, creating it at zero first. Returns the new value.
    async fn increment(&self, key: &str) -> StoreResult<u64>;

    /// Set the counter's time-to-live.
    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()>;

    /// Delete the counter.
    async fn remove(&self, key: &str) -> StoreResult<()>;
}
