//! In-process stream store.
//!
//! Implements the full consumer-group model: per-group delivery cursor,
//! pending entries list with owner, delivery count and idle time, and
//! TTL-bound counters. Time is read from `tokio::time`, so tests can pause
//! and advance the clock.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use super::{CounterStore, StreamStore};
use crate::entry::{Entry, EntryId, EntryRange, PendingEntry, PendingSummary, StartPosition};
use crate::error::{StoreError, StoreResult};

#[derive(Debug)]
struct PendingRecord {
    consumer: String,
    delivery_count: u64,
    delivered_at: Instant,
}

#[derive(Debug, Default)]
struct GroupState {
    last_delivered: EntryId,
    pending: BTreeMap<EntryId, PendingRecord>,
}

#[derive(Debug, Default)]
struct StreamState {
    entries: BTreeMap<EntryId, BTreeMap<String, String>>,
    last_id: EntryId,
    groups: HashMap<String, GroupState>,
}

#[derive(Debug)]
struct Counter {
    value: u64,
    expires_at: Option<Instant>,
}

impl Counter {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Default)]
struct Inner {
    streams: HashMap<String, StreamState>,
    counters: HashMap<String, Counter>,
}

/// Stream store kept entirely in memory.
#[derive(Debug, Default)]
pub struct InMemoryStreamStore {
    inner: Mutex<Inner>,
    appended: Notify,
}

impl InMemoryStreamStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(|_| StoreError::Unavailable {
            cause: "in-memory store lock poisoned".to_string(),
        })
    }

    /// All entries currently held by a stream, ascending by id.
    pub fn entries(&self, stream: &str) -> StoreResult<Vec<Entry>> {
        let inner = self.lock()?;
        Ok(inner
            .streams
            .get(stream)
            .map(|s| {
                s.entries
                    .iter()
                    .map(|(id, fields)| Entry::new(*id, stream, fields.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    /// Whether the stream exists.
    pub fn contains_stream(&self, stream: &str) -> StoreResult<bool> {
        Ok(self.lock()?.streams.contains_key(stream))
    }

    /// The group's delivery cursor.
    pub fn group_cursor(&self, stream: &str, group: &str) -> StoreResult<Option<EntryId>> {
        let inner = self.lock()?;
        Ok(inner
            .streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map(|g| g.last_delivered))
    }

    /// Remove an entry from the log without touching any pending list.
    ///
    /// Mirrors `XDEL`/`XTRIM`: groups that already delivered the entry keep it pending.
    pub fn trim(&self, stream: &str, id: EntryId) -> StoreResult<bool> {
        let mut inner = self.lock()?;
        Ok(inner
            .streams
            .get_mut(stream)
            .is_some_and(|s| s.entries.remove(&id).is_some()))
    }

    /// Current value of a live counter.
    pub fn counter(&self, key: &str) -> StoreResult<Option<u64>> {
        let inner = self.lock()?;
        let now = Instant::now();
        Ok(inner
            .counters
            .get(key)
            .filter(|c| !c.is_expired(now))
            .map(|c| c.value))
    }

    fn next_id(last: EntryId) -> EntryId {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0);
        if now_ms > last.ms() {
            EntryId::new(now_ms, 0)
        } else {
            last.next()
        }
    }

    fn deliver(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> StoreResult<Vec<Entry>> {
        let mut inner = self.lock()?;
        let state = inner
            .streams
            .get_mut(stream)
            .ok_or_else(|| StoreError::StreamMissing {
                stream: stream.to_string(),
            })?;
        let StreamState {
            entries, groups, ..
        } = state;
        let group_state = groups
            .get_mut(group)
            .ok_or_else(|| StoreError::GroupMissing {
                stream: stream.to_string(),
                group: group.to_string(),
            })?;

        let now = Instant::now();
        let delivered: Vec<Entry> = entries
            .range(group_state.last_delivered.next()..)
            .take(count)
            .map(|(id, fields)| Entry::new(*id, stream, fields.clone()))
            .collect();

        for entry in &delivered {
            group_state.last_delivered = entry.id;
            group_state.pending.insert(
                entry.id,
                PendingRecord {
                    consumer: consumer.to_string(),
                    delivery_count: 1,
                    delivered_at: now,
                },
            );
        }

        Ok(delivered)
    }
}

#[async_trait]
impl StreamStore for InMemoryStreamStore {
    async fn create_group(&self, stream: &str, group: &str, start: StartPosition) -> StoreResult<()> {
        let mut inner = self.lock()?;
        let state = inner
            .streams
            .get_mut(stream)
            .ok_or_else(|| StoreError::StreamMissing {
                stream: stream.to_string(),
            })?;

        if state.groups.contains_key(group) {
            return Err(StoreError::GroupExists {
                stream: stream.to_string(),
                group: group.to_string(),
            });
        }

        let last_delivered = match start {
            StartPosition::Beginning => EntryId::ZERO,
            StartPosition::Latest => state.last_id,
            StartPosition::After(id) => id,
        };
        state.groups.insert(
            group.to_string(),
            GroupState {
                last_delivered,
                pending: BTreeMap::new(),
            },
        );
        debug!(stream = %stream, group = %group, cursor = %last_delivered, "Group created");
        Ok(())
    }

    async fn append(
        &self,
        stream: &str,
        id: Option<EntryId>,
        fields: &BTreeMap<String, String>,
    ) -> StoreResult<EntryId> {
        let id = {
            let mut inner = self.lock()?;
            let state = inner.streams.entry(stream.to_string()).or_default();
            let id = match id {
                Some(id) if id <= state.last_id => {
                    return Err(StoreError::IdNotIncreasing {
                        stream: stream.to_string(),
                        id,
                    });
                }
                Some(id) => id,
                None => Self::next_id(state.last_id),
            };
            state.entries.insert(id, fields.clone());
            state.last_id = id;
            id
        };
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn read_new(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> StoreResult<Vec<Entry>> {
        let deadline = Instant::now() + block;
        loop {
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let delivered = self.deliver(stream, group, consumer, count)?;
            if !delivered.is_empty() || Instant::now() >= deadline {
                return Ok(delivered);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn acknowledge(&self, stream: &str, group: &str, id: EntryId) -> StoreResult<bool> {
        let mut inner = self.lock()?;
        Ok(inner
            .streams
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
            .is_some_and(|g| g.pending.remove(&id).is_some()))
    }

    async fn pending_summary(&self, stream: &str, group: &str) -> StoreResult<PendingSummary> {
        let inner = self.lock()?;
        let group_state = inner
            .streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .ok_or_else(|| StoreError::GroupMissing {
                stream: stream.to_string(),
                group: group.to_string(),
            })?;

        let mut per_consumer: BTreeMap<&str, u64> = BTreeMap::new();
        for record in group_state.pending.values() {
            *per_consumer.entry(record.consumer.as_str()).or_default() += 1;
        }

        Ok(PendingSummary {
            total: group_state.pending.len() as u64,
            lowest: group_state.pending.keys().next().copied(),
            highest: group_state.pending.keys().next_back().copied(),
            consumers: per_consumer
                .into_iter()
                .map(|(name, count)| (name.to_string(), count))
                .collect(),
        })
    }

    async fn list_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        range: EntryRange,
        limit: usize,
    ) -> StoreResult<Vec<PendingEntry>> {
        let inner = self.lock()?;
        let group_state = inner
            .streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .ok_or_else(|| StoreError::GroupMissing {
                stream: stream.to_string(),
                group: group.to_string(),
            })?;

        let now = Instant::now();
        Ok(group_state
            .pending
            .iter()
            .filter(|(id, record)| record.consumer == consumer && range.contains(**id))
            .take(limit)
            .map(|(id, record)| PendingEntry {
                id: *id,
                consumer: record.consumer.clone(),
                delivery_count: record.delivery_count,
                idle: now.saturating_duration_since(record.delivered_at),
            })
            .collect())
    }

    async fn lookup(&self, stream: &str, id: EntryId) -> StoreResult<Option<Entry>> {
        let inner = self.lock()?;
        Ok(inner
            .streams
            .get(stream)
            .and_then(|s| s.entries.get(&id))
            .map(|fields| Entry::new(id, stream, fields.clone())))
    }
}

#[async_trait]
impl CounterStore for InMemoryStreamStore {
    async fn increment(&self, key: &str) -> StoreResult<u64> {
        let mut inner = self.lock()?;
        let now = Instant::now();
        if inner.counters.get(key).is_some_and(|c| c.is_expired(now)) {
            inner.counters.remove(key);
        }
        let counter = inner.counters.entry(key.to_string()).or_insert(Counter {
            value: 0,
            expires_at: None,
        });
        counter.value += 1;
        Ok(counter.value)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        let mut inner = self.lock()?;
        if let Some(counter) = inner.counters.get_mut(key) {
            counter.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> StoreResult<()> {
        self.lock()?.counters.remove(key);
        Ok(())
    }
}
