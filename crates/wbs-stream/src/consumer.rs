//! Live stream consumer.
//!
//! Bootstraps the consumer group of one (entity, repository) pairing and
//! drains entries the group has never seen. Failed entries stay pending and
//! are left to the reconciler.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, error, info, instrument, warn};

use crate::config::ConsumerConfig;
use crate::entry::{Entry, StartPosition, INIT_FIELD};
use crate::error::{StoreError, SyncError, SyncResult};
use crate::naming::Pairing;
use crate::orchestrator::ProcessOrchestrator;
use crate::processor::Processor;
use crate::store::StreamStore;

/// Consumer for one pairing.
pub struct StreamConsumer {
    store: Arc<dyn StreamStore>,
    processor: Arc<dyn Processor>,
    orchestrator: Arc<dyn ProcessOrchestrator>,
    config: ConsumerConfig,
    shutdown: Arc<AtomicBool>,
}

impl std::fmt::Debug for StreamConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamConsumer")
            .field("pairing", self.pairing())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl StreamConsumer {
    pub fn new(
        store: Arc<dyn StreamStore>,
        processor: Arc<dyn Processor>,
        orchestrator: Arc<dyn ProcessOrchestrator>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            store,
            processor,
            orchestrator,
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    #[must_use]
    pub fn pairing(&self) -> &Pairing {
        self.processor.pairing()
    }

    /// Create the consumer group if it does not exist yet.
    ///
    /// A missing stream gets an init marker first; the group is then created
    /// after it so the marker is never delivered. Running this again never
    /// fails and never moves the group's cursor.
    #[instrument(skip(self), fields(stream = %self.pairing().stream_key(), group = %self.pairing().group()))]
    pub async fn bootstrap(&self) -> SyncResult<()> {
        let pairing = self.pairing();
        let stream = pairing.stream_key();
        let group = pairing.group();

        match self
            .store
            .create_group(stream, group, StartPosition::Beginning)
            .await
        {
            Ok(()) => {
                info!("Consumer group created");
                return Ok(());
            }
            Err(StoreError::GroupExists { .. }) => {
                debug!("Consumer group already exists");
                return Ok(());
            }
            Err(StoreError::StreamMissing { .. }) => {
                debug!("Stream does not exist yet, appending init marker");
            }
            Err(source) => return Err(bootstrap_error(stream, group, source)),
        }

        let mut marker = BTreeMap::new();
        marker.insert(INIT_FIELD.to_string(), "true".to_string());
        let marker_id = self
            .store
            .append(stream, None, &marker)
            .await
            .map_err(|source| bootstrap_error(stream, group, source))?;

        // Entries appended after the marker are delivered.
        match self
            .store
            .create_group(stream, group, StartPosition::After(marker_id))
            .await
        {
            Ok(()) => {
                info!("Stream initialised and consumer group created");
                Ok(())
            }
            Err(StoreError::GroupExists { .. }) => Ok(()),
            Err(source) => Err(bootstrap_error(stream, group, source)),
        }
    }

    /// Read one batch of new entries and drive each through the orchestrator.
    ///
    /// Returns the number of entries delivered. Only receive errors are
    /// returned; entry failures are logged and left pending.
    pub async fn poll_once(&self) -> SyncResult<usize> {
        let pairing = self.pairing();
        let entries = self
            .store
            .read_new(
                pairing.stream_key(),
                pairing.group(),
                pairing.consumer(),
                self.config.read_batch_size,
                self.config.block_timeout,
            )
            .await?;

        for entry in &entries {
            self.on_entry(entry).await;
        }
        Ok(entries.len())
    }

    async fn on_entry(&self, entry: &Entry) {
        if entry.is_init_marker() {
            debug!(entry_id = %entry.id, "Skipping init marker");
            if let Err(e) = self.processor.acknowledge(entry).await {
                warn!(entry_id = %entry.id, error = %e, "Failed to acknowledge init marker");
            }
            return;
        }

        if let Err(e) = self
            .orchestrator
            .orchestrate(entry, self.processor.as_ref())
            .await
        {
            error!(
                entry_id = %entry.id,
                kind = ?e.kind(),
                error = %e,
                "Error processing entry, leaving it pending"
            );
        }
    }

    /// Bootstrap, then receive until shutdown is requested.
    ///
    /// Fails only when bootstrap fails.
    #[instrument(skip(self), fields(stream = %self.pairing().stream_key(), consumer = %self.pairing().consumer()))]
    pub async fn run(&self) -> SyncResult<()> {
        self.bootstrap().await?;
        info!(
            block_timeout_ms = self.config.block_timeout.as_millis() as u64,
            read_batch_size = self.config.read_batch_size,
            "Starting stream consumer"
        );

        while !self.is_shutdown() {
            match self.poll_once().await {
                Ok(0) => {}
                Ok(count) => debug!(count, "Entries delivered"),
                Err(SyncError::Store(StoreError::GroupMissing { .. })) => {
                    warn!("Consumer group disappeared, bootstrapping again");
                    if let Err(e) = self.bootstrap().await {
                        error!(error = %e, "Re-bootstrap failed");
                        tokio::time::sleep(self.config.block_timeout).await;
                    }
                }
                Err(e) => {
                    error!(error = %e, "Error receiving entries");
                    tokio::time::sleep(self.config.block_timeout).await;
                }
            }
        }

        info!("Stream consumer stopped");
        Ok(())
    }

    /// Request graceful shutdown. The loop exits after the current read.
    pub fn shutdown(&self) {
        info!(consumer = %self.pairing().consumer(), "Shutdown requested");
        self.shutdown.store(true, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }
}

fn bootstrap_error(stream: &str, group: &str, source: StoreError) -> SyncError {
    SyncError::Bootstrap {
        stream: stream.to_string(),
        group: group.to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{entry_fields, EntryId, EntryRange, PendingEntry, PendingSummary};
    use crate::error::StoreResult;
    use crate::orchestrator::DefaultOrchestrator;
    use crate::processor::EntityProcessor;
    use crate::repository::{InMemoryRepository, RepositoryRegistry};
    use crate::store::InMemoryStreamStore;
    use crate::Entity;
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Employer {
        id: i64,
        email: String,
    }

    impl Entity for Employer {
        const ENTITY_TYPE: &'static str = "Employer";
    }

    async fn consumer(
        store: Arc<InMemoryStreamStore>,
    ) -> (StreamConsumer, Arc<InMemoryRepository<Employer, i64>>) {
        let registry = Arc::new(RepositoryRegistry::new());
        let repo = Arc::new(InMemoryRepository::new(|e: &Employer| e.id));
        registry
            .register::<Employer, _>("jpa", "jpa-employers", repo.clone())
            .await;
        let pairing = Pairing::new("wb:stream:entity", "Employer", "jpa");
        let processor = Arc::new(EntityProcessor::<Employer>::new(
            pairing,
            store.clone(),
            registry,
        ));
        let config = ConsumerConfig {
            block_timeout: Duration::from_millis(10),
            read_batch_size: 10,
        };
        (
            StreamConsumer::new(store, processor, Arc::new(DefaultOrchestrator), config),
            repo,
        )
    }

    #[tokio::test]
    async fn test_bootstrap_on_missing_stream_skips_marker() {
        let store = Arc::new(InMemoryStreamStore::new());
        let (consumer, _) = consumer(store.clone()).await;

        consumer.bootstrap().await.unwrap();

        let stream = "wb:stream:entity:employer";
        let entries = store.entries(stream).unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].is_init_marker());
        assert_eq!(
            store.group_cursor(stream, "jpa_group").unwrap(),
            Some(entries[0].id)
        );
        assert_eq!(consumer.poll_once().await.unwrap(), 0);
    }

    /// Appends an entry right before a group is created after an id.
    struct RacingStore {
        inner: InMemoryStreamStore,
    }

    #[async_trait::async_trait]
    impl StreamStore for RacingStore {
        async fn create_group(
            &self,
            stream: &str,
            group: &str,
            start: StartPosition,
        ) -> StoreResult<()> {
            if let StartPosition::After(_) = start {
                self.inner
                    .append(stream, None, &entry_fields(r#"{"id":9,"email":"race@b.com"}"#, None))
                    .await?;
            }
            self.inner.create_group(stream, group, start).await
        }

        async fn append(
            &self,
            stream: &str,
            id: Option<EntryId>,
            fields: &BTreeMap<String, String>,
        ) -> StoreResult<EntryId> {
            self.inner.append(stream, id, fields).await
        }

        async fn read_new(
            &self,
            stream: &str,
            group: &str,
            consumer: &str,
            count: usize,
            block: Duration,
        ) -> StoreResult<Vec<Entry>> {
            self.inner.read_new(stream, group, consumer, count, block).await
        }

        async fn acknowledge(&self, stream: &str, group: &str, id: EntryId) -> StoreResult<bool> {
            self.inner.acknowledge(stream, group, id).await
        }

        async fn pending_summary(&self, stream: &str, group: &str) -> StoreResult<PendingSummary> {
            self.inner.pending_summary(stream, group).await
        }

        async fn list_pending(
            &self,
            stream: &str,
            group: &str,
            consumer: &str,
            range: EntryRange,
            limit: usize,
        ) -> StoreResult<Vec<PendingEntry>> {
            self.inner
                .list_pending(stream, group, consumer, range, limit)
                .await
        }

        async fn lookup(&self, stream: &str, id: EntryId) -> StoreResult<Option<Entry>> {
            self.inner.lookup(stream, id).await
        }
    }

    #[tokio::test]
    async fn test_entry_appended_during_bootstrap_is_delivered() {
        let store = Arc::new(RacingStore {
            inner: InMemoryStreamStore::new(),
        });
        let registry = Arc::new(RepositoryRegistry::new());
        let repo = Arc::new(InMemoryRepository::new(|e: &Employer| e.id));
        registry
            .register::<Employer, _>("jpa", "jpa-employers", repo.clone())
            .await;
        let processor = Arc::new(EntityProcessor::<Employer>::new(
            Pairing::new("wb:stream:entity", "Employer", "jpa"),
            store.clone(),
            registry,
        ));
        let consumer = StreamConsumer::new(
            store.clone(),
            processor,
            Arc::new(DefaultOrchestrator),
            ConsumerConfig {
                block_timeout: Duration::from_millis(10),
                read_batch_size: 10,
            },
        );

        consumer.bootstrap().await.unwrap();

        assert_eq!(consumer.poll_once().await.unwrap(), 1);
        assert!(repo.contains(&9).await);
    }

    #[tokio::test]
    async fn test_bootstrap_is_idempotent() {
        let store = Arc::new(InMemoryStreamStore::new());
        let (consumer, _) = consumer(store.clone()).await;
        let stream = "wb:stream:entity:employer";

        consumer.bootstrap().await.unwrap();
        store
            .append(stream, None, &entry_fields(r#"{"id":1,"email":"a@b.com"}"#, None))
            .await
            .unwrap();
        consumer.poll_once().await.unwrap();
        let cursor = store.group_cursor(stream, "jpa_group").unwrap();

        consumer.bootstrap().await.unwrap();
        assert_eq!(store.group_cursor(stream, "jpa_group").unwrap(), cursor);
        assert_eq!(store.entries(stream).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_existing_stream_is_read_from_start() {
        let store = Arc::new(InMemoryStreamStore::new());
        store
            .append(
                "wb:stream:entity:employer",
                None,
                &entry_fields(r#"{"id":5,"email":"early@b.com"}"#, None),
            )
            .await
            .unwrap();
        let (consumer, repo) = consumer(store.clone()).await;

        consumer.bootstrap().await.unwrap();
        assert_eq!(consumer.poll_once().await.unwrap(), 1);
        assert!(repo.contains(&5).await);
    }

    #[tokio::test]
    async fn test_init_marker_is_acknowledged_not_processed() {
        let store = Arc::new(InMemoryStreamStore::new());
        let stream = "wb:stream:entity:employer";
        let mut marker = BTreeMap::new();
        marker.insert(INIT_FIELD.to_string(), "true".to_string());
        store.append(stream, None, &marker).await.unwrap();
        let (consumer, repo) = consumer(store.clone()).await;

        consumer.bootstrap().await.unwrap();
        assert_eq!(consumer.poll_once().await.unwrap(), 1);
        assert!(repo.is_empty().await);
        assert!(store
            .pending_summary(stream, "jpa_group")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_failed_entry_stays_pending() {
        let store = Arc::new(InMemoryStreamStore::new());
        let (consumer, _) = consumer(store.clone()).await;
        let stream = "wb:stream:entity:employer";
        consumer.bootstrap().await.unwrap();
        store
            .append(stream, None, &entry_fields("{broken", None))
            .await
            .unwrap();

        assert_eq!(consumer.poll_once().await.unwrap(), 1);
        assert_eq!(
            store.pending_summary(stream, "jpa_group").await.unwrap().total,
            1
        );
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let store = Arc::new(InMemoryStreamStore::new());
        let (consumer, repo) = consumer(store.clone()).await;
        let consumer = Arc::new(consumer);

        let handle = {
            let consumer = consumer.clone();
            tokio::spawn(async move { consumer.run().await })
        };

        // Wait for bootstrap before appending.
        while store
            .group_cursor("wb:stream:entity:employer", "jpa_group")
            .unwrap()
            .is_none()
        {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        store
            .append(
                "wb:stream:entity:employer",
                None,
                &entry_fields(r#"{"id":1,"email":"a@b.com"}"#, None),
            )
            .await
            .unwrap();
        while !repo.contains(&1).await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        consumer.shutdown();
        handle.await.unwrap().unwrap();
        assert!(consumer.is_shutdown());
    }
}
