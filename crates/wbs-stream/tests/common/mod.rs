//! Integration test helpers for wbs-stream.
//!
//! Provides a fault-injecting store wrapper, scriptable repositories and a
//! context that wires one (Employer, repository) pipeline over them.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use wbs_stream::error::{RepositoryResult, StoreResult};
use wbs_stream::{
    CounterStore, Entity, Entry, EntryId, EntryRange, InMemoryRepository, InMemoryStreamStore,
    PendingEntry, PendingSummary, Pipeline, Repository, RepositoryError, StartPosition,
    StoreError, StreamStore, WbsConfig, WriteBehindProducer,
};

static INIT: Once = Once::new();

/// Initialize logging for tests (once).
pub fn init_test_logging() {
    INIT.call_once(|| {
        if std::env::var("RUST_LOG").is_ok() {
            tracing_subscriber::fmt()
                .with_test_writer()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .try_init()
                .ok();
        }
    });
}

pub const PREFIX: &str = "wb:stream:entity";
pub const STREAM: &str = "wb:stream:entity:employer";
pub const DLQ: &str = "wb:stream:entity:employer:dlq";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Employer {
    pub id: i64,
    pub email: String,
}

impl Entity for Employer {
    const ENTITY_TYPE: &'static str = "Employer";
}

pub fn employer(id: i64, email: &str) -> Employer {
    Employer {
        id,
        email: email.to_string(),
    }
}

pub fn test_config() -> WbsConfig {
    WbsConfig::builder()
        .max_attempts(3)
        .max_retention(Duration::from_secs(60))
        .batch_size(50)
        .sweep_interval(Duration::from_secs(5))
        .block_timeout(Duration::from_millis(20))
        .read_batch_size(100)
        .build()
        .unwrap()
}

fn unavailable(what: &str) -> StoreError {
    StoreError::Unavailable {
        cause: format!("injected {what} failure"),
    }
}

/// Store wrapper with switchable failures.
#[derive(Default)]
pub struct FlakyStore {
    pub inner: InMemoryStreamStore,
    pub fail_dead_letter_append: AtomicBool,
    pub fail_acknowledge: AtomicBool,
    pub fail_lookup: AtomicBool,
    pub acknowledge_calls: AtomicUsize,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(flag: &AtomicBool, value: bool) {
        flag.store(value, Ordering::SeqCst);
    }
}

#[async_trait]
impl StreamStore for FlakyStore {
    async fn create_group(&self, stream: &str, group: &str, start: StartPosition) -> StoreResult<()> {
        self.inner.create_group(stream, group, start).await
    }

    async fn append(
        &self,
        stream: &str,
        id: Option<EntryId>,
        fields: &BTreeMap<String, String>,
    ) -> StoreResult<EntryId> {
        if stream.ends_with(":dlq") && self.fail_dead_letter_append.load(Ordering::SeqCst) {
            return Err(unavailable("dead-letter append"));
        }
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
        self.acknowledge_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_acknowledge.load(Ordering::SeqCst) {
            return Err(unavailable("acknowledge"));
        }
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
        if self.fail_lookup.load(Ordering::SeqCst) {
            return Err(unavailable("lookup"));
        }
        self.inner.lookup(stream, id).await
    }
}

#[async_trait]
impl CounterStore for FlakyStore {
    async fn increment(&self, key: &str) -> StoreResult<u64> {
        self.inner.increment(key).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        self.inner.expire(key, ttl).await
    }

    async fn remove(&self, key: &str) -> StoreResult<()> {
        self.inner.remove(key).await
    }
}

/// In-memory repository that fails saves for chosen ids and counts calls.
pub struct ScriptedRepository {
    pub items: InMemoryRepository<Employer, i64>,
    pub failing_ids: Mutex<HashSet<i64>>,
    pub save_calls: AtomicUsize,
}

impl ScriptedRepository {
    pub fn new() -> Self {
        Self {
            items: InMemoryRepository::new(|e: &Employer| e.id),
            failing_ids: Mutex::new(HashSet::new()),
            save_calls: AtomicUsize::new(0),
        }
    }

    pub fn fail_for(&self, id: i64) {
        self.failing_ids.lock().unwrap().insert(id);
    }

    pub fn heal(&self, id: i64) {
        self.failing_ids.lock().unwrap().remove(&id);
    }

    pub fn saves(&self) -> usize {
        self.save_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Repository<Employer> for ScriptedRepository {
    type Id = i64;

    async fn save(&self, entity: &Employer) -> RepositoryResult<()> {
        self.save_calls.fetch_add(1, Ordering::SeqCst);
        let failing = self.failing_ids.lock().unwrap().contains(&entity.id);
        if failing {
            return Err(RepositoryError::Unavailable {
                cause: format!("injected failure for id {}", entity.id),
            });
        }
        self.items.save(entity).await
    }

    async fn delete_by_id(&self, id: i64) -> RepositoryResult<()> {
        self.items.delete_by_id(id).await
    }
}

/// Repository whose saves block until released.
pub struct GatedRepository {
    pub entered: Notify,
    pub gate: Notify,
}

impl GatedRepository {
    pub fn new() -> Self {
        Self {
            entered: Notify::new(),
            gate: Notify::new(),
        }
    }
}

#[async_trait]
impl Repository<Employer> for GatedRepository {
    type Id = i64;

    async fn save(&self, _entity: &Employer) -> RepositoryResult<()> {
        self.entered.notify_one();
        self.gate.notified().await;
        Ok(())
    }

    async fn delete_by_id(&self, _id: i64) -> RepositoryResult<()> {
        Ok(())
    }
}

/// One Employer pipeline over a [`FlakyStore`].
pub struct TestContext {
    pub store: Arc<FlakyStore>,
    pub pipeline: Pipeline,
    pub producer: WriteBehindProducer<Employer>,
}

impl TestContext {
    /// Pipeline for repository type "jpa" with the given repositories.
    pub async fn with_repositories(repositories: Vec<(&str, Arc<ScriptedRepository>)>) -> Self {
        init_test_logging();

        let store = Arc::new(FlakyStore::new());
        let mut builder = Pipeline::builder::<Employer>("jpa")
            .config(test_config())
            .store(store.clone());
        for (name, repository) in repositories {
            builder = builder.repository(name, repository);
        }
        let pipeline = builder.build().await.unwrap();
        let producer = WriteBehindProducer::new(store.clone(), PREFIX);

        Self {
            store,
            pipeline,
            producer,
        }
    }

    pub async fn single() -> (Self, Arc<ScriptedRepository>) {
        let repo = Arc::new(ScriptedRepository::new());
        let ctx = Self::with_repositories(vec![("jpa-employers", repo.clone())]).await;
        (ctx, repo)
    }

    /// Bootstrap and deliver everything currently in the stream.
    pub async fn deliver(&self) -> usize {
        let consumer = self.pipeline.consumer();
        consumer.bootstrap().await.unwrap();
        consumer.poll_once().await.unwrap()
    }

    pub async fn pending(&self) -> u64 {
        let pairing = self.pipeline.pairing();
        self.store
            .pending_summary(pairing.stream_key(), pairing.group())
            .await
            .unwrap()
            .total
    }

    pub fn dead_letters(&self) -> Vec<Entry> {
        self.store.inner.entries(DLQ).unwrap()
    }
}
