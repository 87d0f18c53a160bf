//! # wbs-stream
//!
//! Write-behind synchronization over an append-only stream.
//!
//! A mutation is appended to a per-entity stream and propagated
//! asynchronously into one or more backing repositories. Delivery is
//! at-least-once: failed entries stay pending, are retried by a periodic
//! reconciler and end up in a dead-letter stream once their retry budget
//! is spent.
//!
//! ## Features
//!
//! - **Live consumer**: bootstraps the consumer group and drains new entries
//! - **Pending reconciler**: bounded retries by attempt count and idle time
//! - **Dead-letter routing**: exhausted entries are copied to `<stream>:dlq`
//! - **Repository registry**: type-erased save and delete-by-id dispatch
//!
//! ## Cargo Features
//!
//! - `redis`: Redis Streams backed store (`RedisStreamStore`)
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use wbs_stream::{InMemoryRepository, InMemoryStreamStore, Pipeline, WbsConfig, WriteBehindProducer};
//!
//! let store = Arc::new(InMemoryStreamStore::new());
//! let employers = Arc::new(InMemoryRepository::new(|e: &Employer| e.id));
//!
//! let pipeline = Pipeline::builder::<Employer>("jpa")
//!     .config(WbsConfig::from_env()?)
//!     .store(store.clone())
//!     .repository("jpa-employers", employers)
//!     .build()
//!     .await?;
//! let handle = pipeline.start().await?;
//!
//! let producer = WriteBehindProducer::<Employer>::new(store, "wb:stream:entity");
//! producer.save(&employer).await?;
//!
//! handle.shutdown().await;
//! ```

pub mod attempt;
pub mod config;
pub mod consumer;
pub mod dead_letter;
pub mod entity;
pub mod entry;
pub mod error;
pub mod naming;
pub mod orchestrator;
pub mod pipeline;
pub mod processor;
pub mod producer;
pub mod reconciler;
pub mod repository;
pub mod store;

pub use attempt::AttemptCounter;
pub use config::{ConsumerConfig, ReconcilerConfig, WbsConfig, WbsConfigBuilder};
pub use consumer::StreamConsumer;
pub use dead_letter::{DeadLetterOutcome, DeadLetterRouter};
pub use entity::Entity;
pub use entry::{Entry, EntryId, EntryRange, Operation, PendingEntry, PendingSummary, StartPosition};
pub use error::{
    DispatchError, ErrorKind, Exhaustion, ProcessError, RepositoryError, ResolutionError,
    StoreError, SyncError, SyncResult,
};
pub use naming::Pairing;
pub use orchestrator::{DefaultOrchestrator, ProcessOrchestrator};
pub use pipeline::{Pipeline, PipelineBuilder, PipelineHandle};
pub use processor::{EntityProcessor, Processor};
pub use producer::WriteBehindProducer;
pub use reconciler::{PendingReconciler, SweepReport};
pub use repository::{
    create_id, CallbackRepository, EntityKey, IdType, InMemoryRepository, Repository,
    RepositoryHandle, RepositoryId, RepositoryRegistry,
};
pub use store::{CounterStore, InMemoryStreamStore, StreamStore};

#[cfg(feature = "redis")]
pub use store::RedisStreamStore;
