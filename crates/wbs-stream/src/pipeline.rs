//! Per-pairing wiring.
//!
//! [`Pipeline::builder`] assembles the consumer and reconciler of one
//! (entity, repository) pairing from a store, the repository callbacks and
//! the naming callbacks.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::WbsConfig;
use crate::consumer::StreamConsumer;
use crate::entity::Entity;
use crate::error::{RepositoryResult, SyncError, SyncResult};
use crate::naming::{self, Pairing};
use crate::orchestrator::{DefaultOrchestrator, ProcessOrchestrator};
use crate::processor::{EntityProcessor, Processor};
use crate::reconciler::PendingReconciler;
use crate::repository::{CallbackRepository, Repository, RepositoryId, RepositoryRegistry};
use crate::store::{CounterStore, StreamStore};

type Registration = Box<dyn FnOnce(Arc<RepositoryRegistry>) -> BoxFuture<'static, ()> + Send>;
type GroupNameFn = Box<dyn Fn(&str) -> String + Send + Sync>;
type ConsumerNameFn = Box<dyn Fn(&str, &str) -> String + Send + Sync>;

/// Builder for a [`Pipeline`].
pub struct PipelineBuilder<E> {
    repository_type: String,
    config: WbsConfig,
    store: Option<Arc<dyn StreamStore>>,
    counters: Option<Arc<dyn CounterStore>>,
    registry: Option<Arc<RepositoryRegistry>>,
    registrations: Vec<Registration>,
    group_name: Option<GroupNameFn>,
    consumer_name: Option<ConsumerNameFn>,
    processor: Option<Arc<dyn Processor>>,
    orchestrator: Option<Arc<dyn ProcessOrchestrator>>,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity> PipelineBuilder<E> {
    fn new(repository_type: impl Into<String>) -> Self {
        Self {
            repository_type: repository_type.into(),
            config: WbsConfig::default(),
            store: None,
            counters: None,
            registry: None,
            registrations: Vec::new(),
            group_name: None,
            consumer_name: None,
            processor: None,
            orchestrator: None,
            _entity: PhantomData,
        }
    }

    /// Engine settings. Defaults to `WbsConfig::default()`.
    #[must_use]
    pub fn config(mut self, config: WbsConfig) -> Self {
        self.config = config;
        self
    }

    /// Stream store, also used for attempt counters unless [`Self::counters`] is set.
    #[must_use]
    pub fn store<S>(mut self, store: Arc<S>) -> Self
    where
        S: StreamStore + CounterStore + 'static,
    {
        if self.counters.is_none() {
            let counters: Arc<dyn CounterStore> = store.clone();
            self.counters = Some(counters);
        }
        let store: Arc<dyn StreamStore> = store;
        self.store = Some(store);
        self
    }

    /// Separate counter store.
    #[must_use]
    pub fn counters(mut self, counters: Arc<dyn CounterStore>) -> Self {
        self.counters = Some(counters);
        self
    }

    /// Share a repository registry with other pipelines.
    #[must_use]
    pub fn registry(mut self, registry: Arc<RepositoryRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Register a typed repository for this pairing.
    #[must_use]
    pub fn repository<R>(mut self, name: impl Into<String>, repository: Arc<R>) -> Self
    where
        R: Repository<E>,
    {
        let name = name.into();
        let repository_type = self.repository_type.clone();
        self.registrations.push(Box::new(move |registry| {
            async move {
                registry
                    .register::<E, R>(repository_type, name, repository)
                    .await;
            }
            .boxed()
        }));
        self
    }

    /// Register a repository built from a save callback and a delete callback.
    #[must_use]
    pub fn callbacks<K, S, SF, D, DF>(self, name: impl Into<String>, save: S, delete: D) -> Self
    where
        E: Clone,
        K: RepositoryId,
        S: Fn(E) -> SF + Send + Sync + 'static,
        SF: Future<Output = RepositoryResult<()>> + Send + 'static,
        D: Fn(K) -> DF + Send + Sync + 'static,
        DF: Future<Output = RepositoryResult<()>> + Send + 'static,
    {
        let repository = Arc::new(CallbackRepository::<E, K>::new(save, delete));
        self.repository(name, repository)
    }

    /// Consumer group name from the repository type.
    #[must_use]
    pub fn group_name<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        self.group_name = Some(Box::new(f));
        self
    }

    /// Consumer name from the entity type and repository type.
    #[must_use]
    pub fn consumer_name<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, &str) -> String + Send + Sync + 'static,
    {
        self.consumer_name = Some(Box::new(f));
        self
    }

    /// Replace the generic entity processor.
    #[must_use]
    pub fn processor(mut self, processor: Arc<dyn Processor>) -> Self {
        self.processor = Some(processor);
        self
    }

    /// Replace the default orchestrator.
    #[must_use]
    pub fn orchestrator(mut self, orchestrator: Arc<dyn ProcessOrchestrator>) -> Self {
        self.orchestrator = Some(orchestrator);
        self
    }

    /// Register the repositories and assemble the consumer and reconciler.
    pub async fn build(self) -> SyncResult<Pipeline> {
        let store = self.store.ok_or_else(|| SyncError::ConfigMissing {
            var: "store".to_string(),
        })?;
        let counters = self.counters.ok_or_else(|| SyncError::ConfigMissing {
            var: "counters".to_string(),
        })?;
        if self.repository_type.trim().is_empty() {
            return Err(SyncError::ConfigInvalid {
                var: "repository_type".to_string(),
                reason: "Repository type cannot be empty".to_string(),
            });
        }

        let mut pairing = Pairing::new(
            &self.config.stream_prefix,
            E::ENTITY_TYPE,
            self.repository_type.as_str(),
        );
        if let Some(f) = &self.group_name {
            pairing = pairing.with_group(f(&self.repository_type));
        }
        if let Some(f) = &self.consumer_name {
            pairing = pairing.with_consumer(f(E::ENTITY_TYPE, &self.repository_type));
        }

        let registry = self.registry.unwrap_or_default();
        for registration in self.registrations {
            registration(registry.clone()).await;
        }

        let processor: Arc<dyn Processor> = match self.processor {
            Some(processor) => processor,
            None => Arc::new(EntityProcessor::<E>::new(
                pairing.clone(),
                store.clone(),
                registry.clone(),
            )),
        };
        let orchestrator: Arc<dyn ProcessOrchestrator> = match self.orchestrator {
            Some(orchestrator) => orchestrator,
            None => Arc::new(DefaultOrchestrator::new()),
        };

        let consumer = StreamConsumer::new(
            store.clone(),
            processor.clone(),
            orchestrator.clone(),
            self.config.consumer.clone(),
        );
        let reconciler = PendingReconciler::new(
            store,
            counters,
            processor,
            orchestrator,
            self.config.reconciler.clone(),
        );

        info!(
            entity_type = E::ENTITY_TYPE,
            stream = %pairing.stream_key(),
            group = %pairing.group(),
            consumer = %pairing.consumer(),
            "Pipeline assembled"
        );

        Ok(Pipeline {
            pairing,
            registry,
            consumer: Arc::new(consumer),
            reconciler: Arc::new(reconciler),
        })
    }
}

/// Consumer and reconciler of one pairing.
#[derive(Debug)]
pub struct Pipeline {
    pairing: Pairing,
    registry: Arc<RepositoryRegistry>,
    consumer: Arc<StreamConsumer>,
    reconciler: Arc<PendingReconciler>,
}

impl Pipeline {
    /// Start building a pipeline for entity `E` and `repository_type`.
    #[must_use]
    pub fn builder<E: Entity>(repository_type: impl Into<String>) -> PipelineBuilder<E> {
        PipelineBuilder::new(repository_type)
    }

    #[must_use]
    pub fn pairing(&self) -> &Pairing {
        &self.pairing
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<RepositoryRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn consumer(&self) -> &Arc<StreamConsumer> {
        &self.consumer
    }

    #[must_use]
    pub fn reconciler(&self) -> &Arc<PendingReconciler> {
        &self.reconciler
    }

    /// Bootstrap the consumer group, then spawn the consumer and reconciler tasks.
    ///
    /// Bootstrap failure is returned here and nothing is spawned.
    pub async fn start(&self) -> SyncResult<PipelineHandle> {
        self.consumer.bootstrap().await?;

        let consumer = self.consumer.clone();
        let consumer_task = tokio::spawn(async move { consumer.run().await });
        let reconciler = self.reconciler.clone();
        let reconciler_task = tokio::spawn(async move { reconciler.run().await });

        Ok(PipelineHandle {
            consumer: self.consumer.clone(),
            reconciler: self.reconciler.clone(),
            consumer_task,
            reconciler_task,
        })
    }
}

/// Running pipeline tasks.
#[derive(Debug)]
pub struct PipelineHandle {
    consumer: Arc<StreamConsumer>,
    reconciler: Arc<PendingReconciler>,
    consumer_task: JoinHandle<SyncResult<()>>,
    reconciler_task: JoinHandle<()>,
}

impl PipelineHandle {
    /// Request shutdown of both tasks and wait for them to stop.
    pub async fn shutdown(self) {
        self.consumer.shutdown();
        self.reconciler.shutdown();

        match self.consumer_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "Consumer exited with error"),
            Err(e) => error!(error = %e, "Consumer task panicked"),
        }
        if let Err(e) = self.reconciler_task.await {
            error!(error = %e, "Reconciler task panicked");
        }
    }
}

/// Default consumer group naming, exposed for custom `group_name` callbacks.
#[must_use]
pub fn default_group_name(repository_type: &str) -> String {
    naming::consumer_group(repository_type)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RepositoryError;
    use crate::store::InMemoryStreamStore;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Employer {
        id: i64,
        email: String,
    }

    impl Entity for Employer {
        const ENTITY_TYPE: &'static str = "Employer";
    }

    #[tokio::test]
    async fn test_build_requires_store() {
        let result = Pipeline::builder::<Employer>("jpa").build().await;
        assert!(matches!(result, Err(SyncError::ConfigMissing { ref var }) if var == "store"));
    }

    #[tokio::test]
    async fn test_naming_callbacks_override_defaults() {
        let pipeline = Pipeline::builder::<Employer>("jpa")
            .store(Arc::new(InMemoryStreamStore::new()))
            .group_name(|repo| format!("{repo}-writers"))
            .consumer_name(|entity, repo| format!("{entity}.{repo}"))
            .build()
            .await
            .unwrap();

        assert_eq!(pipeline.pairing().group(), "jpa-writers");
        assert_eq!(pipeline.pairing().consumer(), "Employer.jpa");
        assert_eq!(pipeline.pairing().stream_key(), "wb:stream:entity:employer");
    }

    #[tokio::test]
    async fn test_callbacks_are_registered() {
        let pipeline = Pipeline::builder::<Employer>("jpa")
            .store(Arc::new(InMemoryStreamStore::new()))
            .callbacks(
                "jpa-callbacks",
                |_e: Employer| async { Ok::<(), RepositoryError>(()) },
                |_id: i64| async { Ok::<(), RepositoryError>(()) },
            )
            .build()
            .await
            .unwrap();

        let names = pipeline.registry().registered_names::<Employer>().await;
        assert_eq!(names, vec!["jpa-callbacks"]);
        assert_eq!(pipeline.pairing().group(), default_group_name("jpa"));
    }
}
