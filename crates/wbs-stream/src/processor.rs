//! Entry processor.
//!
//! Deserializes one entry and applies it to every repository registered for
//! the entity under the pairing's repository type.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument, trace};

use crate::entity::Entity;
use crate::entry::{Entry, CONTENT_FIELD};
use crate::error::{DispatchError, ProcessError, SyncError};
use crate::naming::Pairing;
use crate::repository::RepositoryRegistry;
use crate::store::StreamStore;

/// Applies entries and commits them.
///
/// Processing must be idempotent: the same entry is routinely applied more
/// than once.
#[async_trait]
pub trait Processor: Send + Sync {
    /// Names of the (entity, repository) pairing this processor serves.
    fn pairing(&self) -> &Pairing;

    /// Apply the entry to the backing stores.
    async fn process(&self, entry: &Entry) -> Result<(), ProcessError>;

    /// Remove the entry from the group's pending list.
    async fn acknowledge(&self, entry: &Entry) -> Result<(), SyncError>;
}

/// Generic processor for entity `E`.
pub struct EntityProcessor<E> {
    pairing: Pairing,
    store: Arc<dyn StreamStore>,
    registry: Arc<RepositoryRegistry>,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity> EntityProcessor<E> {
    pub fn new(pairing: Pairing, store: Arc<dyn StreamStore>, registry: Arc<RepositoryRegistry>) -> Self {
        Self {
            pairing,
            store,
            registry,
            _entity: PhantomData,
        }
    }

    fn decode(&self, entry: &Entry, content: &str) -> Result<E, ProcessError> {
        serde_json::from_str(content).map_err(|source| ProcessError::Deserialize {
            entry_id: entry.id,
            entity_type: E::ENTITY_TYPE,
            source,
        })
    }
}

impl<E> std::fmt::Debug for EntityProcessor<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityProcessor")
            .field("pairing", &self.pairing)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<E: Entity> Processor for EntityProcessor<E> {
    fn pairing(&self) -> &Pairing {
        &self.pairing
    }

    #[instrument(skip(self, entry), fields(entry_id = %entry.id, stream = %entry.stream_key))]
    async fn process(&self, entry: &Entry) -> Result<(), ProcessError> {
        let content = entry.content().ok_or(ProcessError::MissingField {
            entry_id: entry.id,
            field: CONTENT_FIELD,
        })?;

        // Deletes carry the raw identifier, upserts the JSON document.
        let entity = if entry.is_delete() {
            None
        } else {
            Some(self.decode(entry, content)?)
        };

        let handles = self
            .registry
            .find_repositories_for_entity::<E>(self.pairing.repository_type())
            .await;
        if handles.is_empty() {
            info!(
                entity_type = E::ENTITY_TYPE,
                repository_type = %self.pairing.repository_type(),
                "No repositories registered, nothing to apply"
            );
            return Ok(());
        }

        for handle in &handles {
            match &entity {
                None => {
                    trace!(repository = %handle.name(), "Deleting");
                    RepositoryRegistry::execute_id_operation(handle.as_ref(), content)
                        .await
                        .map_err(|e| match e {
                            DispatchError::Resolution(source) => ProcessError::Resolution {
                                entry_id: entry.id,
                                source,
                            },
                            DispatchError::Repository(source) => ProcessError::Repository {
                                entry_id: entry.id,
                                repository: handle.name().to_string(),
                                source,
                            },
                        })?;
                }
                Some(entity) => {
                    trace!(repository = %handle.name(), "Saving");
                    RepositoryRegistry::execute_operation(handle.as_ref(), entity)
                        .await
                        .map_err(|source| ProcessError::Repository {
                            entry_id: entry.id,
                            repository: handle.name().to_string(),
                            source,
                        })?;
                }
            }
        }

        debug!(repositories = handles.len(), "Entry processed");
        Ok(())
    }

    async fn acknowledge(&self, entry: &Entry) -> Result<(), SyncError> {
        let acknowledged = self
            .store
            .acknowledge(self.pairing.stream_key(), self.pairing.group(), entry.id)
            .await
            .map_err(|source| SyncError::Acknowledge {
                entry_id: entry.id,
                group: self.pairing.group().to_string(),
                source,
            })?;

        if acknowledged {
            debug!(entry_id = %entry.id, group = %self.pairing.group(), "Entry acknowledged");
        } else {
            debug!(entry_id = %entry.id, group = %self.pairing.group(), "Entry was not pending");
        }
        Ok(())
    }
}
