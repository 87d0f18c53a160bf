//! Write-behind producer.

use std::fmt::Display;
use std::marker::PhantomData;
use std::sync::Arc;

use tracing::{debug, instrument};

use crate::entity::Entity;
use crate::entry::{entry_fields, EntryId, Operation};
use crate::error::{SyncError, SyncResult};
use crate::naming::stream_key;
use crate::store::StreamStore;

/// Appends mutations of entity `E` to its stream.
pub struct WriteBehindProducer<E> {
    store: Arc<dyn StreamStore>,
    stream_key: String,
    _entity: PhantomData<fn(E)>,
}

impl<E> std::fmt::Debug for WriteBehindProducer<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteBehindProducer")
            .field("stream_key", &self.stream_key)
            .finish_non_exhaustive()
    }
}

impl<E: Entity> WriteBehindProducer<E> {
    /// Create a producer writing to `<prefix>:<entitytype>`.
    pub fn new(store: Arc<dyn StreamStore>, prefix: &str) -> Self {
        Self {
            store,
            stream_key: stream_key(prefix, E::ENTITY_TYPE),
            _entity: PhantomData,
        }
    }

    #[must_use]
    pub fn stream_key(&self) -> &str {
        &self.stream_key
    }

    /// Record an upsert.
    pub async fn save(&self, entity: &E) -> SyncResult<EntryId> {
        let content = serde_json::to_string(entity).map_err(|source| SyncError::Serialize {
            entity_type: E::ENTITY_TYPE,
            source,
        })?;
        self.append(&content, None).await
    }

    /// Record a delete by identifier.
    pub async fn delete(&self, id: impl Display) -> SyncResult<EntryId> {
        self.append(&id.to_string(), Some(Operation::Delete)).await
    }

    /// Append a raw entry.
    #[instrument(skip(self, content), fields(stream = %self.stream_key))]
    pub async fn append(&self, content: &str, operation: Option<Operation>) -> SyncResult<EntryId> {
        let id = self
            .store
            .append(&self.stream_key, None, &entry_fields(content, operation))
            .await?;
        debug!(entry_id = %id, operation = ?operation, "Entry appended");
        Ok(id)
    }
}
