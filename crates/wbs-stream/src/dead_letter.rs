//! Dead-letter routing.
//!
//! Entries that ran out of retries are copied to `<streamKey>:dlq` with the
//! failure context and then acknowledged on the original stream.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use tracing::{error, instrument, warn};

use crate::entry::{Entry, EntryId};
use crate::error::{StoreError, SyncError};
use crate::naming::Pairing;
use crate::store::StreamStore;

pub const ERROR_FIELD: &str = "error";
pub const ORIGINAL_STREAM_KEY_FIELD: &str = "originalStreamKey";
pub const ORIGINAL_ENTRY_ID_FIELD: &str = "originalEntryId";
pub const CONSUMER_NAME_FIELD: &str = "consumerName";
pub const GROUP_NAME_FIELD: &str = "groupName";
pub const FAILED_AT_FIELD: &str = "failedAt";
pub const ATTEMPTS_FIELD: &str = "attempts";

/// Result of routing one entry.
#[derive(Debug)]
pub enum DeadLetterOutcome {
    /// A new record was written to the dead-letter stream.
    Routed { dlq_id: EntryId, acknowledged: bool },
    /// A record with the original id was already in the dead-letter stream.
    AlreadyRouted { acknowledged: bool },
    /// The record could not be written; the original entry stays pending.
    WriteFailed(SyncError),
}

impl DeadLetterOutcome {
    /// Whether the dead-letter stream now holds the entry.
    #[must_use]
    pub fn is_quarantined(&self) -> bool {
        !matches!(self, Self::WriteFailed(_))
    }
}

/// Terminal quarantine for one pairing.
#[derive(Clone)]
pub struct DeadLetterRouter {
    store: Arc<dyn StreamStore>,
    pairing: Pairing,
}

impl std::fmt::Debug for DeadLetterRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadLetterRouter")
            .field("dlq", &self.pairing.dlq_key())
            .finish_non_exhaustive()
    }
}

impl DeadLetterRouter {
    pub fn new(store: Arc<dyn StreamStore>, pairing: Pairing) -> Self {
        Self { store, pairing }
    }

    /// Build the enriched dead-letter record.
    #[must_use]
    pub fn record(&self, entry: &Entry, cause: &str, attempts: u64) -> BTreeMap<String, String> {
        let mut fields = entry.fields.clone();
        fields.insert(ERROR_FIELD.to_string(), cause.to_string());
        fields.insert(
            ORIGINAL_STREAM_KEY_FIELD.to_string(),
            entry.stream_key.clone(),
        );
        fields.insert(ORIGINAL_ENTRY_ID_FIELD.to_string(), entry.id.to_string());
        fields.insert(
            CONSUMER_NAME_FIELD.to_string(),
            self.pairing.consumer().to_string(),
        );
        fields.insert(GROUP_NAME_FIELD.to_string(), self.pairing.group().to_string());
        fields.insert(
            FAILED_AT_FIELD.to_string(),
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        );
        fields.insert(ATTEMPTS_FIELD.to_string(), attempts.to_string());
        fields
    }

    /// Quarantine `entry` and acknowledge the original.
    ///
    /// Never fails: write errors are logged and returned as
    /// [`DeadLetterOutcome::WriteFailed`].
    #[instrument(skip(self, entry, cause), fields(entry_id = %entry.id, dlq = %self.pairing.dlq_key()))]
    pub async fn handle(&self, entry: &Entry, cause: &str, attempts: u64) -> DeadLetterOutcome {
        let record = self.record(entry, cause, attempts);

        let outcome = match self.write(entry.id, &record).await {
            Ok(Some(dlq_id)) => DeadLetterOutcome::Routed {
                dlq_id,
                acknowledged: self.acknowledge(entry.id).await,
            },
            Ok(None) => DeadLetterOutcome::AlreadyRouted {
                acknowledged: self.acknowledge(entry.id).await,
            },
            Err(source) => {
                error!(error = %source, "Error moving entry to dead letter stream");
                return DeadLetterOutcome::WriteFailed(SyncError::DeadLetterWrite {
                    entry_id: entry.id,
                    dlq: self.pairing.dlq_key().to_string(),
                    source,
                });
            }
        };

        warn!(
            cause = %cause,
            attempts,
            "Entry moved to dead letter stream for manual processing"
        );
        outcome
    }

    /// Append with the original id when possible. `Ok(None)` means the record
    /// was already there.
    async fn write(
        &self,
        id: EntryId,
        record: &BTreeMap<String, String>,
    ) -> Result<Option<EntryId>, StoreError> {
        let dlq = self.pairing.dlq_key();
        match self.store.append(dlq, Some(id), record).await {
            Ok(dlq_id) => Ok(Some(dlq_id)),
            Err(StoreError::IdNotIncreasing { .. }) => {
                if self.store.lookup(dlq, id).await?.is_some() {
                    warn!("Dead letter record already present");
                    return Ok(None);
                }
                warn!("Original id cannot be reused in dead letter stream, using a generated id");
                self.store.append(dlq, None, record).await.map(Some)
            }
            Err(e) => Err(e),
        }
    }

    async fn acknowledge(&self, id: EntryId) -> bool {
        match self
            .store
            .acknowledge(self.pairing.stream_key(), self.pairing.group(), id)
            .await
        {
            Ok(_) => true,
            Err(e) => {
                error!(error = %e, "Dead-lettered entry could not be acknowledged");
                false
            }
        }
    }
}
