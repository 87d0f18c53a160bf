//! Error types for the wbs-stream crate.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::entry::EntryId;
use crate::repository::IdType;

/// Errors raised by a stream store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The stream key does not exist yet.
    #[error("Stream {stream} does not exist")]
    StreamMissing { stream: String },

    /// The consumer group was already created.
    #[error("Consumer group {group} already exists on stream {stream}")]
    GroupExists { stream: String, group: String },

    /// The consumer group was never created.
    #[error("Consumer group {group} does not exist on stream {stream}")]
    GroupMissing { stream: String, group: String },

    /// An explicit id was not greater than the stream's last id.
    #[error("Entry id {id} is equal or smaller than the last id of stream {stream}")]
    IdNotIncreasing { stream: String, id: EntryId },

    /// A reply carried an id that could not be parsed.
    #[error("Invalid entry id: {id}")]
    InvalidEntryId { id: String },

    // Connection errors (transient)
    /// The store could not be reached.
    #[error("Stream store unavailable: {cause}")]
    Unavailable { cause: String },

    /// The store answered with something unexpected.
    #[error("Unexpected stream store reply: {cause}")]
    Protocol { cause: String },

    /// Internal Redis client error.
    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

impl StoreError {
    /// Returns true if this error is transient and the call can be retried.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Unavailable { .. } => true,
            #[cfg(feature = "redis")]
            StoreError::Redis(e) => e.is_io_error() || e.is_timeout() || e.is_connection_dropped(),
            _ => false,
        }
    }
}

/// Errors raised by a backing repository.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// The backing store could not be reached.
    #[error("Repository unavailable: {cause}")]
    Unavailable { cause: String },

    /// The backing store refused the write.
    #[error("Repository rejected the operation: {cause}")]
    Rejected { cause: String },

    /// Any other backend failure.
    #[error("Repository backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Identifier conversion failures.
#[derive(Debug, Error)]
pub enum ResolutionError {
    /// The raw identifier string was empty.
    #[error("Identifier value cannot be empty")]
    EmptyId,

    /// The raw identifier could not be converted into the repository's key type.
    #[error("Cannot create {id_type} identifier from '{value}': {cause}")]
    InvalidId {
        id_type: IdType,
        value: String,
        cause: String,
    },

    /// The converted key does not match what the repository expects.
    #[error("Identifier type {id_type} is not supported by a repository keyed by {expected}")]
    UnsupportedIdType { id_type: IdType, expected: IdType },
}

/// Failure of an untyped call against a resolved repository handle.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Uniform processing failure: the entry could not be applied to its repositories.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// A required field is absent.
    #[error("Entry {entry_id} has no '{field}' field")]
    MissingField {
        entry_id: EntryId,
        field: &'static str,
    },

    /// The content could not be deserialized into the entity.
    #[error("Failed to deserialize {entity_type} from entry {entry_id}: {source}")]
    Deserialize {
        entry_id: EntryId,
        entity_type: &'static str,
        #[source]
        source: serde_json::Error,
    },

    /// Repository resolution or identifier conversion failed.
    #[error("Resolution failed for entry {entry_id}: {source}")]
    Resolution {
        entry_id: EntryId,
        #[source]
        source: ResolutionError,
    },

    /// A repository failed to apply the mutation.
    #[error("Repository {repository} failed for entry {entry_id}: {source}")]
    Repository {
        entry_id: EntryId,
        repository: String,
        #[source]
        source: RepositoryError,
    },
}

/// Why the reconciler stopped retrying an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exhaustion {
    /// The attempt counter went past the budget.
    TooManyAttempts { attempts: u64, max_attempts: u64 },
    /// The failed retry used the last permitted attempt.
    LastAttemptFailed { attempts: u64 },
    /// The entry sat undelivered for longer than the retention window.
    Expired { idle: Duration, max_retention: Duration },
}

impl fmt::Display for Exhaustion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooManyAttempts {
                attempts,
                max_attempts,
            } => write!(f, "Too many attempts ({attempts} > {max_attempts})"),
            Self::LastAttemptFailed { attempts } => {
                write!(f, "Last attempt failed after {attempts} attempts")
            }
            Self::Expired {
                idle,
                max_retention,
            } => write!(
                f,
                "Long lasting message (idle {} ms > {} ms)",
                idle.as_millis(),
                max_retention.as_millis()
            ),
        }
    }
}

/// Engine-level errors.
#[derive(Debug, Error)]
pub enum SyncError {
    // Configuration errors (permanent, no retry)
    /// Required configuration variable is missing.
    #[error("Configuration missing: {var}")]
    ConfigMissing { var: String },

    /// Configuration value is invalid.
    #[error("Configuration invalid for {var}: {reason}")]
    ConfigInvalid { var: String, reason: String },

    /// Stream or consumer group setup failed; fatal for the consumer.
    #[error("Bootstrap of group {group} on stream {stream} failed: {source}")]
    Bootstrap {
        stream: String,
        group: String,
        #[source]
        source: StoreError,
    },

    /// Deserialization, resolution or repository failure; retried.
    #[error("Processing failed: {0}")]
    Processing(#[from] ProcessError),

    /// The entry was applied but its acknowledgment failed; retried.
    #[error("Acknowledge of entry {entry_id} in group {group} failed: {source}")]
    Acknowledge {
        entry_id: EntryId,
        group: String,
        #[source]
        source: StoreError,
    },

    /// The entry exhausted its retry budget; terminal.
    #[error("Retry budget exhausted for entry {entry_id}: {reason}")]
    RetryBudgetExhausted { entry_id: EntryId, reason: Exhaustion },

    /// Writing to the dead-letter stream failed; logged, never escalated.
    #[error("Dead-letter write of entry {entry_id} to {dlq} failed: {source}")]
    DeadLetterWrite {
        entry_id: EntryId,
        dlq: String,
        #[source]
        source: StoreError,
    },

    /// A producer could not serialize the entity.
    #[error("Failed to serialize {entity_type}: {source}")]
    Serialize {
        entity_type: &'static str,
        #[source]
        source: serde_json::Error,
    },

    /// Any other stream store failure.
    #[error("Stream store error: {0}")]
    Store(#[from] StoreError),
}

/// Failure categories used for logging and retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Config,
    Bootstrap,
    Processing,
    Acknowledge,
    Resolution,
    RetryBudgetExhausted,
    DeadLetterWrite,
    Serialize,
    Store,
}

impl SyncError {
    /// The failure category.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::ConfigMissing { .. } | SyncError::ConfigInvalid { .. } => ErrorKind::Config,
            SyncError::Bootstrap { .. } => ErrorKind::Bootstrap,
            SyncError::Processing(ProcessError::Resolution { .. }) => ErrorKind::Resolution,
            SyncError::Processing(_) => ErrorKind::Processing,
            SyncError::Acknowledge { .. } => ErrorKind::Acknowledge,
            SyncError::RetryBudgetExhausted { .. } => ErrorKind::RetryBudgetExhausted,
            SyncError::DeadLetterWrite { .. } => ErrorKind::DeadLetterWrite,
            SyncError::Serialize { .. } => ErrorKind::Serialize,
            SyncError::Store(_) => ErrorKind::Store,
        }
    }

    /// Returns true if the entry stays pending and will be retried by the reconciler.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Processing | ErrorKind::Acknowledge | ErrorKind::Resolution | ErrorKind::Store
        )
    }

    /// Returns true if this is a configuration error.
    #[must_use]
    pub fn is_config_error(&self) -> bool {
        self.kind() == ErrorKind::Config
    }
}

/// Result type for engine operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Result type for stream store calls.
pub type StoreResult<T> = Result<T, StoreError>;

/// Result type for repository calls.
pub type RepositoryResult<T> = Result<T, RepositoryError>;
