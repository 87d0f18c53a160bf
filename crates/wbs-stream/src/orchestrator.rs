//! Process orchestration.
//!
//! Live delivery and reconciliation both go through [`ProcessOrchestrator`],
//! so an entry is handled the same way no matter which path delivered it.

use async_trait::async_trait;
use tracing::{debug, instrument};

use crate::entry::Entry;
use crate::error::SyncResult;
use crate::processor::Processor;

/// Runs `process` then, only on success, `acknowledge`.
#[async_trait]
pub trait ProcessOrchestrator: Send + Sync {
    /// Process and commit one entry.
    ///
    /// Fails with `SyncError::Processing` when the entry could not be applied
    /// and `SyncError::Acknowledge` when it was applied but not committed.
    async fn orchestrate(&self, entry: &Entry, processor: &dyn Processor) -> SyncResult<()>;
}

/// Orchestrator re-running both steps on every call.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultOrchestrator;

impl DefaultOrchestrator {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProcessOrchestrator for DefaultOrchestrator {
    #[instrument(skip_all, fields(entry_id = %entry.id, group = %processor.pairing().group()))]
    async fn orchestrate(&self, entry: &Entry, processor: &dyn Processor) -> SyncResult<()> {
        processor.process(entry).await?;
        processor.acknowledge(entry).await?;
        debug!("Entry processed and acknowledged");
        Ok(())
    }
}
