//! Pending-entry reconciler.
//!
//! A periodic sweep over the group's pending list. Entries that were
//! delivered but never acknowledged are retried through the same
//! orchestrator as live delivery, bounded by an attempt counter and by their
//! idle time. Exhausted entries go to the dead-letter router.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use crate::attempt::AttemptCounter;
use crate::config::ReconcilerConfig;
use crate::dead_letter::{DeadLetterOutcome, DeadLetterRouter};
use crate::entry::{Entry, EntryRange, PendingEntry};
use crate::error::{Exhaustion, SyncError, SyncResult};
use crate::naming::Pairing;
use crate::orchestrator::ProcessOrchestrator;
use crate::processor::Processor;
use crate::store::{CounterStore, StreamStore};

/// Counters for one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Another sweep was in flight; nothing was done.
    pub skipped: bool,
    pub examined: usize,
    pub recovered: usize,
    pub still_pending: usize,
    pub dead_lettered: usize,
    pub trimmed: usize,
    pub errored: usize,
}

impl SweepReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }

    fn record(&mut self, outcome: EntryOutcome) {
        match outcome {
            EntryOutcome::Recovered => self.recovered += 1,
            EntryOutcome::StillPending => self.still_pending += 1,
            EntryOutcome::DeadLettered => self.dead_lettered += 1,
            EntryOutcome::DeadLetterFailed => self.errored += 1,
            EntryOutcome::Trimmed => self.trimmed += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryOutcome {
    Recovered,
    StillPending,
    DeadLettered,
    DeadLetterFailed,
    Trimmed,
}

/// Reconciler for one pairing.
pub struct PendingReconciler {
    store: Arc<dyn StreamStore>,
    processor: Arc<dyn Processor>,
    orchestrator: Arc<dyn ProcessOrchestrator>,
    counter: AttemptCounter,
    router: DeadLetterRouter,
    config: ReconcilerConfig,
    in_flight: Mutex<()>,
    shutdown: AtomicBool,
    stop: Notify,
}

impl std::fmt::Debug for PendingReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingReconciler")
            .field("pairing", self.pairing())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PendingReconciler {
    pub fn new(
        store: Arc<dyn StreamStore>,
        counters: Arc<dyn CounterStore>,
        processor: Arc<dyn Processor>,
        orchestrator: Arc<dyn ProcessOrchestrator>,
        config: ReconcilerConfig,
    ) -> Self {
        let router = DeadLetterRouter::new(store.clone(), processor.pairing().clone());
        Self {
            counter: AttemptCounter::new(counters, config.max_retention),
            store,
            processor,
            orchestrator,
            router,
            config,
            in_flight: Mutex::new(()),
            shutdown: AtomicBool::new(false),
            stop: Notify::new(),
        }
    }

    #[must_use]
    pub fn pairing(&self) -> &Pairing {
        self.processor.pairing()
    }

    /// Run one sweep.
    ///
    /// Never fails: per-entry and store errors are logged and counted in the
    /// report. Returns a skipped report when another sweep is in flight.
    #[instrument(skip(self), fields(stream = %self.pairing().stream_key(), group = %self.pairing().group()))]
    pub async fn sweep(&self) -> SweepReport {
        let Ok(_guard) = self.in_flight.try_lock() else {
            warn!("Previous sweep still running, skipping");
            return SweepReport::skipped();
        };

        let mut report = SweepReport::default();
        let pairing = self.pairing();

        let summary = match self
            .store
            .pending_summary(pairing.stream_key(), pairing.group())
            .await
        {
            Ok(summary) => summary,
            Err(e) => {
                error!(error = %e, "Failed to read pending summary");
                report.errored += 1;
                return report;
            }
        };
        if summary.is_empty() {
            debug!("No pending entries");
            return report;
        }
        info!(pending = summary.total, "Found pending entries");

        let pending = match self
            .store
            .list_pending(
                pairing.stream_key(),
                pairing.group(),
                pairing.consumer(),
                EntryRange::unbounded(),
                self.config.batch_size,
            )
            .await
        {
            Ok(pending) => pending,
            Err(e) => {
                error!(error = %e, "Failed to list pending entries");
                report.errored += 1;
                return report;
            }
        };

        for entry in &pending {
            report.examined += 1;
            match self.reconcile(entry).await {
                Ok(outcome) => report.record(outcome),
                Err(e) => {
                    error!(entry_id = %entry.id, error = %e, "Error reconciling pending entry");
                    report.errored += 1;
                }
            }
        }

        info!(
            examined = report.examined,
            recovered = report.recovered,
            still_pending = report.still_pending,
            dead_lettered = report.dead_lettered,
            trimmed = report.trimmed,
            errored = report.errored,
            "Sweep finished"
        );
        report
    }

    async fn reconcile(&self, pending: &PendingEntry) -> SyncResult<EntryOutcome> {
        let pairing = self.pairing();
        let key = pairing.counter_key(pending.id);

        let Some(entry) = self.store.lookup(pairing.stream_key(), pending.id).await? else {
            debug!(entry_id = %pending.id, "Pending entry was trimmed from the stream, skipping");
            self.store
                .acknowledge(pairing.stream_key(), pairing.group(), pending.id)
                .await?;
            self.counter.clear(&key).await?;
            return Ok(EntryOutcome::Trimmed);
        };

        if entry.is_init_marker() {
            self.processor.acknowledge(&entry).await?;
            return Ok(EntryOutcome::Recovered);
        }

        let attempts = self.counter.increment(&key).await?;

        if attempts > self.config.max_attempts {
            let reason = Exhaustion::TooManyAttempts {
                attempts,
                max_attempts: self.config.max_attempts,
            };
            return Ok(self.exhausted(&entry, &key, reason, None, attempts).await);
        }
        if pending.idle > self.config.max_retention {
            let reason = Exhaustion::Expired {
                idle: pending.idle,
                max_retention: self.config.max_retention,
            };
            return Ok(self.exhausted(&entry, &key, reason, None, attempts).await);
        }

        debug!(entry_id = %entry.id, attempts, "Retrying pending entry");
        match self
            .orchestrator
            .orchestrate(&entry, self.processor.as_ref())
            .await
        {
            Ok(()) => {
                if let Err(e) = self.counter.clear(&key).await {
                    warn!(entry_id = %entry.id, error = %e, "Failed to clear attempt counter");
                }
                info!(entry_id = %entry.id, attempts, "Pending entry recovered");
                Ok(EntryOutcome::Recovered)
            }
            Err(e) if attempts >= self.config.max_attempts => {
                let reason = Exhaustion::LastAttemptFailed { attempts };
                Ok(self.exhausted(&entry, &key, reason, Some(&e), attempts).await)
            }
            Err(e) => {
                warn!(
                    entry_id = %entry.id,
                    attempts,
                    max_attempts = self.config.max_attempts,
                    error = %e,
                    "Retry failed, entry stays pending"
                );
                Ok(EntryOutcome::StillPending)
            }
        }
    }

    async fn exhausted(
        &self,
        entry: &Entry,
        key: &str,
        reason: Exhaustion,
        last_error: Option<&SyncError>,
        attempts: u64,
    ) -> EntryOutcome {
        let exhausted = SyncError::RetryBudgetExhausted {
            entry_id: entry.id,
            reason,
        };
        let cause = match last_error {
            Some(e) => format!("{exhausted}: {e}"),
            None => exhausted.to_string(),
        };
        warn!(entry_id = %entry.id, reason = %reason, "Routing entry to dead letter stream");

        // On any incomplete outcome the counter is kept so the next sweep
        // comes straight back here without processing the entry again.
        match self.router.handle(entry, &cause, attempts).await {
            DeadLetterOutcome::WriteFailed(e) => {
                error!(entry_id = %entry.id, error = %e, "Dead letter write failed, entry stays pending");
                EntryOutcome::DeadLetterFailed
            }
            DeadLetterOutcome::Routed {
                acknowledged: false,
                ..
            }
            | DeadLetterOutcome::AlreadyRouted {
                acknowledged: false,
            } => {
                error!(entry_id = %entry.id, "Dead-lettered entry not acknowledged, entry stays pending");
                EntryOutcome::DeadLetterFailed
            }
            DeadLetterOutcome::Routed { .. } | DeadLetterOutcome::AlreadyRouted { .. } => {
                if let Err(e) = self.counter.clear(key).await {
                    warn!(entry_id = %entry.id, error = %e, "Failed to clear attempt counter");
                }
                EntryOutcome::DeadLettered
            }
        }
    }

    /// Sweep on a fixed delay until shutdown is requested.
    #[instrument(skip(self), fields(stream = %self.pairing().stream_key(), group = %self.pairing().group()))]
    pub async fn run(&self) {
        info!(
            sweep_interval_ms = self.config.sweep_interval.as_millis() as u64,
            max_attempts = self.config.max_attempts,
            max_retention_ms = self.config.max_retention.as_millis() as u64,
            batch_size = self.config.batch_size,
            "Starting pending reconciler"
        );

        let mut ticker = interval(self.config.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.is_shutdown() {
                        break;
                    }
                    self.sweep().await;
                }
                () = self.stop.notified() => {}
            }
            if self.is_shutdown() {
                break;
            }
        }

        info!("Pending reconciler stopped");
    }

    /// Request graceful shutdown. A sweep in progress runs to completion.
    pub fn shutdown(&self) {
        info!(consumer = %self.pairing().consumer(), "Shutdown requested");
        self.shutdown.store(true, Ordering::Relaxed);
        self.stop.notify_one();
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }
}
