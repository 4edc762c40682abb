//! # Retry Queue
//!
//! Holds pushes that failed on a transient transport error and retries them
//! with bounded exponential backoff.
//!
//! ## Entry Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Retry Queue Flow                                │
//! │                                                                         │
//! │  push fails (transient) ──► enqueue(path, envelope)                    │
//! │                               │  one entry per path; a newer failure  │
//! │                               │  for the same path replaces the       │
//! │                               │  payload and restarts the schedule    │
//! │                               ▼                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │  worker tick (every 500ms)                                     │   │
//! │  │    due = !parked && !in_flight && next_attempt_at <= now       │   │
//! │  │    attempt:                                                     │   │
//! │  │      stale hash (newer intent for path) ──► Superseded, drop   │   │
//! │  │      write ok                           ──► Succeeded, drop    │   │
//! │  │      write fails, attempts < max        ──► reschedule         │   │
//! │  │      write fails, attempts == max       ──► parked             │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                                                         │
//! │  SCHEDULE: 2s, 4s, 8s (then parked)                                    │
//! │  PARKED:   kept, never auto-retried, reported with can_retry = true,   │
//! │            retry_now() or dismiss() by the user                        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use dayflow_core::conflict::lww_winner;
use dayflow_core::{now_millis, RawEnvelope, Side};

use crate::config::RetrySettings;
use crate::context::SyncContext;
use crate::error::{SyncError, SyncResult};
use crate::events::SyncFailure;
use crate::sync_log::LogSource;

// =============================================================================
// Types
// =============================================================================

/// A queued push.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryQueueEntry {
    /// `{collection}-{key|root}-{timestamp}`.
    pub id: String,
    pub collection: String,
    pub key: Option<String>,
    pub path: String,
    /// The envelope to write.
    pub payload: RawEnvelope,
    /// Failed retry attempts so far.
    pub attempts: u32,
    pub next_attempt_at: Instant,
    pub last_error: Option<String>,
    pub in_flight: bool,
    /// Out of automatic attempts.
    pub parked: bool,
}

impl RetryQueueEntry {
    fn label(&self) -> String {
        format!("{}/{}", self.collection, self.key.as_deref().unwrap_or("root"))
    }
}

/// Result of one retry attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome {
    Succeeded,
    Failed { can_retry: bool },
    /// Another attempt for this entry is running.
    InFlight,
    /// A newer push for the same path replaced this payload, or a newer
    /// envelope from another device already won.
    Superseded,
    NotFound,
}

/// Totals from [`RetryQueue::drain`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainSummary {
    pub succeeded: usize,
    pub failed: usize,
}

struct Slot {
    entry: RetryQueueEntry,
    backoff: ExponentialBackoff,
}

// =============================================================================
// Retry Queue
// =============================================================================

/// Queue of failed pushes, one per remote path.
pub struct RetryQueue {
    ctx: Arc<SyncContext>,
    settings: RetrySettings,
    slots: Mutex<HashMap<String, Slot>>,
}

impl RetryQueue {
    pub fn new(ctx: Arc<SyncContext>, settings: RetrySettings) -> Self {
        RetryQueue {
            ctx,
            settings,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Adds or replaces the entry for `path`. Returns the entry id.
    pub fn enqueue(
        &self,
        collection: &str,
        key: Option<&str>,
        path: &str,
        payload: RawEnvelope,
        error: &SyncError,
    ) -> String {
        let mut backoff = self.new_backoff();
        let delay = backoff.next_backoff().unwrap_or_else(|| self.settings.max_backoff());
        let next_attempt_at = Instant::now() + delay;

        let (id, label) = {
            let mut slots = self.slots();
            match slots.get_mut(path) {
                Some(slot) => {
                    slot.entry.payload = payload;
                    slot.entry.attempts = 0;
                    slot.entry.parked = false;
                    slot.entry.next_attempt_at = next_attempt_at;
                    slot.entry.last_error = Some(error.to_string());
                    slot.backoff = backoff;
                    (slot.entry.id.clone(), slot.entry.label())
                }
                None => {
                    let entry = RetryQueueEntry {
                        id: format!(
                            "{}-{}-{}",
                            collection,
                            key.unwrap_or("root"),
                            now_millis()
                        ),
                        collection: collection.to_string(),
                        key: key.map(str::to_string),
                        path: path.to_string(),
                        payload,
                        attempts: 0,
                        next_attempt_at,
                        last_error: Some(error.to_string()),
                        in_flight: false,
                        parked: false,
                    };
                    let result = (entry.id.clone(), entry.label());
                    slots.insert(path.to_string(), Slot { entry, backoff });
                    result
                }
            }
        };

        debug!(entry_id = %id, path = %path, delay_ms = delay.as_millis() as u64, "Queued failed push");
        self.ctx
            .log()
            .retry(format!("Added to retry queue: {}", label));
        id
    }

    /// Drops the entry for `path` (a newer write already landed).
    pub fn discard_path(&self, path: &str) {
        if let Some(slot) = self.slots().remove(path) {
            debug!(entry_id = %slot.entry.id, path = %path, "Retry entry discarded");
            self.ctx
                .log()
                .retry(format!("Dropped from retry queue: {}", slot.entry.label()));
        }
    }

    /// Queued payload for `path`, if any. This is the newest local intent
    /// that has not reached the remote yet.
    pub fn pending_payload(&self, path: &str) -> Option<RawEnvelope> {
        self.slots().get(path).map(|slot| slot.entry.payload.clone())
    }

    /// Attempts one entry now, parked or not.
    pub async fn retry_now(&self, id: &str) -> RetryOutcome {
        let (path, label, payload, attempt) = {
            let mut slots = self.slots();
            let Some(slot) = slots.values_mut().find(|slot| slot.entry.id == id) else {
                return RetryOutcome::NotFound;
            };
            if slot.entry.in_flight {
                return RetryOutcome::InFlight;
            }
            slot.entry.in_flight = true;
            (
                slot.entry.path.clone(),
                slot.entry.label(),
                slot.entry.payload.clone(),
                slot.entry.attempts + 1,
            )
        };

        self.ctx.log().retry(format!(
            "Retrying {} (attempt {}/{})",
            label, attempt, self.settings.max_attempts
        ));

        let result = {
            let _writes = self.ctx.lock_writes().await;
            if !self.ctx.is_intended(&path, &payload.hash) || self.is_outdated(&path, &payload) {
                None
            } else {
                Some(self.ctx.write_envelope(&path, &payload).await)
            }
        };

        match result {
            None => {
                self.remove_if_current(&path, &payload.hash);
                debug!(entry_id = %id, path = %path, "Retry entry superseded");
                RetryOutcome::Superseded
            }
            Some(Ok(())) => {
                self.remove_if_current(&path, &payload.hash);
                self.ctx
                    .log()
                    .sync(LogSource::Remote, format!("Retry successful: {}", label));
                RetryOutcome::Succeeded
            }
            Some(Err(e)) => self.record_failure(&path, &payload.hash, e),
        }
    }

    /// Attempts every due entry.
    pub async fn process_due(&self) -> usize {
        let now = Instant::now();
        let due: Vec<String> = {
            let slots = self.slots();
            let mut due: Vec<&RetryQueueEntry> = slots
                .values()
                .map(|slot| &slot.entry)
                .filter(|e| !e.parked && !e.in_flight && e.next_attempt_at <= now)
                .collect();
            due.sort_by_key(|e| e.next_attempt_at);
            due.into_iter().map(|e| e.id.clone()).collect()
        };

        for id in &due {
            self.retry_now(id).await;
        }
        due.len()
    }

    /// Retries every entry once, parked ones included.
    pub async fn drain(&self) -> DrainSummary {
        let ids: Vec<String> = self.entries().into_iter().map(|e| e.id).collect();
        self.ctx
            .log()
            .info(LogSource::Remote, format!("Draining retry queue: {} items", ids.len()));

        let mut summary = DrainSummary::default();
        for id in ids {
            match self.retry_now(&id).await {
                RetryOutcome::Succeeded | RetryOutcome::Superseded => summary.succeeded += 1,
                RetryOutcome::Failed { .. } | RetryOutcome::InFlight => summary.failed += 1,
                RetryOutcome::NotFound => {}
            }
        }

        self.ctx.log().info(
            LogSource::Remote,
            format!(
                "Retry queue drained: {} succeeded, {} failed",
                summary.succeeded, summary.failed
            ),
        );
        summary
    }

    /// Removes an entry. Returns false if it was unknown.
    pub fn dismiss(&self, id: &str) -> bool {
        let mut slots = self.slots();
        let path = slots
            .iter()
            .find(|(_, slot)| slot.entry.id == id)
            .map(|(path, _)| path.clone());
        match path {
            Some(path) => {
                slots.remove(&path);
                info!(entry_id = %id, "Retry entry dismissed");
                true
            }
            None => false,
        }
    }

    /// Snapshot of all entries, soonest first.
    pub fn entries(&self) -> Vec<RetryQueueEntry> {
        let mut entries: Vec<RetryQueueEntry> =
            self.slots().values().map(|slot| slot.entry.clone()).collect();
        entries.sort_by_key(|e| e.next_attempt_at);
        entries
    }

    /// Entry for one remote path.
    pub fn entry_for_path(&self, path: &str) -> Option<RetryQueueEntry> {
        self.slots().get(path).map(|slot| slot.entry.clone())
    }

    pub fn len(&self) -> usize {
        self.slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn parked_count(&self) -> usize {
        self.slots().values().filter(|slot| slot.entry.parked).count()
    }

    pub fn clear(&self) {
        self.slots().clear();
        self.ctx.log().info(LogSource::Remote, "Retry queue cleared");
    }

    /// Routes failure notifications to `callback`.
    pub fn set_error_callback<F>(&self, callback: F)
    where
        F: Fn(&SyncFailure) + Send + Sync + 'static,
    {
        self.ctx.emitter().set_error_callback(callback);
    }

    /// Spawns the background tick loop.
    pub fn spawn_worker(self: &Arc<Self>) -> RetryWorkerHandle {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        tokio::spawn(run_worker(self.clone(), shutdown_rx));
        RetryWorkerHandle { shutdown_tx }
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn new_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.settings.initial_backoff(),
            current_interval: self.settings.initial_backoff(),
            max_interval: self.settings.max_backoff(),
            multiplier: self.settings.multiplier,
            randomization_factor: 0.0,
            max_elapsed_time: None,
            ..Default::default()
        }
    }

    /// True when an envelope already known for `path` beats `payload`.
    fn is_outdated(&self, path: &str, payload: &RawEnvelope) -> bool {
        self.ctx
            .known(path)
            .is_some_and(|known| lww_winner(payload, &known) == Side::Remote)
    }

    fn remove_if_current(&self, path: &str, hash: &str) {
        let mut slots = self.slots();
        let current = slots
            .get(path)
            .is_some_and(|slot| slot.entry.payload.hash == hash);
        if current {
            slots.remove(path);
        } else if let Some(slot) = slots.get_mut(path) {
            slot.entry.in_flight = false;
        }
    }

    fn record_failure(&self, path: &str, hash: &str, error: SyncError) -> RetryOutcome {
        let (failure, outcome) = {
            let mut slots = self.slots();
            let Some(slot) = slots.get_mut(path) else {
                // Dismissed while the attempt ran
                return RetryOutcome::Failed { can_retry: false };
            };
            slot.entry.in_flight = false;
            if slot.entry.payload.hash != hash {
                // Replaced while the attempt ran; the new payload has its own schedule
                return RetryOutcome::Failed { can_retry: true };
            }

            slot.entry.attempts += 1;
            slot.entry.last_error = Some(error.to_string());
            let attempts = slot.entry.attempts;
            let max = self.settings.max_attempts;
            let entry_id = slot.entry.id.clone();
            let collection = slot.entry.collection.clone();
            let label = slot.entry.label();

            let (message, can_retry) = if !error.is_retryable() {
                slots.remove(path);
                (format!("Sync failed for {}: {}", label, error), false)
            } else if attempts >= max {
                slot.entry.parked = true;
                (
                    format!("Sync failed for {} (max retries exceeded, {} attempts)", label, max),
                    true,
                )
            } else {
                let delay = slot
                    .backoff
                    .next_backoff()
                    .unwrap_or_else(|| self.settings.max_backoff());
                slot.entry.next_attempt_at = Instant::now() + delay;
                (
                    format!("Sync failed for {} (retry {}/{})", label, attempts, max),
                    true,
                )
            };

            (
                SyncFailure {
                    entry_id: Some(entry_id),
                    collection,
                    message,
                    can_retry,
                },
                RetryOutcome::Failed { can_retry },
            )
        };

        warn!(path = %path, error = %error, can_retry = failure.can_retry, "Retry attempt failed");
        self.ctx
            .log()
            .error(LogSource::Remote, failure.message.clone(), &error.to_string());
        self.ctx.emitter().emit_error(&failure);
        outcome
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

// =============================================================================
// Worker
// =============================================================================

/// Handle for stopping the retry worker.
#[derive(Clone)]
pub struct RetryWorkerHandle {
    shutdown_tx: mpsc::Sender<()>,
}

impl RetryWorkerHandle {
    /// Triggers graceful shutdown.
    pub async fn shutdown(&self) -> SyncResult<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| SyncError::ChannelError("Retry shutdown channel closed".into()))
    }
}

async fn run_worker(queue: Arc<RetryQueue>, mut shutdown_rx: mpsc::Receiver<()>) {
    info!("Retry worker starting");

    let tick: Duration = queue.settings.tick_interval();
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let attempted = queue.process_due().await;
                if attempted > 0 {
                    debug!(attempted, remaining = queue.len(), "Retry tick");
                }
            }

            _ = shutdown_rx.recv() => {
                info!("Retry worker shutting down");
                break;
            }
        }
    }

    info!("Retry worker stopped");
}
