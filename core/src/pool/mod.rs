//! Bounded worker pool for recipe executions
//!
//! A fixed number of workers pull [`ExecutionRequest`]s from one shared
//! bounded FIFO. `submit` never waits: it validates, then either admits the
//! request or rejects it with [`SubmitError::Backpressure`].
//!
//! # Ordering
//!
//! Requests waiting in the queue at the same time are dispatched in
//! submission order. A request that finds an idle worker is claimed
//! immediately and may finish before older requests that are still running.
//!
//! # Example
//!
//! ```ignore
//! let pool = PoolController::new(OperationRegistry::with_builtins(), PoolSettings::new(2, 8)?)?;
//! let id = pool.submit(&Recipe::from_text("upper_first | uppercase")?, "hello".into())?;
//! assert_eq!(pool.wait(&id).await, Some(ExecutionOutcome::Success("HELLO".into())));
//! pool.shutdown().await;
//! ```

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{watch, Notify};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::errors::{SettingsError, SubmitError};
use crate::recipe::{validator, Recipe};
use crate::registry::OperationRegistry;
use crate::settings::{PoolSettings, SettingsStore};
use crate::types::{ExecutionOutcome, ExecutionRecord, ExecutionStatus, RequestId, Value};

mod queue;
mod worker;

#[cfg(test)]
mod tests;

pub(crate) use queue::{AdmissionQueue, ExecutionRequest};

/// Point-in-time view of pool occupancy and counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub pool_size: usize,
    pub max_queue_length: usize,
    /// Worker tasks alive, including ones about to retire after a shrink
    pub live_workers: usize,
    pub busy_workers: usize,
    pub queued: usize,
    /// Highest `busy_workers` observed since the pool started
    pub peak_busy: usize,
    pub accepted: u64,
    pub rejected: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

/// Per-request result channel and bookkeeping
struct RequestEntry {
    status: watch::Sender<ExecutionStatus>,
    cancel: CancellationToken,
    fingerprint: String,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl RequestEntry {
    fn is_terminal(&self) -> bool {
        self.status.borrow().is_terminal()
    }
}

/// Everything workers and the controller share, guarded by one mutex
pub(crate) struct PoolState {
    settings: PoolSettings,
    registry: Arc<OperationRegistry>,
    queue: AdmissionQueue,
    live_workers: usize,
    busy_workers: usize,
    accepting: bool,
    next_worker_id: u64,
    entries: HashMap<RequestId, RequestEntry>,
    stats: PoolStats,
}

impl PoolState {
    /// Workers that are neither running a request nor due to retire
    fn idle_workers(&self) -> usize {
        self.live_workers
            .min(self.settings.pool_size)
            .saturating_sub(self.busy_workers)
    }

    fn mark_running(&mut self, id: &RequestId) {
        if let Some(entry) = self.entries.get_mut(id) {
            entry.started_at = Some(Utc::now());
            entry.status.send_replace(ExecutionStatus::Running);
        }
    }

    /// Deliver the terminal state of a request; later deliveries are ignored
    fn finish(&mut self, id: &RequestId, outcome: ExecutionOutcome) -> bool {
        let Some(entry) = self.entries.get_mut(id) else {
            return false;
        };
        if entry.is_terminal() {
            return false;
        }

        let outcome = if entry.cancel.is_cancelled() {
            ExecutionOutcome::Cancelled
        } else {
            outcome
        };
        match &outcome {
            ExecutionOutcome::Success(_) => self.stats.completed += 1,
            ExecutionOutcome::Failure(_) => self.stats.failed += 1,
            ExecutionOutcome::Cancelled => self.stats.cancelled += 1,
        }

        entry.completed_at = Some(Utc::now());
        entry.status.send_replace(ExecutionStatus::Finished(outcome));
        true
    }

    fn snapshot(&self) -> PoolStats {
        PoolStats {
            pool_size: self.settings.pool_size,
            max_queue_length: self.settings.max_queue_length,
            live_workers: self.live_workers,
            busy_workers: self.busy_workers,
            queued: self.queue.len(),
            ..self.stats
        }
    }
}

pub(crate) struct Shared {
    state: Mutex<PoolState>,
    work_available: Notify,
}

impl Shared {
    /// Critical sections never panic midway, so a poisoned lock still holds
    /// consistent state
    pub(crate) fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Owns pool configuration, admission, cancellation and draining
///
/// Cheap to clone; clones share the same pool. Must be created inside a
/// Tokio runtime. Dropping the last clone without [`Self::shutdown`] aborts
/// the workers.
#[derive(Clone)]
pub struct PoolController {
    shared: Arc<Shared>,
    workers: Arc<Mutex<JoinSet<()>>>,
    store: Option<Arc<dyn SettingsStore>>,
}

impl PoolController {
    pub fn new(
        registry: impl Into<Arc<OperationRegistry>>,
        settings: PoolSettings,
    ) -> Result<Self, SettingsError> {
        settings.validate()?;

        let shared = Arc::new(Shared {
            state: Mutex::new(PoolState {
                settings,
                registry: registry.into(),
                queue: AdmissionQueue::new(),
                live_workers: 0,
                busy_workers: 0,
                accepting: true,
                next_worker_id: 0,
                entries: HashMap::new(),
                stats: PoolStats::default(),
            }),
            work_available: Notify::new(),
        });

        let controller = Self {
            shared,
            workers: Arc::new(Mutex::new(JoinSet::new())),
            store: None,
        };
        controller.spawn_missing_workers();

        info!(
            pool_size = settings.pool_size,
            max_queue_length = settings.max_queue_length,
            "Pool started"
        );
        Ok(controller)
    }

    /// Build a pool from persisted settings, falling back to `defaults`
    ///
    /// Later [`Self::apply_settings`] calls are saved back to `store`.
    pub fn with_store(
        registry: impl Into<Arc<OperationRegistry>>,
        store: Arc<dyn SettingsStore>,
        defaults: PoolSettings,
    ) -> anyhow::Result<Self> {
        let settings = store.load()?.unwrap_or(defaults);
        let mut controller = Self::new(registry, settings)?;
        controller.store = Some(store);
        Ok(controller)
    }

    pub fn settings(&self) -> PoolSettings {
        self.shared.lock().settings
    }

    /// Persist new settings, then apply them live
    ///
    /// A failed save leaves the running pool untouched.
    pub fn apply_settings(&self, settings: PoolSettings) -> anyhow::Result<()> {
        settings.validate()?;
        if let Some(store) = &self.store {
            store.save(&settings)?;
        }

        self.resize(settings.pool_size)?;
        self.set_max_queue_length(settings.max_queue_length);
        Ok(())
    }

    /// Change the number of workers
    ///
    /// Growing spawns workers that start pulling from the queue at once.
    /// Shrinking lets excess workers finish what they hold, then retire; no
    /// running or queued request is dropped.
    #[instrument(skip(self))]
    pub fn resize(&self, pool_size: usize) -> Result<(), SettingsError> {
        if pool_size == 0 {
            return Err(SettingsError::ZeroPoolSize);
        }

        let previous = {
            let mut state = self.shared.lock();
            std::mem::replace(&mut state.settings.pool_size, pool_size)
        };

        if pool_size > previous {
            self.spawn_missing_workers();
        } else if pool_size < previous {
            // Wake idle workers so the excess ones notice and retire
            self.shared.work_available.notify_waiters();
        }

        info!(previous, pool_size, "Pool resized");
        Ok(())
    }

    /// Change queue capacity; already queued requests are never evicted
    pub fn set_max_queue_length(&self, max_queue_length: usize) {
        let mut state = self.shared.lock();
        state.settings.max_queue_length = max_queue_length;
        debug!(max_queue_length, queued = state.queue.len(), "Queue capacity changed");
    }

    /// Current registry snapshot
    pub fn registry(&self) -> Arc<OperationRegistry> {
        self.shared.lock().registry.clone()
    }

    /// Install a new registry for future submissions
    ///
    /// Requests already admitted keep the snapshot they were validated with.
    pub fn swap_registry(&self, registry: impl Into<Arc<OperationRegistry>>) {
        let registry = registry.into();
        let count = registry.len();
        self.shared.lock().registry = registry;
        info!(operations = count, "Registry snapshot replaced");
    }

    /// Validate and admit a request
    ///
    /// Returns immediately. The result is delivered later through
    /// [`Self::result`] / [`Self::wait`].
    #[instrument(skip_all, fields(steps = recipe.len()))]
    pub fn submit(&self, recipe: &Recipe, input: Value) -> Result<RequestId, SubmitError> {
        let registry = self.registry();

        let typed = validator::validate_for_input(recipe, &registry, input.tag()).map_err(|e| {
            debug!(error = %e, "Recipe rejected");
            self.shared.lock().stats.rejected += 1;
            SubmitError::from(e)
        })?;

        let id = RequestId::new();
        {
            let mut state = self.shared.lock();

            if !state.accepting {
                state.stats.rejected += 1;
                return Err(SubmitError::ShuttingDown);
            }

            let idle = state.idle_workers();
            let capacity = state.settings.max_queue_length;
            if !state.queue.has_room(idle, capacity) {
                state.stats.rejected += 1;
                let queued = state.queue.len().saturating_sub(idle);
                debug!(queued, capacity, "Request rejected: queue full");
                return Err(SubmitError::Backpressure { queued, capacity });
            }

            let cancel = CancellationToken::new();
            let (status, _) = watch::channel(ExecutionStatus::Queued);
            state.entries.insert(
                id,
                RequestEntry {
                    status,
                    cancel: cancel.clone(),
                    fingerprint: typed.fingerprint().to_string(),
                    created_at: Utc::now(),
                    started_at: None,
                    completed_at: None,
                },
            );

            debug!(
                request_id = %id,
                fingerprint = typed.fingerprint(),
                queued = state.queue.len(),
                idle,
                "Request admitted"
            );

            state.queue.push_back(ExecutionRequest {
                id,
                recipe: typed,
                input,
                registry,
                cancel,
            });
            state.stats.accepted += 1;
        }

        self.shared.work_available.notify_one();
        Ok(id)
    }

    /// Cancel a request by id
    ///
    /// A queued request is removed and resolves to `Cancelled` at once. A
    /// running one is flagged; its worker stops at the next step boundary and
    /// the result resolves to `Cancelled`. Returns `false` for unknown or
    /// already finished requests.
    #[instrument(skip(self), fields(request_id = %id))]
    pub fn cancel(&self, id: &RequestId) -> bool {
        let mut state = self.shared.lock();

        if state.queue.remove(id).is_some() {
            info!("Cancelled queued request");
            return state.finish(id, ExecutionOutcome::Cancelled);
        }

        match state.entries.get(id) {
            Some(entry) if !entry.is_terminal() => {
                entry.cancel.cancel();
                info!("Cancellation requested for running request");
                true
            }
            _ => false,
        }
    }

    /// Current status, or `None` for an unknown id
    pub fn result(&self, id: &RequestId) -> Option<ExecutionStatus> {
        let state = self.shared.lock();
        state.entries.get(id).map(|e| e.status.borrow().clone())
    }

    pub fn record(&self, id: &RequestId) -> Option<ExecutionRecord> {
        let state = self.shared.lock();
        state.entries.get(id).map(|e| ExecutionRecord {
            id: *id,
            status: e.status.borrow().clone(),
            fingerprint: e.fingerprint.clone(),
            created_at: e.created_at,
            started_at: e.started_at,
            completed_at: e.completed_at,
        })
    }

    /// Wait for the terminal state of a request
    pub async fn wait(&self, id: &RequestId) -> Option<ExecutionOutcome> {
        let mut rx = {
            let state = self.shared.lock();
            state.entries.get(id)?.status.subscribe()
        };
        let status = rx.wait_for(ExecutionStatus::is_terminal).await.ok()?;
        status.outcome().cloned()
    }

    /// Remove a finished request's record and return its outcome
    pub fn take_result(&self, id: &RequestId) -> Option<ExecutionOutcome> {
        let mut state = self.shared.lock();
        if !state.entries.get(id)?.is_terminal() {
            return None;
        }
        let entry = state.entries.remove(id)?;
        let status = entry.status.borrow().clone();
        status.outcome().cloned()
    }

    pub fn stats(&self) -> PoolStats {
        self.shared.lock().snapshot()
    }

    /// Stop admitting, cancel everything still queued, let running requests
    /// finish, then release the workers
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        let cancelled = {
            let mut state = self.shared.lock();
            state.accepting = false;
            let drained: Vec<RequestId> = state.queue.drain().map(|r| r.id).collect();
            for id in &drained {
                state.finish(id, ExecutionOutcome::Cancelled);
            }
            drained.len()
        };
        self.shared.work_available.notify_waiters();
        info!(cancelled, "Pool draining");

        let mut workers = {
            let mut guard = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *guard)
        };
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Worker ended abnormally");
            }
        }

        info!("Pool stopped");
    }

    fn spawn_missing_workers(&self) {
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        let mut state = self.shared.lock();
        if !state.accepting {
            return;
        }

        while state.live_workers < state.settings.pool_size {
            let worker_id = state.next_worker_id;
            state.next_worker_id += 1;
            state.live_workers += 1;
            workers.spawn(worker::run_worker(self.shared.clone(), worker_id));
        }
    }
}
