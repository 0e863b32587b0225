//! # Sync Dispatcher
//!
//! Orchestrates delivery of queued mutations to the remote Task Store.
//!
//! ## Overview
//!
//! The `SyncDispatcher` is the central orchestrator of the engine. It
//! coordinates between the other modules to:
//! - Watch network status and suspend dispatch while `Offline`
//! - Select eligible queue heads (`SyncQueue::eligible_heads`) so each
//!   entity has at most one attempt in flight and per-entity order holds
//! - Dispatch distinct entities concurrently, bounded by a fan-out limit
//! - Bound each attempt with a timeout (longer while `Degraded`)
//! - Feed attempt outcomes back into the `NetworkStatusMonitor`
//! - Route version conflicts to the `ConflictResolver`
//! - Emit progress events via `EventBus`
//!
//! ## Cycle Triggers
//!
//! The background loop started by [`SyncDispatcher::start`] runs a dispatch
//! cycle when:
//! 1. the network status transitions to `Online`,
//! 2. a new mutation is enqueued (and the network is usable),
//! 3. the periodic safety-net timer fires.
//!
//! [`SyncDispatcher::run_cycle`] is public so a single cycle can be driven
//! deterministically, which is also how the integration tests exercise the
//! engine.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use sync_engine::SyncDispatcher;
//!
//! # async fn example(dispatcher: std::sync::Arc<SyncDispatcher>) -> Result<(), Box<dyn std::error::Error>> {
//! let handle = dispatcher.clone().start();
//!
//! let item_id = dispatcher
//!     .enqueue(
//!         "task".to_string(),
//!         "task-1".to_string(),
//!         SyncOperation::Update,
//!         Some(serde_json::json!({"status": "done"})),
//!         ResolutionHints::at_version(5, None),
//!     )
//!     .await?;
//!
//! dispatcher.stop();
//! handle.await?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{Mutex, Notify, Semaphore};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use sync_bridge::{StoreError, TaskStore};
use sync_runtime::events::{EngineEvent, QueueEvent};
use sync_runtime::{EngineConfig, EventBus};

use crate::conflict::{ConflictResolver, ResolutionOutcome};
use crate::error::{Result, SyncError};
use crate::item::{ResolutionHints, SyncItemId, SyncOperation, SyncQueueItem};
use crate::network::{NetworkState, NetworkStatus, NetworkStatusMonitor};
use crate::queue::{QueueStats, SyncQueue};

/// Result of one dispatch cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleOutcome {
    /// Items that reached `Synced` this cycle
    pub processed: u64,
    /// Items that reached `Failed` this cycle
    pub failed: u64,
}

/// Point-in-time engine view for listener (re)attachment
///
/// Event delivery is best-effort; a listener that (re)connects re-derives
/// current state from this snapshot instead of relying on event replay.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct EngineSnapshot {
    pub queue: QueueStats,
    pub network: NetworkState,
}

enum AttemptOutcome {
    Synced,
    Rescheduled,
    Failed,
    Conflict(ResolutionOutcome),
    Skipped,
}

/// Dispatches queued mutations to the remote store
pub struct SyncDispatcher {
    queue: Arc<SyncQueue>,
    store: Arc<dyn TaskStore>,
    monitor: NetworkStatusMonitor,
    resolver: Arc<ConflictResolver>,
    events: EventBus,
    config: EngineConfig,
    semaphore: Arc<Semaphore>,
    notify: Notify,
    cancel: CancellationToken,
    /// Entities with an attempt in flight; guards against overlap between
    /// the background loop and externally driven cycles
    in_flight: Mutex<HashSet<(String, String)>>,
}

impl SyncDispatcher {
    /// Create a new dispatcher
    pub fn new(
        queue: Arc<SyncQueue>,
        store: Arc<dyn TaskStore>,
        monitor: NetworkStatusMonitor,
        resolver: Arc<ConflictResolver>,
        events: EventBus,
        config: EngineConfig,
    ) -> Self {
        let fanout = config.dispatch_fanout_limit;
        Self {
            queue,
            store,
            monitor,
            resolver,
            events,
            config,
            semaphore: Arc::new(Semaphore::new(fanout)),
            notify: Notify::new(),
            cancel: CancellationToken::new(),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// The queue this dispatcher drains
    pub fn queue(&self) -> &Arc<SyncQueue> {
        &self.queue
    }

    /// The network monitor feeding this dispatcher
    pub fn network(&self) -> &NetworkStatusMonitor {
        &self.monitor
    }

    /// The conflict resolver handling rejected mutations
    pub fn conflicts(&self) -> &Arc<ConflictResolver> {
        &self.resolver
    }

    /// Start the background dispatch loop
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        info!(
            fanout = self.config.dispatch_fanout_limit,
            interval_secs = self.config.sync_interval_secs,
            "Starting sync dispatcher"
        );

        tokio::spawn(async move { self.run_loop().await })
    }

    /// Stop the background loop; in-flight attempts finish within their
    /// per-attempt timeout
    pub fn stop(&self) {
        info!("Stopping sync dispatcher");
        self.cancel.cancel();
    }

    async fn run_loop(&self) {
        let mut status_rx = self.monitor.subscribe();
        let mut ticker = tokio::time::interval(self.config.sync_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately, draining anything queued
        // while the process was down

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = self.notify.notified() => {}
                changed = status_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    // Only a recovery to Online warrants an immediate cycle
                    if *status_rx.borrow_and_update() != NetworkStatus::Online {
                        continue;
                    }
                }
                _ = ticker.tick() => {}
            }

            if let Err(e) = self.run_cycle().await {
                error!(error = %e, "Dispatch cycle failed");
            }
        }

        debug!("Sync dispatcher loop exited");
    }

    /// Run a single dispatch cycle
    ///
    /// Skips entirely while `Offline`; while `Degraded` attempts proceed
    /// with the longer per-attempt timeout. Distinct entities dispatch
    /// concurrently up to the fan-out limit; same-entity mutations stay
    /// strictly sequential via head selection.
    #[instrument(skip(self))]
    pub async fn run_cycle(&self) -> Result<CycleOutcome> {
        let status = self.monitor.status();
        if !status.is_usable() {
            debug!("Network offline; skipping dispatch cycle");
            return Ok(CycleOutcome::default());
        }
        let degraded = status == NetworkStatus::Degraded;

        self.queue
            .prune_synced(self.config.synced_retention_secs)
            .await?;

        let now = chrono::Utc::now().timestamp();
        let heads = self.queue.eligible_heads(now).await?;

        let mut claimed = Vec::new();
        {
            let mut in_flight = self.in_flight.lock().await;
            for item in heads {
                let key = (item.entity_type.clone(), item.entity_id.clone());
                if in_flight.insert(key) {
                    claimed.push(item);
                }
            }
        }

        if claimed.is_empty() {
            return Ok(CycleOutcome::default());
        }

        debug!(
            count = claimed.len(),
            degraded, "Dispatching eligible queue heads"
        );

        let attempts = claimed.into_iter().map(|item| {
            let semaphore = self.semaphore.clone();
            async move {
                let key = (item.entity_type.clone(), item.entity_id.clone());
                let outcome = match semaphore.acquire_owned().await {
                    Ok(_permit) => self.attempt(item, degraded).await,
                    Err(_) => Ok(AttemptOutcome::Skipped),
                };
                self.in_flight.lock().await.remove(&key);
                outcome
            }
        });

        let mut cycle = CycleOutcome::default();
        for outcome in futures::future::join_all(attempts).await {
            match outcome? {
                AttemptOutcome::Synced | AttemptOutcome::Conflict(ResolutionOutcome::ServerWins) => {
                    cycle.processed += 1
                }
                AttemptOutcome::Failed
                | AttemptOutcome::Conflict(ResolutionOutcome::PendingManual) => cycle.failed += 1,
                AttemptOutcome::Rescheduled
                | AttemptOutcome::Conflict(_)
                | AttemptOutcome::Skipped => {}
            }
        }

        self.events
            .emit(EngineEvent::Queue(QueueEvent::CycleCompleted {
                processed: cycle.processed,
                failed: cycle.failed,
            }))
            .ok();

        Ok(cycle)
    }

    async fn attempt(&self, head: SyncQueueItem, degraded: bool) -> Result<AttemptOutcome> {
        let item = match self.queue.mark_syncing(head.id).await {
            Ok(item) => item,
            // Lost a race with another cycle; the item is no longer ours
            Err(SyncError::InvalidStateTransition { .. }) => return Ok(AttemptOutcome::Skipped),
            Err(e) => return Err(e),
        };

        self.events
            .emit(EngineEvent::Queue(QueueEvent::ItemSyncing {
                item_id: item.id.as_str(),
                entity_id: item.entity_id.clone(),
                attempt: item.attempts + 1,
            }))
            .ok();

        let timeout = self.config.attempt_timeout(degraded);
        let call = tokio::time::timeout(timeout, self.deliver(&item)).await;

        match call {
            Ok(Ok(delivery)) => {
                self.queue.mark_synced(item.id).await?;
                self.monitor.report_success().await;

                self.events
                    .emit(EngineEvent::Queue(QueueEvent::ItemSynced {
                        item_id: item.id.as_str(),
                        entity_id: item.entity_id.clone(),
                        remote_id: delivery.remote_id,
                        version: delivery.version,
                    }))
                    .ok();

                Ok(AttemptOutcome::Synced)
            }
            Ok(Err(StoreError::Conflict {
                current_version,
                current_values,
            })) => {
                // Conflicts are never retryable failures and say nothing
                // about network health
                let outcome = self
                    .resolver
                    .resolve(&item, current_version, current_values)
                    .await?;

                if outcome == ResolutionOutcome::Merged {
                    // Merged items are immediately eligible again
                    self.notify.notify_one();
                }
                Ok(AttemptOutcome::Conflict(outcome))
            }
            Ok(Err(StoreError::NotFound(_))) if item.operation == SyncOperation::Delete => {
                // Already gone remotely; same resolution as a delete conflict
                // against a deleted entity
                let base = item.hints.base_version.unwrap_or_default();
                let outcome = self.resolver.resolve(&item, base, None).await?;
                Ok(AttemptOutcome::Conflict(outcome))
            }
            Ok(Err(e)) if e.is_transient() => {
                self.monitor.report_failure().await;
                self.handle_retryable(&item, e.to_string()).await
            }
            Ok(Err(e)) => {
                // Permanent store rejection; retrying cannot help and the
                // network is not to blame
                warn!(item_id = %item.id, error = %e, "Mutation rejected by store");
                self.terminal_failure(&item, e.to_string()).await
            }
            Err(_) => {
                self.monitor.report_failure().await;
                self.handle_retryable(
                    &item,
                    SyncError::AttemptTimeout(timeout.as_millis() as u64).to_string(),
                )
                .await
            }
        }
    }

    async fn handle_retryable(
        &self,
        item: &SyncQueueItem,
        error: String,
    ) -> Result<AttemptOutcome> {
        if item.attempts + 1 < self.config.max_sync_attempts {
            let delay = item.backoff_delay_ms(
                self.config.base_backoff_ms,
                self.config.backoff_ceiling_ms,
            );
            self.queue
                .reschedule_pending(item.id, error, delay)
                .await?;
            Ok(AttemptOutcome::Rescheduled)
        } else {
            self.terminal_failure(item, error).await
        }
    }

    async fn terminal_failure(&self, item: &SyncQueueItem, error: String) -> Result<AttemptOutcome> {
        let failed = self.queue.mark_failed(item.id, error.clone()).await?;

        self.events
            .emit(EngineEvent::Queue(QueueEvent::ItemFailed {
                item_id: item.id.as_str(),
                entity_id: item.entity_id.clone(),
                attempts: failed.attempts,
                message: error,
            }))
            .ok();

        Ok(AttemptOutcome::Failed)
    }

    async fn deliver(&self, item: &SyncQueueItem) -> sync_bridge::Result<Delivery> {
        match item.operation {
            SyncOperation::Create => {
                let payload = item.payload.as_ref().cloned().unwrap_or(Value::Null);
                let record = self.store.create(&item.entity_type, &payload).await?;
                Ok(Delivery {
                    remote_id: Some(record.id),
                    version: Some(record.version),
                })
            }
            SyncOperation::Update => {
                let payload = item.payload.as_ref().cloned().unwrap_or(Value::Null);
                let base = item.hints.base_version.unwrap_or_default();
                let version = self
                    .store
                    .update(&item.entity_type, &item.entity_id, &payload, base)
                    .await?;
                Ok(Delivery {
                    remote_id: None,
                    version: Some(version),
                })
            }
            SyncOperation::Delete => {
                let base = item.hints.base_version.unwrap_or_default();
                self.store
                    .delete(&item.entity_type, &item.entity_id, base)
                    .await?;
                Ok(Delivery {
                    remote_id: None,
                    version: None,
                })
            }
        }
    }

    /// Validate and persist a new mutation, then nudge the dispatch loop
    pub async fn enqueue(
        &self,
        entity_type: String,
        entity_id: String,
        operation: SyncOperation,
        payload: Option<Value>,
        hints: ResolutionHints,
    ) -> Result<SyncItemId> {
        let item_id = self
            .queue
            .enqueue(
                entity_type.clone(),
                entity_id.clone(),
                operation,
                payload,
                hints,
            )
            .await?;

        self.events
            .emit(EngineEvent::Queue(QueueEvent::ItemEnqueued {
                item_id: item_id.as_str(),
                entity_type,
                entity_id,
                operation: operation.as_str().to_string(),
            }))
            .ok();

        if self.monitor.status().is_usable() {
            self.notify.notify_one();
        }

        Ok(item_id)
    }

    /// Explicit user retry of a failed item
    pub async fn retry_item(&self, id: SyncItemId) -> Result<()> {
        self.queue.retry_failed(id).await?;
        if self.monitor.status().is_usable() {
            self.notify.notify_one();
        }
        Ok(())
    }

    /// Remove an item, cancelling future attempts
    ///
    /// An attempt already in flight is bounded by its timeout rather than
    /// interrupted.
    pub async fn remove_item(&self, id: SyncItemId) -> Result<()> {
        self.queue.remove(id).await
    }

    /// Current engine state for listener (re)attachment
    pub async fn snapshot(&self) -> Result<EngineSnapshot> {
        Ok(EngineSnapshot {
            queue: self.queue.stats().await?,
            network: self.monitor.state().await,
        })
    }
}

struct Delivery {
    remote_id: Option<String>,
    version: Option<i64>,
}
