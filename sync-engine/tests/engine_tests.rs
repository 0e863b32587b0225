//! End-to-end engine tests against a scripted in-memory task store.
//!
//! Each test wires the real queue, monitor, resolver and dispatcher
//! together and drives dispatch cycles deterministically through
//! `run_cycle`, or lets the background loop react to its triggers.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use sqlx::sqlite::SqlitePoolOptions;
use tokio::sync::Mutex;

use sync_bridge::{RemoteRecord, StoreError, TaskStore};
use sync_engine::{
    ConflictResolver, ManualDecision, NetworkStatus, NetworkStatusMonitor, ResolutionHints,
    SyncDispatcher, SyncItemStatus, SyncOperation, SyncQueue,
};
use sync_runtime::events::{EngineEvent, NetworkEvent, QueueEvent};
use sync_runtime::{EngineConfig, EventBus};

/// Task store that replays a scripted sequence of responses and records
/// every call it receives.
#[derive(Default)]
struct ScriptedStore {
    script: Mutex<VecDeque<Result<RemoteRecord, StoreError>>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedStore {
    async fn push_ok(&self, id: &str, version: i64) {
        self.script.lock().await.push_back(Ok(RemoteRecord {
            id: id.to_string(),
            version,
        }));
    }

    async fn push_err(&self, err: StoreError) {
        self.script.lock().await.push_back(Err(err));
    }

    async fn calls(&self) -> Vec<String> {
        self.calls.lock().await.clone()
    }

    async fn next(&self, call: String) -> Result<RemoteRecord, StoreError> {
        self.calls.lock().await.push(call);
        self.script
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| Err(StoreError::Unavailable("script exhausted".to_string())))
    }
}

#[async_trait]
impl TaskStore for ScriptedStore {
    async fn create(&self, entity_type: &str, _payload: &Value) -> sync_bridge::Result<RemoteRecord> {
        self.next(format!("create:{}", entity_type)).await
    }

    async fn update(
        &self,
        _entity_type: &str,
        entity_id: &str,
        _payload: &Value,
        base_version: i64,
    ) -> sync_bridge::Result<i64> {
        self.next(format!("update:{}@{}", entity_id, base_version))
            .await
            .map(|r| r.version)
    }

    async fn delete(
        &self,
        _entity_type: &str,
        entity_id: &str,
        base_version: i64,
    ) -> sync_bridge::Result<()> {
        self.next(format!("delete:{}@{}", entity_id, base_version))
            .await
            .map(|_| ())
    }
}

struct Harness {
    dispatcher: Arc<SyncDispatcher>,
    store: Arc<ScriptedStore>,
    events: EventBus,
}

async fn harness_with(config: EngineConfig) -> Harness {
    // A single connection keeps every query on the same in-memory database
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect(":memory:")
        .await
        .unwrap();

    let queue = Arc::new(SyncQueue::new(pool).await.unwrap());
    let events = EventBus::new(256);
    let monitor = NetworkStatusMonitor::new(
        config.degraded_failure_threshold,
        config.probe_timeout(),
        events.clone(),
    );
    let resolver = Arc::new(ConflictResolver::new(queue.clone(), events.clone()));
    let store = Arc::new(ScriptedStore::default());
    let dispatcher = Arc::new(SyncDispatcher::new(
        queue,
        store.clone(),
        monitor,
        resolver,
        events.clone(),
        config,
    ));

    Harness {
        dispatcher,
        store,
        events,
    }
}

async fn harness() -> Harness {
    harness_with(EngineConfig::default()).await
}

async fn enqueue_update(
    h: &Harness,
    entity_id: &str,
    payload: Value,
    base_version: i64,
    snapshot: Option<Value>,
) -> sync_engine::SyncItemId {
    h.dispatcher
        .enqueue(
            "task".to_string(),
            entity_id.to_string(),
            SyncOperation::Update,
            Some(payload),
            ResolutionHints::at_version(base_version, snapshot),
        )
        .await
        .unwrap()
}

#[tokio::test]
async fn offline_enqueue_syncs_after_link_returns() {
    let h = harness().await;
    h.dispatcher.network().set_link_down().await;

    let id = enqueue_update(&h, "task-1", json!({"status": "done"}), 5, None).await;

    // Nothing dispatches while offline
    let outcome = h.dispatcher.run_cycle().await.unwrap();
    assert_eq!(outcome.processed, 0);
    assert!(h.store.calls().await.is_empty());

    h.store.push_ok("task-1", 6).await;
    h.dispatcher.network().set_link_up().await;

    let outcome = h.dispatcher.run_cycle().await.unwrap();
    assert_eq!(outcome.processed, 1);

    let item = h.dispatcher.queue().get(id).await.unwrap().unwrap();
    assert_eq!(item.status, SyncItemStatus::Synced);
    assert_eq!(h.store.calls().await, vec!["update:task-1@5"]);
}

#[tokio::test]
async fn create_event_carries_remote_id_for_reconciliation() {
    let h = harness().await;
    let mut sub = h.events.subscribe();

    h.store.push_ok("srv-42", 1).await;
    let id = h
        .dispatcher
        .enqueue(
            "task".to_string(),
            "tmp-local-1".to_string(),
            SyncOperation::Create,
            Some(json!({"title": "buy milk"})),
            ResolutionHints::default(),
        )
        .await
        .unwrap();

    h.dispatcher.run_cycle().await.unwrap();

    let mut synced = None;
    while let Ok(event) = sub.try_recv() {
        if let EngineEvent::Queue(QueueEvent::ItemSynced {
            item_id,
            remote_id,
            version,
            ..
        }) = event
        {
            assert_eq!(item_id, id.as_str());
            synced = Some((remote_id, version));
        }
    }

    // The UI reconciles its temporary id against the server-assigned one
    assert_eq!(synced, Some((Some("srv-42".to_string()), Some(1))));
}

#[tokio::test]
async fn same_entity_stays_sequential() {
    let h = harness().await;

    enqueue_update(&h, "task-1", json!({"status": "doing"}), 5, None).await;
    enqueue_update(&h, "task-1", json!({"status": "done"}), 5, None).await;

    // First attempt fails transiently; the head is rescheduled
    h.store
        .push_err(StoreError::Unavailable("flaky".to_string()))
        .await;
    let outcome = h.dispatcher.run_cycle().await.unwrap();
    assert_eq!(outcome.processed, 0);

    // The second mutation never dispatched while the first is unresolved
    assert_eq!(h.store.calls().await.len(), 1);

    // After the backoff window both sync, oldest first
    tokio::time::sleep(Duration::from_millis(1_200)).await;
    h.store.push_ok("task-1", 6).await;
    h.dispatcher.run_cycle().await.unwrap();
    h.store.push_ok("task-1", 7).await;
    h.dispatcher.run_cycle().await.unwrap();

    assert_eq!(
        h.store.calls().await,
        vec!["update:task-1@5", "update:task-1@5", "update:task-1@5"]
    );

    let stats = h.dispatcher.queue().stats().await.unwrap();
    assert_eq!(stats.synced, 2);
}

#[tokio::test]
async fn distinct_entities_dispatch_in_one_cycle() {
    let h = harness().await;

    for i in 0..3 {
        enqueue_update(&h, &format!("task-{}", i), json!({"status": "done"}), 1, None).await;
        h.store.push_ok(&format!("task-{}", i), 2).await;
    }

    let outcome = h.dispatcher.run_cycle().await.unwrap();
    assert_eq!(outcome.processed, 3);
    assert_eq!(outcome.failed, 0);
    assert_eq!(h.store.calls().await.len(), 3);
}

#[tokio::test]
async fn exhausted_item_fails_and_only_user_retry_resumes() {
    let config = EngineConfig::builder()
        .max_sync_attempts(2)
        .base_backoff_ms(1)
        .build()
        .unwrap();
    let h = harness_with(config).await;
    let mut sub = h.events.subscribe();

    let id = enqueue_update(&h, "task-1", json!({"status": "done"}), 5, None).await;

    h.store
        .push_err(StoreError::Unavailable("down".to_string()))
        .await;
    h.dispatcher.run_cycle().await.unwrap();

    tokio::time::sleep(Duration::from_millis(1_200)).await;
    h.store
        .push_err(StoreError::Unavailable("still down".to_string()))
        .await;
    let outcome = h.dispatcher.run_cycle().await.unwrap();
    assert_eq!(outcome.failed, 1);

    let item = h.dispatcher.queue().get(id).await.unwrap().unwrap();
    assert_eq!(item.status, SyncItemStatus::Failed);
    assert_eq!(item.attempts, 2);

    let mut failed_events = 0;
    while let Ok(event) = sub.try_recv() {
        if let EngineEvent::Queue(QueueEvent::ItemFailed { attempts, .. }) = event {
            failed_events += 1;
            assert_eq!(attempts, 2);
        }
    }
    assert_eq!(failed_events, 1);

    // No automatic resumption
    let outcome = h.dispatcher.run_cycle().await.unwrap();
    assert_eq!(outcome.processed + outcome.failed, 0);
    assert_eq!(h.store.calls().await.len(), 2);

    // Explicit retry, then success clears the error
    h.dispatcher.retry_item(id).await.unwrap();
    h.store.push_ok("task-1", 6).await;
    h.dispatcher.run_cycle().await.unwrap();

    let item = h.dispatcher.queue().get(id).await.unwrap().unwrap();
    assert_eq!(item.status, SyncItemStatus::Synced);
    assert!(item.last_error.is_none());
}

#[tokio::test]
async fn disjoint_conflict_auto_merges_and_syncs() {
    let h = harness().await;

    // Client changed `status` at base 5; server changed only `priority`
    // and sits at version 6
    let id = enqueue_update(
        &h,
        "task-1",
        json!({"status": "done"}),
        5,
        Some(json!({"status": "open", "priority": 1})),
    )
    .await;

    h.store
        .push_err(StoreError::Conflict {
            current_version: 6,
            current_values: Some(json!({"status": "open", "priority": 2})),
        })
        .await;
    h.dispatcher.run_cycle().await.unwrap();

    // Merged and immediately eligible at the new base version
    let item = h.dispatcher.queue().get(id).await.unwrap().unwrap();
    assert_eq!(item.status, SyncItemStatus::Pending);
    assert_eq!(item.hints.base_version, Some(6));

    h.store.push_ok("task-1", 7).await;
    h.dispatcher.run_cycle().await.unwrap();

    let item = h.dispatcher.queue().get(id).await.unwrap().unwrap();
    assert_eq!(item.status, SyncItemStatus::Synced);
    assert_eq!(
        h.store.calls().await,
        vec!["update:task-1@5", "update:task-1@6"]
    );
    assert!(h.dispatcher.conflicts().pending().await.is_empty());
}

#[tokio::test]
async fn overlapping_conflict_waits_for_user_decision() {
    let h = harness().await;

    let id = enqueue_update(
        &h,
        "task-1",
        json!({"status": "done"}),
        5,
        Some(json!({"status": "open"})),
    )
    .await;

    h.store
        .push_err(StoreError::Conflict {
            current_version: 6,
            current_values: Some(json!({"status": "cancelled"})),
        })
        .await;
    let outcome = h.dispatcher.run_cycle().await.unwrap();
    assert_eq!(outcome.failed, 1);

    let item = h.dispatcher.queue().get(id).await.unwrap().unwrap();
    assert_eq!(item.status, SyncItemStatus::Failed);

    let pending = h.dispatcher.conflicts().pending().await;
    assert_eq!(pending.len(), 1);

    // No automatic action until the user decides
    h.dispatcher.run_cycle().await.unwrap();
    assert_eq!(h.store.calls().await.len(), 1);

    // Keep the client's change: force-overwrite at the server's version
    h.dispatcher
        .conflicts()
        .apply_decision(pending[0].id, ManualDecision::KeepClient)
        .await
        .unwrap();

    h.store.push_ok("task-1", 7).await;
    h.dispatcher.run_cycle().await.unwrap();

    let item = h.dispatcher.queue().get(id).await.unwrap().unwrap();
    assert_eq!(item.status, SyncItemStatus::Synced);
    assert_eq!(
        h.store.calls().await,
        vec!["update:task-1@5", "update:task-1@6"]
    );
}

#[tokio::test]
async fn delete_of_remotely_deleted_entity_counts_as_synced() {
    let h = harness().await;

    let id = h
        .dispatcher
        .enqueue(
            "task".to_string(),
            "task-1".to_string(),
            SyncOperation::Delete,
            None,
            ResolutionHints::at_version(5, None),
        )
        .await
        .unwrap();

    h.store
        .push_err(StoreError::NotFound("task-1".to_string()))
        .await;
    let outcome = h.dispatcher.run_cycle().await.unwrap();

    assert_eq!(outcome.processed, 1);
    let item = h.dispatcher.queue().get(id).await.unwrap().unwrap();
    assert_eq!(item.status, SyncItemStatus::Synced);
}

#[tokio::test]
async fn three_failures_degrade_exactly_once() {
    let h = harness().await;
    let mut sub = h.events.subscribe();

    for i in 0..3 {
        enqueue_update(&h, &format!("task-{}", i), json!({"status": "done"}), 1, None).await;
        h.store
            .push_err(StoreError::Unavailable("down".to_string()))
            .await;
    }

    h.dispatcher.run_cycle().await.unwrap();
    assert_eq!(h.dispatcher.network().status(), NetworkStatus::Degraded);

    let mut transitions = Vec::new();
    while let Ok(event) = sub.try_recv() {
        if let EngineEvent::Network(NetworkEvent::StatusChanged {
            old,
            new,
            failure_count,
        }) = event
        {
            transitions.push((old, new, failure_count));
        }
    }
    assert_eq!(
        transitions,
        vec![("online".to_string(), "degraded".to_string(), 3)]
    );

    // One success restores Online
    tokio::time::sleep(Duration::from_millis(1_200)).await;
    h.store.push_ok("task-0", 2).await;
    h.dispatcher.run_cycle().await.unwrap();
    assert_eq!(h.dispatcher.network().status(), NetworkStatus::Online);
}

#[tokio::test]
async fn permanent_rejection_fails_without_blaming_network() {
    let h = harness().await;

    let id = enqueue_update(&h, "task-1", json!({"status": "done"}), 5, None).await;

    h.store
        .push_err(StoreError::Rejected("schema validation failed".to_string()))
        .await;
    let outcome = h.dispatcher.run_cycle().await.unwrap();

    assert_eq!(outcome.failed, 1);
    let item = h.dispatcher.queue().get(id).await.unwrap().unwrap();
    assert_eq!(item.status, SyncItemStatus::Failed);
    // A store rejection is not a connectivity signal
    assert_eq!(h.dispatcher.network().state().await.failure_count, 0);
}

#[tokio::test]
async fn snapshot_reflects_queue_and_network() {
    let h = harness().await;
    h.dispatcher.network().set_link_down().await;
    enqueue_update(&h, "task-1", json!({"status": "done"}), 1, None).await;

    let snapshot = h.dispatcher.snapshot().await.unwrap();
    assert_eq!(snapshot.queue.pending, 1);
    assert_eq!(snapshot.network.status, NetworkStatus::Offline);
    assert_eq!(snapshot.network.failure_count, 0);
}

#[tokio::test]
async fn remove_item_cancels_future_attempts() {
    let h = harness().await;
    h.dispatcher.network().set_link_down().await;

    let id = enqueue_update(&h, "task-1", json!({"status": "done"}), 1, None).await;
    h.dispatcher.remove_item(id).await.unwrap();

    h.dispatcher.network().set_link_up().await;
    let outcome = h.dispatcher.run_cycle().await.unwrap();
    assert_eq!(outcome.processed + outcome.failed, 0);
    assert!(h.store.calls().await.is_empty());
}

#[tokio::test]
async fn queue_state_survives_facade_reopen() {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect(":memory:")
        .await
        .unwrap();

    let queue = SyncQueue::new(pool.clone()).await.unwrap();
    let id = queue
        .enqueue(
            "task".to_string(),
            "task-1".to_string(),
            SyncOperation::Update,
            Some(json!({"status": "done"})),
            ResolutionHints::at_version(5, Some(json!({"status": "open"}))),
        )
        .await
        .unwrap();
    drop(queue);

    // A fresh facade over the same database sees the queued mutation intact
    let reopened = SyncQueue::new(pool).await.unwrap();
    let item = reopened.get(id).await.unwrap().unwrap();
    assert_eq!(item.entity_id, "task-1");
    assert_eq!(item.status, SyncItemStatus::Pending);
    assert_eq!(item.hints.base_version, Some(5));
    assert_eq!(item.hints.base_snapshot, Some(json!({"status": "open"})));
}

#[tokio::test]
async fn background_loop_reacts_to_enqueue() {
    let h = harness().await;
    let mut sub = h.events.subscribe();

    let handle = h.dispatcher.clone().start();

    h.store.push_ok("task-1", 2).await;
    let id = enqueue_update(&h, "task-1", json!({"status": "done"}), 1, None).await;

    let synced = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(EngineEvent::Queue(QueueEvent::ItemSynced { item_id, .. })) = sub.recv().await
            {
                if item_id == id.as_str() {
                    return;
                }
            }
        }
    })
    .await;
    assert!(synced.is_ok(), "item was not synced by the background loop");

    h.dispatcher.stop();
    handle.await.unwrap();
}

#[tokio::test]
async fn background_loop_reacts_to_recovery() {
    let h = harness().await;
    h.dispatcher.network().set_link_down().await;

    let mut sub = h.events.subscribe();
    let handle = h.dispatcher.clone().start();

    h.store.push_ok("task-1", 2).await;
    let id = enqueue_update(&h, "task-1", json!({"status": "done"}), 1, None).await;

    // Give the loop a moment; nothing must dispatch while offline
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.store.calls().await.is_empty());

    h.dispatcher.network().set_link_up().await;

    let synced = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(EngineEvent::Queue(QueueEvent::ItemSynced { item_id, .. })) = sub.recv().await
            {
                if item_id == id.as_str() {
                    return;
                }
            }
        }
    })
    .await;
    assert!(synced.is_ok(), "recovery did not trigger a dispatch cycle");

    h.dispatcher.stop();
    handle.await.unwrap();
}
