//! # Conflict Resolver
//!
//! Resolves optimistic-concurrency conflicts between queued local mutations
//! and the remote store.
//!
//! ## Overview
//!
//! A conflict arises when the store rejects a mutation because the entity
//! changed since the client last saw it (`base_version` mismatch). The
//! resolver applies the first matching policy:
//!
//! - **Server wins**: a queued delete against an entity already deleted
//!   remotely is a no-op; the item is marked synced.
//! - **Auto-merge**: when the fields the client changed and the fields the
//!   server changed are disjoint (computable only when the enqueue-time
//!   snapshot is available), the client's fields apply cleanly over the
//!   server document; the item is requeued against the server's latest
//!   version for an immediate retry.
//! - **Manual**: overlapping edits, a missing snapshot, or an update
//!   against a remotely deleted entity always surface to the user; the
//!   item is parked and a [`ConflictRecord`] is retained until
//!   [`ConflictResolver::apply_decision`] is called.
//!
//! The engine never silently discards a local change; only an explicit
//! keep-server decision does.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use sync_runtime::events::{ConflictEvent, EngineEvent};
use sync_runtime::EventBus;

use crate::error::{Result, SyncError};
use crate::item::{SyncItemId, SyncOperation, SyncQueueItem};
use crate::queue::SyncQueue;

/// Type-safe conflict identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConflictId(Uuid);

impl ConflictId {
    /// Create a new random conflict ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a conflict ID from a string
    pub fn from_string(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| SyncError::InvalidItemId(e.to_string()))
    }

    /// Get the string representation
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for ConflictId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConflictId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a conflict was (or will be) resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolutionOutcome {
    /// Server state kept; local change discarded or already satisfied
    ServerWins,
    /// Local change force-applied over the server state (user decision)
    ClientWins,
    /// Disjoint edits combined automatically
    Merged,
    /// Awaiting a user decision
    PendingManual,
}

impl ResolutionOutcome {
    /// String representation used in events and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ServerWins => "server-wins",
            Self::ClientWins => "client-wins",
            Self::Merged => "merged",
            Self::PendingManual => "pending-manual",
        }
    }
}

/// User decision on a pending-manual conflict
#[derive(Debug, Clone, PartialEq)]
pub enum ManualDecision {
    /// Discard the local change; the item is removed from the queue
    KeepServer,
    /// Retry the original local payload against the server's current version
    KeepClient,
    /// Retry a hand-merged payload against the server's current version
    Merge(Value),
}

/// A detected version conflict and everything needed to resolve it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictRecord {
    /// Unique identifier
    pub id: ConflictId,
    /// The rejected queue item
    pub item_id: SyncItemId,
    pub entity_type: String,
    pub entity_id: String,
    pub operation: SyncOperation,
    /// The client's intended field values
    pub client_values: Option<Value>,
    /// Server's current field values; `None` means deleted remotely
    pub server_values: Option<Value>,
    /// Server's current version
    pub server_version: i64,
    /// Fields the client intends to change
    pub client_changed: Vec<String>,
    /// Fields the server changed since the client's snapshot
    pub server_changed: Vec<String>,
    /// The combined document when auto-merge applied
    pub merged: Option<Value>,
    pub outcome: ResolutionOutcome,
    /// Unix timestamp when detected
    pub detected_at: i64,
}

/// Resolves version conflicts against the queue
pub struct ConflictResolver {
    queue: Arc<SyncQueue>,
    events: EventBus,
    pending: Mutex<HashMap<ConflictId, ConflictRecord>>,
}

impl ConflictResolver {
    /// Create a new conflict resolver
    pub fn new(queue: Arc<SyncQueue>, events: EventBus) -> Self {
        Self {
            queue,
            events,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve a conflict reported by the store for an in-flight item
    ///
    /// Applies the first matching policy (server-wins, auto-merge, manual)
    /// and updates the queue accordingly. Returns the outcome; only
    /// [`ResolutionOutcome::PendingManual`] requires further action.
    #[instrument(skip(self, item, server_values), fields(item_id = %item.id, entity_id = %item.entity_id))]
    pub async fn resolve(
        &self,
        item: &SyncQueueItem,
        server_version: i64,
        server_values: Option<Value>,
    ) -> Result<ResolutionOutcome> {
        let client_changed = item
            .payload
            .as_ref()
            .map(object_fields)
            .unwrap_or_default();
        let server_changed = match (&item.hints.base_snapshot, &server_values) {
            (Some(base), Some(current)) => Some(changed_fields(base, current)),
            _ => None,
        };

        let mut record = ConflictRecord {
            id: ConflictId::new(),
            item_id: item.id,
            entity_type: item.entity_type.clone(),
            entity_id: item.entity_id.clone(),
            operation: item.operation,
            client_values: item.payload.clone(),
            server_values: server_values.clone(),
            server_version,
            client_changed: client_changed.clone(),
            server_changed: server_changed.clone().unwrap_or_default(),
            merged: None,
            outcome: ResolutionOutcome::PendingManual,
            detected_at: chrono::Utc::now().timestamp(),
        };

        // Policy 1: delete of an entity already deleted remotely is satisfied
        if item.operation == SyncOperation::Delete && server_values.is_none() {
            record.outcome = ResolutionOutcome::ServerWins;
            self.queue.mark_synced(item.id).await?;
            self.finish(&record);
            return Ok(ResolutionOutcome::ServerWins);
        }

        // Policy 2: disjoint edits merge automatically
        if let (Some(server_changed), Some(server_doc)) = (&server_changed, &server_values) {
            let disjoint = !client_changed.is_empty()
                && client_changed.iter().all(|f| !server_changed.contains(f));
            if disjoint {
                record.outcome = ResolutionOutcome::Merged;
                record.merged = Some(apply_over(server_doc, item.payload.as_ref()));

                // Retry the original client fields against the server's
                // latest version; partial update semantics make that
                // equivalent to sending the merged document
                self.queue
                    .requeue_for_merge(item.id, None, server_version, Some(server_doc.clone()))
                    .await?;
                self.finish(&record);
                return Ok(ResolutionOutcome::Merged);
            }
        }

        // Policy 3: everything else needs a user decision
        warn!(
            conflict_id = %record.id,
            client_changed = ?record.client_changed,
            server_changed = ?record.server_changed,
            remotely_deleted = server_values.is_none(),
            "Conflict requires manual resolution"
        );

        self.queue
            .mark_failed(
                item.id,
                format!("conflict pending manual resolution ({})", record.id),
            )
            .await?;

        self.events
            .emit(EngineEvent::Conflict(ConflictEvent::Detected {
                conflict_id: record.id.as_str(),
                item_id: item.id.as_str(),
                entity_type: record.entity_type.clone(),
                entity_id: record.entity_id.clone(),
                requires_manual: true,
            }))
            .ok();

        self.pending.lock().await.insert(record.id, record);
        Ok(ResolutionOutcome::PendingManual)
    }

    /// Apply a user decision to a pending-manual conflict
    ///
    /// Keep-server removes the item (the user explicitly discarded the
    /// local change); keep-client and merge requeue it against the
    /// server's current version for a force-overwrite retry.
    #[instrument(skip(self, decision), fields(conflict_id = %conflict_id))]
    pub async fn apply_decision(
        &self,
        conflict_id: ConflictId,
        decision: ManualDecision,
    ) -> Result<ResolutionOutcome> {
        let mut record = self
            .pending
            .lock()
            .await
            .remove(&conflict_id)
            .ok_or_else(|| SyncError::ConflictNotFound {
                conflict_id: conflict_id.to_string(),
            })?;

        let result = match decision {
            ManualDecision::KeepServer => {
                record.outcome = ResolutionOutcome::ServerWins;
                self.queue.remove(record.item_id).await
            }
            ManualDecision::KeepClient => {
                record.outcome = ResolutionOutcome::ClientWins;
                self.queue
                    .requeue_for_merge(
                        record.item_id,
                        None,
                        record.server_version,
                        record.server_values.clone(),
                    )
                    .await
                    .map(|_| ())
            }
            ManualDecision::Merge(payload) => {
                if !payload.is_object() {
                    // Put the record back; the decision was invalid, not consumed
                    let err = SyncError::InvalidInput {
                        field: "payload".to_string(),
                        message: "merged payload must be a JSON object".to_string(),
                    };
                    self.pending.lock().await.insert(record.id, record);
                    return Err(err);
                }
                record.outcome = ResolutionOutcome::Merged;
                record.merged = Some(payload.clone());
                self.queue
                    .requeue_for_merge(
                        record.item_id,
                        Some(payload),
                        record.server_version,
                        record.server_values.clone(),
                    )
                    .await
                    .map(|_| ())
            }
        };

        if let Err(e) = result {
            // Queue update failed; retain the record so the decision can be retried
            let outcome_err = e;
            self.pending.lock().await.insert(record.id, record);
            return Err(outcome_err);
        }

        self.finish(&record);
        Ok(record.outcome)
    }

    /// Conflicts awaiting a user decision
    pub async fn pending(&self) -> Vec<ConflictRecord> {
        let mut records: Vec<ConflictRecord> = self.pending.lock().await.values().cloned().collect();
        records.sort_by_key(|r| r.detected_at);
        records
    }

    fn finish(&self, record: &ConflictRecord) {
        info!(
            conflict_id = %record.id,
            item_id = %record.item_id,
            entity_id = %record.entity_id,
            outcome = record.outcome.as_str(),
            client_values = ?record.client_values,
            server_values = ?record.server_values,
            merged = ?record.merged,
            "Conflict resolved"
        );

        self.events
            .emit(EngineEvent::Conflict(ConflictEvent::Resolved {
                conflict_id: record.id.as_str(),
                item_id: record.item_id.as_str(),
                outcome: record.outcome.as_str().to_string(),
            }))
            .ok();
    }
}

/// Top-level field names of a JSON object
fn object_fields(value: &Value) -> Vec<String> {
    match value {
        Value::Object(map) => map.keys().cloned().collect(),
        _ => Vec::new(),
    }
}

/// Fields whose values differ between two documents (a field missing on
/// one side counts as changed)
fn changed_fields(base: &Value, current: &Value) -> Vec<String> {
    let empty = Map::new();
    let base_map = base.as_object().unwrap_or(&empty);
    let current_map = current.as_object().unwrap_or(&empty);

    let mut changed: Vec<String> = base_map
        .iter()
        .filter(|(k, v)| current_map.get(*k) != Some(v))
        .map(|(k, _)| k.clone())
        .collect();

    for k in current_map.keys() {
        if !base_map.contains_key(k) && !changed.contains(k) {
            changed.push(k.clone());
        }
    }

    changed
}

/// The server document with the client's fields applied over it
fn apply_over(server: &Value, client: Option<&Value>) -> Value {
    let mut merged = server.as_object().cloned().unwrap_or_default();
    if let Some(Value::Object(client_map)) = client {
        for (k, v) in client_map {
            merged.insert(k.clone(), v.clone());
        }
    }
    Value::Object(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::{ResolutionHints, SyncItemStatus};
    use serde_json::json;
    use sqlx::SqlitePool;

    async fn setup() -> (Arc<SyncQueue>, ConflictResolver, EventBus) {
        let pool = SqlitePool::connect(":memory:").await.unwrap();
        let queue = Arc::new(SyncQueue::new(pool).await.unwrap());
        let events = EventBus::new(32);
        let resolver = ConflictResolver::new(queue.clone(), events.clone());
        (queue, resolver, events)
    }

    async fn syncing_update(
        queue: &SyncQueue,
        payload: Value,
        base_version: i64,
        snapshot: Option<Value>,
    ) -> SyncQueueItem {
        let id = queue
            .enqueue(
                "task".to_string(),
                "task-1".to_string(),
                SyncOperation::Update,
                Some(payload),
                ResolutionHints::at_version(base_version, snapshot),
            )
            .await
            .unwrap();
        queue.mark_syncing(id).await.unwrap()
    }

    #[test]
    fn test_changed_fields() {
        let base = json!({"status": "open", "priority": 1, "title": "a"});
        let current = json!({"status": "open", "priority": 2, "owner": "b", "title": "a"});

        let mut changed = changed_fields(&base, &current);
        changed.sort();
        assert_eq!(changed, vec!["owner", "priority"]);
    }

    #[test]
    fn test_apply_over_prefers_client_fields() {
        let server = json!({"status": "open", "priority": 2});
        let client = json!({"status": "done"});
        assert_eq!(
            apply_over(&server, Some(&client)),
            json!({"status": "done", "priority": 2})
        );
    }

    #[tokio::test]
    async fn test_delete_of_deleted_entity_is_server_wins() {
        let (queue, resolver, _) = setup().await;

        let id = queue
            .enqueue(
                "task".to_string(),
                "task-1".to_string(),
                SyncOperation::Delete,
                None,
                ResolutionHints::at_version(5, None),
            )
            .await
            .unwrap();
        let item = queue.mark_syncing(id).await.unwrap();

        let outcome = resolver.resolve(&item, 6, None).await.unwrap();
        assert_eq!(outcome, ResolutionOutcome::ServerWins);

        let stored = queue.get(id).await.unwrap().unwrap();
        assert_eq!(stored.status, SyncItemStatus::Synced);
    }

    #[tokio::test]
    async fn test_disjoint_fields_auto_merge() {
        let (queue, resolver, _) = setup().await;

        // Client changed `status`; server changed `priority` at version 6
        let item = syncing_update(
            &queue,
            json!({"status": "done"}),
            5,
            Some(json!({"status": "open", "priority": 1})),
        )
        .await;
        let server_doc = json!({"status": "open", "priority": 2});

        let outcome = resolver.resolve(&item, 6, Some(server_doc)).await.unwrap();
        assert_eq!(outcome, ResolutionOutcome::Merged);

        let stored = queue.get(item.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SyncItemStatus::Pending);
        assert_eq!(stored.hints.base_version, Some(6));
        // Client payload retried as-is against the new base
        assert_eq!(stored.payload, Some(json!({"status": "done"})));
        assert!(resolver.pending().await.is_empty());
    }

    #[tokio::test]
    async fn test_overlapping_fields_go_manual() {
        let (queue, resolver, events) = setup().await;
        let mut sub = events.subscribe();

        let item = syncing_update(
            &queue,
            json!({"status": "done"}),
            5,
            Some(json!({"status": "open"})),
        )
        .await;
        let server_doc = json!({"status": "cancelled"});

        let outcome = resolver.resolve(&item, 6, Some(server_doc)).await.unwrap();
        assert_eq!(outcome, ResolutionOutcome::PendingManual);

        let stored = queue.get(item.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SyncItemStatus::Failed);
        assert!(stored
            .last_error
            .as_deref()
            .unwrap()
            .contains("conflict pending manual resolution"));

        let pending = resolver.pending().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].item_id, item.id);

        let event = sub.try_recv().unwrap();
        assert!(matches!(
            event,
            EngineEvent::Conflict(ConflictEvent::Detected {
                requires_manual: true,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_missing_snapshot_goes_manual() {
        let (queue, resolver, _) = setup().await;

        let item = syncing_update(&queue, json!({"status": "done"}), 5, None).await;
        let outcome = resolver
            .resolve(&item, 6, Some(json!({"priority": 2})))
            .await
            .unwrap();

        // Without a snapshot there is no way to prove the edits disjoint
        assert_eq!(outcome, ResolutionOutcome::PendingManual);
    }

    #[tokio::test]
    async fn test_update_of_deleted_entity_goes_manual() {
        let (queue, resolver, _) = setup().await;

        let item = syncing_update(
            &queue,
            json!({"status": "done"}),
            5,
            Some(json!({"status": "open"})),
        )
        .await;

        let outcome = resolver.resolve(&item, 6, None).await.unwrap();
        assert_eq!(outcome, ResolutionOutcome::PendingManual);
    }

    #[tokio::test]
    async fn test_keep_server_removes_item() {
        let (queue, resolver, _) = setup().await;

        let item = syncing_update(
            &queue,
            json!({"status": "done"}),
            5,
            Some(json!({"status": "open"})),
        )
        .await;
        resolver
            .resolve(&item, 6, Some(json!({"status": "cancelled"})))
            .await
            .unwrap();

        let conflict_id = resolver.pending().await[0].id;
        let outcome = resolver
            .apply_decision(conflict_id, ManualDecision::KeepServer)
            .await
            .unwrap();

        assert_eq!(outcome, ResolutionOutcome::ServerWins);
        assert!(queue.get(item.id).await.unwrap().is_none());
        assert!(resolver.pending().await.is_empty());
    }

    #[tokio::test]
    async fn test_keep_client_requeues_at_server_version() {
        let (queue, resolver, _) = setup().await;

        let item = syncing_update(
            &queue,
            json!({"status": "done"}),
            5,
            Some(json!({"status": "open"})),
        )
        .await;
        resolver
            .resolve(&item, 6, Some(json!({"status": "cancelled"})))
            .await
            .unwrap();

        let conflict_id = resolver.pending().await[0].id;
        let outcome = resolver
            .apply_decision(conflict_id, ManualDecision::KeepClient)
            .await
            .unwrap();

        assert_eq!(outcome, ResolutionOutcome::ClientWins);
        let stored = queue.get(item.id).await.unwrap().unwrap();
        assert_eq!(stored.status, SyncItemStatus::Pending);
        assert_eq!(stored.hints.base_version, Some(6));
        assert_eq!(stored.payload, Some(json!({"status": "done"})));
    }

    #[tokio::test]
    async fn test_manual_merge_replaces_payload() {
        let (queue, resolver, _) = setup().await;

        let item = syncing_update(
            &queue,
            json!({"status": "done"}),
            5,
            Some(json!({"status": "open"})),
        )
        .await;
        resolver
            .resolve(&item, 6, Some(json!({"status": "cancelled"})))
            .await
            .unwrap();

        let conflict_id = resolver.pending().await[0].id;
        let merged = json!({"status": "done", "note": "kept over cancel"});
        let outcome = resolver
            .apply_decision(conflict_id, ManualDecision::Merge(merged.clone()))
            .await
            .unwrap();

        assert_eq!(outcome, ResolutionOutcome::Merged);
        let stored = queue.get(item.id).await.unwrap().unwrap();
        assert_eq!(stored.payload, Some(merged));
        assert_eq!(stored.hints.base_version, Some(6));
    }

    #[tokio::test]
    async fn test_invalid_merge_payload_keeps_record() {
        let (queue, resolver, _) = setup().await;

        let item = syncing_update(
            &queue,
            json!({"status": "done"}),
            5,
            Some(json!({"status": "open"})),
        )
        .await;
        resolver
            .resolve(&item, 6, Some(json!({"status": "cancelled"})))
            .await
            .unwrap();

        let conflict_id = resolver.pending().await[0].id;
        let result = resolver
            .apply_decision(conflict_id, ManualDecision::Merge(json!("not an object")))
            .await;

        assert!(matches!(result, Err(SyncError::InvalidInput { .. })));
        assert_eq!(resolver.pending().await.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_conflict_rejected() {
        let (_queue, resolver, _) = setup().await;
        let result = resolver
            .apply_decision(ConflictId::new(), ManualDecision::KeepServer)
            .await;
        assert!(matches!(result, Err(SyncError::ConflictNotFound { .. })));
    }
}
