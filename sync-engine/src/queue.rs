//! # Sync Queue Store
//!
//! Durable, ordered store for queued local mutations.
//!
//! ## Overview
//!
//! The queue persists every mutation made while offline so nothing is lost
//! across restarts. It provides:
//!
//! - **Persistence**: items survive restarts via SQLite (`sqlx`)
//! - **Ordering**: per-entity FIFO; later mutations to an entity never
//!   overtake earlier ones
//! - **Atomic transitions**: status changes are conditional updates, so a
//!   concurrent dispatcher can never double-dispatch an item
//! - **Retry scheduling**: rescheduled items carry an earliest-eligible time
//! - **GC**: synced items are retained briefly for audit, then pruned
//!
//! ## Usage
//!
//! ```ignore
//! use sync_engine::queue::SyncQueue;
//!
//! # async fn example(pool: sqlx::SqlitePool) -> Result<(), Box<dyn std::error::Error>> {
//! let queue = SyncQueue::new(pool).await?;
//!
//! let id = queue
//!     .enqueue(
//!         "task".to_string(),
//!         "task-1".to_string(),
//!         SyncOperation::Update,
//!         Some(serde_json::json!({"status": "done"})),
//!         ResolutionHints::at_version(5, None),
//!     )
//!     .await?;
//!
//! for head in queue.eligible_heads(chrono::Utc::now().timestamp()).await? {
//!     // dispatch head...
//! }
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{Result, SyncError};
use crate::item::{ResolutionHints, SyncItemId, SyncItemStatus, SyncOperation, SyncQueueItem};

/// Queue statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct QueueStats {
    /// Items awaiting dispatch
    pub pending: u64,
    /// Items with an attempt in flight
    pub syncing: u64,
    /// Items delivered and awaiting pruning
    pub synced: u64,
    /// Items parked pending user action
    pub failed: u64,
}

impl QueueStats {
    /// Total items currently in the store
    pub fn total(&self) -> u64 {
        self.pending + self.syncing + self.synced + self.failed
    }

    /// Whether any work remains
    pub fn is_empty(&self) -> bool {
        self.pending == 0 && self.syncing == 0
    }
}

/// Repository trait for persisting the sync queue
#[async_trait]
pub trait SyncQueueRepository: Send + Sync {
    /// Insert a queue item
    async fn insert(&self, item: &SyncQueueItem) -> Result<()>;

    /// Persist an item's mutable fields, but only if its stored status
    /// still matches `expected`. Returns false when the guard fails.
    async fn update_if_status(
        &self,
        item: &SyncQueueItem,
        expected: SyncItemStatus,
    ) -> Result<bool>;

    /// Find an item by ID
    async fn find_by_id(&self, id: SyncItemId) -> Result<Option<SyncQueueItem>>;

    /// All non-synced items in durable enqueue order
    ///
    /// The order key must be a monotonic insertion sequence; wall-clock
    /// timestamps are second-resolution and cannot break ties.
    async fn list_active(&self) -> Result<Vec<SyncQueueItem>>;

    /// Count items by status
    async fn count_by_status(&self, status: SyncItemStatus) -> Result<u64>;

    /// Delete an item
    async fn delete(&self, id: SyncItemId) -> Result<bool>;

    /// Delete synced items last updated before `cutoff` (unix seconds)
    async fn delete_synced_before(&self, cutoff: i64) -> Result<u64>;
}

/// SQLite implementation of the sync queue repository
pub struct SqliteSyncQueueRepository {
    pool: SqlitePool,
}

impl SqliteSyncQueueRepository {
    /// Create a new repository
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Initialize the database table if it doesn't exist
    pub async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_queue (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                operation TEXT NOT NULL,
                payload TEXT,
                status TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                base_version INTEGER,
                base_snapshot TEXT,
                next_attempt_at INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_sync_queue_status_created
            ON sync_queue(status, created_at ASC)
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_sync_queue_entity
            ON sync_queue(entity_type, entity_id, seq ASC)
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        Ok(())
    }

    fn item_from_row(row: &SqliteRow) -> Result<SyncQueueItem> {
        let payload: Option<String> = row.get("payload");
        let payload = payload
            .map(|s| serde_json::from_str::<Value>(&s))
            .transpose()
            .map_err(|e| SyncError::Database(format!("Corrupt payload JSON: {}", e)))?;

        let base_snapshot: Option<String> = row.get("base_snapshot");
        let base_snapshot = base_snapshot
            .map(|s| serde_json::from_str::<Value>(&s))
            .transpose()
            .map_err(|e| SyncError::Database(format!("Corrupt snapshot JSON: {}", e)))?;

        Ok(SyncQueueItem {
            id: SyncItemId::from_string(&row.get::<String, _>("id"))?,
            entity_type: row.get("entity_type"),
            entity_id: row.get("entity_id"),
            operation: row.get::<String, _>("operation").parse()?,
            payload,
            status: row.get::<String, _>("status").parse()?,
            attempts: row.get::<i32, _>("attempts") as u32,
            last_error: row.get("last_error"),
            hints: ResolutionHints {
                base_version: row.get("base_version"),
                base_snapshot,
            },
            next_attempt_at: row.get("next_attempt_at"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    fn json_text(value: &Option<Value>) -> Option<String> {
        value.as_ref().map(|v| v.to_string())
    }
}

#[async_trait]
impl SyncQueueRepository for SqliteSyncQueueRepository {
    async fn insert(&self, item: &SyncQueueItem) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_queue (
                id, entity_type, entity_id, operation, payload, status,
                attempts, last_error, base_version, base_snapshot,
                next_attempt_at, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(item.id.as_str())
        .bind(&item.entity_type)
        .bind(&item.entity_id)
        .bind(item.operation.as_str())
        .bind(Self::json_text(&item.payload))
        .bind(item.status.as_str())
        .bind(item.attempts as i32)
        .bind(&item.last_error)
        .bind(item.hints.base_version)
        .bind(Self::json_text(&item.hints.base_snapshot))
        .bind(item.next_attempt_at)
        .bind(item.created_at)
        .bind(item.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        Ok(())
    }

    async fn update_if_status(
        &self,
        item: &SyncQueueItem,
        expected: SyncItemStatus,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE sync_queue SET
                payload = ?,
                status = ?,
                attempts = ?,
                last_error = ?,
                base_version = ?,
                base_snapshot = ?,
                next_attempt_at = ?,
                updated_at = ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(Self::json_text(&item.payload))
        .bind(item.status.as_str())
        .bind(item.attempts as i32)
        .bind(&item.last_error)
        .bind(item.hints.base_version)
        .bind(Self::json_text(&item.hints.base_snapshot))
        .bind(item.next_attempt_at)
        .bind(item.updated_at)
        .bind(item.id.as_str())
        .bind(expected.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn find_by_id(&self, id: SyncItemId) -> Result<Option<SyncQueueItem>> {
        let row = sqlx::query(
            r#"
            SELECT id, entity_type, entity_id, operation, payload, status,
                   attempts, last_error, base_version, base_snapshot,
                   next_attempt_at, created_at, updated_at
            FROM sync_queue
            WHERE id = ?
            "#,
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        row.as_ref().map(Self::item_from_row).transpose()
    }

    async fn list_active(&self) -> Result<Vec<SyncQueueItem>> {
        let rows = sqlx::query(
            r#"
            SELECT id, entity_type, entity_id, operation, payload, status,
                   attempts, last_error, base_version, base_snapshot,
                   next_attempt_at, created_at, updated_at
            FROM sync_queue
            WHERE status != 'synced'
            ORDER BY seq ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| SyncError::Database(e.to_string()))?;

        rows.iter().map(Self::item_from_row).collect()
    }

    async fn count_by_status(&self, status: SyncItemStatus) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sync_queue WHERE status = ?")
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| SyncError::Database(e.to_string()))?;

        Ok(count as u64)
    }

    async fn delete(&self, id: SyncItemId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM sync_queue WHERE id = ?")
            .bind(id.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| SyncError::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_synced_before(&self, cutoff: i64) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM sync_queue WHERE status = 'synced' AND updated_at < ?")
                .bind(cutoff)
                .execute(&self.pool)
                .await
                .map_err(|e| SyncError::Database(e.to_string()))?;

        Ok(result.rows_affected())
    }
}

/// Durable FIFO queue of local mutations
pub struct SyncQueue {
    repository: Arc<dyn SyncQueueRepository>,
}

impl SyncQueue {
    /// Create a queue backed by SQLite, initializing the schema
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        let repository = SqliteSyncQueueRepository::new(pool);
        repository.initialize().await?;

        Ok(Self {
            repository: Arc::new(repository),
        })
    }

    /// Create a queue with a custom repository
    pub fn with_repository(repository: Arc<dyn SyncQueueRepository>) -> Self {
        Self { repository }
    }

    /// Validate and enqueue a new mutation
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidInput`] for empty entity identifiers, a
    /// missing or non-object payload on create/update, a payload supplied
    /// for delete, or a missing base version on update/delete. Invalid
    /// input is a caller error and is never retried.
    pub async fn enqueue(
        &self,
        entity_type: String,
        entity_id: String,
        operation: SyncOperation,
        payload: Option<Value>,
        hints: ResolutionHints,
    ) -> Result<SyncItemId> {
        if entity_type.trim().is_empty() {
            return Err(SyncError::InvalidInput {
                field: "entity_type".to_string(),
                message: "must not be empty".to_string(),
            });
        }
        if entity_id.trim().is_empty() {
            return Err(SyncError::InvalidInput {
                field: "entity_id".to_string(),
                message: "must not be empty".to_string(),
            });
        }

        match operation {
            SyncOperation::Create | SyncOperation::Update => match &payload {
                Some(Value::Object(map)) if !map.is_empty() => {}
                Some(Value::Object(_)) => {
                    return Err(SyncError::InvalidInput {
                        field: "payload".to_string(),
                        message: "must contain at least one field".to_string(),
                    })
                }
                Some(_) => {
                    return Err(SyncError::InvalidInput {
                        field: "payload".to_string(),
                        message: "must be a JSON object".to_string(),
                    })
                }
                None => {
                    return Err(SyncError::InvalidInput {
                        field: "payload".to_string(),
                        message: format!("required for {} operations", operation.as_str()),
                    })
                }
            },
            SyncOperation::Delete => {
                if payload.is_some() {
                    return Err(SyncError::InvalidInput {
                        field: "payload".to_string(),
                        message: "must be absent for delete operations".to_string(),
                    });
                }
            }
        }

        if matches!(operation, SyncOperation::Update | SyncOperation::Delete)
            && hints.base_version.is_none()
        {
            return Err(SyncError::InvalidInput {
                field: "base_version".to_string(),
                message: format!("required for {} operations", operation.as_str()),
            });
        }

        let item = SyncQueueItem::new(entity_type, entity_id, operation, payload, hints);
        let item_id = item.id;

        info!(
            item_id = %item_id,
            entity_type = %item.entity_type,
            entity_id = %item.entity_id,
            operation = item.operation.as_str(),
            "Enqueuing mutation"
        );

        self.repository.insert(&item).await?;
        Ok(item_id)
    }

    /// Fetch an item by ID
    pub async fn get(&self, id: SyncItemId) -> Result<Option<SyncQueueItem>> {
        self.repository.find_by_id(id).await
    }

    /// All non-synced items in queue order
    pub async fn list_pending(&self) -> Result<Vec<SyncQueueItem>> {
        self.repository.list_active().await
    }

    /// For each entity, the earliest active item — returned only when it is
    /// `Pending` and due at `now`. A `Syncing` or unresolved `Failed` head
    /// blocks all later items for that entity.
    pub async fn eligible_heads(&self, now: i64) -> Result<Vec<SyncQueueItem>> {
        let active = self.repository.list_active().await?;
        let mut seen: HashMap<(String, String), ()> = HashMap::new();
        let mut heads = Vec::new();

        for item in active {
            let key = (item.entity_type.clone(), item.entity_id.clone());
            if seen.contains_key(&key) {
                continue;
            }
            seen.insert(key, ());

            if item.is_due(now) {
                heads.push(item);
            }
        }

        Ok(heads)
    }

    async fn load(&self, id: SyncItemId) -> Result<SyncQueueItem> {
        self.repository
            .find_by_id(id)
            .await?
            .ok_or_else(|| SyncError::ItemNotFound {
                item_id: id.to_string(),
            })
    }

    /// Persist a transition guarded on the item's prior status. A failed
    /// guard means another task changed the item concurrently.
    async fn commit(&self, item: &SyncQueueItem, prior: SyncItemStatus) -> Result<()> {
        if self.repository.update_if_status(item, prior).await? {
            Ok(())
        } else {
            Err(SyncError::InvalidStateTransition {
                from: prior.as_str().to_string(),
                to: item.status.as_str().to_string(),
                reason: "item changed concurrently".to_string(),
            })
        }
    }

    /// Claim an item for a dispatch attempt (`Pending -> Syncing`)
    pub async fn mark_syncing(&self, id: SyncItemId) -> Result<SyncQueueItem> {
        let mut item = self.load(id).await?;
        let prior = item.status;
        item.start_syncing()?;
        self.commit(&item, prior).await?;

        debug!(item_id = %id, attempt = item.attempts + 1, "Dispatching item");
        Ok(item)
    }

    /// Record a successful attempt (`Syncing -> Synced`)
    pub async fn mark_synced(&self, id: SyncItemId) -> Result<()> {
        let mut item = self.load(id).await?;
        if item.status == SyncItemStatus::Synced {
            return Ok(());
        }
        let prior = item.status;
        item.complete()?;
        self.commit(&item, prior).await?;

        info!(item_id = %id, "Item synced");
        Ok(())
    }

    /// Record a transient failure and schedule the next attempt
    pub async fn reschedule_pending(
        &self,
        id: SyncItemId,
        error: String,
        delay_ms: u64,
    ) -> Result<SyncQueueItem> {
        let mut item = self.load(id).await?;
        let prior = item.status;
        item.reschedule(error, delay_ms)?;
        self.commit(&item, prior).await?;

        debug!(
            item_id = %id,
            attempts = item.attempts,
            backoff_ms = delay_ms,
            "Item rescheduled after transient failure"
        );
        Ok(item)
    }

    /// Record a terminal failure (`Syncing -> Failed`)
    pub async fn mark_failed(&self, id: SyncItemId, error: String) -> Result<SyncQueueItem> {
        let mut item = self.load(id).await?;
        let prior = item.status;
        item.fail(error)?;
        self.commit(&item, prior).await?;

        info!(item_id = %id, attempts = item.attempts, "Item failed permanently");
        Ok(item)
    }

    /// Explicit user retry of a failed item (`Failed -> Pending`)
    pub async fn retry_failed(&self, id: SyncItemId) -> Result<SyncQueueItem> {
        let mut item = self.load(id).await?;
        let prior = item.status;
        item.retry()?;
        self.commit(&item, prior).await?;

        info!(item_id = %id, "Failed item re-queued by user");
        Ok(item)
    }

    /// Requeue an item after conflict resolution with fresh hints
    pub async fn requeue_for_merge(
        &self,
        id: SyncItemId,
        payload: Option<Value>,
        base_version: i64,
        base_snapshot: Option<Value>,
    ) -> Result<SyncQueueItem> {
        let mut item = self.load(id).await?;
        let prior = item.status;
        item.requeue_for_merge(payload, base_version, base_snapshot)?;
        self.commit(&item, prior).await?;

        info!(item_id = %id, base_version, "Item requeued after conflict resolution");
        Ok(item)
    }

    /// Remove an item, cancelling any future attempts
    pub async fn remove(&self, id: SyncItemId) -> Result<()> {
        if !self.repository.delete(id).await? {
            return Err(SyncError::ItemNotFound {
                item_id: id.to_string(),
            });
        }
        info!(item_id = %id, "Item removed from queue");
        Ok(())
    }

    /// Prune synced items older than the retention window
    pub async fn prune_synced(&self, older_than_secs: u64) -> Result<u64> {
        let cutoff = chrono::Utc::now().timestamp() - older_than_secs as i64;
        let pruned = self.repository.delete_synced_before(cutoff).await?;
        if pruned > 0 {
            debug!(pruned, "Pruned synced items");
        }
        Ok(pruned)
    }

    /// Queue statistics
    pub async fn stats(&self) -> Result<QueueStats> {
        Ok(QueueStats {
            pending: self
                .repository
                .count_by_status(SyncItemStatus::Pending)
                .await?,
            syncing: self
                .repository
                .count_by_status(SyncItemStatus::Syncing)
                .await?,
            synced: self
                .repository
                .count_by_status(SyncItemStatus::Synced)
                .await?,
            failed: self
                .repository
                .count_by_status(SyncItemStatus::Failed)
                .await?,
        })
    }
}
