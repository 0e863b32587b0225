//! Remote Task Store Abstraction
//!
//! The authoritative server-side store for task entities. Every mutation
//! carries the version the client last observed so the store can detect
//! concurrent modification.

use crate::error::Result;
use serde_json::Value;

/// Identity and version of an entity as known by the remote store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRecord {
    /// Server-assigned entity id.
    pub id: String,
    /// Server-side version marker, monotonically increasing per entity.
    pub version: i64,
}

/// Remote authoritative task store.
///
/// Mutations are expected to be idempotent enough to tolerate at-least-once
/// delivery: the engine retries transient failures and may re-send a request
/// whose first delivery succeeded but whose response was lost.
///
/// # Conflict Semantics
///
/// `update` and `delete` must fail with
/// [`StoreError::Conflict`](crate::StoreError::Conflict) when `base_version`
/// no longer matches the entity's current version, carrying the entity's
/// current field values (`None` when it was deleted). Deleting an entity that
/// no longer exists may be reported either as a conflict with
/// `current_values: None` or as `NotFound`; the engine treats both as the
/// deletion already having happened.
///
/// # Example
///
/// ```ignore
/// use sync_bridge::{TaskStore, StoreError};
///
/// async fn complete_task(store: &dyn TaskStore, id: &str, base: i64) -> Result<(), StoreError> {
///     let payload = serde_json::json!({ "status": "done" });
///     store.update("task", id, &payload, base).await?;
///     Ok(())
/// }
/// ```
#[async_trait::async_trait]
pub trait TaskStore: Send + Sync {
    /// Create a new entity from the given field values.
    ///
    /// Returns the server-assigned id and initial version. The caller's
    /// locally generated temporary id is not sent; the engine reconciles it
    /// against the returned id.
    async fn create(&self, entity_type: &str, payload: &Value) -> Result<RemoteRecord>;

    /// Apply a partial document on top of the entity, guarded by
    /// `base_version`. Returns the new version.
    async fn update(
        &self,
        entity_type: &str,
        entity_id: &str,
        payload: &Value,
        base_version: i64,
    ) -> Result<i64>;

    /// Delete the entity, guarded by `base_version`.
    async fn delete(&self, entity_type: &str, entity_id: &str, base_version: i64) -> Result<()>;
}
