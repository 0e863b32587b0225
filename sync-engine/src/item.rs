//! # Sync Queue Item Model
//!
//! Data model for queued local mutations and their status state machine.
//!
//! ## Overview
//!
//! Every change the user makes while offline becomes a [`SyncQueueItem`]:
//! the entity it targets, the operation, the field values to apply, and the
//! resolution hints (server version and snapshot last seen) used later for
//! conflict detection. Items march through a small lifecycle:
//!
//! ```text
//! Pending ──> Syncing ──> Synced            (success, terminal)
//!    ^           │
//!    │           ├──> Pending               (transient failure, backoff)
//!    └───────────┴──> Failed                (attempts exhausted / parked)
//!                        │
//!                        └──> Pending       (explicit user retry)
//! ```
//!
//! Transitions are validated; an illegal prior state yields
//! [`SyncError::InvalidStateTransition`] instead of silently corrupting the
//! queue.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Result, SyncError};

/// Type-safe sync queue item identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SyncItemId(Uuid);

impl SyncItemId {
    /// Create a new random item ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse an item ID from a string
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

impl Default for SyncItemId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SyncItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The remote mutation a queue item carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncOperation {
    /// Create a new entity (entity_id is a locally generated temporary id)
    Create,
    /// Update fields of an existing entity
    Update,
    /// Delete an existing entity
    Delete,
}

impl SyncOperation {
    /// Convert operation to database string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl std::str::FromStr for SyncOperation {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            _ => Err(SyncError::InvalidOperation(s.to_string())),
        }
    }
}

/// Queue item status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncItemStatus {
    /// Item is queued and waiting for dispatch
    Pending,
    /// A dispatch attempt is in flight
    Syncing,
    /// Item reached the remote store (terminal)
    Synced,
    /// Attempts exhausted or parked on a conflict; only an explicit
    /// user retry resumes it
    Failed,
}

impl SyncItemStatus {
    /// Convert status to database string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Syncing => "syncing",
            Self::Synced => "synced",
            Self::Failed => "failed",
        }
    }

    /// Check if status is terminal
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Synced)
    }

    /// Check if the item still blocks later items for its entity
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Syncing | Self::Failed)
    }
}

impl std::str::FromStr for SyncItemStatus {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "syncing" => Ok(Self::Syncing),
            "synced" => Ok(Self::Synced),
            "failed" => Ok(Self::Failed),
            _ => Err(SyncError::InvalidStatus(s.to_string())),
        }
    }
}

/// Conflict-detection context captured when the mutation was queued
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolutionHints {
    /// Server version the client last saw before queueing the mutation.
    /// Required for update/delete; absent for create.
    pub base_version: Option<i64>,
    /// Entity field values at `base_version`. Enables changed-field
    /// classification when a conflict is detected; without it the
    /// conflict can only go to manual resolution.
    pub base_snapshot: Option<Value>,
}

impl ResolutionHints {
    /// Hints for an update/delete queued against a known server version
    pub fn at_version(base_version: i64, base_snapshot: Option<Value>) -> Self {
        Self {
            base_version: Some(base_version),
            base_snapshot,
        }
    }
}

/// A queued local mutation awaiting delivery to the remote store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncQueueItem {
    /// Unique identifier, stable across retries
    pub id: SyncItemId,
    /// Entity kind being mutated (e.g., "task")
    pub entity_type: String,
    /// Entity the mutation targets
    pub entity_id: String,
    /// The remote mutation to perform
    pub operation: SyncOperation,
    /// Field values to apply; object for create/update, absent for delete
    pub payload: Option<Value>,
    /// Current lifecycle status
    pub status: SyncItemStatus,
    /// Number of dispatch attempts made so far
    pub attempts: u32,
    /// Error message from the most recent failed attempt
    pub last_error: Option<String>,
    /// Conflict-detection context
    pub hints: ResolutionHints,
    /// Earliest eligible retry time (unix seconds); `None` = immediately
    pub next_attempt_at: Option<i64>,
    /// Unix timestamp when created
    pub created_at: i64,
    /// Unix timestamp when last updated
    pub updated_at: i64,
}

impl SyncQueueItem {
    /// Create a new pending queue item
    pub fn new(
        entity_type: String,
        entity_id: String,
        operation: SyncOperation,
        payload: Option<Value>,
        hints: ResolutionHints,
    ) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            id: SyncItemId::new(),
            entity_type,
            entity_id,
            operation,
            payload,
            status: SyncItemStatus::Pending,
            attempts: 0,
            last_error: None,
            hints,
            next_attempt_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Backoff delay for the next retry given the current attempt count
    pub fn backoff_delay_ms(&self, base_ms: u64, ceiling_ms: u64) -> u64 {
        let exp = self.attempts.min(32);
        base_ms.saturating_mul(2u64.saturating_pow(exp)).min(ceiling_ms)
    }

    /// Whether the item is due for dispatch at `now` (unix seconds)
    pub fn is_due(&self, now: i64) -> bool {
        self.status == SyncItemStatus::Pending
            && self.next_attempt_at.map_or(true, |at| at <= now)
    }

    fn transition_error(&self, to: SyncItemStatus, reason: &str) -> SyncError {
        SyncError::InvalidStateTransition {
            from: self.status.as_str().to_string(),
            to: to.as_str().to_string(),
            reason: reason.to_string(),
        }
    }

    /// Begin a dispatch attempt (`Pending -> Syncing`)
    pub fn start_syncing(&mut self) -> Result<()> {
        if self.status != SyncItemStatus::Pending {
            return Err(self.transition_error(
                SyncItemStatus::Syncing,
                "only a pending item can be dispatched",
            ));
        }
        self.status = SyncItemStatus::Syncing;
        self.updated_at = chrono::Utc::now().timestamp();
        Ok(())
    }

    /// Record success (`Syncing -> Synced`). A no-op if already synced,
    /// so an idempotent retry that succeeds twice stays consistent.
    pub fn complete(&mut self) -> Result<()> {
        if self.status == SyncItemStatus::Synced {
            return Ok(());
        }
        if self.status != SyncItemStatus::Syncing {
            return Err(self.transition_error(
                SyncItemStatus::Synced,
                "only an in-flight item can complete",
            ));
        }
        self.status = SyncItemStatus::Synced;
        self.last_error = None;
        self.next_attempt_at = None;
        self.updated_at = chrono::Utc::now().timestamp();
        Ok(())
    }

    /// Record a transient failure (`Syncing -> Pending`), scheduling the
    /// next attempt `delay_ms` from now
    ///
    /// `next_attempt_at` is stored at unix-second resolution, so the
    /// delay is rounded down to whole seconds with a one-second minimum;
    /// sub-second backoff steps all wait one second.
    pub fn reschedule(&mut self, error: String, delay_ms: u64) -> Result<()> {
        if self.status != SyncItemStatus::Syncing {
            return Err(self.transition_error(
                SyncItemStatus::Pending,
                "only an in-flight item can be rescheduled",
            ));
        }
        let now = chrono::Utc::now().timestamp();
        self.status = SyncItemStatus::Pending;
        self.attempts += 1;
        self.last_error = Some(error);
        self.next_attempt_at = Some(now + (delay_ms / 1000).max(1) as i64);
        self.updated_at = now;
        Ok(())
    }

    /// Record a terminal failure (`Syncing -> Failed`)
    pub fn fail(&mut self, error: String) -> Result<()> {
        if self.status != SyncItemStatus::Syncing {
            return Err(self.transition_error(
                SyncItemStatus::Failed,
                "only an in-flight item can fail",
            ));
        }
        self.status = SyncItemStatus::Failed;
        self.attempts += 1;
        self.last_error = Some(error);
        self.next_attempt_at = None;
        self.updated_at = chrono::Utc::now().timestamp();
        Ok(())
    }

    /// Explicit user retry (`Failed -> Pending`); resets the attempt
    /// counter so the item gets a fresh backoff schedule
    pub fn retry(&mut self) -> Result<()> {
        if self.status != SyncItemStatus::Failed {
            return Err(self.transition_error(
                SyncItemStatus::Pending,
                "only a failed item can be retried",
            ));
        }
        self.status = SyncItemStatus::Pending;
        self.attempts = 0;
        self.next_attempt_at = None;
        self.updated_at = chrono::Utc::now().timestamp();
        Ok(())
    }

    /// Requeue after an auto-merge or manual conflict decision: new
    /// payload/base version, attempts unchanged, immediately eligible.
    /// Valid from `Syncing` (auto-merge during an attempt) and `Failed`
    /// (manual decision on a parked item).
    pub fn requeue_for_merge(
        &mut self,
        payload: Option<Value>,
        base_version: i64,
        base_snapshot: Option<Value>,
    ) -> Result<()> {
        if !matches!(self.status, SyncItemStatus::Syncing | SyncItemStatus::Failed) {
            return Err(self.transition_error(
                SyncItemStatus::Pending,
                "only an in-flight or parked item can be requeued",
            ));
        }
        self.status = SyncItemStatus::Pending;
        if payload.is_some() {
            self.payload = payload;
        }
        self.hints = ResolutionHints::at_version(base_version, base_snapshot);
        self.last_error = None;
        self.next_attempt_at = None;
        self.updated_at = chrono::Utc::now().timestamp();
        Ok(())
    }
}
