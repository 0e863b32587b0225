//! # Offline Task Sync Engine
//!
//! Queues local mutations made while disconnected and reconciles them
//! against a remote authoritative task store when connectivity returns.
//!
//! ## Overview
//!
//! This crate manages the full offline-sync lifecycle:
//! - Persisting local mutations to a durable, per-entity FIFO queue
//! - Classifying network health (`Online` / `Degraded` / `Offline`) with
//!   hysteresis from attempt outcomes and raw link signals
//! - Dispatching queued mutations concurrently with bounded fan-out,
//!   exponential backoff and per-attempt timeouts
//! - Resolving optimistic-concurrency conflicts (server-wins, auto-merge
//!   of disjoint edits, manual escalation)
//! - Broadcasting progress events to the foreground UI
//!
//! ## Components
//!
//! - **Queue Item Model** (`item`): Mutation data model with a validated
//!   status state machine
//! - **Sync Queue** (`queue`): Durable SQLite-backed queue with atomic
//!   status transitions
//! - **Network Monitor** (`network`): Health classification and
//!   wait-for-online latching
//! - **Conflict Resolver** (`conflict`): Policy-driven conflict handling
//! - **Sync Dispatcher** (`dispatcher`): The orchestrating background loop

pub mod conflict;
pub mod dispatcher;
pub mod error;
pub mod item;
pub mod network;
pub mod queue;

pub use conflict::{
    ConflictId, ConflictRecord, ConflictResolver, ManualDecision, ResolutionOutcome,
};
pub use dispatcher::{CycleOutcome, EngineSnapshot, SyncDispatcher};
pub use error::{Result, SyncError};
pub use item::{
    ResolutionHints, SyncItemId, SyncItemStatus, SyncOperation, SyncQueueItem,
};
pub use network::{NetworkState, NetworkStatus, NetworkStatusMonitor, StatusTransition};
pub use queue::{QueueStats, SqliteSyncQueueRepository, SyncQueue, SyncQueueRepository};
