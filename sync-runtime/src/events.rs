//! # Event Bus System
//!
//! Event-driven transport between the background sync engine and the
//! foreground UI, built on `tokio::sync::broadcast`.
//!
//! ## Overview
//!
//! The event bus system consists of:
//! - **Event Types**: Strongly-typed enum hierarchies for queue, network and
//!   conflict domains
//! - **EventBus**: Central broadcast channel for publishing events
//! - **EventStream**: Wrapper for consuming events with filtering
//! - **Subscription Management**: Multiple subscribers can listen independently
//!
//! ## Delivery Semantics
//!
//! Delivery is best-effort, at most once per listener: an event emitted while
//! nobody subscribes is dropped, and a listener that falls behind the buffer
//! receives `RecvError::Lagged` instead of the missed events. Foreground
//! consumers are expected to re-derive current state from the engine's
//! snapshot surface on (re)attachment rather than rely on event replay.
//!
//! ## Usage
//!
//! ```rust
//! use sync_runtime::events::{EventBus, EngineEvent, QueueEvent};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let bus = EventBus::new(100);
//! let mut sub = bus.subscribe();
//!
//! bus.emit(EngineEvent::Queue(QueueEvent::CycleCompleted {
//!     processed: 3,
//!     failed: 0,
//! }))
//! .ok();
//!
//! let event = sub.recv().await.unwrap();
//! assert!(matches!(event, EngineEvent::Queue(_)));
//! # }
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;

pub use tokio::sync::broadcast::error::{RecvError, SendError};
pub use tokio::sync::broadcast::Receiver;

/// Default buffer size for the event bus channel.
///
/// Subscribers that fall behind by more than this receive
/// `RecvError::Lagged` and must resynchronize from a snapshot.
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 100;

// ============================================================================
// Core Event Types
// ============================================================================

/// Top-level event enum encompassing all event categories.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload")]
pub enum EngineEvent {
    /// Queue item lifecycle and dispatch-cycle events
    Queue(QueueEvent),
    /// Network health transitions
    Network(NetworkEvent),
    /// Conflict detection and resolution events
    Conflict(ConflictEvent),
}

impl EngineEvent {
    /// Returns a human-readable description of the event.
    pub fn description(&self) -> &str {
        match self {
            EngineEvent::Queue(e) => e.description(),
            EngineEvent::Network(e) => e.description(),
            EngineEvent::Conflict(e) => e.description(),
        }
    }

    /// Returns the severity level of the event.
    pub fn severity(&self) -> EventSeverity {
        match self {
            EngineEvent::Queue(QueueEvent::ItemFailed { .. }) => EventSeverity::Error,
            EngineEvent::Conflict(ConflictEvent::Detected { .. }) => EventSeverity::Warning,
            EngineEvent::Network(NetworkEvent::StatusChanged { new, .. })
                if new == "offline" || new == "degraded" =>
            {
                EventSeverity::Warning
            }
            EngineEvent::Queue(QueueEvent::ItemSynced { .. })
            | EngineEvent::Conflict(ConflictEvent::Resolved { .. }) => EventSeverity::Info,
            _ => EventSeverity::Debug,
        }
    }
}

/// Event severity levels for filtering and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventSeverity {
    /// Debug-level events (verbose)
    Debug,
    /// Informational events
    Info,
    /// Warning events
    Warning,
    /// Error events
    Error,
}

// ============================================================================
// Queue Events
// ============================================================================

/// Events describing queue item lifecycle transitions and dispatch cycles.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum QueueEvent {
    /// A new mutation was appended to the queue.
    ItemEnqueued {
        /// Queue item id.
        item_id: String,
        /// Entity kind being mutated (e.g., "task").
        entity_type: String,
        /// Entity the mutation targets.
        entity_id: String,
        /// "create", "update" or "delete".
        operation: String,
    },
    /// A dispatch attempt started for the item.
    ItemSyncing {
        item_id: String,
        entity_id: String,
        /// Attempt number, 1-based.
        attempt: u32,
    },
    /// The item reached the remote store.
    ItemSynced {
        item_id: String,
        entity_id: String,
        /// Server-assigned id; differs from `entity_id` for creates, where
        /// the UI must reconcile its temporary id.
        remote_id: Option<String>,
        /// Server version after the mutation.
        version: Option<i64>,
    },
    /// The item exhausted its attempts and is terminally failed.
    ItemFailed {
        item_id: String,
        entity_id: String,
        attempts: u32,
        message: String,
    },
    /// A dispatch cycle finished.
    CycleCompleted { processed: u64, failed: u64 },
}

impl QueueEvent {
    fn description(&self) -> &str {
        match self {
            QueueEvent::ItemEnqueued { .. } => "Mutation enqueued",
            QueueEvent::ItemSyncing { .. } => "Dispatch attempt started",
            QueueEvent::ItemSynced { .. } => "Mutation reached the remote store",
            QueueEvent::ItemFailed { .. } => "Mutation failed terminally",
            QueueEvent::CycleCompleted { .. } => "Dispatch cycle completed",
        }
    }
}

// ============================================================================
// Network Events
// ============================================================================

/// Events describing network health transitions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum NetworkEvent {
    /// The derived network status changed.
    StatusChanged {
        /// Previous status ("online", "degraded", "offline").
        old: String,
        /// New status.
        new: String,
        /// Consecutive failure count at the time of the transition.
        failure_count: u32,
    },
}

impl NetworkEvent {
    fn description(&self) -> &str {
        match self {
            NetworkEvent::StatusChanged { .. } => "Network status changed",
        }
    }
}

// ============================================================================
// Conflict Events
// ============================================================================

/// Events describing version-conflict detection and resolution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum ConflictEvent {
    /// A queued mutation was rejected because the remote entity changed.
    Detected {
        conflict_id: String,
        item_id: String,
        entity_type: String,
        entity_id: String,
        /// Whether the engine needs a user decision to proceed.
        requires_manual: bool,
    },
    /// A conflict reached an outcome.
    Resolved {
        conflict_id: String,
        item_id: String,
        /// "server-wins", "client-wins", "merged" or "pending-manual".
        outcome: String,
    },
}

impl ConflictEvent {
    fn description(&self) -> &str {
        match self {
            ConflictEvent::Detected { .. } => "Version conflict detected",
            ConflictEvent::Resolved { .. } => "Conflict resolved",
        }
    }
}

// ============================================================================
// Event Bus
// ============================================================================

/// Central event bus for publishing and subscribing to engine events.
///
/// Uses `tokio::sync::broadcast` internally, which provides:
/// - Multiple producers (clone the `EventBus`)
/// - Multiple consumers (each `subscribe()` creates a new receiver)
/// - Non-blocking sends (events are cloned for each subscriber)
/// - Lagging detection (slow subscribers get `RecvError::Lagged`)
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    /// Creates a new event bus with the specified buffer size.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publishes an event to all subscribers.
    ///
    /// Returns the number of subscribers that received the event, or an
    /// error when nobody is listening. Callers treat the no-subscriber case
    /// as a non-event; delivery is best-effort by design.
    pub fn emit(&self, event: EngineEvent) -> Result<usize, SendError<EngineEvent>> {
        self.sender.send(event)
    }

    /// Creates a new subscriber receiving all future events.
    ///
    /// Past events are not replayed; subscribers resynchronize from the
    /// engine snapshot instead.
    pub fn subscribe(&self) -> Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    /// Returns the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_SIZE)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

// ============================================================================
// Event Stream Wrapper
// ============================================================================

/// Type alias for event filter functions.
type EventFilter = Box<dyn Fn(&EngineEvent) -> bool + Send + Sync>;

/// A wrapper around `broadcast::Receiver` with predicate filtering.
///
/// # Example
///
/// ```rust
/// use sync_runtime::events::{EventBus, EventStream, EngineEvent};
///
/// let bus = EventBus::new(100);
/// let stream = EventStream::new(bus.subscribe())
///     .filter(|event| matches!(event, EngineEvent::Conflict(_)));
/// ```
pub struct EventStream {
    receiver: Receiver<EngineEvent>,
    filter: Option<EventFilter>,
}

impl EventStream {
    /// Creates a new event stream from a receiver.
    pub fn new(receiver: Receiver<EngineEvent>) -> Self {
        Self {
            receiver,
            filter: None,
        }
    }

    /// Adds a filter predicate; only matching events are returned by `recv()`.
    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&EngineEvent) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Box::new(predicate));
        self
    }

    /// Receives the next event that passes the filter.
    ///
    /// # Errors
    ///
    /// Returns `RecvError::Lagged(n)` if the subscriber fell behind by `n`
    /// events, `RecvError::Closed` if all senders have been dropped.
    pub async fn recv(&mut self) -> Result<EngineEvent, RecvError> {
        loop {
            let event = self.receiver.recv().await?;

            let Some(filter) = &self.filter else {
                return Ok(event);
            };

            if filter(&event) {
                return Ok(event);
            }
        }
    }

    /// Attempts to receive an event without blocking.
    ///
    /// Returns `None` if no matching event is currently available.
    pub fn try_recv(&mut self) -> Option<Result<EngineEvent, RecvError>> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => {
                    let Some(filter) = &self.filter else {
                        return Some(Ok(event));
                    };

                    if filter(&event) {
                        return Some(Ok(event));
                    }
                }
                Err(broadcast::error::TryRecvError::Empty) => return None,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    return Some(Err(RecvError::Lagged(n)))
                }
                Err(broadcast::error::TryRecvError::Closed) => return Some(Err(RecvError::Closed)),
            }
        }
    }
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("has_filter", &self.filter.is_some())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
