//! # Network Status Monitor
//!
//! Classifies network health as `Online`, `Degraded` or `Offline` so the
//! dispatcher can decide when to sync and how patient to be.
//!
//! ## Overview
//!
//! The monitor derives status from two kinds of input:
//!
//! - **Raw link signals** (`set_link_up` / `set_link_down`): authoritative
//!   connectivity changes reported by the host; these force the status
//!   immediately.
//! - **Outcome heuristics** (`report_failure` / `report_success`): sync
//!   attempt outcomes; a configurable run of consecutive failures while
//!   online degrades the status, one success restores it.
//!
//! Status is observable three ways: instant queries (`status`/`state`), a
//! `tokio::sync::watch` subscription that replays the current value and
//! then every transition in order, and `StatusChanged` events on the bus.
//!
//! One monitor instance exists per engine; all mutation goes through it.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use sync_bridge::ConnectivityProbe;
use sync_runtime::events::{EngineEvent, NetworkEvent};
use sync_runtime::EventBus;

/// Derived network health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkStatus {
    /// Link up, sync proceeding normally
    Online,
    /// Link nominally up but attempts keep failing; sync continues with
    /// longer timeouts
    Degraded,
    /// No connectivity; dispatch is suspended
    Offline,
}

impl NetworkStatus {
    /// String representation used in events and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Degraded => "degraded",
            Self::Offline => "offline",
        }
    }

    /// Whether dispatch may proceed in this status
    pub fn is_usable(&self) -> bool {
        !matches!(self, Self::Offline)
    }
}

impl std::fmt::Display for NetworkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A recorded status transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusTransition {
    /// Unix timestamp of the transition
    pub at: i64,
    pub from: NetworkStatus,
    pub to: NetworkStatus,
}

/// Point-in-time view of the monitor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkState {
    pub status: NetworkStatus,
    /// Consecutive failures since the last success
    pub failure_count: u32,
    pub last_transition: Option<StatusTransition>,
}

struct MonitorState {
    status: NetworkStatus,
    failure_count: u32,
    last_transition: Option<StatusTransition>,
}

/// Tracks network health with hysteresis
///
/// Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct NetworkStatusMonitor {
    state: Arc<Mutex<MonitorState>>,
    watch_tx: Arc<watch::Sender<NetworkStatus>>,
    events: EventBus,
    degraded_threshold: u32,
    probe_timeout: Duration,
}

impl NetworkStatusMonitor {
    /// Create a monitor starting `Online`
    pub fn new(degraded_threshold: u32, probe_timeout: Duration, events: EventBus) -> Self {
        let (watch_tx, _) = watch::channel(NetworkStatus::Online);
        Self {
            state: Arc::new(Mutex::new(MonitorState {
                status: NetworkStatus::Online,
                failure_count: 0,
                last_transition: None,
            })),
            watch_tx: Arc::new(watch_tx),
            events,
            degraded_threshold,
            probe_timeout,
        }
    }

    /// Current status; instant and infallible
    pub fn status(&self) -> NetworkStatus {
        *self.watch_tx.borrow()
    }

    /// Full monitor state
    pub async fn state(&self) -> NetworkState {
        let state = self.state.lock().await;
        NetworkState {
            status: state.status,
            failure_count: state.failure_count,
            last_transition: state.last_transition,
        }
    }

    /// Subscribe to status transitions; the receiver starts at the
    /// current value and then sees every change in order
    pub fn subscribe(&self) -> watch::Receiver<NetworkStatus> {
        self.watch_tx.subscribe()
    }

    fn transition(&self, state: &mut MonitorState, to: NetworkStatus) {
        let from = state.status;
        if from == to {
            return;
        }

        state.status = to;
        state.last_transition = Some(StatusTransition {
            at: chrono::Utc::now().timestamp(),
            from,
            to,
        });

        info!(
            old = from.as_str(),
            new = to.as_str(),
            failure_count = state.failure_count,
            "Network status changed"
        );

        // watch keeps the latest value even with no receivers
        self.watch_tx.send_replace(to);

        self.events
            .emit(EngineEvent::Network(NetworkEvent::StatusChanged {
                old: from.as_str().to_string(),
                new: to.as_str().to_string(),
                failure_count: state.failure_count,
            }))
            .ok();
    }

    /// Record a failed sync attempt
    ///
    /// Crossing the consecutive-failure threshold while `Online` moves the
    /// status to `Degraded`, with exactly one transition at the boundary.
    /// Failures while `Offline` change nothing.
    pub async fn report_failure(&self) {
        let mut state = self.state.lock().await;
        if state.status == NetworkStatus::Offline {
            return;
        }

        state.failure_count = state.failure_count.saturating_add(1);
        debug!(failure_count = state.failure_count, "Sync attempt failed");

        if state.status == NetworkStatus::Online && state.failure_count >= self.degraded_threshold {
            self.transition(&mut state, NetworkStatus::Degraded);
        }
    }

    /// Record a successful sync attempt; resets the failure counter and
    /// restores `Online` from `Degraded`
    pub async fn report_success(&self) {
        let mut state = self.state.lock().await;
        state.failure_count = 0;

        if state.status == NetworkStatus::Degraded {
            self.transition(&mut state, NetworkStatus::Online);
        }
    }

    /// Raw link-up signal: force `Online` immediately
    ///
    /// Resets the failure counter so a stale run of failures cannot
    /// instantly re-degrade the fresh link.
    pub async fn set_link_up(&self) {
        let mut state = self.state.lock().await;
        state.failure_count = 0;
        self.transition(&mut state, NetworkStatus::Online);
    }

    /// Raw link-down signal: force `Offline` immediately
    pub async fn set_link_down(&self) {
        let mut state = self.state.lock().await;
        self.transition(&mut state, NetworkStatus::Offline);
    }

    /// Wait until the status becomes `Online`
    ///
    /// Returns true the moment status is `Online` (immediately if it
    /// already is), false when `timeout` elapses first.
    pub async fn wait_for_online(&self, timeout: Duration) -> bool {
        let mut rx = self.subscribe();

        let wait = async {
            loop {
                if *rx.borrow_and_update() == NetworkStatus::Online {
                    return;
                }
                if rx.changed().await.is_err() {
                    // Sender dropped; status can never change again
                    std::future::pending::<()>().await;
                }
            }
        };

        tokio::time::timeout(timeout, wait).await.is_ok()
    }

    /// Actively verify connectivity with a bounded probe round trip
    ///
    /// Probe success forces `Online`; failure or timeout forces `Offline`.
    /// Never returns an error.
    pub async fn recheck(&self, probe: &dyn ConnectivityProbe) -> NetworkStatus {
        let outcome = tokio::time::timeout(self.probe_timeout, probe.probe()).await;

        match outcome {
            Ok(Ok(())) => {
                self.set_link_up().await;
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Connectivity probe failed");
                self.set_link_down().await;
            }
            Err(_) => {
                warn!(
                    timeout_ms = self.probe_timeout.as_millis() as u64,
                    "Connectivity probe timed out"
                );
                self.set_link_down().await;
            }
        }

        self.status()
    }
}
