//! Connectivity Probe Abstraction
//!
//! An active, lightweight round trip against the backend, used when the user
//! explicitly asks for a connectivity recheck. Passive health classification
//! (failure counting, raw link signals) lives in the engine and does not go
//! through this trait.

use crate::error::Result;

/// Active connectivity check.
///
/// Implementations should hit a cheap endpoint (a HEAD request, a ping
/// route) rather than a full store operation. The engine bounds the call
/// with its own probe timeout; implementations need not enforce one.
#[async_trait::async_trait]
pub trait ConnectivityProbe: Send + Sync {
    /// Perform one round trip. `Ok(())` means the backend is reachable.
    async fn probe(&self) -> Result<()>;
}
