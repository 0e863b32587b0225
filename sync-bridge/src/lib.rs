//! # Host Bridge Traits
//!
//! External-collaborator contracts that must be implemented by the host
//! application embedding the sync engine.
//!
//! ## Overview
//!
//! This crate defines the boundary between the sync engine and everything it
//! does not own: the remote authoritative task store and the runtime's
//! connectivity signals. The engine never talks to a network or a backend
//! directly; it only drives these traits.
//!
//! ## Traits
//!
//! - [`TaskStore`](store::TaskStore) - Remote authoritative store with
//!   optimistic-concurrency create/update/delete
//! - [`ConnectivityProbe`](connectivity::ConnectivityProbe) - Active
//!   lightweight round trip used by explicit connectivity rechecks
//!
//! ## Error Handling
//!
//! All bridge traits use [`StoreError`](error::StoreError). Implementations
//! should map backend responses onto the taxonomy faithfully: version
//! mismatches become [`StoreError::Conflict`](error::StoreError::Conflict)
//! carrying the store's current field values, and only genuinely retryable
//! failures (timeouts, connection errors, 5xx) should classify as transient.
//!
//! ## Thread Safety
//!
//! All bridge traits require `Send + Sync` bounds to support safe concurrent
//! usage across async tasks.

pub mod connectivity;
pub mod error;
pub mod store;

pub use connectivity::ConnectivityProbe;
pub use error::{Result, StoreError};
pub use store::{RemoteRecord, TaskStore};
