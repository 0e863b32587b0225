//! # Sync Runtime Module
//!
//! Foundational runtime infrastructure for the task sync engine:
//! - Logging and tracing setup
//! - Engine configuration
//! - Event bus connecting the background engine to the foreground UI
//!
//! ## Overview
//!
//! This crate contains the runtime utilities the engine crate depends on. It
//! establishes the logging conventions, the configuration surface, and the
//! event broadcasting mechanism used throughout the system.

pub mod config;
pub mod error;
pub mod events;
pub mod logging;

pub use config::EngineConfig;
pub use error::{Error, Result};
pub use events::{
    ConflictEvent, EngineEvent, EventBus, EventStream, NetworkEvent, QueueEvent,
};
