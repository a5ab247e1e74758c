//! # Core Runtime Module
//!
//! Foundational runtime infrastructure for the syncback core:
//! - Logging and tracing infrastructure
//! - Service configuration and retry policy
//! - Event bus system
//!
//! ## Overview
//!
//! Other workspace crates depend on this one for their ambient concerns. It
//! establishes the logging conventions, configuration validation and event
//! broadcasting used throughout the system.

pub mod config;
pub mod error;
pub mod events;
pub mod logging;

pub use config::{RetryPolicy, SyncbackConfig, SyncbackConfigBuilder};
pub use error::{Error, Result};
pub use events::{CoreEvent, EventBus, EventSeverity, EventStream, SyncbackEvent};
