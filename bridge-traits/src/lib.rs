//! # Collaborator Contracts
//!
//! Traits the syncback core requires but does not implement.
//!
//! ## Overview
//!
//! The core never talks to a concrete mail server, clock or log pipeline.
//! Each capability is a trait defined here and injected by the host:
//!
//! - [`RemoteProtocolClient`](mail::RemoteProtocolClient) - folder and
//!   message operations against the remote mail store (IMAP or similar)
//! - [`Clock`](time::Clock) - time source, replaceable with
//!   [`ManualClock`](time::ManualClock) for deterministic lease tests
//! - [`LoggerSink`](time::LoggerSink) - forward structured logs to a host
//!   logging pipeline
//!
//! ## Error Handling
//!
//! Remote operations fail with [`RemoteError`](error::RemoteError), which
//! carries the transient/permanent classification the retry machinery relies
//! on. Host-side plumbing (log sinks) uses [`BridgeError`](error::BridgeError).
//!
//! ## Thread Safety
//!
//! All traits require `Send + Sync` so implementations can be shared across
//! worker tasks behind an `Arc`.

pub mod error;
pub mod mail;
pub mod time;

pub use error::{BridgeError, RemoteError};
pub use mail::{AccountId, MailProvider, NamespaceInfo, RemoteFolder, RemoteProtocolClient};
pub use time::{Clock, LogEntry, LogLevel, LoggerSink, ManualClock, SystemClock};
