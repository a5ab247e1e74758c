//! # Syncback Module
//!
//! Delivers locally initiated folder and message changes to remote mail
//! stores, in order, exactly once per successful attempt.
//!
//! ## Overview
//!
//! Every user action is first appended to a durable action log. Workers
//! replay the log per account and translate folder names between the
//! engine's canonical form (`Taxes/Accounting`) and the provider's native
//! form (`INBOX.Taxes.Accounting`).
//!
//! ## Components
//!
//! - **Folder Names** (`folder_name`): Canonical/remote name translation
//! - **Action Log Entry** (`action`): Payloads and the validated state machine
//! - **Repository** (`repository`): SQLite action log with leased claims
//! - **Namespaces** (`namespace`): Per-account prefix and separator discovery
//! - **Worker** (`worker`): Drains one account's log in order
//! - **Service** (`service`): Bounded worker pool, dispatcher and public API

pub mod action;
pub mod error;
pub mod folder_name;
pub mod namespace;
pub mod repository;
pub mod service;
pub mod worker;

#[cfg(test)]
mod testing;

pub use action::{
    ActionError, ActionId, ActionLogEntry, ActionPayload, ActionStatus, ActionStatusReport,
    ActionType, ErrorKind, QueueStats,
};
pub use error::{Result, SyncbackError};
pub use folder_name::{
    to_canonical, to_remote, CanonicalFolderName, FolderNamespace, TranslationError,
};
pub use namespace::{
    AccountNamespace, NamespaceCache, NamespaceRepository, SqliteNamespaceRepository,
};
pub use repository::{
    ActionLogRepository, ClaimOutcome, ReclaimedLease, SqliteActionLogRepository,
};
pub use service::{FolderDisplayName, SyncbackService};
pub use worker::{SyncbackWorker, WorkerContext, WorkerExit, WorkerReport};
