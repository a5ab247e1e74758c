//! # Action Log Entries
//!
//! Durable records of local mutations waiting to be applied remotely, with a
//! validated status state machine.
//!
//! ## State Machine
//!
//! ```text
//!            claim                 success
//! Pending ───────────> InProgress ─────────> Succeeded
//!    ▲                  │      │
//!    │  lease reclaim   │      │ failure
//!    └──────────────────┘      ▼
//!    ▲                       Failed ──────────> DeadLettered
//!    │     retry allowed       │   permanent or
//!    └─────────────────────────┘   attempts exhausted
//! ```
//!
//! `Failed` is transient: [`ActionLogEntry::fail`] moves through it and
//! settles on `Pending` or `DeadLettered` in the same step, so the log never
//! rests in `Failed`.

use crate::folder_name::{CanonicalFolderName, TranslationError};
use crate::{Result, SyncbackError};
use bridge_traits::error::RemoteError;
use bridge_traits::mail::AccountId;
use core_runtime::config::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

// ============================================================================
// ID Types
// ============================================================================

/// Row id of an action log entry; defines per-account ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ActionId(i64);

impl ActionId {
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for ActionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for ActionId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

// ============================================================================
// Action Types & Payloads
// ============================================================================

/// Kind of remote mutation an entry requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    CreateFolder,
    RenameFolder,
    DeleteFolder,
    MoveMessage,
    UpdateFlags,
}

impl ActionType {
    /// Get the string representation for database storage
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::CreateFolder => "create_folder",
            ActionType::RenameFolder => "rename_folder",
            ActionType::DeleteFolder => "delete_folder",
            ActionType::MoveMessage => "move_message",
            ActionType::UpdateFlags => "update_flags",
        }
    }
}

impl FromStr for ActionType {
    type Err = SyncbackError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "create_folder" => Ok(ActionType::CreateFolder),
            "rename_folder" => Ok(ActionType::RenameFolder),
            "delete_folder" => Ok(ActionType::DeleteFolder),
            "move_message" => Ok(ActionType::MoveMessage),
            "update_flags" => Ok(ActionType::UpdateFlags),
            _ => Err(SyncbackError::InvalidActionType(s.to_string())),
        }
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Arguments of a logged action. Every folder field holds a canonical name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionPayload {
    CreateFolder {
        display_name: String,
    },
    RenameFolder {
        old_display_name: String,
        new_display_name: String,
    },
    DeleteFolder {
        display_name: String,
    },
    MoveMessage {
        uid: u32,
        source_folder: String,
        destination_folder: String,
    },
    UpdateFlags {
        folder: String,
        uid: u32,
        #[serde(default)]
        add: Vec<String>,
        #[serde(default)]
        remove: Vec<String>,
    },
}

impl ActionPayload {
    pub fn create_folder(display_name: impl Into<String>) -> Self {
        ActionPayload::CreateFolder {
            display_name: display_name.into(),
        }
    }

    pub fn rename_folder(old: impl Into<String>, new: impl Into<String>) -> Self {
        ActionPayload::RenameFolder {
            old_display_name: old.into(),
            new_display_name: new.into(),
        }
    }

    pub fn delete_folder(display_name: impl Into<String>) -> Self {
        ActionPayload::DeleteFolder {
            display_name: display_name.into(),
        }
    }

    pub fn action_type(&self) -> ActionType {
        match self {
            ActionPayload::CreateFolder { .. } => ActionType::CreateFolder,
            ActionPayload::RenameFolder { .. } => ActionType::RenameFolder,
            ActionPayload::DeleteFolder { .. } => ActionType::DeleteFolder,
            ActionPayload::MoveMessage { .. } => ActionType::MoveMessage,
            ActionPayload::UpdateFlags { .. } => ActionType::UpdateFlags,
        }
    }

    /// Canonical folder names referenced by this payload.
    pub fn folder_names(&self) -> Vec<&str> {
        match self {
            ActionPayload::CreateFolder { display_name }
            | ActionPayload::DeleteFolder { display_name } => vec![display_name],
            ActionPayload::RenameFolder {
                old_display_name,
                new_display_name,
            } => vec![old_display_name, new_display_name],
            ActionPayload::MoveMessage {
                source_folder,
                destination_folder,
                ..
            } => vec![source_folder, destination_folder],
            ActionPayload::UpdateFlags { folder, .. } => vec![folder],
        }
    }

    /// Checks that every folder name parses as a canonical name.
    pub fn validate(&self) -> std::result::Result<(), TranslationError> {
        for name in self.folder_names() {
            CanonicalFolderName::parse(name)?;
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| SyncbackError::InvalidPayload(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| SyncbackError::InvalidPayload(e.to_string()))
    }
}

// ============================================================================
// Status Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    /// Waiting for a worker, possibly until `next_attempt_at`
    Pending,
    /// Leased by a worker
    InProgress,
    /// Applied remotely
    Succeeded,
    /// Last attempt failed; never persisted
    Failed,
    /// Given up on
    DeadLettered,
}

impl ActionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ActionStatus::Succeeded | ActionStatus::DeadLettered)
    }

    /// Get the string representation for database storage
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Pending => "pending",
            ActionStatus::InProgress => "in_progress",
            ActionStatus::Succeeded => "succeeded",
            ActionStatus::Failed => "failed",
            ActionStatus::DeadLettered => "dead_lettered",
        }
    }
}

impl FromStr for ActionStatus {
    type Err = SyncbackError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(ActionStatus::Pending),
            "in_progress" => Ok(ActionStatus::InProgress),
            "succeeded" => Ok(ActionStatus::Succeeded),
            "failed" => Ok(ActionStatus::Failed),
            "dead_lettered" => Ok(ActionStatus::DeadLettered),
            _ => Err(SyncbackError::InvalidStatus(s.to_string())),
        }
    }
}

impl std::fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Errors recorded on entries
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Translation,
    RemoteTransient,
    RemotePermanent,
    LeaseExpired,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Translation => "translation",
            ErrorKind::RemoteTransient => "remote_transient",
            ErrorKind::RemotePermanent => "remote_permanent",
            ErrorKind::LeaseExpired => "lease_expired",
            ErrorKind::Internal => "internal",
        }
    }

    /// Only transient remote failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::RemoteTransient)
    }
}

impl FromStr for ErrorKind {
    type Err = SyncbackError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "translation" => Ok(ErrorKind::Translation),
            "remote_transient" => Ok(ErrorKind::RemoteTransient),
            "remote_permanent" => Ok(ErrorKind::RemotePermanent),
            "lease_expired" => Ok(ErrorKind::LeaseExpired),
            "internal" => Ok(ErrorKind::Internal),
            _ => Err(SyncbackError::InvalidErrorKind(s.to_string())),
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Classified failure of the most recent attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ActionError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RemoteTransient, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RemotePermanent, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl From<&RemoteError> for ActionError {
    fn from(err: &RemoteError) -> Self {
        let kind = if err.is_retryable() {
            ErrorKind::RemoteTransient
        } else {
            ErrorKind::RemotePermanent
        };
        ActionError::new(kind, err.to_string())
    }
}

impl From<&TranslationError> for ActionError {
    fn from(err: &TranslationError) -> Self {
        ActionError::new(ErrorKind::Translation, err.to_string())
    }
}

impl From<&SyncbackError> for ActionError {
    fn from(err: &SyncbackError) -> Self {
        match err {
            SyncbackError::Remote(remote) => remote.into(),
            SyncbackError::Translation(translation) => translation.into(),
            SyncbackError::LeaseExpired { .. } => {
                ActionError::new(ErrorKind::LeaseExpired, err.to_string())
            }
            // Local storage hiccups resolve on their own
            SyncbackError::Database(_) => ActionError::transient(err.to_string()),
            _ => ActionError::internal(err.to_string()),
        }
    }
}

impl std::fmt::Display for ActionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

// ============================================================================
// Action Log Entry
// ============================================================================

/// One requested remote mutation and its delivery bookkeeping.
///
/// Timestamps are Unix milliseconds from the service clock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionLogEntry {
    pub id: ActionId,
    pub account_id: AccountId,
    pub payload: ActionPayload,
    pub status: ActionStatus,
    /// Claims so far; never exceeds the retry policy's `max_attempts`
    pub attempt_count: u32,
    pub last_error: Option<ActionError>,
    /// Earliest time a worker may claim the entry
    pub next_attempt_at: i64,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl ActionLogEntry {
    pub fn action_type(&self) -> ActionType {
        self.payload.action_type()
    }

    /// Whether the lease has run out at `now`.
    pub fn lease_expired(&self, now: i64) -> bool {
        self.status == ActionStatus::InProgress
            && self.lease_expires_at.is_some_and(|expires| expires <= now)
    }

    /// Record a successful dispatch.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry is not `InProgress`
    pub fn succeed(mut self, now: i64) -> Result<Self> {
        self.validate_transition(ActionStatus::Succeeded)?;
        self.status = ActionStatus::Succeeded;
        self.release_lease(now);
        Ok(self)
    }

    /// Record a failed dispatch and settle on the follow-up status.
    ///
    /// Retryable errors with attempts left return the entry to `Pending`
    /// after `policy.backoff(attempt_count)`; anything else dead-letters it.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry is not `InProgress`
    pub fn fail(mut self, error: ActionError, policy: &RetryPolicy, now: i64) -> Result<Self> {
        self.validate_transition(ActionStatus::Failed)?;
        self.status = ActionStatus::Failed;
        self.release_lease(now);

        let settled = if error.is_retryable() && policy.allows_retry(self.attempt_count) {
            let delay = policy.backoff(self.attempt_count).as_millis() as i64;
            self.next_attempt_at = now + delay;
            ActionStatus::Pending
        } else {
            ActionStatus::DeadLettered
        };

        self.last_error = Some(error);
        self.validate_transition(settled)?;
        self.status = settled;
        Ok(self)
    }

    /// Return an orphaned entry to the queue after its lease expired.
    ///
    /// `attempt_count` is kept: the lost attempt already counted. An entry
    /// that has used all of its attempts is dead-lettered instead, so an
    /// action that keeps killing its worker cannot loop forever.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry is not `InProgress`
    pub fn reclaim(mut self, policy: &RetryPolicy, now: i64) -> Result<Self> {
        let target = if policy.allows_retry(self.attempt_count) {
            ActionStatus::Pending
        } else {
            ActionStatus::DeadLettered
        };

        self.validate_transition(target)?;

        if target == ActionStatus::DeadLettered {
            self.last_error = Some(ActionError::new(
                ErrorKind::LeaseExpired,
                format!(
                    "Lease held by {} expired after {} attempts",
                    self.lease_owner.as_deref().unwrap_or("unknown worker"),
                    self.attempt_count
                ),
            ));
        }

        self.status = target;
        self.release_lease(now);
        Ok(self)
    }

    fn release_lease(&mut self, now: i64) {
        self.lease_owner = None;
        self.lease_expires_at = None;
        self.updated_at = now;
    }

    fn validate_transition(&self, to: ActionStatus) -> Result<()> {
        let valid = match (self.status, to) {
            // From Pending
            (ActionStatus::Pending, ActionStatus::InProgress) => true,

            // From InProgress
            (ActionStatus::InProgress, ActionStatus::Succeeded) => true,
            (ActionStatus::InProgress, ActionStatus::Failed) => true,
            (ActionStatus::InProgress, ActionStatus::Pending) => true,
            (ActionStatus::InProgress, ActionStatus::DeadLettered) => true,

            // From Failed
            (ActionStatus::Failed, ActionStatus::Pending) => true,
            (ActionStatus::Failed, ActionStatus::DeadLettered) => true,

            // Terminal states cannot transition
            (ActionStatus::Succeeded, _) => false,
            (ActionStatus::DeadLettered, _) => false,

            _ => false,
        };

        if !valid {
            return Err(SyncbackError::InvalidStateTransition {
                from: self.status.as_str().to_string(),
                to: to.as_str().to_string(),
                reason: format!(
                    "Cannot transition action {} from {} to {}",
                    self.id,
                    self.status.as_str(),
                    to.as_str()
                ),
            });
        }

        Ok(())
    }
}

/// Snapshot of one entry returned to API callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionStatusReport {
    pub id: ActionId,
    pub account_id: AccountId,
    pub action_type: ActionType,
    pub status: ActionStatus,
    pub attempt_count: u32,
    pub last_error: Option<ActionError>,
    pub next_attempt_at: i64,
}

/// Entry counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: u64,
    pub in_progress: u64,
    pub succeeded: u64,
    pub dead_lettered: u64,
}

impl QueueStats {
    /// Entries not yet in a terminal status.
    pub fn outstanding(&self) -> u64 {
        self.pending + self.in_progress
    }

    pub fn total(&self) -> u64 {
        self.outstanding() + self.succeeded + self.dead_lettered
    }
}

// ============================================================================
// Tests
// ============================================================================
