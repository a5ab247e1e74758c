use bridge_traits::error::RemoteError;
use thiserror::Error;

use crate::folder_name::TranslationError;

#[derive(Error, Debug)]
pub enum SyncbackError {
    #[error("Folder name translation failed: {0}")]
    Translation(#[from] TranslationError),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Lease on action {action_id} no longer held by {owner}")]
    LeaseExpired { action_id: i64, owner: String },

    #[error("Action {action_id} not found")]
    ActionNotFound { action_id: i64 },

    #[error("Invalid action status: {0}")]
    InvalidStatus(String),

    #[error("Invalid action type: {0}")]
    InvalidActionType(String),

    #[error("Invalid error kind: {0}")]
    InvalidErrorKind(String),

    #[error("Invalid action payload: {0}")]
    InvalidPayload(String),

    #[error("Invalid state transition from {from} to {to}: {reason}")]
    InvalidStateTransition {
        from: String,
        to: String,
        reason: String,
    },

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Syncback service already running")]
    AlreadyRunning,

    #[error("Syncback service not running")]
    NotRunning,

    #[error("Worker pool closed")]
    PoolClosed,
}

impl From<core_runtime::Error> for SyncbackError {
    fn from(err: core_runtime::Error) -> Self {
        SyncbackError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SyncbackError>;
