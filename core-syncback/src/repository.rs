//! # Action Log Repository
//!
//! Durable storage for action log entries.
//!
//! ## Overview
//!
//! The log is the only state shared between workers, and possibly between
//! processes using the same database. Every status change is a single
//! conditional statement:
//!
//! - claiming updates the account's oldest outstanding entry only if it is
//!   pending and due, so two claimers can never both win and a younger entry
//!   can never overtake an older one;
//! - settling an attempt only applies while the caller still holds the lease;
//! - reclaiming only touches leases that have expired.
//!
//! `failed` is excluded by the table's CHECK constraint: the transition out
//! of it is computed before the row is written.

use crate::action::{
    ActionError, ActionId, ActionLogEntry, ActionPayload, ActionStatus, ActionStatusReport,
    ActionType, ErrorKind, QueueStats,
};
use crate::{Result, SyncbackError};
use async_trait::async_trait;
use bridge_traits::mail::AccountId;
use core_runtime::config::RetryPolicy;
use sqlx::{FromRow, SqlitePool};

const SELECT_COLUMNS: &str = "id, account_id, action_type, payload, status, attempt_count, \
     error_kind, last_error, next_attempt_at, lease_owner, lease_expires_at, created_at, updated_at";

const STATUS_COLUMNS: &str =
    "id, account_id, action_type, status, attempt_count, error_kind, last_error, next_attempt_at";

// ============================================================================
// Claim & Reclaim Results
// ============================================================================

/// Result of trying to lease an account's next entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The oldest outstanding entry is now leased to the caller.
    Claimed(ActionLogEntry),
    /// Nothing outstanding for the account.
    Empty,
    /// The oldest outstanding entry is leased by someone else.
    Blocked { action_id: ActionId },
    /// The oldest outstanding entry waits until `eligible_at`.
    Backoff {
        action_id: ActionId,
        eligible_at: i64,
    },
    /// The claimed row could not be decoded and was dead-lettered.
    Rejected { action_id: ActionId, message: String },
}

/// An expired lease released by [`ActionLogRepository::reclaim_expired`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReclaimedLease {
    pub action_id: ActionId,
    pub account_id: AccountId,
    pub previous_owner: Option<String>,
    /// `Pending`, or `DeadLettered` when the entry had no attempts left
    pub status: ActionStatus,
    pub attempt_count: u32,
}

// ============================================================================
// Repository Trait
// ============================================================================

/// Repository trait for action log persistence
#[async_trait]
pub trait ActionLogRepository: Send + Sync {
    /// Append a pending entry, due immediately.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails
    async fn insert(
        &self,
        account_id: &AccountId,
        payload: &ActionPayload,
        now: i64,
    ) -> Result<ActionLogEntry>;

    /// Find an entry by ID
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails
    async fn find_by_id(&self, id: ActionId) -> Result<Option<ActionLogEntry>>;

    /// All entries of an account in log order.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails
    async fn find_by_account(&self, account_id: &AccountId) -> Result<Vec<ActionLogEntry>>;

    /// Status of an entry, read without decoding its payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails
    async fn status_by_id(&self, id: ActionId) -> Result<Option<ActionStatusReport>>;

    /// Status of every entry of an account in log order, read without
    /// decoding payloads.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails
    async fn statuses_by_account(&self, account_id: &AccountId) -> Result<Vec<ActionStatusReport>>;

    /// Lease the account's oldest outstanding entry if it is pending and due.
    ///
    /// On success the entry is `InProgress`, `attempt_count` is incremented
    /// and the lease runs until `lease_expires_at`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails
    async fn claim_next(
        &self,
        account_id: &AccountId,
        owner: &str,
        now: i64,
        lease_expires_at: i64,
    ) -> Result<ClaimOutcome>;

    /// Persist the outcome of an attempt computed by
    /// [`ActionLogEntry::succeed`] or [`ActionLogEntry::fail`].
    ///
    /// # Errors
    ///
    /// Returns [`SyncbackError::LeaseExpired`] if `owner` no longer holds the
    /// lease; the outcome is then discarded.
    async fn settle(&self, entry: &ActionLogEntry, owner: &str) -> Result<()>;

    /// Release every lease that expired at or before `now`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails
    async fn reclaim_expired(&self, now: i64, policy: &RetryPolicy) -> Result<Vec<ReclaimedLease>>;

    /// Accounts whose oldest outstanding entry is pending and due, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails
    async fn accounts_ready(&self, now: i64) -> Result<Vec<AccountId>>;

    /// Entry counts by status.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails
    async fn stats(&self) -> Result<QueueStats>;
}

// ============================================================================
// SQLite Implementation
// ============================================================================

/// SQLite implementation of ActionLogRepository
pub struct SqliteActionLogRepository {
    pool: SqlitePool,
}

impl SqliteActionLogRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the `action_log` table and its index if missing.
    pub async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS action_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id TEXT NOT NULL,
                action_type TEXT NOT NULL,
                payload TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                attempt_count INTEGER NOT NULL DEFAULT 0,
                error_kind TEXT,
                last_error TEXT,
                next_attempt_at INTEGER NOT NULL,
                lease_owner TEXT,
                lease_expires_at INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                CONSTRAINT action_log_status_check CHECK (
                    status IN ('pending', 'in_progress', 'succeeded', 'dead_lettered')
                ),
                CONSTRAINT action_log_type_check CHECK (
                    action_type IN ('create_folder', 'rename_folder', 'delete_folder',
                                    'move_message', 'update_flags')
                )
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| SyncbackError::Database(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_action_log_account_status
            ON action_log(account_id, status, id)
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| SyncbackError::Database(e.to_string()))?;

        Ok(())
    }

    /// Dead-letter a row whose stored payload no longer decodes.
    async fn reject_undecodable(&self, id: i64, message: &str, now: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE action_log
            SET status = 'dead_lettered', error_kind = ?, last_error = ?,
                lease_owner = NULL, lease_expires_at = NULL, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(ErrorKind::Internal.as_str())
        .bind(message)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| SyncbackError::Database(e.to_string()))?;

        Ok(())
    }

    /// Explain why `claim_next` found nothing to lease.
    async fn inspect_head(&self, account_id: &AccountId, now: i64) -> Result<ClaimOutcome> {
        let head = sqlx::query_as::<_, (i64, String, i64)>(
            r#"
            SELECT id, status, next_attempt_at FROM action_log
            WHERE account_id = ? AND status IN ('pending', 'in_progress')
            ORDER BY id
            LIMIT 1
            "#,
        )
        .bind(account_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| SyncbackError::Database(e.to_string()))?;

        let Some((id, status, next_attempt_at)) = head else {
            return Ok(ClaimOutcome::Empty);
        };

        let action_id = ActionId::new(id);
        match status.parse::<ActionStatus>()? {
            ActionStatus::Pending if next_attempt_at > now => Ok(ClaimOutcome::Backoff {
                action_id,
                eligible_at: next_attempt_at,
            }),
            // In progress, or a due entry another claimer released and
            // re-leased between the two statements
            _ => Ok(ClaimOutcome::Blocked { action_id }),
        }
    }
}

/// Database row representation of an action log entry
#[derive(Debug, FromRow)]
struct ActionLogRow {
    id: i64,
    account_id: String,
    action_type: String,
    payload: String,
    status: String,
    attempt_count: i64,
    error_kind: Option<String>,
    last_error: Option<String>,
    next_attempt_at: i64,
    lease_owner: Option<String>,
    lease_expires_at: Option<i64>,
    created_at: i64,
    updated_at: i64,
}

impl TryFrom<ActionLogRow> for ActionLogEntry {
    type Error = SyncbackError;

    fn try_from(row: ActionLogRow) -> Result<Self> {
        let payload = ActionPayload::from_json(&row.payload)?;
        let action_type: ActionType = row.action_type.parse()?;

        if payload.action_type() != action_type {
            return Err(SyncbackError::InvalidPayload(format!(
                "action {} is {} but payload is {}",
                row.id,
                action_type,
                payload.action_type()
            )));
        }

        let last_error = match row.error_kind {
            Some(kind) => Some(ActionError::new(
                kind.parse()?,
                row.last_error.unwrap_or_default(),
            )),
            None => None,
        };

        Ok(ActionLogEntry {
            id: ActionId::new(row.id),
            account_id: AccountId::new(row.account_id),
            payload,
            status: row.status.parse()?,
            attempt_count: row.attempt_count as u32,
            last_error,
            next_attempt_at: row.next_attempt_at,
            lease_owner: row.lease_owner,
            lease_expires_at: row.lease_expires_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(FromRow)]
struct ActionStatusRow {
    id: i64,
    account_id: String,
    action_type: String,
    status: String,
    attempt_count: i64,
    error_kind: Option<String>,
    last_error: Option<String>,
    next_attempt_at: i64,
}

impl TryFrom<ActionStatusRow> for ActionStatusReport {
    type Error = SyncbackError;

    fn try_from(row: ActionStatusRow) -> Result<Self> {
        let last_error = match row.error_kind {
            Some(kind) => Some(ActionError::new(
                kind.parse()?,
                row.last_error.unwrap_or_default(),
            )),
            None => None,
        };

        Ok(ActionStatusReport {
            id: ActionId::new(row.id),
            account_id: AccountId::new(row.account_id),
            action_type: row.action_type.parse()?,
            status: row.status.parse()?,
            attempt_count: row.attempt_count as u32,
            last_error,
            next_attempt_at: row.next_attempt_at,
        })
    }
}

#[async_trait]
impl ActionLogRepository for SqliteActionLogRepository {
    async fn insert(
        &self,
        account_id: &AccountId,
        payload: &ActionPayload,
        now: i64,
    ) -> Result<ActionLogEntry> {
        let row = sqlx::query_as::<_, ActionLogRow>(&format!(
            r#"
            INSERT INTO action_log (
                account_id, action_type, payload, status, attempt_count,
                next_attempt_at, created_at, updated_at
            ) VALUES (?, ?, ?, 'pending', 0, ?, ?, ?)
            RETURNING {SELECT_COLUMNS}
            "#
        ))
        .bind(account_id.as_str())
        .bind(payload.action_type().as_str())
        .bind(payload.to_json()?)
        .bind(now)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| SyncbackError::Database(e.to_string()))?;

        row.try_into()
    }

    async fn find_by_id(&self, id: ActionId) -> Result<Option<ActionLogEntry>> {
        let row = sqlx::query_as::<_, ActionLogRow>(&format!(
            "SELECT {SELECT_COLUMNS} FROM action_log WHERE id = ?"
        ))
        .bind(id.as_i64())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| SyncbackError::Database(e.to_string()))?;

        row.map(TryInto::try_into).transpose()
    }

    async fn find_by_account(&self, account_id: &AccountId) -> Result<Vec<ActionLogEntry>> {
        let rows = sqlx::query_as::<_, ActionLogRow>(&format!(
            "SELECT {SELECT_COLUMNS} FROM action_log WHERE account_id = ? ORDER BY id"
        ))
        .bind(account_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| SyncbackError::Database(e.to_string()))?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn status_by_id(&self, id: ActionId) -> Result<Option<ActionStatusReport>> {
        let row = sqlx::query_as::<_, ActionStatusRow>(&format!(
            "SELECT {STATUS_COLUMNS} FROM action_log WHERE id = ?"
        ))
        .bind(id.as_i64())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| SyncbackError::Database(e.to_string()))?;

        row.map(TryInto::try_into).transpose()
    }

    async fn statuses_by_account(&self, account_id: &AccountId) -> Result<Vec<ActionStatusReport>> {
        let rows = sqlx::query_as::<_, ActionStatusRow>(&format!(
            "SELECT {STATUS_COLUMNS} FROM action_log WHERE account_id = ? ORDER BY id"
        ))
        .bind(account_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| SyncbackError::Database(e.to_string()))?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn claim_next(
        &self,
        account_id: &AccountId,
        owner: &str,
        now: i64,
        lease_expires_at: i64,
    ) -> Result<ClaimOutcome> {
        let claimed = sqlx::query_as::<_, ActionLogRow>(&format!(
            r#"
            UPDATE action_log
            SET status = 'in_progress',
                attempt_count = attempt_count + 1,
                lease_owner = ?,
                lease_expires_at = ?,
                updated_at = ?
            WHERE id = (
                SELECT id FROM action_log
                WHERE account_id = ? AND status IN ('pending', 'in_progress')
                ORDER BY id
                LIMIT 1
            )
            AND status = 'pending'
            AND next_attempt_at <= ?
            RETURNING {SELECT_COLUMNS}
            "#
        ))
        .bind(owner)
        .bind(lease_expires_at)
        .bind(now)
        .bind(account_id.as_str())
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| SyncbackError::Database(e.to_string()))?;

        let Some(row) = claimed else {
            return self.inspect_head(account_id, now).await;
        };

        let id = row.id;
        match ActionLogEntry::try_from(row) {
            Ok(entry) => Ok(ClaimOutcome::Claimed(entry)),
            Err(e) => {
                let message = e.to_string();
                self.reject_undecodable(id, &message, now).await?;
                Ok(ClaimOutcome::Rejected {
                    action_id: ActionId::new(id),
                    message,
                })
            }
        }
    }

    async fn settle(&self, entry: &ActionLogEntry, owner: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE action_log
            SET status = ?, error_kind = ?, last_error = ?, next_attempt_at = ?,
                lease_owner = ?, lease_expires_at = ?, updated_at = ?
            WHERE id = ? AND status = 'in_progress' AND lease_owner = ?
            "#,
        )
        .bind(entry.status.as_str())
        .bind(entry.last_error.as_ref().map(|e| e.kind.as_str()))
        .bind(entry.last_error.as_ref().map(|e| e.message.as_str()))
        .bind(entry.next_attempt_at)
        .bind(entry.lease_owner.as_deref())
        .bind(entry.lease_expires_at)
        .bind(entry.updated_at)
        .bind(entry.id.as_i64())
        .bind(owner)
        .execute(&self.pool)
        .await
        .map_err(|e| SyncbackError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(SyncbackError::LeaseExpired {
                action_id: entry.id.as_i64(),
                owner: owner.to_string(),
            });
        }

        Ok(())
    }

    async fn reclaim_expired(&self, now: i64, policy: &RetryPolicy) -> Result<Vec<ReclaimedLease>> {
        let rows = sqlx::query_as::<_, ActionLogRow>(&format!(
            r#"
            SELECT {SELECT_COLUMNS} FROM action_log
            WHERE status = 'in_progress' AND lease_expires_at <= ?
            ORDER BY id
            "#
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| SyncbackError::Database(e.to_string()))?;

        let mut reclaimed = Vec::new();

        for row in rows {
            let id = row.id;
            let account_id = AccountId::new(row.account_id.clone());
            let previous_owner = row.lease_owner.clone();
            let expired_at = row.lease_expires_at;

            let entry = match ActionLogEntry::try_from(row) {
                Ok(entry) => entry,
                Err(e) => {
                    self.reject_undecodable(id, &e.to_string(), now).await?;
                    continue;
                }
            };

            let released = entry.reclaim(policy, now)?;

            let result = sqlx::query(
                r#"
                UPDATE action_log
                SET status = ?, error_kind = ?, last_error = ?,
                    lease_owner = NULL, lease_expires_at = NULL, updated_at = ?
                WHERE id = ? AND status = 'in_progress'
                  AND lease_owner IS ? AND lease_expires_at IS ?
                "#,
            )
            .bind(released.status.as_str())
            .bind(released.last_error.as_ref().map(|e| e.kind.as_str()))
            .bind(released.last_error.as_ref().map(|e| e.message.as_str()))
            .bind(released.updated_at)
            .bind(id)
            .bind(previous_owner.as_deref())
            .bind(expired_at)
            .execute(&self.pool)
            .await
            .map_err(|e| SyncbackError::Database(e.to_string()))?;

            // Zero rows: the owner settled or another reclaimer won
            if result.rows_affected() == 1 {
                reclaimed.push(ReclaimedLease {
                    action_id: released.id,
                    account_id,
                    previous_owner,
                    status: released.status,
                    attempt_count: released.attempt_count,
                });
            }
        }

        Ok(reclaimed)
    }

    async fn accounts_ready(&self, now: i64) -> Result<Vec<AccountId>> {
        let accounts = sqlx::query_scalar::<_, String>(
            r#"
            SELECT account_id FROM action_log
            WHERE id IN (
                SELECT MIN(id) FROM action_log
                WHERE status IN ('pending', 'in_progress')
                GROUP BY account_id
            )
            AND status = 'pending'
            AND next_attempt_at <= ?
            ORDER BY id
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| SyncbackError::Database(e.to_string()))?;

        Ok(accounts.into_iter().map(AccountId::new).collect())
    }

    async fn stats(&self) -> Result<QueueStats> {
        let counts = sqlx::query_as::<_, (String, i64)>(
            "SELECT status, COUNT(*) FROM action_log GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| SyncbackError::Database(e.to_string()))?;

        let mut stats = QueueStats::default();
        for (status, count) in counts {
            let count = count as u64;
            match status.parse::<ActionStatus>()? {
                ActionStatus::Pending => stats.pending = count,
                ActionStatus::InProgress => stats.in_progress = count,
                ActionStatus::Succeeded => stats.succeeded = count,
                ActionStatus::DeadLettered => stats.dead_lettered = count,
                ActionStatus::Failed => {}
            }
        }

        Ok(stats)
    }
}

// ============================================================================
// Tests
// ============================================================================
