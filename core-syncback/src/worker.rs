//! # Syncback Worker
//!
//! Drains the action log of a single account, strictly in log order.
//!
//! ## Overview
//!
//! A worker is started by the service for one account and returns when it
//! runs out of work it may do right now:
//!
//! ```text
//! loop:
//!   shutdown requested?           → Shutdown
//!   dispatched max_actions_per_run → BatchLimit
//!   claim oldest outstanding entry
//!     Empty                        → Idle
//!     leased elsewhere             → Blocked
//!     backing off > poll_interval  → Backoff   (shorter waits are slept through)
//!     Claimed → dispatch → settle → loop
//! ```
//!
//! Dispatch resolves the account namespace, translates every canonical
//! folder name and invokes the matching remote operation, all bounded by
//! `remote_call_timeout`. An in-flight dispatch is never interrupted by
//! shutdown; the worker stops before claiming the next entry.

use crate::action::{ActionError, ActionId, ActionLogEntry, ActionPayload, ActionStatus};
use crate::folder_name::FolderNamespace;
use crate::namespace::NamespaceCache;
use crate::repository::{ActionLogRepository, ClaimOutcome};
use crate::{Result, SyncbackError};
use bridge_traits::mail::{AccountId, RemoteProtocolClient};
use bridge_traits::time::Clock;
use core_async::sync::CancellationToken;
use core_async::time::{sleep, timeout, Duration, Instant};
use core_runtime::config::SyncbackConfig;
use core_runtime::events::{CoreEvent, EventBus, SyncbackEvent};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Collaborators shared by every worker of a service.
#[derive(Clone)]
pub struct WorkerContext {
    pub config: Arc<SyncbackConfig>,
    pub client: Arc<dyn RemoteProtocolClient>,
    pub action_log: Arc<dyn ActionLogRepository>,
    pub namespaces: Arc<NamespaceCache>,
    pub event_bus: Arc<EventBus>,
    pub clock: Arc<dyn Clock>,
}

/// Why a worker returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// No outstanding entry for the account
    Idle,
    /// The oldest entry is not due before `eligible_at`
    Backoff {
        action_id: ActionId,
        eligible_at: i64,
    },
    /// The oldest entry is leased by another owner
    Blocked { action_id: ActionId },
    /// `max_actions_per_run` reached; more work may remain
    BatchLimit,
    Shutdown,
}

impl WorkerExit {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerExit::Idle => "idle",
            WorkerExit::Backoff { .. } => "backoff",
            WorkerExit::Blocked { .. } => "blocked",
            WorkerExit::BatchLimit => "batch_limit",
            WorkerExit::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Summary of one worker run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerReport {
    pub account_id: AccountId,
    pub worker_id: String,
    /// Entries claimed and dispatched, whatever their outcome
    pub dispatched: u32,
    pub exit: WorkerExit,
}

pub struct SyncbackWorker {
    account_id: AccountId,
    worker_id: String,
    ctx: WorkerContext,
    shutdown: CancellationToken,
}

impl SyncbackWorker {
    /// `worker_id` doubles as the lease owner and must be unique across
    /// every process sharing the action log.
    pub fn new(
        account_id: AccountId,
        worker_id: impl Into<String>,
        ctx: WorkerContext,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            account_id,
            worker_id: worker_id.into(),
            ctx,
            shutdown,
        }
    }

    pub fn account_id(&self) -> &AccountId {
        &self.account_id
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Process the account's entries until there is nothing to do right now.
    ///
    /// # Errors
    ///
    /// Returns an error if the action log cannot be read or written. Remote
    /// failures are recorded on the entries and never returned.
    #[instrument(skip(self), fields(account_id = %self.account_id, worker_id = %self.worker_id))]
    pub async fn run(self) -> Result<WorkerReport> {
        self.emit(SyncbackEvent::WorkerStarted {
            account_id: self.account_id.to_string(),
            worker_id: self.worker_id.clone(),
        });
        debug!("Worker started");

        let config = Arc::clone(&self.ctx.config);
        let lease_millis = config.lease_duration.as_millis() as i64;
        let mut dispatched: u32 = 0;
        let mut waited_on: Option<ActionId> = None;

        let exit = loop {
            if self.shutdown.is_cancelled() {
                break WorkerExit::Shutdown;
            }

            if dispatched as usize >= config.max_actions_per_run {
                break WorkerExit::BatchLimit;
            }

            let now = self.ctx.clock.unix_timestamp_millis();
            let outcome = self
                .ctx
                .action_log
                .claim_next(&self.account_id, &self.worker_id, now, now + lease_millis)
                .await?;

            match outcome {
                ClaimOutcome::Claimed(entry) => {
                    waited_on = None;
                    self.process(entry).await?;
                    dispatched += 1;
                }
                ClaimOutcome::Empty => break WorkerExit::Idle,
                ClaimOutcome::Blocked { action_id } => {
                    debug!(action_id = %action_id, "Head entry leased elsewhere");
                    break WorkerExit::Blocked { action_id };
                }
                ClaimOutcome::Backoff {
                    action_id,
                    eligible_at,
                } => {
                    let wait = Duration::from_millis((eligible_at - now).max(0) as u64);

                    // Sleep once through a short backoff; if the clock did not
                    // reach `eligible_at` meanwhile, leave it to the poller.
                    if wait > config.poll_interval || waited_on == Some(action_id) {
                        break WorkerExit::Backoff {
                            action_id,
                            eligible_at,
                        };
                    }

                    waited_on = Some(action_id);
                    let cancelled = core_async::select! {
                        _ = self.shutdown.cancelled() => true,
                        _ = sleep(wait) => false,
                    };
                    if cancelled {
                        break WorkerExit::Shutdown;
                    }
                }
                ClaimOutcome::Rejected { action_id, message } => {
                    warn!(action_id = %action_id, error = %message, "Undecodable action dead-lettered");
                    self.emit(SyncbackEvent::ActionDeadLettered {
                        action_id: action_id.as_i64(),
                        account_id: self.account_id.to_string(),
                        attempt: 0,
                        error_kind: "internal".to_string(),
                        message,
                    });
                }
            }
        };

        info!(dispatched, exit = %exit, "Worker finished");
        self.emit(SyncbackEvent::WorkerStopped {
            account_id: self.account_id.to_string(),
            worker_id: self.worker_id.clone(),
            dispatched,
            reason: exit.as_str().to_string(),
        });

        Ok(WorkerReport {
            account_id: self.account_id.clone(),
            worker_id: self.worker_id.clone(),
            dispatched,
            exit,
        })
    }

    /// Dispatch a claimed entry and persist the outcome.
    #[instrument(skip(self, entry), fields(action_id = %entry.id, action_type = %entry.action_type(), attempt = entry.attempt_count))]
    async fn process(&self, entry: ActionLogEntry) -> Result<()> {
        let action_id = entry.id;
        let attempt = entry.attempt_count;

        self.emit(SyncbackEvent::ActionClaimed {
            action_id: action_id.as_i64(),
            account_id: self.account_id.to_string(),
            attempt,
        });

        let started = Instant::now();
        let outcome = self.dispatch(&entry).await;
        let now = self.ctx.clock.unix_timestamp_millis();

        let settled = match outcome {
            Ok(()) => entry.succeed(now)?,
            Err(error) => entry.fail(error, &self.ctx.config.retry, now)?,
        };

        match self.ctx.action_log.settle(&settled, &self.worker_id).await {
            Ok(()) => {}
            Err(SyncbackError::LeaseExpired { .. }) => {
                warn!(
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Lease lost before the outcome was recorded; entry will be redelivered"
                );
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        self.report_outcome(&settled, started.elapsed());
        Ok(())
    }

    fn report_outcome(&self, entry: &ActionLogEntry, elapsed: Duration) {
        let action_id = entry.id.as_i64();
        let account_id = self.account_id.to_string();
        let attempt = entry.attempt_count;
        let elapsed_ms = elapsed.as_millis() as u64;

        match (entry.status, entry.last_error.as_ref()) {
            (ActionStatus::Succeeded, _) => {
                info!(elapsed_ms, "Action delivered");
                self.emit(SyncbackEvent::ActionSucceeded {
                    action_id,
                    account_id,
                    attempt,
                });
            }
            (ActionStatus::Pending, Some(error)) => {
                warn!(
                    error = %error,
                    next_attempt_at = entry.next_attempt_at,
                    "Action failed, retry scheduled"
                );
                self.emit(SyncbackEvent::ActionRetryScheduled {
                    action_id,
                    account_id,
                    attempt,
                    next_attempt_at: entry.next_attempt_at,
                    message: error.message.clone(),
                });
            }
            (ActionStatus::DeadLettered, Some(error)) => {
                warn!(error = %error, "Action dead-lettered");
                self.emit(SyncbackEvent::ActionDeadLettered {
                    action_id,
                    account_id,
                    attempt,
                    error_kind: error.kind.as_str().to_string(),
                    message: error.message.clone(),
                });
            }
            (status, _) => {
                debug!(status = %status, "Unexpected settled status");
            }
        }
    }

    /// Run one attempt: namespace, translation and the remote call.
    async fn dispatch(&self, entry: &ActionLogEntry) -> std::result::Result<(), ActionError> {
        let call_timeout = self.ctx.config.remote_call_timeout;

        let attempt = async {
            let namespace = self
                .ctx
                .namespaces
                .resolve(&entry.account_id)
                .await
                .map_err(|e| ActionError::from(&e))?;

            self.invoke(&namespace.folder_namespace(), &entry.payload)
                .await
        };

        match timeout(call_timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(ActionError::transient(format!(
                "Remote call timed out after {:?}",
                call_timeout
            ))),
        }
    }

    async fn invoke(
        &self,
        namespace: &FolderNamespace,
        payload: &ActionPayload,
    ) -> std::result::Result<(), ActionError> {
        let remote = |canonical: &str| {
            namespace
                .to_remote(canonical)
                .map_err(|e| ActionError::from(&e))
        };
        let account = &self.account_id;
        let client = &self.ctx.client;

        let result = match payload {
            ActionPayload::CreateFolder { display_name } => {
                let name = remote(display_name)?;
                debug!(remote_name = %name, "Creating folder");
                client.create_folder(account, &name).await
            }
            ActionPayload::RenameFolder {
                old_display_name,
                new_display_name,
            } => {
                let old = remote(old_display_name)?;
                let new = remote(new_display_name)?;
                debug!(old_remote_name = %old, new_remote_name = %new, "Renaming folder");
                client.rename_folder(account, &old, &new).await
            }
            ActionPayload::DeleteFolder { display_name } => {
                let name = remote(display_name)?;
                debug!(remote_name = %name, "Deleting folder");
                client.delete_folder(account, &name).await
            }
            ActionPayload::MoveMessage {
                uid,
                source_folder,
                destination_folder,
            } => {
                let source = remote(source_folder)?;
                let destination = remote(destination_folder)?;
                debug!(uid, source = %source, destination = %destination, "Moving message");
                client.move_message(account, *uid, &source, &destination).await
            }
            ActionPayload::UpdateFlags {
                folder,
                uid,
                add,
                remove,
            } => {
                let name = remote(folder)?;
                debug!(uid, remote_name = %name, "Updating flags");
                client.update_flags(account, &name, *uid, add, remove).await
            }
        };

        result.map_err(|e| ActionError::from(&e))
    }

    fn emit(&self, event: SyncbackEvent) {
        self.ctx.event_bus.emit(CoreEvent::Syncback(event)).ok();
    }
}
