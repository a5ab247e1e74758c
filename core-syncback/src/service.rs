//! # Syncback Service
//!
//! Owns the action log and a bounded pool of per-account workers.
//!
//! ## Overview
//!
//! Callers append intents with [`SyncbackService::enqueue_action`]. A
//! dispatcher pass ([`SyncbackService::process_log`]) first releases leases
//! that outlived their owner, then starts one worker for every account whose
//! oldest outstanding entry is due, up to `pool_size` workers at once.
//!
//! ## Concurrency
//!
//! - At most one worker per account inside a process (the `active` map).
//! - At most one `in_progress` entry per account across processes (the
//!   conditional claim in the action log).
//! - Workers run inside a supervising task; a crash only costs that account
//!   a lease timeout.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use core_syncback::{ActionPayload, SyncbackService};
//!
//! let service = SyncbackService::new(config, client, pool, event_bus).await?;
//! service.start().await?;
//!
//! let id = service
//!     .enqueue_action(&account, ActionPayload::create_folder("Taxes/Accounting"))
//!     .await?;
//!
//! service.stop().await?;
//! ```

use crate::action::{ActionId, ActionPayload, ActionStatus, ActionStatusReport, ErrorKind, QueueStats};
use crate::namespace::{NamespaceCache, NamespaceRepository, SqliteNamespaceRepository};
use crate::repository::{ActionLogRepository, SqliteActionLogRepository};
use crate::worker::{SyncbackWorker, WorkerContext, WorkerExit};
use crate::{Result, SyncbackError};
use bridge_traits::error::RemoteError;
use bridge_traits::mail::{AccountId, RemoteProtocolClient};
use bridge_traits::time::{Clock, SystemClock};
use core_async::sync::{CancellationToken, Mutex, Notify, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use core_async::task::JoinHandle;
use core_async::time::{interval, sleep, timeout, MissedTickBehavior};
use core_runtime::config::SyncbackConfig;
use core_runtime::events::{CoreEvent, EventBus, SyncbackEvent};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// A remote folder paired with the name shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderDisplayName {
    pub remote_name: String,
    pub display_name: String,
    pub attributes: Vec<String>,
}

struct ActiveWorker {
    worker_id: String,
}

/// Delivers logged folder and message actions to remote mail stores.
pub struct SyncbackService {
    config: Arc<SyncbackConfig>,
    client: Arc<dyn RemoteProtocolClient>,
    action_log: Arc<dyn ActionLogRepository>,
    namespaces: Arc<NamespaceCache>,
    event_bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,

    /// One permit per concurrently running worker
    permits: Arc<Semaphore>,

    /// Accounts with a running worker
    active: Arc<Mutex<HashMap<AccountId, ActiveWorker>>>,

    /// Supervisor tasks not yet joined
    workers: Arc<Mutex<Vec<JoinHandle<()>>>>,

    /// Signalled on enqueue so the dispatcher does not wait for the next tick
    wake: Arc<Notify>,

    /// Cancelled by `stop()`, replaced once shutdown completes
    shutdown: Arc<Mutex<CancellationToken>>,

    dispatcher: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl SyncbackService {
    /// Create a service backed by an existing SQLite pool.
    ///
    /// Creates the `action_log` and `account_namespaces` tables if missing.
    ///
    /// # Errors
    ///
    /// Returns [`SyncbackError::Config`] for an invalid configuration or
    /// [`SyncbackError::Database`] if the schema cannot be created.
    pub async fn new(
        config: SyncbackConfig,
        client: Arc<dyn RemoteProtocolClient>,
        pool: SqlitePool,
        event_bus: Arc<EventBus>,
    ) -> Result<Self> {
        let action_log = SqliteActionLogRepository::new(pool.clone());
        action_log.initialize().await?;

        let namespaces = SqliteNamespaceRepository::new(pool);
        namespaces.initialize().await?;

        Self::with_components(
            config,
            client,
            Arc::new(action_log),
            Arc::new(namespaces),
            event_bus,
            Arc::new(SystemClock),
        )
    }

    /// Open the database at `config.database_path` and create a service on it.
    ///
    /// # Errors
    ///
    /// Returns [`SyncbackError::Config`] if no database path is configured.
    pub async fn open(
        config: SyncbackConfig,
        client: Arc<dyn RemoteProtocolClient>,
        event_bus: Arc<EventBus>,
    ) -> Result<Self> {
        let path = config
            .database_path
            .clone()
            .ok_or_else(|| SyncbackError::Config("No database path configured".to_string()))?;

        info!(path = %path.display(), "Opening action log database");

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .map_err(|e| SyncbackError::Database(e.to_string()))?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(config.remote_call_timeout)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.pool_size as u32 + 1)
            .connect_with(options)
            .await
            .map_err(|e| {
                warn!(error = %e, "Failed to open action log database");
                SyncbackError::Database(e.to_string())
            })?;

        Self::new(config, client, pool, event_bus).await
    }

    /// Create a service from injected collaborators.
    ///
    /// # Errors
    ///
    /// Returns [`SyncbackError::Config`] for an invalid configuration.
    pub fn with_components(
        config: SyncbackConfig,
        client: Arc<dyn RemoteProtocolClient>,
        action_log: Arc<dyn ActionLogRepository>,
        namespaces: Arc<dyn NamespaceRepository>,
        event_bus: Arc<EventBus>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let cache = NamespaceCache::new(
            Arc::clone(&client),
            namespaces,
            Arc::clone(&clock),
            config.default_separator.clone(),
        );

        Ok(Self {
            permits: Arc::new(Semaphore::new(config.pool_size)),
            config: Arc::new(config),
            client,
            action_log,
            namespaces: Arc::new(cache),
            event_bus,
            clock,
            active: Arc::new(Mutex::new(HashMap::new())),
            workers: Arc::new(Mutex::new(Vec::new())),
            wake: Arc::new(Notify::new()),
            shutdown: Arc::new(Mutex::new(CancellationToken::new())),
            dispatcher: Arc::new(Mutex::new(None)),
        })
    }

    /// Clone for background task (avoids Arc<Arc<...>>)
    fn clone_for_task(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            client: Arc::clone(&self.client),
            action_log: Arc::clone(&self.action_log),
            namespaces: Arc::clone(&self.namespaces),
            event_bus: Arc::clone(&self.event_bus),
            clock: Arc::clone(&self.clock),
            permits: Arc::clone(&self.permits),
            active: Arc::clone(&self.active),
            workers: Arc::clone(&self.workers),
            wake: Arc::clone(&self.wake),
            shutdown: Arc::clone(&self.shutdown),
            dispatcher: Arc::clone(&self.dispatcher),
        }
    }

    fn worker_context(&self) -> WorkerContext {
        WorkerContext {
            config: Arc::clone(&self.config),
            client: Arc::clone(&self.client),
            action_log: Arc::clone(&self.action_log),
            namespaces: Arc::clone(&self.namespaces),
            event_bus: Arc::clone(&self.event_bus),
            clock: Arc::clone(&self.clock),
        }
    }

    fn emit(&self, event: SyncbackEvent) {
        self.event_bus.emit(CoreEvent::Syncback(event)).ok();
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Spawn the dispatcher loop.
    ///
    /// The loop runs a [`process_log`](Self::process_log) pass every
    /// `poll_interval`, and immediately after each enqueue.
    ///
    /// # Errors
    ///
    /// Returns [`SyncbackError::AlreadyRunning`] if the loop is running.
    pub async fn start(&self) -> Result<()> {
        let mut dispatcher = self.dispatcher.lock().await;
        if dispatcher.is_some() {
            return Err(SyncbackError::AlreadyRunning);
        }

        let token = self.shutdown.lock().await.clone();
        let service = self.clone_for_task();
        *dispatcher = Some(core_async::task::spawn(async move {
            service.dispatch_loop(token).await;
        }));

        info!(
            instance = %self.config.instance_name,
            pool_size = self.config.pool_size,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "Syncback service started"
        );
        Ok(())
    }

    /// Stop claiming new work and wait for every worker to finish.
    ///
    /// In-flight dispatches complete and record their outcome; workers then
    /// exit before claiming another entry.
    ///
    /// # Errors
    ///
    /// Returns [`SyncbackError::NotRunning`] if the service was not started.
    pub async fn stop(&self) -> Result<()> {
        let handle = self
            .dispatcher
            .lock()
            .await
            .take()
            .ok_or(SyncbackError::NotRunning)?;

        self.shutdown.lock().await.cancel();

        if let Err(e) = handle.await {
            error!(error = %e, "Dispatcher task failed");
        }

        let joined = self.join_workers().await;
        self.active.lock().await.clear();

        *self.shutdown.lock().await = CancellationToken::new();

        info!(workers_joined = joined, "Syncback service stopped");
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.dispatcher.lock().await.is_some()
    }

    async fn dispatch_loop(&self, shutdown: CancellationToken) {
        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            core_async::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
                _ = self.wake.notified() => {}
            }

            if let Err(e) = self.process_log().await {
                warn!(error = %e, "Dispatch pass failed");
            }
        }

        debug!("Dispatcher loop exited");
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    /// Run one dispatch pass.
    ///
    /// Releases expired leases, then starts a worker for every account whose
    /// oldest outstanding entry is due and which has no worker yet, while
    /// pool slots remain.
    ///
    /// Returns the number of workers started.
    ///
    /// # Errors
    ///
    /// Returns an error if the action log cannot be read, or
    /// [`SyncbackError::PoolClosed`] if the worker pool was closed.
    #[instrument(skip(self))]
    pub async fn process_log(&self) -> Result<usize> {
        let shutdown = self.shutdown.lock().await.clone();
        if shutdown.is_cancelled() {
            return Ok(0);
        }

        let now = self.clock.unix_timestamp_millis();
        self.reclaim_expired(now).await?;

        let ready = self.action_log.accounts_ready(now).await?;
        if ready.is_empty() {
            return Ok(0);
        }

        let mut started = 0;
        let mut active = self.active.lock().await;

        for account_id in ready {
            if active.contains_key(&account_id) {
                continue;
            }

            let permit = match Arc::clone(&self.permits).try_acquire_owned() {
                Ok(permit) => permit,
                Err(TryAcquireError::NoPermits) => {
                    debug!("Worker pool saturated");
                    break;
                }
                Err(TryAcquireError::Closed) => return Err(SyncbackError::PoolClosed),
            };

            let worker_id = format!("{}/{}", self.config.instance_name, Uuid::new_v4());
            active.insert(
                account_id.clone(),
                ActiveWorker {
                    worker_id: worker_id.clone(),
                },
            );

            let worker = SyncbackWorker::new(
                account_id,
                worker_id,
                self.worker_context(),
                shutdown.clone(),
            );
            let handle = self.supervise(worker, permit);
            self.workers.lock().await.push(handle);
            started += 1;
        }

        if started > 0 {
            debug!(started, "Workers started");
        }
        Ok(started)
    }

    /// Run `worker` in its own task and clean up after it whatever happens.
    fn supervise(&self, worker: SyncbackWorker, permit: OwnedSemaphorePermit) -> JoinHandle<()> {
        let service = self.clone_for_task();

        core_async::task::spawn(async move {
            let account_id = worker.account_id().clone();
            let worker_id = worker.worker_id().to_string();

            let mut more_work = false;
            let crash = match core_async::task::spawn(worker.run()).await {
                Ok(Ok(report)) => {
                    more_work = report.exit == WorkerExit::BatchLimit;
                    None
                }
                Ok(Err(e)) => Some(e.to_string()),
                Err(e) if e.is_panic() => Some("Worker panicked".to_string()),
                Err(e) => Some(e.to_string()),
            };

            if let Some(message) = crash {
                error!(
                    account_id = %account_id,
                    worker_id = %worker_id,
                    error = %message,
                    "Worker crashed; its lease will be reclaimed after expiry"
                );
                service.emit(SyncbackEvent::WorkerCrashed {
                    account_id: account_id.to_string(),
                    worker_id,
                    message,
                });
            }

            service.active.lock().await.remove(&account_id);
            drop(permit);

            // Only once the account and permit are free can a pass restart it
            if more_work {
                service.wake.notify_one();
            }
        })
    }

    async fn reclaim_expired(&self, now: i64) -> Result<()> {
        let reclaimed = self
            .action_log
            .reclaim_expired(now, &self.config.retry)
            .await?;

        for lease in reclaimed {
            if lease.status == ActionStatus::DeadLettered {
                warn!(
                    action_id = %lease.action_id,
                    account_id = %lease.account_id,
                    attempt = lease.attempt_count,
                    "Expired lease on final attempt, action dead-lettered"
                );
                self.emit(SyncbackEvent::ActionDeadLettered {
                    action_id: lease.action_id.as_i64(),
                    account_id: lease.account_id.to_string(),
                    attempt: lease.attempt_count,
                    error_kind: ErrorKind::LeaseExpired.as_str().to_string(),
                    message: "Lease expired on the final attempt".to_string(),
                });
            } else {
                info!(
                    action_id = %lease.action_id,
                    account_id = %lease.account_id,
                    previous_owner = ?lease.previous_owner,
                    "Expired lease reclaimed"
                );
                self.emit(SyncbackEvent::LeaseReclaimed {
                    action_id: lease.action_id.as_i64(),
                    account_id: lease.account_id.to_string(),
                    previous_owner: lease.previous_owner,
                });
            }
        }

        Ok(())
    }

    /// Await every worker started so far.
    ///
    /// Returns the number of workers joined.
    pub async fn join_workers(&self) -> usize {
        let handles = std::mem::take(&mut *self.workers.lock().await);
        let count = handles.len();

        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker supervisor failed");
            }
        }

        count
    }

    /// Dispatch until no outstanding entry is due.
    ///
    /// Entries waiting out a backoff delay are left alone.
    ///
    /// # Errors
    ///
    /// Returns an error if the action log cannot be read.
    pub async fn wait_for_idle(&self) -> Result<()> {
        loop {
            let started = self.process_log().await?;
            let joined = self.join_workers().await;

            let now = self.clock.unix_timestamp_millis();
            if self.action_log.accounts_ready(now).await?.is_empty() {
                return Ok(());
            }

            if started == 0 && joined == 0 {
                sleep(self.config.poll_interval).await;
            }
        }
    }

    pub async fn active_accounts(&self) -> Vec<AccountId> {
        let mut accounts: Vec<AccountId> = self.active.lock().await.keys().cloned().collect();
        accounts.sort();
        accounts
    }

    /// Lease owner of the worker currently running for `account_id`.
    pub async fn active_worker(&self, account_id: &AccountId) -> Option<String> {
        self.active
            .lock()
            .await
            .get(account_id)
            .map(|worker| worker.worker_id.clone())
    }

    // ========================================================================
    // Action Log
    // ========================================================================

    /// Append an action for `account_id` and wake the dispatcher.
    ///
    /// # Errors
    ///
    /// Returns [`SyncbackError::Translation`] without writing anything if a
    /// folder name in `payload` is not a valid canonical name.
    #[instrument(skip(self, payload), fields(account_id = %account_id, action_type = %payload.action_type()))]
    pub async fn enqueue_action(
        &self,
        account_id: &AccountId,
        payload: ActionPayload,
    ) -> Result<ActionId> {
        payload.validate()?;

        let now = self.clock.unix_timestamp_millis();
        let entry = self.action_log.insert(account_id, &payload, now).await?;

        debug!(action_id = %entry.id, "Action enqueued");
        self.emit(SyncbackEvent::ActionEnqueued {
            action_id: entry.id.as_i64(),
            account_id: account_id.to_string(),
            action_type: entry.action_type().as_str().to_string(),
        });

        self.wake.notify_one();
        Ok(entry.id)
    }

    /// # Errors
    ///
    /// Returns [`SyncbackError::ActionNotFound`] for an unknown id.
    pub async fn action_status(&self, id: ActionId) -> Result<ActionStatusReport> {
        self.action_log
            .status_by_id(id)
            .await?
            .ok_or(SyncbackError::ActionNotFound {
                action_id: id.as_i64(),
            })
    }

    /// Every entry of `account_id`, oldest first.
    pub async fn account_actions(&self, account_id: &AccountId) -> Result<Vec<ActionStatusReport>> {
        self.action_log.statuses_by_account(account_id).await
    }

    pub async fn queue_stats(&self) -> Result<QueueStats> {
        self.action_log.stats().await
    }

    // ========================================================================
    // Folder Names
    // ========================================================================

    /// Display name for a provider-native folder name.
    ///
    /// # Errors
    ///
    /// Returns an error if the account namespace cannot be discovered.
    pub async fn get_folder_display_name(
        &self,
        account_id: &AccountId,
        remote_name: &str,
    ) -> Result<String> {
        let namespace = self.namespaces.resolve(account_id).await?;
        Ok(namespace.folder_namespace().to_canonical(remote_name))
    }

    /// List the account's remote folders with their display names.
    ///
    /// # Errors
    ///
    /// Returns [`SyncbackError::Remote`] if listing fails or times out.
    #[instrument(skip(self), fields(account_id = %account_id))]
    pub async fn list_folder_display_names(
        &self,
        account_id: &AccountId,
    ) -> Result<Vec<FolderDisplayName>> {
        let namespace = self.namespaces.resolve(account_id).await?.folder_namespace();

        let folders = timeout(
            self.config.remote_call_timeout,
            self.client.list_folders(account_id),
        )
        .await
        .map_err(|_| {
            SyncbackError::Remote(RemoteError::transient("Folder listing timed out"))
        })??;

        Ok(folders
            .into_iter()
            .map(|folder| FolderDisplayName {
                display_name: namespace.to_canonical(&folder.name),
                remote_name: folder.name,
                attributes: folder.attributes,
            })
            .collect())
    }

    /// Forget the account namespace; the next dispatch rediscovers it.
    pub async fn refresh_namespace(&self, account_id: &AccountId) -> Result<()> {
        self.namespaces.invalidate(account_id).await
    }
}
