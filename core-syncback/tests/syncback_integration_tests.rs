//! Integration tests for action delivery
//!
//! These tests drive `SyncbackService` against an in-memory action log and a
//! recording fake of the remote mail store:
//! - Folder name translation on the wire
//! - Per-account ordering with several accounts in flight
//! - Retry, backoff and dead-lettering
//! - Lease reclamation after a crashed owner
//! - Remote call timeouts
//! - Graceful shutdown

use async_trait::async_trait;
use bridge_traits::error::{RemoteError, RemoteResult};
use bridge_traits::mail::{
    AccountId, MailProvider, NamespaceInfo, RemoteFolder, RemoteProtocolClient,
};
use bridge_traits::time::{Clock, ManualClock};
use core_async::sync::Mutex as AsyncMutex;
use core_async::time::{sleep, timeout, Duration};
use core_runtime::config::{RetryPolicy, SyncbackConfig};
use core_runtime::events::{CoreEvent, EventBus, SyncbackEvent};
use core_syncback::{
    ActionLogRepository, ActionPayload, ActionStatus, ClaimOutcome, ErrorKind,
    SqliteActionLogRepository, SqliteNamespaceRepository, SyncbackService,
};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

// ============================================================================
// Fake Remote Store
// ============================================================================

/// Remote store that records every mutating call.
struct FakeRemoteClient {
    /// `None` when the server does not advertise NAMESPACE
    namespace: Option<(String, String)>,
    list_separator: String,
    delay: Duration,
    calls: AsyncMutex<Vec<(AccountId, String)>>,
    failures: AsyncMutex<HashMap<String, VecDeque<RemoteError>>>,
    in_flight: AsyncMutex<HashMap<AccountId, usize>>,
    overlapped: AtomicBool,
}

impl FakeRemoteClient {
    fn new(prefix: &str, separator: &str) -> Self {
        Self {
            namespace: Some((prefix.to_string(), separator.to_string())),
            list_separator: separator.to_string(),
            delay: Duration::ZERO,
            calls: AsyncMutex::new(Vec::new()),
            failures: AsyncMutex::new(HashMap::new()),
            in_flight: AsyncMutex::new(HashMap::new()),
            overlapped: AtomicBool::new(false),
        }
    }

    fn without_namespace(list_separator: &str) -> Self {
        Self {
            namespace: None,
            list_separator: list_separator.to_string(),
            ..Self::new("", list_separator)
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail the next calls naming `remote_name`, one error per call.
    async fn fail(&self, remote_name: &str, errors: Vec<RemoteError>) {
        self.failures
            .lock()
            .await
            .entry(remote_name.to_string())
            .or_default()
            .extend(errors);
    }

    async fn calls(&self) -> Vec<(AccountId, String)> {
        self.calls.lock().await.clone()
    }

    async fn calls_for(&self, account: &AccountId) -> Vec<String> {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|(a, _)| a == account)
            .map(|(_, call)| call.clone())
            .collect()
    }

    async fn record(&self, account: &AccountId, key: &str, call: String) -> RemoteResult<()> {
        {
            let mut in_flight = self.in_flight.lock().await;
            let count = in_flight.entry(account.clone()).or_default();
            *count += 1;
            if *count > 1 {
                self.overlapped.store(true, Ordering::SeqCst);
            }
        }

        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }

        self.calls.lock().await.push((account.clone(), call));

        if let Some(count) = self.in_flight.lock().await.get_mut(account) {
            *count -= 1;
        }

        match self.failures.lock().await.get_mut(key).and_then(VecDeque::pop_front) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RemoteProtocolClient for FakeRemoteClient {
    async fn discover_namespace(&self, _account: &AccountId) -> RemoteResult<NamespaceInfo> {
        match &self.namespace {
            Some((prefix, separator)) => Ok(NamespaceInfo::new(prefix.clone(), separator.clone())),
            None => Err(RemoteError::Unsupported("NAMESPACE".to_string())),
        }
    }

    async fn list_folders(&self, _account: &AccountId) -> RemoteResult<Vec<RemoteFolder>> {
        Ok(vec![RemoteFolder::new(
            vec![],
            Some(self.list_separator.clone()),
            "INBOX",
        )])
    }

    async fn create_folder(&self, account: &AccountId, remote_name: &str) -> RemoteResult<()> {
        self.record(account, remote_name, format!("create {}", remote_name))
            .await
    }

    async fn rename_folder(
        &self,
        account: &AccountId,
        old_remote_name: &str,
        new_remote_name: &str,
    ) -> RemoteResult<()> {
        self.record(
            account,
            old_remote_name,
            format!("rename {} {}", old_remote_name, new_remote_name),
        )
        .await
    }

    async fn delete_folder(&self, account: &AccountId, remote_name: &str) -> RemoteResult<()> {
        self.record(account, remote_name, format!("delete {}", remote_name))
            .await
    }

    async fn move_message(
        &self,
        account: &AccountId,
        uid: u32,
        source_remote_name: &str,
        destination_remote_name: &str,
    ) -> RemoteResult<()> {
        self.record(
            account,
            source_remote_name,
            format!("move {} {} {}", uid, source_remote_name, destination_remote_name),
        )
        .await
    }

    async fn update_flags(
        &self,
        account: &AccountId,
        remote_folder: &str,
        uid: u32,
        add: &[String],
        remove: &[String],
    ) -> RemoteResult<()> {
        self.record(
            account,
            remote_folder,
            format!("flags {} {} +{} -{}", remote_folder, uid, add.join(","), remove.join(",")),
        )
        .await
    }

    async fn has_capability(&self, _account: &AccountId, capability: &str) -> RemoteResult<bool> {
        Ok(capability == "NAMESPACE" && self.namespace.is_some())
    }

    async fn provider(&self, _account: &AccountId) -> MailProvider {
        MailProvider::Generic
    }
}

// ============================================================================
// Fixtures
// ============================================================================

const START_MILLIS: i64 = 1_700_000_000_000;

async fn create_pool() -> SqlitePool {
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap()
}

struct Fixture {
    service: SyncbackService,
    client: Arc<FakeRemoteClient>,
    log: Arc<SqliteActionLogRepository>,
    clock: Arc<ManualClock>,
    events: Arc<EventBus>,
}

async fn fixture_on(pool: SqlitePool, client: Arc<FakeRemoteClient>, config: SyncbackConfig) -> Fixture {
    let log = Arc::new(SqliteActionLogRepository::new(pool.clone()));
    log.initialize().await.unwrap();
    let namespaces = SqliteNamespaceRepository::new(pool);
    namespaces.initialize().await.unwrap();

    let clock = Arc::new(ManualClock::new(START_MILLIS));
    let events = Arc::new(EventBus::new(1024));
    let service = SyncbackService::with_components(
        config,
        client.clone(),
        log.clone(),
        Arc::new(namespaces),
        events.clone(),
        clock.clone(),
    )
    .unwrap();

    Fixture {
        service,
        client,
        log,
        clock,
        events,
    }
}

async fn fixture(client: FakeRemoteClient, config: SyncbackConfig) -> Fixture {
    fixture_on(create_pool().await, Arc::new(client), config).await
}

fn config() -> SyncbackConfig {
    SyncbackConfig::builder()
        .poll_interval(Duration::from_millis(20))
        .retry_policy(RetryPolicy::new(3, Duration::from_secs(1), Duration::from_secs(8)))
        .build()
        .unwrap()
}

fn account(id: &str) -> AccountId {
    AccountId::new(id)
}

// ============================================================================
// Delivery
// ============================================================================

#[core_async::test]
async fn test_create_folder_uses_provider_namespace() {
    let f = fixture(FakeRemoteClient::new("INBOX.", "."), config()).await;
    let alice = account("alice@example.com");

    let id = f
        .service
        .enqueue_action(&alice, ActionPayload::create_folder("Taxes/Accounting"))
        .await
        .unwrap();

    f.service.process_log().await.unwrap();
    f.service.join_workers().await;

    assert_eq!(
        f.client.calls().await,
        vec![(alice, "create INBOX.Taxes.Accounting".to_string())]
    );
    let report = f.service.action_status(id).await.unwrap();
    assert_eq!(report.status, ActionStatus::Succeeded);
    assert_eq!(report.attempt_count, 1);
    assert!(report.last_error.is_none());
}

#[core_async::test]
async fn test_separator_from_folder_list_without_namespace() {
    let f = fixture(FakeRemoteClient::without_namespace("/"), config()).await;
    let bob = account("bob@example.com");

    f.service
        .enqueue_action(&bob, ActionPayload::create_folder("Taxes/Accounting"))
        .await
        .unwrap();
    f.service.wait_for_idle().await.unwrap();

    assert_eq!(f.client.calls_for(&bob).await, vec!["create Taxes/Accounting"]);
}

#[core_async::test]
async fn test_inbox_is_placed_below_prefix() {
    let f = fixture(FakeRemoteClient::new("INBOX.", "."), config()).await;
    let alice = account("alice");

    f.service
        .enqueue_action(
            &alice,
            ActionPayload::MoveMessage {
                uid: 7,
                source_folder: "INBOX".to_string(),
                destination_folder: "Receipts/2024".to_string(),
            },
        )
        .await
        .unwrap();
    f.service.wait_for_idle().await.unwrap();

    assert_eq!(
        f.client.calls_for(&alice).await,
        vec!["move 7 INBOX.INBOX INBOX.Receipts.2024"]
    );
}

#[core_async::test]
async fn test_per_account_order_under_concurrency() {
    let client = FakeRemoteClient::new("", "/").with_delay(Duration::from_millis(2));
    let config = SyncbackConfig::builder()
        .pool_size(2)
        .max_actions_per_run(3)
        .poll_interval(Duration::from_millis(5))
        .build()
        .unwrap();
    let f = fixture(client, config).await;

    let accounts: Vec<AccountId> = (0..4).map(|i| account(&format!("acct-{}", i))).collect();
    for n in 0..8 {
        for acct in &accounts {
            f.service
                .enqueue_action(acct, ActionPayload::create_folder(format!("F{}", n)))
                .await
                .unwrap();
        }
    }

    f.service.wait_for_idle().await.unwrap();

    for acct in &accounts {
        let expected: Vec<String> = (0..8).map(|n| format!("create F{}", n)).collect();
        assert_eq!(f.client.calls_for(acct).await, expected);
    }
    assert!(!f.client.overlapped.load(Ordering::SeqCst));

    let stats = f.service.queue_stats().await.unwrap();
    assert_eq!(stats.succeeded, 32);
    assert_eq!(stats.outstanding(), 0);
}

#[core_async::test]
async fn test_two_services_share_one_log() {
    // Two dispatchers on one database: the claim rule alone keeps them apart
    let pool = create_pool().await;
    let client = Arc::new(FakeRemoteClient::new("", "/").with_delay(Duration::from_millis(1)));
    let a = fixture_on(pool.clone(), client.clone(), config()).await;
    let b = fixture_on(pool, client.clone(), config()).await;

    let acct = account("shared");
    for n in 0..10 {
        a.service
            .enqueue_action(&acct, ActionPayload::create_folder(format!("F{}", n)))
            .await
            .unwrap();
    }

    let (ra, rb) = futures::join!(a.service.wait_for_idle(), b.service.wait_for_idle());
    ra.unwrap();
    rb.unwrap();

    let expected: Vec<String> = (0..10).map(|n| format!("create F{}", n)).collect();
    assert_eq!(client.calls_for(&acct).await, expected);
    assert!(!client.overlapped.load(Ordering::SeqCst));
}

// ============================================================================
// Failure Handling
// ============================================================================

#[core_async::test]
async fn test_transient_failures_exhaust_into_dead_letter() {
    let f = fixture(FakeRemoteClient::new("", "/"), config()).await;
    let acct = account("carol");
    f.client
        .fail(
            "Flaky",
            vec![
                RemoteError::transient("connection reset"),
                RemoteError::transient("connection reset"),
                RemoteError::transient("connection reset"),
            ],
        )
        .await;

    let flaky = f
        .service
        .enqueue_action(&acct, ActionPayload::create_folder("Flaky"))
        .await
        .unwrap();
    let after = f
        .service
        .enqueue_action(&acct, ActionPayload::create_folder("After"))
        .await
        .unwrap();

    for _ in 0..3 {
        f.service.wait_for_idle().await.unwrap();
        f.clock.advance(Duration::from_secs(10));
    }
    f.service.wait_for_idle().await.unwrap();

    let report = f.service.action_status(flaky).await.unwrap();
    assert_eq!(report.status, ActionStatus::DeadLettered);
    assert_eq!(report.attempt_count, 3);
    assert_eq!(report.last_error.unwrap().kind, ErrorKind::RemoteTransient);

    assert_eq!(
        f.service.action_status(after).await.unwrap().status,
        ActionStatus::Succeeded
    );
    assert_eq!(
        f.client.calls_for(&acct).await,
        vec!["create Flaky", "create Flaky", "create Flaky", "create After"]
    );
}

#[core_async::test]
async fn test_retry_waits_for_backoff() {
    let f = fixture(FakeRemoteClient::new("", "/"), config()).await;
    let acct = account("dave");
    f.client
        .fail("Once", vec![RemoteError::transient("try later")])
        .await;

    let id = f
        .service
        .enqueue_action(&acct, ActionPayload::create_folder("Once"))
        .await
        .unwrap();

    f.service.wait_for_idle().await.unwrap();
    let report = f.service.action_status(id).await.unwrap();
    assert_eq!(report.status, ActionStatus::Pending);
    assert_eq!(report.next_attempt_at, START_MILLIS + 1_000);

    // Not yet due: nothing is dispatched
    f.clock.advance(Duration::from_millis(500));
    assert_eq!(f.service.process_log().await.unwrap(), 0);

    f.clock.advance(Duration::from_millis(500));
    f.service.wait_for_idle().await.unwrap();
    assert_eq!(
        f.service.action_status(id).await.unwrap().status,
        ActionStatus::Succeeded
    );
}

#[core_async::test]
async fn test_permanent_failure_dead_letters_immediately() {
    let f = fixture(FakeRemoteClient::new("INBOX.", "."), config()).await;
    let acct = account("erin");
    f.client
        .fail("INBOX.Missing", vec![RemoteError::permanent("NO [NONEXISTENT]")])
        .await;

    let missing = f
        .service
        .enqueue_action(&acct, ActionPayload::delete_folder("Missing"))
        .await
        .unwrap();
    f.service
        .enqueue_action(&acct, ActionPayload::create_folder("Next"))
        .await
        .unwrap();

    let mut stream = f.events.subscribe();
    f.service.wait_for_idle().await.unwrap();

    let report = f.service.action_status(missing).await.unwrap();
    assert_eq!(report.status, ActionStatus::DeadLettered);
    assert_eq!(report.attempt_count, 1);
    assert_eq!(report.last_error.unwrap().kind, ErrorKind::RemotePermanent);
    assert_eq!(
        f.client.calls_for(&acct).await,
        vec!["delete INBOX.Missing", "create INBOX.Next"]
    );

    let mut dead_lettered = Vec::new();
    while let Ok(CoreEvent::Syncback(event)) = stream.try_recv() {
        if let SyncbackEvent::ActionDeadLettered { action_id, error_kind, .. } = event {
            dead_lettered.push((action_id, error_kind));
        }
    }
    assert_eq!(
        dead_lettered,
        vec![(missing.as_i64(), "remote_permanent".to_string())]
    );
}

#[core_async::test]
async fn test_remote_call_timeout_is_transient() {
    let client = FakeRemoteClient::new("", "/").with_delay(Duration::from_millis(500));
    let config = SyncbackConfig::builder()
        .poll_interval(Duration::from_millis(20))
        .remote_call_timeout(Duration::from_millis(50))
        .lease_duration(Duration::from_secs(5))
        .build()
        .unwrap();
    let f = fixture(client, config).await;
    let acct = account("frank");

    let id = f
        .service
        .enqueue_action(&acct, ActionPayload::create_folder("Slow"))
        .await
        .unwrap();
    f.service.wait_for_idle().await.unwrap();

    let report = f.service.action_status(id).await.unwrap();
    assert_eq!(report.status, ActionStatus::Pending);
    assert_eq!(report.attempt_count, 1);
    let error = report.last_error.unwrap();
    assert_eq!(error.kind, ErrorKind::RemoteTransient);
    assert!(error.message.contains("timed out"));
}

// ============================================================================
// Leases
// ============================================================================

#[core_async::test]
async fn test_expired_lease_is_reclaimed_and_redelivered() {
    let f = fixture(FakeRemoteClient::new("", "/"), config()).await;
    let acct = account("grace");

    let id = f
        .service
        .enqueue_action(&acct, ActionPayload::create_folder("Orphan"))
        .await
        .unwrap();

    // A worker in another process claims the entry and dies
    let now = f.clock.unix_timestamp_millis();
    let claimed = f
        .log
        .claim_next(&acct, "crashed/1", now, now + 120_000)
        .await
        .unwrap();
    assert!(matches!(claimed, ClaimOutcome::Claimed(_)));

    // Lease still valid: the account is blocked
    f.service.wait_for_idle().await.unwrap();
    assert!(f.client.calls().await.is_empty());

    let mut stream = f.events.subscribe();
    f.clock.advance(Duration::from_secs(121));
    f.service.wait_for_idle().await.unwrap();

    let report = f.service.action_status(id).await.unwrap();
    assert_eq!(report.status, ActionStatus::Succeeded);
    assert_eq!(report.attempt_count, 2);
    assert_eq!(f.client.calls_for(&acct).await, vec!["create Orphan"]);

    let mut reclaimed = false;
    while let Ok(CoreEvent::Syncback(event)) = stream.try_recv() {
        if let SyncbackEvent::LeaseReclaimed { previous_owner, .. } = event {
            assert_eq!(previous_owner.as_deref(), Some("crashed/1"));
            reclaimed = true;
        }
    }
    assert!(reclaimed);
}

#[core_async::test]
async fn test_expired_lease_on_final_attempt_dead_letters() {
    let config = SyncbackConfig::builder()
        .retry_policy(RetryPolicy::new(1, Duration::from_secs(1), Duration::from_secs(1)))
        .build()
        .unwrap();
    let f = fixture(FakeRemoteClient::new("", "/"), config).await;
    let acct = account("heidi");

    let id = f
        .service
        .enqueue_action(&acct, ActionPayload::create_folder("Poison"))
        .await
        .unwrap();

    let now = f.clock.unix_timestamp_millis();
    f.log
        .claim_next(&acct, "crashed/2", now, now + 1_000)
        .await
        .unwrap();

    f.clock.advance(Duration::from_secs(2));
    f.service.wait_for_idle().await.unwrap();

    let report = f.service.action_status(id).await.unwrap();
    assert_eq!(report.status, ActionStatus::DeadLettered);
    assert_eq!(report.last_error.unwrap().kind, ErrorKind::LeaseExpired);
    assert!(f.client.calls().await.is_empty());
}

// ============================================================================
// Lifecycle
// ============================================================================

#[core_async::test]
async fn test_stop_waits_for_in_flight_work() {
    let client = FakeRemoteClient::new("", "/").with_delay(Duration::from_millis(30));
    let f = fixture(client, config()).await;
    let acct = account("ivan");

    let mut stream = f.events.subscribe();
    f.service.start().await.unwrap();

    for n in 0..20 {
        f.service
            .enqueue_action(&acct, ActionPayload::create_folder(format!("F{}", n)))
            .await
            .unwrap();
    }

    // Wait until the first dispatch is under way
    let worker_id = timeout(Duration::from_secs(5), async {
        let mut started = None;
        loop {
            match stream.recv().await {
                Ok(CoreEvent::Syncback(SyncbackEvent::WorkerStarted { worker_id, .. })) => {
                    started = Some(worker_id);
                }
                Ok(CoreEvent::Syncback(SyncbackEvent::ActionClaimed { .. })) => break started,
                _ => {}
            }
        }
    })
    .await
    .unwrap();

    assert!(worker_id.is_some());
    assert_eq!(f.service.active_worker(&acct).await, worker_id);
    assert_eq!(f.service.active_accounts().await, vec![acct.clone()]);

    f.service.stop().await.unwrap();

    assert!(!f.service.is_running().await);
    assert!(f.service.active_accounts().await.is_empty());
    assert_eq!(f.service.active_worker(&acct).await, None);

    let stats = f.service.queue_stats().await.unwrap();
    assert_eq!(stats.in_progress, 0);
    assert!(stats.succeeded >= 1);
    assert_eq!(stats.succeeded + stats.pending, 20);
}

#[core_async::test]
async fn test_batch_limit_restarts_without_waiting_for_poll() {
    // The poll tick never fires during the test; only wakes can restart the account
    let config = SyncbackConfig::builder()
        .poll_interval(Duration::from_secs(60))
        .max_actions_per_run(1)
        .build()
        .unwrap();
    let f = fixture(FakeRemoteClient::new("", "/"), config).await;
    let acct = account("kim");

    for n in 0..3 {
        f.service
            .enqueue_action(&acct, ActionPayload::create_folder(format!("F{}", n)))
            .await
            .unwrap();
    }

    f.service.start().await.unwrap();

    let drained = timeout(Duration::from_secs(5), async {
        loop {
            if f.service.queue_stats().await.unwrap().succeeded == 3 {
                break;
            }
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await;

    f.service.stop().await.unwrap();

    assert!(drained.is_ok());
    assert_eq!(f.client.calls_for(&acct).await, vec!["create F0", "create F1", "create F2"]);
}

#[core_async::test]
async fn test_enqueue_rejection_writes_nothing() {
    let f = fixture(FakeRemoteClient::new("INBOX.", "."), config()).await;
    let acct = account("judy");

    for payload in [
        ActionPayload::create_folder(""),
        ActionPayload::rename_folder("Ok", "/Leading"),
        ActionPayload::delete_folder("Trailing/"),
    ] {
        assert!(f.service.enqueue_action(&acct, payload).await.is_err());
    }

    assert_eq!(f.service.queue_stats().await.unwrap().total(), 0);
    assert!(f.service.account_actions(&acct).await.unwrap().is_empty());
}
