//! # Account Namespaces
//!
//! Discovery and caching of each account's folder prefix and separator.
//!
//! ## Overview
//!
//! Namespaces are discovered once per account and cached twice: in memory
//! for dispatch, and in the `account_namespaces` table so a restart does not
//! query every server again. [`NamespaceCache::invalidate`] drops both copies
//! when the host learns the server layout changed; the next dispatch then
//! rediscovers it.
//!
//! Discovery asks for `NAMESPACE` only when the server advertises it. Without
//! it the account uses an empty prefix and the separator of the first folder
//! returned by `LIST`, falling back to the configured default.

use crate::folder_name::FolderNamespace;
use crate::{Result, SyncbackError};
use async_trait::async_trait;
use bridge_traits::error::RemoteError;
use bridge_traits::mail::{
    AccountId, MailProvider, NamespaceInfo, RemoteProtocolClient, CAPABILITY_NAMESPACE,
};
use bridge_traits::time::Clock;
use core_async::sync::RwLock;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Namespace metadata of one account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountNamespace {
    pub account_id: AccountId,
    pub prefix: String,
    /// Empty for servers without a hierarchy delimiter
    pub separator: String,
    pub provider: MailProvider,
    /// Unix milliseconds
    pub discovered_at: i64,
}

impl AccountNamespace {
    pub fn folder_namespace(&self) -> FolderNamespace {
        FolderNamespace::new(self.prefix.clone(), self.separator.clone())
    }
}

// ============================================================================
// Repository
// ============================================================================

#[async_trait]
pub trait NamespaceRepository: Send + Sync {
    async fn find(&self, account_id: &AccountId) -> Result<Option<AccountNamespace>>;

    /// Insert or replace the namespace of `namespace.account_id`.
    async fn upsert(&self, namespace: &AccountNamespace) -> Result<()>;

    async fn delete(&self, account_id: &AccountId) -> Result<()>;
}

pub struct SqliteNamespaceRepository {
    pool: SqlitePool,
}

impl SqliteNamespaceRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS account_namespaces (
                account_id TEXT PRIMARY KEY NOT NULL,
                prefix TEXT NOT NULL,
                separator TEXT NOT NULL,
                provider TEXT NOT NULL,
                discovered_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| SyncbackError::Database(e.to_string()))?;

        Ok(())
    }
}

#[derive(Debug, FromRow)]
struct AccountNamespaceRow {
    account_id: String,
    prefix: String,
    separator: String,
    provider: String,
    discovered_at: i64,
}

impl TryFrom<AccountNamespaceRow> for AccountNamespace {
    type Error = SyncbackError;

    fn try_from(row: AccountNamespaceRow) -> Result<Self> {
        let provider = row
            .provider
            .parse()
            .map_err(|e: RemoteError| SyncbackError::Database(e.to_string()))?;

        Ok(AccountNamespace {
            account_id: AccountId::new(row.account_id),
            prefix: row.prefix,
            separator: row.separator,
            provider,
            discovered_at: row.discovered_at,
        })
    }
}

#[async_trait]
impl NamespaceRepository for SqliteNamespaceRepository {
    async fn find(&self, account_id: &AccountId) -> Result<Option<AccountNamespace>> {
        let row = sqlx::query_as::<_, AccountNamespaceRow>(
            r#"
            SELECT account_id, prefix, separator, provider, discovered_at
            FROM account_namespaces
            WHERE account_id = ?
            "#,
        )
        .bind(account_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| SyncbackError::Database(e.to_string()))?;

        row.map(TryInto::try_into).transpose()
    }

    async fn upsert(&self, namespace: &AccountNamespace) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO account_namespaces (account_id, prefix, separator, provider, discovered_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(account_id) DO UPDATE SET
                prefix = excluded.prefix,
                separator = excluded.separator,
                provider = excluded.provider,
                discovered_at = excluded.discovered_at
            "#,
        )
        .bind(namespace.account_id.as_str())
        .bind(&namespace.prefix)
        .bind(&namespace.separator)
        .bind(namespace.provider.as_str())
        .bind(namespace.discovered_at)
        .execute(&self.pool)
        .await
        .map_err(|e| SyncbackError::Database(e.to_string()))?;

        Ok(())
    }

    async fn delete(&self, account_id: &AccountId) -> Result<()> {
        sqlx::query("DELETE FROM account_namespaces WHERE account_id = ?")
            .bind(account_id.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| SyncbackError::Database(e.to_string()))?;

        Ok(())
    }
}

// ============================================================================
// Cache & Discovery
// ============================================================================

/// Read-mostly namespace lookup shared by all workers.
pub struct NamespaceCache {
    client: Arc<dyn RemoteProtocolClient>,
    repository: Arc<dyn NamespaceRepository>,
    clock: Arc<dyn Clock>,
    default_separator: String,
    entries: RwLock<HashMap<AccountId, AccountNamespace>>,
}

impl NamespaceCache {
    pub fn new(
        client: Arc<dyn RemoteProtocolClient>,
        repository: Arc<dyn NamespaceRepository>,
        clock: Arc<dyn Clock>,
        default_separator: impl Into<String>,
    ) -> Self {
        Self {
            client,
            repository,
            clock,
            default_separator: default_separator.into(),
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Namespace of `account_id`, discovering it on first use.
    ///
    /// # Errors
    ///
    /// Returns [`SyncbackError::Remote`] if discovery fails, or a database
    /// error if the stored copy cannot be read or written.
    pub async fn resolve(&self, account_id: &AccountId) -> Result<AccountNamespace> {
        if let Some(namespace) = self.entries.read().await.get(account_id) {
            return Ok(namespace.clone());
        }

        let namespace = match self.repository.find(account_id).await? {
            Some(stored) => stored,
            None => {
                let discovered = self.discover(account_id).await?;
                self.repository.upsert(&discovered).await?;
                discovered
            }
        };

        self.entries
            .write()
            .await
            .insert(account_id.clone(), namespace.clone());

        Ok(namespace)
    }

    /// Forget the namespace so the next [`resolve`](Self::resolve) rediscovers it.
    #[instrument(skip(self), fields(account_id = %account_id))]
    pub async fn invalidate(&self, account_id: &AccountId) -> Result<()> {
        self.entries.write().await.remove(account_id);
        self.repository.delete(account_id).await?;
        debug!("Namespace invalidated");
        Ok(())
    }

    /// Cached namespace, without touching the server or database.
    pub async fn cached(&self, account_id: &AccountId) -> Option<AccountNamespace> {
        self.entries.read().await.get(account_id).cloned()
    }

    #[instrument(skip(self), fields(account_id = %account_id))]
    async fn discover(&self, account_id: &AccountId) -> Result<AccountNamespace> {
        let provider = self.client.provider(account_id).await;

        let reported = if self
            .client
            .has_capability(account_id, CAPABILITY_NAMESPACE)
            .await?
        {
            match self.client.discover_namespace(account_id).await {
                Ok(info) => Some(info),
                Err(RemoteError::Unsupported(reason)) => {
                    debug!(reason = %reason, "NAMESPACE advertised but unsupported");
                    None
                }
                Err(e) => return Err(e.into()),
            }
        } else {
            None
        };

        let info = match reported {
            Some(info) => info,
            None => self.fallback_namespace(account_id).await?,
        };

        info!(
            prefix = %info.prefix,
            separator = %info.separator,
            provider = %provider,
            "Discovered account namespace"
        );

        Ok(AccountNamespace {
            account_id: account_id.clone(),
            prefix: info.prefix,
            separator: info.separator,
            provider,
            discovered_at: self.clock.unix_timestamp_millis(),
        })
    }

    async fn fallback_namespace(&self, account_id: &AccountId) -> Result<NamespaceInfo> {
        let folders = self.client.list_folders(account_id).await?;

        let separator = folders
            .first()
            .and_then(|folder| folder.separator.clone())
            .unwrap_or_else(|| self.default_separator.clone());

        Ok(NamespaceInfo::new("", separator))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockRemoteClient;
    use bridge_traits::mail::RemoteFolder;
    use bridge_traits::time::ManualClock;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn create_test_repo() -> Arc<SqliteNamespaceRepository> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let repo = SqliteNamespaceRepository::new(pool);
        repo.initialize().await.unwrap();
        Arc::new(repo)
    }

    fn cache(client: MockRemoteClient, repo: Arc<SqliteNamespaceRepository>) -> NamespaceCache {
        NamespaceCache::new(
            Arc::new(client),
            repo,
            Arc::new(ManualClock::new(42_000)),
            ".",
        )
    }

    fn account() -> AccountId {
        AccountId::new("alice@example.com")
    }

    #[core_async::test]
    async fn test_discovers_namespace_once() {
        let mut client = MockRemoteClient::new();
        client.expect_provider().returning(|_| MailProvider::Fastmail);
        client
            .expect_has_capability()
            .withf(|acct, capability| *acct == account() && capability == CAPABILITY_NAMESPACE)
            .times(1)
            .returning(|_, _| Ok(true));
        client
            .expect_discover_namespace()
            .times(1)
            .returning(|_| Ok(NamespaceInfo::new("INBOX.", ".")));

        let repo = create_test_repo().await;
        let cache = cache(client, repo.clone());

        let first = cache.resolve(&account()).await.unwrap();
        let second = cache.resolve(&account()).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.prefix, "INBOX.");
        assert_eq!(first.provider, MailProvider::Fastmail);
        assert_eq!(first.discovered_at, 42_000);
        assert_eq!(repo.find(&account()).await.unwrap(), Some(first));
    }

    #[core_async::test]
    async fn test_falls_back_to_listed_separator() {
        let mut client = MockRemoteClient::new();
        client.expect_provider().returning(|_| MailProvider::Generic);
        client.expect_has_capability().returning(|_, _| Ok(false));
        client.expect_discover_namespace().never();
        client.expect_list_folders().times(1).returning(|_| {
            Ok(vec![
                RemoteFolder::new(vec![], Some("/"), "INBOX"),
                RemoteFolder::new(vec![], Some("."), "Other"),
            ])
        });

        let cache = cache(client, create_test_repo().await);
        let namespace = cache.resolve(&account()).await.unwrap();

        assert_eq!(namespace.prefix, "");
        assert_eq!(namespace.separator, "/");
    }

    #[core_async::test]
    async fn test_unsupported_namespace_uses_default_separator() {
        let mut client = MockRemoteClient::new();
        client.expect_provider().returning(|_| MailProvider::Generic);
        client.expect_has_capability().returning(|_, _| Ok(true));
        client
            .expect_discover_namespace()
            .returning(|_| Err(RemoteError::Unsupported("NAMESPACE".into())));
        client.expect_list_folders().returning(|_| Ok(vec![]));

        let cache = cache(client, create_test_repo().await);
        let namespace = cache.resolve(&account()).await.unwrap();

        assert_eq!(namespace.folder_namespace(), FolderNamespace::new("", "."));
    }

    #[core_async::test]
    async fn test_discovery_failure_is_not_cached() {
        let mut client = MockRemoteClient::new();
        client.expect_provider().returning(|_| MailProvider::Generic);
        client
            .expect_has_capability()
            .returning(|_, _| Err(RemoteError::transient("connection reset")));

        let repo = create_test_repo().await;
        let cache = cache(client, repo.clone());

        let err = cache.resolve(&account()).await.unwrap_err();
        assert!(matches!(err, SyncbackError::Remote(RemoteError::Transient { .. })));
        assert!(cache.cached(&account()).await.is_none());
        assert!(repo.find(&account()).await.unwrap().is_none());
    }

    #[core_async::test]
    async fn test_invalidate_forces_rediscovery() {
        let mut client = MockRemoteClient::new();
        client.expect_provider().returning(|_| MailProvider::Generic);
        client.expect_has_capability().returning(|_, _| Ok(true));
        let mut seq = mockall::Sequence::new();
        client
            .expect_discover_namespace()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(NamespaceInfo::new("INBOX.", ".")));
        client
            .expect_discover_namespace()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(NamespaceInfo::new("", "/")));

        let cache = cache(client, create_test_repo().await);

        assert_eq!(cache.resolve(&account()).await.unwrap().prefix, "INBOX.");
        cache.invalidate(&account()).await.unwrap();
        assert!(cache.cached(&account()).await.is_none());
        assert_eq!(cache.resolve(&account()).await.unwrap().separator, "/");
    }

    #[core_async::test]
    async fn test_stored_namespace_survives_restart() {
        let repo = create_test_repo().await;
        repo.upsert(&AccountNamespace {
            account_id: account(),
            prefix: "INBOX".to_string(),
            separator: ".".to_string(),
            provider: MailProvider::Icloud,
            discovered_at: 1,
        })
        .await
        .unwrap();

        // No expectations: any remote call would panic
        let cache = cache(MockRemoteClient::new(), repo);
        let namespace = cache.resolve(&account()).await.unwrap();
        assert_eq!(namespace.provider, MailProvider::Icloud);
        assert_eq!(namespace.folder_namespace().to_remote("Taxes").unwrap(), "INBOX.Taxes");
    }
}
