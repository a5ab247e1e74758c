//! Test doubles shared by the unit tests of this crate.

use async_trait::async_trait;
use bridge_traits::error::RemoteResult;
use bridge_traits::mail::{AccountId, MailProvider, NamespaceInfo, RemoteFolder, RemoteProtocolClient};
use mockall::mock;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

mock! {
    pub RemoteClient {}

    #[async_trait]
    impl RemoteProtocolClient for RemoteClient {
        async fn discover_namespace(&self, account: &AccountId) -> RemoteResult<NamespaceInfo>;
        async fn list_folders(&self, account: &AccountId) -> RemoteResult<Vec<RemoteFolder>>;
        async fn create_folder(&self, account: &AccountId, remote_name: &str) -> RemoteResult<()>;
        async fn rename_folder(
            &self,
            account: &AccountId,
            old_remote_name: &str,
            new_remote_name: &str,
        ) -> RemoteResult<()>;
        async fn delete_folder(&self, account: &AccountId, remote_name: &str) -> RemoteResult<()>;
        async fn move_message(
            &self,
            account: &AccountId,
            uid: u32,
            source_remote_name: &str,
            destination_remote_name: &str,
        ) -> RemoteResult<()>;
        async fn update_flags(
            &self,
            account: &AccountId,
            remote_folder: &str,
            uid: u32,
            add: &[String],
            remove: &[String],
        ) -> RemoteResult<()>;
        async fn has_capability(&self, account: &AccountId, capability: &str) -> RemoteResult<bool>;
        async fn provider(&self, account: &AccountId) -> MailProvider;
    }
}

impl MockRemoteClient {
    /// Mock whose namespace discovery reports `(prefix, separator)`.
    pub fn with_namespace(prefix: &'static str, separator: &'static str) -> Self {
        let mut client = MockRemoteClient::new();
        client.expect_provider().returning(|_| MailProvider::Generic);
        client.expect_has_capability().returning(|_, _| Ok(true));
        client
            .expect_discover_namespace()
            .returning(move |_| Ok(NamespaceInfo::new(prefix, separator)));
        client
    }
}

/// Single-connection in-memory database.
pub async fn memory_pool() -> SqlitePool {
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap()
}
