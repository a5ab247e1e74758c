//! Remote Mail Store Abstractions
//!
//! The operations the syncback core invokes against a mail provider. The
//! protocol layer (IMAP session handling, command encoding, connection
//! pooling) lives outside the core and implements [`RemoteProtocolClient`].
//!
//! All folder names crossing this boundary are provider-native: they already
//! carry the account's separator and prefix.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{RemoteError, RemoteResult};

/// Capability advertised by servers implementing RFC 2342 namespaces.
pub const CAPABILITY_NAMESPACE: &str = "NAMESPACE";

/// Identifier of a mail account known to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountId(String);

impl AccountId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AccountId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for AccountId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Mail provider family behind an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MailProvider {
    /// Any standards-compliant IMAP server
    #[default]
    Generic,
    Gmail,
    Outlook,
    Yahoo,
    Icloud,
    Fastmail,
}

impl MailProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            MailProvider::Generic => "generic",
            MailProvider::Gmail => "gmail",
            MailProvider::Outlook => "outlook",
            MailProvider::Yahoo => "yahoo",
            MailProvider::Icloud => "icloud",
            MailProvider::Fastmail => "fastmail",
        }
    }
}

impl FromStr for MailProvider {
    type Err = RemoteError;

    fn from_str(s: &str) -> RemoteResult<Self> {
        match s.to_lowercase().as_str() {
            "generic" => Ok(MailProvider::Generic),
            "gmail" => Ok(MailProvider::Gmail),
            "outlook" => Ok(MailProvider::Outlook),
            "yahoo" => Ok(MailProvider::Yahoo),
            "icloud" => Ok(MailProvider::Icloud),
            "fastmail" => Ok(MailProvider::Fastmail),
            other => Err(RemoteError::Unsupported(format!("mail provider {other}"))),
        }
    }
}

impl fmt::Display for MailProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Personal namespace reported by the server.
///
/// `separator` is empty when the server reports no hierarchy delimiter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceInfo {
    pub prefix: String,
    pub separator: String,
}

impl NamespaceInfo {
    pub fn new(prefix: impl Into<String>, separator: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            separator: separator.into(),
        }
    }
}

/// One entry of a folder listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFolder {
    /// Name attributes such as `\HasChildren` or `\Noselect`
    pub attributes: Vec<String>,
    /// Hierarchy delimiter for this folder, `None` for a flat namespace
    pub separator: Option<String>,
    /// Provider-native folder name
    pub name: String,
}

impl RemoteFolder {
    pub fn new(
        attributes: Vec<String>,
        separator: Option<impl Into<String>>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            attributes,
            separator: separator.map(Into::into),
            name: name.into(),
        }
    }
}

/// Remote mail store operations.
///
/// Implementations own connection handling for each account. Mutating calls
/// must classify failures as [`RemoteError::Transient`] or
/// [`RemoteError::Permanent`]; the core retries only the former.
///
/// # Example
///
/// ```ignore
/// use bridge_traits::mail::{AccountId, RemoteProtocolClient};
///
/// async fn make_folder(client: &dyn RemoteProtocolClient) {
///     let account = AccountId::new("alice@example.com");
///     client.create_folder(&account, "INBOX.Taxes.Accounting").await?;
/// }
/// ```
#[async_trait]
pub trait RemoteProtocolClient: Send + Sync {
    /// Query the personal namespace.
    ///
    /// Fails with [`RemoteError::Unsupported`] when the provider has no
    /// namespace concept; callers then fall back to defaults.
    async fn discover_namespace(&self, account: &AccountId) -> RemoteResult<NamespaceInfo>;

    /// List every folder visible to the account.
    async fn list_folders(&self, account: &AccountId) -> RemoteResult<Vec<RemoteFolder>>;

    async fn create_folder(&self, account: &AccountId, remote_name: &str) -> RemoteResult<()>;

    async fn rename_folder(
        &self,
        account: &AccountId,
        old_remote_name: &str,
        new_remote_name: &str,
    ) -> RemoteResult<()>;

    async fn delete_folder(&self, account: &AccountId, remote_name: &str) -> RemoteResult<()>;

    /// Move one message, identified by UID, between two folders.
    async fn move_message(
        &self,
        account: &AccountId,
        uid: u32,
        source_remote_name: &str,
        destination_remote_name: &str,
    ) -> RemoteResult<()>;

    /// Add and remove flags on one message.
    async fn update_flags(
        &self,
        account: &AccountId,
        remote_folder: &str,
        uid: u32,
        add: &[String],
        remove: &[String],
    ) -> RemoteResult<()>;

    async fn has_capability(&self, account: &AccountId, capability: &str) -> RemoteResult<bool>;

    /// Provider family behind the account.
    async fn provider(&self, _account: &AccountId) -> MailProvider {
        MailProvider::Generic
    }
}
