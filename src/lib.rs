//! Workspace facade crate.
//!
//! Host applications can depend on `syncback-workspace` alone and reach the
//! service, its configuration and the collaborator traits it consumes
//! without wiring each crate individually.

pub use bridge_traits as bridge;
pub use core_runtime as runtime;
pub use core_syncback as syncback;

pub use bridge_traits::mail::{AccountId, RemoteProtocolClient};
pub use core_runtime::config::{RetryPolicy, SyncbackConfig};
pub use core_runtime::events::EventBus;
pub use core_syncback::{ActionPayload, SyncbackService};
