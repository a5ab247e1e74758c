//! Async runtime facade for the syncback engine.
//!
//! Every `core-*` crate goes through this crate instead of naming Tokio
//! directly, so the executor can be swapped in one place.
//!
//! # Modules
//!
//! - `task`: task spawning and join handles
//! - `time`: sleep, timeout, interval, instants
//! - `sync`: async locks, semaphores, notification and cancellation
//! - `runtime`: building and blocking on a runtime
//!
//! # Examples
//!
//! ```rust
//! use core_async::task;
//! use core_async::time::{sleep, Duration};
//!
//! async fn example() {
//!     let handle = task::spawn(async {
//!         sleep(Duration::from_millis(10)).await;
//!         42
//!     });
//!     assert_eq!(handle.await.unwrap(), 42);
//! }
//! ```

// Re-export the async entry-point/test macros so downstream crates never need
// direct Tokio dependencies.
pub use core_async_macros::{main, test};

pub mod runtime;
pub mod sync;
pub mod task;
pub mod time;

pub use futures::future::{join_all, BoxFuture, FutureExt};
pub use task::spawn;
pub use time::{sleep, Duration, Instant};

/// Waits on several branches, resolving with the first to complete.
pub use tokio::select;
