//! Synchronization primitives.
//!
//! All primitives are async-aware and `Send + Sync`:
//!
//! - `Mutex` / `RwLock` guard the service's active-worker map and the
//!   namespace cache
//! - `Semaphore` bounds the worker pool
//! - `Notify` wakes the dispatcher when an action is enqueued
//! - `CancellationToken` carries graceful shutdown to every worker
//!
//! # Examples
//!
//! ```rust
//! use core_async::sync::{CancellationToken, Mutex};
//!
//! async fn example() {
//!     let mutex = Mutex::new(0);
//!     *mutex.lock().await += 1;
//!
//!     let token = CancellationToken::new();
//!     let child = token.child_token();
//!     token.cancel();
//!     assert!(child.is_cancelled());
//! }
//! ```

pub use tokio::sync::{
    broadcast, mpsc, oneshot, watch, AcquireError, Barrier, Mutex, MutexGuard, Notify,
    OwnedSemaphorePermit, RwLock, RwLockReadGuard, RwLockWriteGuard, Semaphore, SemaphorePermit,
    TryAcquireError,
};

pub use tokio_util::sync::{CancellationToken, DropGuard, WaitForCancellationFuture};
