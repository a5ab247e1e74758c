//! Runtime utilities.
//!
//! Hosts that are not already inside a runtime (CLI entry points, the
//! `#[core_async::test]` expansion) use [`block_on`] to drive a future.

pub use tokio::runtime::{Builder, Handle, Runtime};

/// Runs the provided future to completion on a fresh current-thread runtime.
///
/// # Panics
///
/// Panics if the runtime cannot be built (for example when the process is
/// out of file descriptors).
pub fn block_on<F>(future: F) -> F::Output
where
    F: std::future::Future,
{
    Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("core_async::runtime::block_on: failed to build Tokio runtime")
        .block_on(future)
}
