//! Time-related abstractions.
//!
//! `sleep` and `timeout` are the suspension points used for retry backoff and
//! for bounding remote calls; `interval` drives the dispatcher's poll loop.
//!
//! # Examples
//!
//! ```rust
//! use core_async::time::{sleep, timeout, Duration};
//!
//! async fn example() {
//!     let slow = sleep(Duration::from_millis(100));
//!     assert!(timeout(Duration::from_millis(10), slow).await.is_err());
//! }
//! ```

pub use tokio::time::error::Elapsed;
pub use tokio::time::{
    interval, sleep, sleep_until, timeout, Interval, MissedTickBehavior, Sleep, Timeout,
};

pub use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
