//! # Event Bus System
//!
//! Provides an event-driven architecture for the syncback core using a
//! broadcast channel. Hosts subscribe to observe action delivery without
//! polling the action log.
//!
//! ## Overview
//!
//! The event bus system consists of:
//! - **Event Types**: Strongly-typed enum hierarchies per domain
//! - **EventBus**: Central broadcast channel for publishing events
//! - **EventStream**: Wrapper for consuming events with filtering
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────┐   emit    ┌───────────┐   subscribe   ┌────────────┐
//! │ SyncbackService├──────────>│           ├──────────────>│ Subscriber │
//! └────────────────┘           │ EventBus  │               └────────────┘
//!                              │ (broadcast│
//! ┌────────────────┐   emit    │  channel) │   subscribe   ┌────────────┐
//! │ SyncbackWorker ├──────────>│           ├──────────────>│ Subscriber │
//! └────────────────┘           └───────────┘               └────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use core_runtime::events::{CoreEvent, EventBus, SyncbackEvent};
//!
//! let event_bus = EventBus::new(100);
//! let event = CoreEvent::Syncback(SyncbackEvent::ActionSucceeded {
//!     action_id: 7,
//!     account_id: "alice@example.com".to_string(),
//!     attempt: 1,
//! });
//!
//! // Emission fails only when nobody listens, which is not an error for the emitter
//! event_bus.emit(event).ok();
//! ```
//!
//! ## Error Handling
//!
//! - **`RecvError::Lagged(n)`**: Subscriber was too slow and missed `n` events.
//!   Non-fatal; the subscriber continues with newer events.
//! - **`RecvError::Closed`**: All senders have been dropped. Treat as shutdown.

use core_async::sync::broadcast;
use serde::{Deserialize, Serialize};
use std::fmt;

pub use core_async::sync::broadcast::error::{RecvError, SendError};
pub use core_async::sync::broadcast::Receiver;

/// Default buffer size for the event bus channel.
///
/// Subscribers that can't keep up will receive `RecvError::Lagged`.
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 256;

// ============================================================================
// Core Event Types
// ============================================================================

/// Top-level event enum encompassing all event categories.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    /// Action delivery events
    Syncback(SyncbackEvent),
}

impl CoreEvent {
    /// Returns a human-readable description of the event.
    pub fn description(&self) -> &str {
        match self {
            CoreEvent::Syncback(e) => e.description(),
        }
    }

    /// Returns the severity level of the event.
    pub fn severity(&self) -> EventSeverity {
        match self {
            CoreEvent::Syncback(SyncbackEvent::ActionDeadLettered { .. }) => EventSeverity::Error,
            CoreEvent::Syncback(SyncbackEvent::WorkerCrashed { .. }) => EventSeverity::Error,
            CoreEvent::Syncback(SyncbackEvent::ActionRetryScheduled { .. }) => {
                EventSeverity::Warning
            }
            CoreEvent::Syncback(SyncbackEvent::LeaseReclaimed { .. }) => EventSeverity::Warning,
            CoreEvent::Syncback(SyncbackEvent::ActionSucceeded { .. }) => EventSeverity::Info,
            _ => EventSeverity::Debug,
        }
    }

    /// Account the event concerns, if any.
    pub fn account_id(&self) -> Option<&str> {
        match self {
            CoreEvent::Syncback(e) => e.account_id(),
        }
    }
}

/// Event severity levels for filtering and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventSeverity {
    Debug,
    Info,
    Warning,
    Error,
}

// ============================================================================
// Syncback Events
// ============================================================================

/// Events emitted while delivering logged actions to the remote store.
///
/// Action ids are the action log's row ids; account ids are the opaque
/// account identifiers used by the host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum SyncbackEvent {
    /// A new action was written to the log.
    ActionEnqueued {
        action_id: i64,
        account_id: String,
        /// Action type as stored, e.g. `create_folder`
        action_type: String,
    },
    /// A worker leased an action and is about to dispatch it.
    ActionClaimed {
        action_id: i64,
        account_id: String,
        /// 1-based attempt number of this dispatch
        attempt: u32,
    },
    /// The remote store accepted the action.
    ActionSucceeded {
        action_id: i64,
        account_id: String,
        attempt: u32,
    },
    /// A transient failure; the action returns to pending after a delay.
    ActionRetryScheduled {
        action_id: i64,
        account_id: String,
        attempt: u32,
        /// Unix milliseconds when the action becomes eligible again
        next_attempt_at: i64,
        message: String,
    },
    /// The action will never be retried.
    ActionDeadLettered {
        action_id: i64,
        account_id: String,
        attempt: u32,
        /// Error kind as stored, e.g. `remote_permanent`
        error_kind: String,
        message: String,
    },
    /// An expired lease was released so another worker may pick the action up.
    LeaseReclaimed {
        action_id: i64,
        account_id: String,
        previous_owner: Option<String>,
    },
    WorkerStarted {
        account_id: String,
        worker_id: String,
    },
    WorkerStopped {
        account_id: String,
        worker_id: String,
        /// Number of actions dispatched during this run
        dispatched: u32,
        /// Why the worker returned, e.g. `idle` or `batch_limit`
        reason: String,
    },
    /// A worker panicked or failed; its account is retried on the next poll.
    WorkerCrashed {
        account_id: String,
        worker_id: String,
        message: String,
    },
}

impl SyncbackEvent {
    fn description(&self) -> &str {
        match self {
            SyncbackEvent::ActionEnqueued { .. } => "Action enqueued",
            SyncbackEvent::ActionClaimed { .. } => "Action claimed",
            SyncbackEvent::ActionSucceeded { .. } => "Action delivered",
            SyncbackEvent::ActionRetryScheduled { .. } => "Action retry scheduled",
            SyncbackEvent::ActionDeadLettered { .. } => "Action dead-lettered",
            SyncbackEvent::LeaseReclaimed { .. } => "Expired lease reclaimed",
            SyncbackEvent::WorkerStarted { .. } => "Worker started",
            SyncbackEvent::WorkerStopped { .. } => "Worker stopped",
            SyncbackEvent::WorkerCrashed { .. } => "Worker crashed",
        }
    }

    fn account_id(&self) -> Option<&str> {
        match self {
            SyncbackEvent::ActionEnqueued { account_id, .. }
            | SyncbackEvent::ActionClaimed { account_id, .. }
            | SyncbackEvent::ActionSucceeded { account_id, .. }
            | SyncbackEvent::ActionRetryScheduled { account_id, .. }
            | SyncbackEvent::ActionDeadLettered { account_id, .. }
            | SyncbackEvent::LeaseReclaimed { account_id, .. }
            | SyncbackEvent::WorkerStarted { account_id, .. }
            | SyncbackEvent::WorkerStopped { account_id, .. }
            | SyncbackEvent::WorkerCrashed { account_id, .. } => Some(account_id),
        }
    }
}

// ============================================================================
// Event Bus
// ============================================================================

/// Central event bus for publishing and subscribing to events.
///
/// Cloning the bus is cheap; all clones share the same channel.
///
/// # Example
///
/// ```rust
/// use core_runtime::events::EventBus;
///
/// let event_bus = EventBus::new(100);
/// let _subscriber = event_bus.subscribe();
/// assert_eq!(event_bus.subscriber_count(), 1);
/// ```
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    /// Creates a new event bus with the specified buffer size.
    ///
    /// When a subscriber falls behind by more than `capacity` events it
    /// receives `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Creates a new event bus with the default buffer size.
    #[allow(clippy::should_implement_trait)]
    pub fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_SIZE)
    }

    /// Publishes an event to all subscribers.
    ///
    /// Returns the number of subscribers that received the event, or an
    /// error if there are no active subscribers.
    pub fn emit(&self, event: CoreEvent) -> Result<usize, SendError<CoreEvent>> {
        self.sender.send(event)
    }

    /// Creates a new subscriber. Past events are not replayed.
    pub fn subscribe(&self) -> Receiver<CoreEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

// ============================================================================
// Event Stream Wrapper
// ============================================================================

type EventFilter = Box<dyn Fn(&CoreEvent) -> bool + Send + Sync>;

/// A wrapper around `broadcast::Receiver` with filtering.
///
/// # Example
///
/// ```rust
/// use core_runtime::events::{EventBus, EventSeverity, EventStream};
///
/// let event_bus = EventBus::new(100);
/// let failures = EventStream::new(event_bus.subscribe())
///     .filter(|event| event.severity() >= EventSeverity::Warning);
/// ```
pub struct EventStream {
    receiver: Receiver<CoreEvent>,
    filter: Option<EventFilter>,
}

impl EventStream {
    pub fn new(receiver: Receiver<CoreEvent>) -> Self {
        Self {
            receiver,
            filter: None,
        }
    }

    /// Only events matching `predicate` are returned by `recv()`.
    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&CoreEvent) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Box::new(predicate));
        self
    }

    /// Receives the next event that passes the filter.
    ///
    /// # Errors
    ///
    /// Returns `RecvError::Lagged(n)` if the subscriber fell behind by `n` events.
    /// Returns `RecvError::Closed` if all senders have been dropped.
    pub async fn recv(&mut self) -> Result<CoreEvent, RecvError> {
        loop {
            let event = self.receiver.recv().await?;

            let Some(filter) = &self.filter else {
                return Ok(event);
            };

            if filter(&event) {
                return Ok(event);
            }
        }
    }

    /// Attempts to receive an event without blocking.
    ///
    /// Returns `None` if no matching event is currently available.
    pub fn try_recv(&mut self) -> Option<Result<CoreEvent, RecvError>> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => {
                    let Some(filter) = &self.filter else {
                        return Some(Ok(event));
                    };

                    if filter(&event) {
                        return Some(Ok(event));
                    }
                }
                Err(broadcast::error::TryRecvError::Empty) => return None,
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    return Some(Err(RecvError::Lagged(n)))
                }
                Err(broadcast::error::TryRecvError::Closed) => return Some(Err(RecvError::Closed)),
            }
        }
    }
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("has_filter", &self.filter.is_some())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
