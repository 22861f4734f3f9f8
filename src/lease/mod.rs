//! Lease-expiry monitor.
//!
//! Each instance agent keeps a key `shadow:<instance_id>` alive in the lease
//! store. When the key expires the agent is presumed lost and the monitor
//! emits one `instance_terminated` event with `["agent-lost", instance_id]`.
//! The monitor runs until cancelled or until the subscription breaks; it never
//! reconnects.

mod store;

use std::future::Future;
use std::pin::Pin;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::{Event, EventBus};

pub use store::RedisExpirySource;

/// Prefix of every lease key.
pub const LEASE_KEY_PREFIX: &str = "shadow:";

/// Event kind carried by expiry notifications.
pub const EXPIRED: &str = "expired";

/// Returns the lease key for `instance_id`.
#[must_use]
pub fn lease_key(instance_id: &str) -> String {
    format!("{LEASE_KEY_PREFIX}{instance_id}")
}

/// Extracts the instance id from a lease key. Keys without the prefix, or
/// with nothing after it, are not leases.
#[must_use]
pub fn instance_from_lease_key(key: &str) -> Option<&str> {
    key.strip_prefix(LEASE_KEY_PREFIX)
        .filter(|instance_id| !instance_id.is_empty())
}

/// Returns the keyevent channel pattern for logical database `db`.
#[must_use]
pub fn expiry_channel_pattern(db: u32) -> String {
    format!("__keyevent@{db}__:*")
}

/// A keyspace notification: the event kind and the key it concerns.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct KeyEvent {
    /// Suffix of the notification channel, such as `expired` or `del`.
    pub kind: String,
    /// Key named in the payload.
    pub key: String,
}

impl KeyEvent {
    /// Creates an event of `kind` for `key`.
    #[must_use]
    pub fn new(kind: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            key: key.into(),
        }
    }

    /// Creates an expiry event for `key`.
    #[must_use]
    pub fn expired(key: impl Into<String>) -> Self {
        Self::new(EXPIRED, key)
    }

    /// Parses a notification received on `channel`. The kind is whatever
    /// follows the last `:` of the channel name.
    #[must_use]
    pub fn from_channel(channel: &str, payload: impl Into<String>) -> Option<Self> {
        let (_, kind) = channel.rsplit_once(':')?;
        (!kind.is_empty()).then(|| Self::new(kind, payload))
    }

    /// Returns the instance whose lease expired, if this is such an event.
    #[must_use]
    pub fn expired_instance(&self) -> Option<&str> {
        if self.kind != EXPIRED {
            return None;
        }
        instance_from_lease_key(&self.key)
    }
}

/// Errors that end the monitor loop.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum MonitorError {
    /// Raised when the lease store cannot be reached or fails mid-stream.
    #[error("lease store connectivity lost: {0}")]
    Connectivity(String),
    /// Raised when the store closes the subscription.
    #[error("lease store closed the subscription")]
    SubscriptionClosed,
}

/// Future returned by [`ExpirySource`] operations.
pub type LeaseFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, MonitorError>> + Send + 'a>>;

/// A stream of keyspace notifications.
pub trait ExpirySource: Send {
    /// Waits for the next notification. `None` means the subscription ended.
    fn next_event(&mut self) -> LeaseFuture<'_, Option<KeyEvent>>;

    /// Unsubscribes and releases the connection.
    fn close(&mut self) -> LeaseFuture<'_, ()>;
}

/// How a monitor run ended without error.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MonitorExit {
    /// The cancellation token fired.
    Cancelled,
}

/// Watches lease expiries and turns them into bus events.
#[derive(Debug)]
pub struct LeaseMonitor<S> {
    source: S,
    bus: EventBus,
}

impl<S: ExpirySource> LeaseMonitor<S> {
    /// Creates a monitor that reads `source` and dispatches on `bus`.
    #[must_use]
    pub const fn new(source: S, bus: EventBus) -> Self {
        Self { source, bus }
    }

    /// Runs until `cancel` fires or the subscription fails. The source is
    /// closed on every exit path.
    ///
    /// # Errors
    ///
    /// Returns [`MonitorError`] when the subscription breaks.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<MonitorExit, MonitorError> {
        let outcome = self.pump(&cancel).await;
        if let Err(err) = self.source.close().await {
            warn!(error = %err, "failed to close lease subscription cleanly");
        }
        match &outcome {
            Ok(MonitorExit::Cancelled) => info!("lease monitor stopped"),
            Err(err) => warn!(error = %err, "lease monitor ended"),
        }
        outcome
    }

    async fn pump(&mut self, cancel: &CancellationToken) -> Result<MonitorExit, MonitorError> {
        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok(MonitorExit::Cancelled),
                next = self.source.next_event() => next?,
            };
            let Some(notification) = next else {
                return Err(MonitorError::SubscriptionClosed);
            };
            self.handle(&notification);
        }
    }

    fn handle(&self, notification: &KeyEvent) {
        let Some(instance_id) = notification.expired_instance() else {
            debug!(kind = %notification.kind, key = %notification.key, "ignoring key event");
            return;
        };
        info!(instance_id, "instance lease expired");
        self.bus.dispatch(Event::agent_lost(instance_id));
    }
}

impl<S: ExpirySource + 'static> LeaseMonitor<S> {
    /// Runs the monitor on its own task.
    #[must_use]
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<Result<MonitorExit, MonitorError>> {
        tokio::spawn(self.run(cancel))
    }
}
