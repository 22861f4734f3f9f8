//! Redis keyspace-notification source.

use futures::StreamExt;
use redis::Msg;
use redis::aio::PubSub;
use tracing::{debug, info};

use super::{ExpirySource, KeyEvent, LeaseFuture, MonitorError, expiry_channel_pattern};

impl From<redis::RedisError> for MonitorError {
    fn from(value: redis::RedisError) -> Self {
        Self::Connectivity(value.to_string())
    }
}

/// Pattern subscription to the keyevent channels of one database.
pub struct RedisExpirySource {
    pubsub: Option<PubSub>,
    pattern: String,
}

impl std::fmt::Debug for RedisExpirySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisExpirySource")
            .field("pattern", &self.pattern)
            .field("open", &self.pubsub.is_some())
            .finish()
    }
}

impl RedisExpirySource {
    /// Connects to `url` and subscribes to expiry notifications of `db`.
    /// With `configure` set, the server is first told to publish expired-key
    /// events (`notify-keyspace-events Ex`).
    ///
    /// # Errors
    ///
    /// Returns [`MonitorError::Connectivity`] when the server is unreachable
    /// or refuses a command.
    pub async fn connect(url: &str, db: u32, configure: bool) -> Result<Self, MonitorError> {
        let client = redis::Client::open(url)?;

        if configure {
            let mut conn = client.get_multiplexed_async_connection().await?;
            let _: () = redis::cmd("CONFIG")
                .arg("SET")
                .arg("notify-keyspace-events")
                .arg("Ex")
                .query_async(&mut conn)
                .await?;
            debug!("enabled expired-key notifications");
        }

        let pattern = expiry_channel_pattern(db);
        let mut pubsub = client.get_async_pubsub().await?;
        pubsub.psubscribe(&pattern).await?;
        info!(%pattern, "subscribed to lease expiries");

        Ok(Self {
            pubsub: Some(pubsub),
            pattern,
        })
    }
}

/// Reads a keyevent notification. Keys that are not UTF-8 cannot be leases
/// and are dropped.
fn key_event_from_message(message: &Msg) -> Option<KeyEvent> {
    let channel = message.get_channel_name();
    let Ok(key) = std::str::from_utf8(message.get_payload_bytes()) else {
        debug!(%channel, "ignoring key event with a non UTF-8 key");
        return None;
    };
    KeyEvent::from_channel(channel, key)
}

impl ExpirySource for RedisExpirySource {
    fn next_event(&mut self) -> LeaseFuture<'_, Option<KeyEvent>> {
        Box::pin(async move {
            let Some(pubsub) = self.pubsub.as_mut() else {
                return Ok(None);
            };
            loop {
                let Some(message) = pubsub.on_message().next().await else {
                    return Ok(None);
                };
                if let Some(event) = key_event_from_message(&message) {
                    return Ok(Some(event));
                }
            }
        })
    }

    fn close(&mut self) -> LeaseFuture<'_, ()> {
        Box::pin(async move {
            // Dropping the pubsub releases the connection even if this fails.
            if let Some(mut pubsub) = self.pubsub.take() {
                pubsub.punsubscribe(&self.pattern).await?;
                debug!(pattern = %self.pattern, "unsubscribed from lease expiries");
            }
            Ok(())
        })
    }
}
