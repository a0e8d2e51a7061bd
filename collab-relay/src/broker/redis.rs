//! Redis pub/sub broker.
//!
//! Lets several relay processes serve the same session: each publishes edits
//! to the session's channel and runs its own subscription per locally active
//! session. Envelopes travel as MessagePack bytes.

use super::{Broker, Subscription};
use crate::error::{BrokerError, BrokerResult};
use async_trait::async_trait;
use collab_types::{Envelope, SessionId};
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisError};

/// Prefix for every session channel.
pub const CHANNEL_PREFIX: &str = "collab:";

fn channel(topic: &SessionId) -> String {
    format!("{CHANNEL_PREFIX}{topic}")
}

fn unavailable(e: RedisError) -> BrokerError {
    BrokerError::Unavailable(e.to_string())
}

/// Broker backed by a Redis server.
///
/// Publishing goes through one shared connection that reconnects on its own.
/// Each subscription holds a dedicated pub/sub connection; losing it ends the
/// subscription with [`BrokerError::Unavailable`].
#[derive(Clone)]
pub struct RedisBroker {
    client: redis::Client,
    publisher: ConnectionManager,
}

impl std::fmt::Debug for RedisBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBroker")
            .field("server", &self.client.get_connection_info().addr)
            .finish_non_exhaustive()
    }
}

impl RedisBroker {
    /// Connect to the Redis server at `url` (e.g. `redis://127.0.0.1:6379`).
    pub async fn connect(url: &str) -> BrokerResult<Self> {
        let client = redis::Client::open(url).map_err(unavailable)?;
        let publisher = ConnectionManager::new(client.clone())
            .await
            .map_err(unavailable)?;
        tracing::info!("Connected to Redis broker at {}", client.get_connection_info().addr);
        Ok(Self { client, publisher })
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn publish(&self, topic: &SessionId, envelope: Envelope) -> BrokerResult<()> {
        let bytes = envelope.to_bytes()?;
        let mut conn = self.publisher.clone();
        let receivers: i64 = conn
            .publish(channel(topic), bytes)
            .await
            .map_err(unavailable)?;
        tracing::trace!("Published to {} ({} receivers)", topic, receivers);
        Ok(())
    }

    async fn subscribe(&self, topic: &SessionId) -> BrokerResult<Box<dyn Subscription>> {
        let mut pubsub = self.client.get_async_pubsub().await.map_err(unavailable)?;
        pubsub.subscribe(channel(topic)).await.map_err(unavailable)?;
        tracing::debug!("Subscribed to Redis channel {}", channel(topic));

        Ok(Box::new(RedisSubscription {
            topic: topic.clone(),
            messages: Some(pubsub.into_on_message().boxed()),
        }))
    }
}

struct RedisSubscription {
    topic: SessionId,
    // None once the connection has been reported lost.
    messages: Option<BoxStream<'static, redis::Msg>>,
}

#[async_trait]
impl Subscription for RedisSubscription {
    async fn recv(&mut self) -> Option<BrokerResult<Envelope>> {
        let messages = self.messages.as_mut()?;
        match messages.next().await {
            Some(msg) => Some(Envelope::from_bytes(msg.get_payload_bytes()).map_err(BrokerError::from)),
            None => {
                self.messages = None;
                Some(Err(BrokerError::Unavailable(format!(
                    "Redis connection for {} was lost",
                    self.topic
                ))))
            }
        }
    }
}
