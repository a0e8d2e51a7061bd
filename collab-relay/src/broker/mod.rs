//! Publish/subscribe broker keyed by session id.
//!
//! The broker decouples relay instances from each other: every relay process
//! publishes edits to the session's topic and runs one subscription per
//! locally active session.
//!
//! Delivery is at-most-once per subscriber. Messages from one publisher to
//! one topic keep their order; order across publishers is unspecified.
//! Subscriptions see only messages published after they were created.

mod memory;
mod redis;

pub use self::redis::RedisBroker;
pub use memory::MemoryBroker;

use crate::error::BrokerResult;
use async_trait::async_trait;
use collab_types::{Envelope, SessionId};

/// Topic-based publish/subscribe transport.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Enqueue `envelope` for every current subscriber of `topic`.
    ///
    /// Publishing to a topic with no subscribers succeeds and drops the message.
    async fn publish(&self, topic: &SessionId, envelope: Envelope) -> BrokerResult<()>;

    /// Subscribe to messages published to `topic` from now on.
    async fn subscribe(&self, topic: &SessionId) -> BrokerResult<Box<dyn Subscription>>;
}

/// A live subscription to one topic. Dropping it releases the subscription.
#[async_trait]
pub trait Subscription: Send {
    /// Wait for the next message.
    ///
    /// Returns `None` once the subscription has ended for good, and
    /// `Some(Err(BrokerError::Unavailable))` if the broker connection dropped.
    async fn recv(&mut self) -> Option<BrokerResult<Envelope>>;
}
