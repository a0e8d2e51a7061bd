//! In-process broker backed by `tokio::sync::broadcast` channels.

use super::{Broker, Subscription};
use crate::error::{BrokerError, BrokerResult};
use async_trait::async_trait;
use collab_types::{Envelope, SessionId};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;

type Topics = DashMap<SessionId, broadcast::Sender<Arc<Vec<u8>>>>;

/// Single-process broker.
///
/// Envelopes travel as MessagePack bytes, exactly as they would through an
/// external broker, so codec problems surface here too. A topic's channel
/// exists only while it has subscribers.
#[derive(Debug)]
pub struct MemoryBroker {
    topics: Arc<Topics>,
    capacity: usize,
    shutdown: watch::Sender<bool>,
}

impl MemoryBroker {
    /// Create a broker whose topics buffer up to `capacity` messages per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            topics: Arc::new(DashMap::new()),
            capacity: capacity.max(1),
            shutdown,
        }
    }

    /// Simulate losing the broker transport.
    ///
    /// Every open subscription yields `BrokerError::Unavailable`, and every
    /// later publish or subscribe fails the same way.
    pub fn shut_down(&self) {
        self.shutdown.send_replace(true);
        self.topics.clear();
        tracing::warn!("Memory broker shut down");
    }

    /// Number of topics with at least one subscriber.
    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    /// Number of subscribers on `topic`.
    pub fn subscriber_count(&self, topic: &SessionId) -> usize {
        self.topics
            .get(topic)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    fn check_available(&self) -> BrokerResult<()> {
        if *self.shutdown.borrow() {
            Err(BrokerError::Unavailable("broker has shut down".into()))
        } else {
            Ok(())
        }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, topic: &SessionId, envelope: Envelope) -> BrokerResult<()> {
        self.check_available()?;
        let bytes = Arc::new(envelope.to_bytes()?);

        if let Some(tx) = self.topics.get(topic) {
            // Err only means nobody is listening; there is no backlog to keep.
            let _ = tx.send(bytes);
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &SessionId) -> BrokerResult<Box<dyn Subscription>> {
        self.check_available()?;
        let rx = self
            .topics
            .entry(topic.clone())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();

        tracing::debug!("Subscribed to topic {}", topic);

        Ok(Box::new(MemorySubscription {
            topic: topic.clone(),
            rx,
            shutdown: self.shutdown.subscribe(),
            topics: Arc::clone(&self.topics),
        }))
    }
}

struct MemorySubscription {
    topic: SessionId,
    rx: broadcast::Receiver<Arc<Vec<u8>>>,
    shutdown: watch::Receiver<bool>,
    topics: Arc<Topics>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn recv(&mut self) -> Option<BrokerResult<Envelope>> {
        loop {
            if *self.shutdown.borrow_and_update() {
                return Some(Err(BrokerError::Unavailable("broker has shut down".into())));
            }

            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        // Broker dropped without an explicit shutdown.
                        return None;
                    }
                }
                message = self.rx.recv() => match message {
                    Ok(bytes) => {
                        return Some(Envelope::from_bytes(&bytes).map_err(BrokerError::from));
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!("Subscriber on {} lagged, skipped {} messages", self.topic, skipped);
                    }
                    Err(RecvError::Closed) => return None,
                },
            }
        }
    }
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        // Our own receiver is still alive here, hence `<= 1`.
        self.topics
            .remove_if(&self.topic, |_, tx| tx.receiver_count() <= 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use collab_types::UserId;
    use std::time::Duration;

    fn topic(name: &str) -> SessionId {
        SessionId::parse(name).unwrap()
    }

    fn envelope(session: &SessionId, payload: &str) -> Envelope {
        Envelope::new(session.clone(), UserId::new("alice"), payload.into())
    }

    #[tokio::test]
    async fn subscriber_receives_published_message() {
        let broker = MemoryBroker::default();
        let room = topic("room1");
        let mut sub = broker.subscribe(&room).await.unwrap();

        broker.publish(&room, envelope(&room, "x")).await.unwrap();

        let received = sub.recv().await.unwrap().unwrap();
        assert_eq!(received.payload, "x");
        assert_eq!(received.author, UserId::new("alice"));
    }

    #[tokio::test]
    async fn topics_are_isolated() {
        let broker = MemoryBroker::default();
        let a = topic("A");
        let b = topic("B");
        let mut sub_b = broker.subscribe(&b).await.unwrap();

        broker.publish(&a, envelope(&a, "for a")).await.unwrap();

        let nothing = tokio::time::timeout(Duration::from_millis(50), sub_b.recv()).await;
        assert!(nothing.is_err(), "B must not see messages published to A");
    }

    #[tokio::test]
    async fn no_backlog_replay() {
        let broker = MemoryBroker::default();
        let room = topic("room1");
        broker.publish(&room, envelope(&room, "early")).await.unwrap();

        let mut sub = broker.subscribe(&room).await.unwrap();
        broker.publish(&room, envelope(&room, "late")).await.unwrap();

        assert_eq!(sub.recv().await.unwrap().unwrap().payload, "late");
    }

    #[tokio::test]
    async fn same_publisher_order_is_preserved() {
        let broker = MemoryBroker::default();
        let room = topic("room1");
        let mut sub = broker.subscribe(&room).await.unwrap();

        for i in 0..20 {
            broker.publish(&room, envelope(&room, &i.to_string())).await.unwrap();
        }
        for i in 0..20 {
            assert_eq!(sub.recv().await.unwrap().unwrap().payload, i.to_string());
        }
    }

    #[tokio::test]
    async fn dropping_last_subscription_prunes_topic() {
        let broker = MemoryBroker::default();
        let room = topic("room1");
        let first = broker.subscribe(&room).await.unwrap();
        let second = broker.subscribe(&room).await.unwrap();
        assert_eq!(broker.subscriber_count(&room), 2);

        drop(first);
        assert_eq!(broker.topic_count(), 1);

        drop(second);
        assert_eq!(broker.topic_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_fails_open_subscriptions_and_new_calls() {
        let broker = MemoryBroker::default();
        let room = topic("room1");
        let mut sub = broker.subscribe(&room).await.unwrap();

        broker.shut_down();

        assert!(matches!(
            sub.recv().await,
            Some(Err(BrokerError::Unavailable(_)))
        ));
        assert!(matches!(
            broker.publish(&room, envelope(&room, "x")).await,
            Err(BrokerError::Unavailable(_))
        ));
        assert!(matches!(
            broker.subscribe(&room).await,
            Err(BrokerError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn lagging_subscriber_skips_and_continues() {
        let broker = MemoryBroker::new(2);
        let room = topic("room1");
        let mut sub = broker.subscribe(&room).await.unwrap();

        for i in 0..5 {
            broker.publish(&room, envelope(&room, &i.to_string())).await.unwrap();
        }

        // Oldest messages were overwritten; the newest two remain.
        assert_eq!(sub.recv().await.unwrap().unwrap().payload, "3");
        assert_eq!(sub.recv().await.unwrap().unwrap().payload, "4");
    }
}
