//! Per-connection session management.
//!
//! Each connection gets a Session that walks it through authentication,
//! initial sync, the steady-state pump, and teardown.

use crate::error::{AuthError, RelayError, TransportError};
use crate::registry::Departure;
use crate::server::CollabRelay;
use crate::transport::{CloseReason, ConnectionHandle, InboundFrames, Outbound};
use collab_types::{ClientEdit, ConnectionId, Envelope, ServerFrame, SessionId, UserId};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

/// Session state machine states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Transport is up, nothing checked yet.
    Connecting,
    /// Waiting on the identity provider.
    Authenticating,
    /// Registered and relaying edits.
    Active {
        /// The authenticated user.
        user: UserId,
    },
    /// Leaving the registry.
    Closing,
    /// Terminal. No further I/O.
    Closed,
}

enum PumpEvent {
    Frame(String),
    ReadFailed(TransportError),
    PeerClosed,
    TransportGone,
    Evicted,
}

/// A per-connection session.
pub struct Session<I> {
    link: Link,
    inbound: I,
    state: SessionState,
}

/// Everything about the connection except its read half.
struct Link {
    relay: Arc<CollabRelay>,
    session_id: SessionId,
    connection_id: ConnectionId,
    outbound: mpsc::Sender<Outbound>,
    evicted: Arc<Notify>,
}

impl<I: InboundFrames> Session<I> {
    /// Create a new session for a connection.
    pub fn new(
        relay: Arc<CollabRelay>,
        session_id: SessionId,
        inbound: I,
        outbound: mpsc::Sender<Outbound>,
    ) -> Self {
        Self {
            link: Link {
                relay,
                session_id,
                connection_id: ConnectionId::new(),
                outbound,
                evicted: Arc::new(Notify::new()),
            },
            inbound,
            state: SessionState::Connecting,
        }
    }

    /// Current state.
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Id this connection is registered under.
    pub fn connection_id(&self) -> ConnectionId {
        self.link.connection_id
    }

    /// Run the session until completion.
    ///
    /// Returns an error only for failures the connection was closed over
    /// (authentication, broker subscription). Peer disconnects and read
    /// errors end the session normally.
    pub async fn run(mut self, credential: Option<String>) -> Result<(), RelayError> {
        self.transition(SessionState::Authenticating);

        let user = match self.link.authenticate(credential.as_deref()).await {
            Ok(user) => user,
            Err(e) => {
                self.link
                    .relay
                    .metrics()
                    .auth_failures
                    .fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    "Authentication failed for session={}: {}",
                    self.link.session_id,
                    e
                );
                let _ = self.link.outbound.try_send(Outbound::Close(CloseReason::AuthFailed));
                self.transition(SessionState::Closed);
                return Err(e.into());
            }
        };

        self.transition(SessionState::Active { user: user.clone() });
        tracing::info!(
            "User {} joined session={} as {:?}",
            user,
            self.link.session_id,
            self.link.connection_id
        );

        let result = match self.link.attach().await {
            Ok(()) => {
                self.pump(&user).await;
                Ok(())
            }
            Err(RelayError::Transport(e)) => {
                tracing::debug!("Transport gone before sync: {}", e);
                Ok(())
            }
            Err(e) => Err(e),
        };

        self.transition(SessionState::Closing);
        self.link.detach().await;
        self.transition(SessionState::Closed);
        result
    }

    async fn pump(&mut self, user: &UserId) {
        let link = &self.link;
        loop {
            let event = tokio::select! {
                frame = self.inbound.next_frame() => match frame {
                    Some(Ok(text)) => PumpEvent::Frame(text),
                    Some(Err(e)) => PumpEvent::ReadFailed(e),
                    None => PumpEvent::PeerClosed,
                },
                _ = link.outbound.closed() => PumpEvent::TransportGone,
                _ = link.evicted.notified() => PumpEvent::Evicted,
            };

            match event {
                PumpEvent::Frame(text) => link.publish(user, &text).await,
                PumpEvent::ReadFailed(e) => {
                    tracing::debug!("Read failed on {:?}: {}", link.connection_id, e);
                    return;
                }
                PumpEvent::PeerClosed => {
                    tracing::debug!("Peer closed {:?}", link.connection_id);
                    return;
                }
                PumpEvent::TransportGone => {
                    tracing::debug!("Transport writer for {:?} stopped", link.connection_id);
                    return;
                }
                PumpEvent::Evicted => {
                    tracing::debug!("{:?} was evicted from session={}", link.connection_id, link.session_id);
                    return;
                }
            }
        }
    }

    fn transition(&mut self, next: SessionState) {
        tracing::debug!("{:?}: {:?} -> {:?}", self.link.connection_id, self.state, next);
        self.state = next;
    }
}

impl Link {
    async fn authenticate(&self, credential: Option<&str>) -> Result<UserId, AuthError> {
        let credential = credential
            .filter(|c| !c.trim().is_empty())
            .ok_or(AuthError::Malformed)?;

        let timeout_secs = self.relay.config().limits.auth_timeout_secs;
        tokio::time::timeout(
            Duration::from_secs(timeout_secs),
            self.relay.identity().resolve(credential),
        )
        .await
        .map_err(|_| AuthError::Unavailable(format!("no answer within {}s", timeout_secs)))?
    }

    /// Send the snapshot, then register and make sure the session is fanned out.
    ///
    /// The snapshot is queued before registration so no broadcast can
    /// overtake it on this connection's queue.
    async fn attach(&self) -> Result<(), RelayError> {
        let content = match self.relay.store().load(&self.session_id).await {
            Ok(content) => content,
            Err(e) => {
                tracing::warn!(
                    "Store load failed for session={}, starting empty: {}",
                    self.session_id,
                    e
                );
                String::new()
            }
        };

        // The queue is empty, so only a vanished writer can refuse this.
        self.outbound
            .try_send(Outbound::Frame(ServerFrame::Snapshot(content)))
            .map_err(|_| TransportError::Closed)?;

        let handle = ConnectionHandle::new(
            self.connection_id,
            self.outbound.clone(),
            self.evicted.clone(),
        );
        self.relay.registry().register(&self.session_id, handle);

        self.relay.fanout().ensure_running(&self.session_id).await?;
        Ok(())
    }

    async fn publish(&self, user: &UserId, text: &str) {
        let edit = ClientEdit::from_inbound(text, user);
        let envelope = Envelope::new(self.session_id.clone(), user.clone(), edit.content);
        let metrics = self.relay.metrics();

        match self.relay.broker().publish(&self.session_id, envelope).await {
            Ok(()) => {
                metrics.messages_published.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                metrics.publish_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Publish failed in session={}: {}", self.session_id, e);
                let _ = self.outbound.try_send(Outbound::Frame(ServerFrame::Warning {
                    message: format!("edit not delivered: {}", e),
                }));
            }
        }
    }

    async fn detach(&self) {
        let departure = self
            .relay
            .registry()
            .unregister(&self.session_id, self.connection_id);
        if departure == Departure::LastMember {
            self.relay.fanout().release(&self.session_id).await;
        }

        let _ = self.outbound.try_send(Outbound::Close(CloseReason::Normal));
        tracing::info!("Connection {:?} left session={}", self.connection_id, self.session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, MemoryBroker, Subscription};
    use crate::config::Config;
    use crate::error::{BrokerError, BrokerResult, StoreError};
    use crate::identity::{IdentityProvider, StaticIdentityProvider};
    use crate::storage::{MemorySessionStore, SessionStore};
    use crate::transport::LocalClient;
    use async_trait::async_trait;

    fn id(name: &str) -> SessionId {
        SessionId::parse(name).unwrap()
    }

    fn relay_with(
        config: Config,
        identity: Arc<dyn IdentityProvider>,
        store: Arc<dyn SessionStore>,
        broker: Arc<dyn Broker>,
    ) -> Arc<CollabRelay> {
        Arc::new(CollabRelay::new(config, identity, store, broker))
    }

    fn identity() -> Arc<dyn IdentityProvider> {
        Arc::new(StaticIdentityProvider::default().with_token("t-alice", "alice"))
    }

    fn session(
        relay: &Arc<CollabRelay>,
        room: &SessionId,
    ) -> (LocalClient, Session<mpsc::UnboundedReceiver<Result<String, TransportError>>>) {
        let (client, server) = LocalClient::pair(relay.config().limits.outbound_queue);
        let session = Session::new(relay.clone(), room.clone(), server.inbound, server.outbound);
        (client, session)
    }

    async fn recv(client: &mut LocalClient) -> Outbound {
        tokio::time::timeout(Duration::from_secs(2), client.recv())
            .await
            .expect("timed out")
            .expect("relay gone")
    }

    struct SlowIdentity;

    #[async_trait]
    impl IdentityProvider for SlowIdentity {
        async fn resolve(&self, _: &str) -> Result<UserId, AuthError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(UserId::new("late"))
        }
    }

    struct BrokenStore;

    #[async_trait]
    impl SessionStore for BrokenStore {
        async fn load(&self, _: &SessionId) -> Result<String, StoreError> {
            Err(StoreError::Unavailable("db down".into()))
        }

        async fn save(&self, _: &SessionId, _: &str) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("db down".into()))
        }
    }

    /// Subscribes normally but refuses every publish.
    #[derive(Default)]
    struct PublishRefusingBroker {
        inner: MemoryBroker,
    }

    #[async_trait]
    impl Broker for PublishRefusingBroker {
        async fn publish(&self, _: &SessionId, _: Envelope) -> BrokerResult<()> {
            Err(BrokerError::Unavailable("publish refused".into()))
        }

        async fn subscribe(&self, topic: &SessionId) -> BrokerResult<Box<dyn Subscription>> {
            self.inner.subscribe(topic).await
        }
    }

    #[test]
    fn new_session_starts_connecting() {
        let relay = relay_with(
            Config::default(),
            identity(),
            Arc::new(MemorySessionStore::new()),
            Arc::new(MemoryBroker::default()),
        );
        let (_client, session) = session(&relay, &id("room1"));
        assert_eq!(session.state(), &SessionState::Connecting);
    }

    #[tokio::test]
    async fn invalid_credential_closes_with_auth_failure_and_never_registers() {
        let relay = relay_with(
            Config::default(),
            identity(),
            Arc::new(MemorySessionStore::new()),
            Arc::new(MemoryBroker::default()),
        );
        let room = id("room1");
        let (mut client, session) = session(&relay, &room);

        let result = session.run(Some("t-mallory".into())).await;

        assert!(matches!(result, Err(RelayError::Auth(AuthError::Invalid { .. }))));
        assert_eq!(recv(&mut client).await, Outbound::Close(CloseReason::AuthFailed));
        assert_eq!(relay.registry().member_count(&room), 0);
        assert_eq!(relay.metrics().auth_failures.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn missing_credential_is_malformed() {
        let relay = relay_with(
            Config::default(),
            identity(),
            Arc::new(MemorySessionStore::new()),
            Arc::new(MemoryBroker::default()),
        );
        let (mut client, session) = session(&relay, &id("room1"));

        let result = session.run(None).await;

        assert!(matches!(result, Err(RelayError::Auth(AuthError::Malformed))));
        assert_eq!(recv(&mut client).await, Outbound::Close(CloseReason::AuthFailed));
    }

    #[tokio::test]
    async fn unresponsive_identity_provider_times_out() {
        let mut config = Config::default();
        config.limits.auth_timeout_secs = 1;
        let relay = relay_with(
            config,
            Arc::new(SlowIdentity),
            Arc::new(MemorySessionStore::new()),
            Arc::new(MemoryBroker::default()),
        );
        let (mut client, session) = session(&relay, &id("room1"));

        let result = session.run(Some("anything".into())).await;

        assert!(matches!(result, Err(RelayError::Auth(AuthError::Unavailable(_)))));
        assert_eq!(recv(&mut client).await, Outbound::Close(CloseReason::AuthFailed));
    }

    #[tokio::test]
    async fn store_failure_starts_with_empty_content() {
        let relay = relay_with(
            Config::default(),
            identity(),
            Arc::new(BrokenStore),
            Arc::new(MemoryBroker::default()),
        );
        let room = id("room1");
        let (mut client, session) = session(&relay, &room);
        let task = tokio::spawn(session.run(Some("t-alice".into())));

        assert_eq!(
            recv(&mut client).await,
            Outbound::Frame(ServerFrame::Snapshot(String::new()))
        );

        drop(client);
        task.await.unwrap().unwrap();
        assert_eq!(relay.registry().member_count(&room), 0);
    }

    #[tokio::test]
    async fn publish_failure_warns_without_closing() {
        let relay = relay_with(
            Config::default(),
            identity(),
            Arc::new(MemorySessionStore::new()),
            Arc::new(PublishRefusingBroker::default()),
        );
        let room = id("room1");
        let (mut client, session) = session(&relay, &room);
        let task = tokio::spawn(session.run(Some("t-alice".into())));

        assert!(matches!(
            recv(&mut client).await,
            Outbound::Frame(ServerFrame::Snapshot(_))
        ));
        client.send(r#"{"content":"x"}"#).unwrap();
        assert!(matches!(
            recv(&mut client).await,
            Outbound::Frame(ServerFrame::Warning { .. })
        ));
        assert_eq!(relay.registry().member_count(&room), 1);
        assert_eq!(relay.metrics().publish_failures.load(Ordering::Relaxed), 1);

        drop(client);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn read_error_unregisters_and_stops_fanout() {
        let relay = relay_with(
            Config::default(),
            identity(),
            Arc::new(MemorySessionStore::new()),
            Arc::new(MemoryBroker::default()),
        );
        let room = id("room1");
        let (mut client, session) = session(&relay, &room);
        let task = tokio::spawn(session.run(Some("t-alice".into())));

        recv(&mut client).await;
        assert!(relay.fanout().is_running(&room).await);

        client.fail(TransportError::Io("reset".into()));
        task.await.unwrap().unwrap();

        assert_eq!(relay.registry().member_count(&room), 0);
        assert!(!relay.fanout().is_running(&room).await);
        assert_eq!(recv(&mut client).await, Outbound::Close(CloseReason::Normal));
    }

    #[tokio::test]
    async fn client_that_stops_reading_is_evicted_and_session_ends() {
        let mut config = Config::default();
        config.limits.outbound_queue = 2;
        let relay = relay_with(
            config,
            identity(),
            Arc::new(MemorySessionStore::new()),
            Arc::new(MemoryBroker::default()),
        );
        let room = id("room1");
        let (mut client, session) = session(&relay, &room);
        let task = tokio::spawn(session.run(Some("t-alice".into())));

        recv(&mut client).await;
        // Every edit echoes back; nothing is read from here on.
        for i in 0..5 {
            client.send(format!(r#"{{"content":"{i}"}}"#)).unwrap();
        }

        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("stalled session did not end")
            .unwrap()
            .unwrap();
        assert_eq!(relay.registry().member_count(&room), 0);

        tokio::time::timeout(Duration::from_secs(2), async {
            while relay.fanout().is_running(&room).await {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("fanout loop kept running");
        assert_eq!(relay.metrics().evictions.load(Ordering::Relaxed), 1);
    }
}
