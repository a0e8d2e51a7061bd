//! Client transport abstraction.
//!
//! The relay core never touches a socket. Each connection is a pair of:
//! - an [`InboundFrames`] source the session reads client text frames from
//! - a bounded queue of [`Outbound`] items drained by a transport writer
//!
//! Implementations: [`websocket`] (axum WebSocket) and [`local`] (in-process
//! channels, used by embedders and tests).

pub mod local;
pub mod websocket;

pub use local::LocalClient;

use crate::error::TransportError;
use async_trait::async_trait;
use collab_types::{ConnectionId, ServerFrame};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};

/// Why the relay is closing a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Ordinary shutdown.
    Normal,
    /// Credential missing, malformed, invalid, or unverifiable.
    AuthFailed,
    /// The session's broker subscription failed.
    BrokerUnavailable,
}

impl CloseReason {
    /// WebSocket close code for this reason.
    pub fn code(self) -> u16 {
        match self {
            Self::Normal => 1000,
            Self::AuthFailed => 4001,
            Self::BrokerUnavailable => 4002,
        }
    }

    /// Close frame reason text.
    pub fn description(self) -> &'static str {
        match self {
            Self::Normal => "closing",
            Self::AuthFailed => "authentication failed",
            Self::BrokerUnavailable => "broker unavailable",
        }
    }
}

/// An item queued for a connection's transport writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Send a frame.
    Frame(ServerFrame),
    /// Send a close signal and stop writing.
    Close(CloseReason),
}

/// Source of inbound text frames for one connection.
///
/// Blocks until a frame arrives. `None` means the peer closed cleanly.
#[async_trait]
pub trait InboundFrames: Send {
    /// Wait for the next client text frame.
    async fn next_frame(&mut self) -> Option<Result<String, TransportError>>;
}

#[async_trait]
impl InboundFrames for mpsc::UnboundedReceiver<Result<String, TransportError>> {
    async fn next_frame(&mut self) -> Option<Result<String, TransportError>> {
        self.recv().await
    }
}

/// The registry's view of a connection: its id and how to reach it.
///
/// The outbound queue is bounded. A peer that stops reading fills it, and
/// from then on `send` fails exactly as if the peer had gone away.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    outbound: mpsc::Sender<Outbound>,
    evicted: Arc<Notify>,
}

impl ConnectionHandle {
    /// Wrap a connection's outbound queue.
    ///
    /// `evicted` is notified when the registry drops this connection.
    pub fn new(id: ConnectionId, outbound: mpsc::Sender<Outbound>, evicted: Arc<Notify>) -> Self {
        Self {
            id,
            outbound,
            evicted,
        }
    }

    /// Connection id.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue a frame without waiting.
    ///
    /// Fails with [`TransportError::Closed`] once the writer has gone away and
    /// with [`TransportError::Backlogged`] while the queue is full.
    pub fn send(&self, frame: ServerFrame) -> Result<(), TransportError> {
        self.outbound
            .try_send(Outbound::Frame(frame))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => TransportError::Backlogged,
                mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
            })
    }

    /// Queue a close signal. Returns false if it could not be queued.
    pub fn close(&self, reason: CloseReason) -> bool {
        self.outbound.try_send(Outbound::Close(reason)).is_ok()
    }

    /// Tell the connection it is no longer registered.
    ///
    /// The close signal is best-effort: a full queue cannot take it. The
    /// session is woken either way.
    pub fn evict(&self, reason: CloseReason) {
        self.close(reason);
        self.evicted.notify_one();
    }

    /// Whether the transport writer is still draining this connection's queue.
    pub fn is_open(&self) -> bool {
        !self.outbound.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(capacity: usize) -> (ConnectionHandle, mpsc::Receiver<Outbound>, Arc<Notify>) {
        let (tx, rx) = mpsc::channel(capacity);
        let evicted = Arc::new(Notify::new());
        (ConnectionHandle::new(ConnectionId::new(), tx, evicted.clone()), rx, evicted)
    }

    #[test]
    fn close_codes_are_distinct() {
        assert_eq!(CloseReason::Normal.code(), 1000);
        assert_eq!(CloseReason::AuthFailed.code(), 4001);
        assert_eq!(CloseReason::BrokerUnavailable.code(), 4002);
    }

    #[test]
    fn send_queues_frame() {
        let (conn, mut rx, _) = handle(4);
        conn.send(ServerFrame::Snapshot("hi".into())).unwrap();
        assert_eq!(
            rx.try_recv().unwrap(),
            Outbound::Frame(ServerFrame::Snapshot("hi".into()))
        );
    }

    #[test]
    fn send_fails_after_writer_dropped() {
        let (conn, rx, _) = handle(4);
        drop(rx);
        assert!(!conn.is_open());
        assert_eq!(
            conn.send(ServerFrame::Snapshot("hi".into())),
            Err(TransportError::Closed)
        );
        assert!(!conn.close(CloseReason::Normal));
    }

    #[test]
    fn full_queue_reports_backlog() {
        let (conn, mut rx, _) = handle(1);
        conn.send(ServerFrame::Snapshot("first".into())).unwrap();

        assert_eq!(
            conn.send(ServerFrame::Snapshot("second".into())),
            Err(TransportError::Backlogged)
        );
        assert!(conn.is_open());

        rx.try_recv().unwrap();
        conn.send(ServerFrame::Snapshot("third".into())).unwrap();
    }

    #[tokio::test]
    async fn evict_wakes_the_session() {
        let (conn, mut rx, evicted) = handle(4);
        conn.evict(CloseReason::BrokerUnavailable);

        tokio::time::timeout(std::time::Duration::from_secs(1), evicted.notified())
            .await
            .expect("eviction was not signalled");
        assert_eq!(
            rx.try_recv().unwrap(),
            Outbound::Close(CloseReason::BrokerUnavailable)
        );
    }

    #[tokio::test]
    async fn evicting_a_full_queue_still_wakes_the_session() {
        let (conn, _rx, evicted) = handle(1);
        conn.send(ServerFrame::Snapshot("fills it".into())).unwrap();
        conn.evict(CloseReason::Normal);

        tokio::time::timeout(std::time::Duration::from_secs(1), evicted.notified())
            .await
            .expect("eviction was not signalled");
    }
}
