//! In-process transport over channels.
//!
//! Lets a caller in the same process attach to a session without a socket.
//! Dropping the [`LocalClient`] behaves like the peer vanishing: reads end
//! and writes fail.

use super::Outbound;
use crate::error::TransportError;
use collab_types::ServerFrame;
use tokio::sync::mpsc;

/// Client side of an in-process connection.
#[derive(Debug)]
pub struct LocalClient {
    inbound: mpsc::UnboundedSender<Result<String, TransportError>>,
    // Dropped once a close signal is read, like a socket writer stopping.
    outbound: Option<mpsc::Receiver<Outbound>>,
}

/// Relay side of an in-process connection.
#[derive(Debug)]
pub struct LocalServerEnd {
    /// Frames sent by the client.
    pub inbound: mpsc::UnboundedReceiver<Result<String, TransportError>>,
    /// Queue drained by the client.
    pub outbound: mpsc::Sender<Outbound>,
}

impl LocalClient {
    /// Create a connected client/relay pair.
    ///
    /// At most `capacity` items wait for the client to read them.
    pub fn pair(capacity: usize) -> (Self, LocalServerEnd) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                inbound: inbound_tx,
                outbound: Some(outbound_rx),
            },
            LocalServerEnd {
                inbound: inbound_rx,
                outbound: outbound_tx,
            },
        )
    }

    /// Send a text frame to the relay.
    pub fn send(&self, text: impl Into<String>) -> Result<(), TransportError> {
        self.inbound
            .send(Ok(text.into()))
            .map_err(|_| TransportError::Closed)
    }

    /// Make the relay's next read fail with `error`.
    pub fn fail(&self, error: TransportError) {
        let _ = self.inbound.send(Err(error));
    }

    /// Wait for the next item the relay queued for this client.
    ///
    /// After a close signal has been returned, always `None`.
    pub async fn recv(&mut self) -> Option<Outbound> {
        let item = self.outbound.as_mut()?.recv().await;
        self.observe(item)
    }

    /// Wait for the next frame. Returns `None` on close or when the relay is gone.
    pub async fn recv_frame(&mut self) -> Option<ServerFrame> {
        match self.recv().await? {
            Outbound::Frame(frame) => Some(frame),
            Outbound::Close(_) => None,
        }
    }

    /// Take an already-queued item without waiting.
    pub fn try_recv(&mut self) -> Option<Outbound> {
        match self.outbound.as_mut()?.try_recv() {
            Ok(item) => self.observe(Some(item)),
            Err(mpsc::error::TryRecvError::Empty) => None,
            Err(mpsc::error::TryRecvError::Disconnected) => self.observe(None),
        }
    }

    /// Whether the relay can still reach this client.
    pub fn is_open(&self) -> bool {
        self.outbound.is_some()
    }

    fn observe(&mut self, item: Option<Outbound>) -> Option<Outbound> {
        if matches!(item, None | Some(Outbound::Close(_))) {
            self.outbound = None;
        }
        item
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{CloseReason, InboundFrames};

    #[tokio::test]
    async fn frames_flow_both_ways() {
        let (mut client, mut server) = LocalClient::pair(8);

        client.send("hello").unwrap();
        assert_eq!(server.inbound.next_frame().await, Some(Ok("hello".to_string())));

        server
            .outbound
            .try_send(Outbound::Frame(ServerFrame::Snapshot("doc".into())))
            .unwrap();
        assert_eq!(client.recv_frame().await, Some(ServerFrame::Snapshot("doc".into())));
    }

    #[tokio::test]
    async fn close_ends_frame_stream() {
        let (mut client, server) = LocalClient::pair(8);
        server.outbound.try_send(Outbound::Close(CloseReason::Normal)).unwrap();
        assert_eq!(client.recv_frame().await, None);
    }

    #[tokio::test]
    async fn reading_close_releases_the_queue() {
        let (mut client, server) = LocalClient::pair(8);
        server
            .outbound
            .try_send(Outbound::Close(CloseReason::BrokerUnavailable))
            .unwrap();

        assert_eq!(
            client.recv().await,
            Some(Outbound::Close(CloseReason::BrokerUnavailable))
        );
        assert!(!client.is_open());
        assert!(server.outbound.is_closed());
        assert_eq!(client.recv().await, None);
    }

    #[tokio::test]
    async fn dropping_client_ends_reads_and_fails_writes() {
        let (client, mut server) = LocalClient::pair(8);
        drop(client);

        assert_eq!(server.inbound.next_frame().await, None);
        assert!(server.outbound.is_closed());
    }

    #[tokio::test]
    async fn injected_failure_surfaces_as_read_error() {
        let (client, mut server) = LocalClient::pair(8);
        client.fail(TransportError::Io("reset by peer".into()));
        assert!(matches!(
            server.inbound.next_frame().await,
            Some(Err(TransportError::Io(_)))
        ));
    }
}
