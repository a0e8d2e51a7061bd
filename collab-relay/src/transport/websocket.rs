//! WebSocket transport (axum).
//!
//! The socket is split: the read half feeds the session as [`InboundFrames`],
//! the write half is owned by a writer task draining the connection's
//! [`Outbound`] queue. When the writer stops, it drops the queue receiver,
//! which the session observes as the transport going away.
//!
//! Half-open peers are caught from both ends. The writer pings on an interval
//! and gives up on any write that does not complete in time; the reader
//! reports an error when nothing (pongs included) arrives within the idle
//! timeout.

use super::{InboundFrames, Outbound};
use crate::config::LimitsConfig;
use crate::error::TransportError;
use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};

/// Read half of a client WebSocket.
pub struct WsInbound {
    stream: SplitStream<WebSocket>,
    idle_timeout: Duration,
}

#[async_trait]
impl InboundFrames for WsInbound {
    async fn next_frame(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            let message = match timeout(self.idle_timeout, self.stream.next()).await {
                Ok(message) => message?,
                Err(_) => {
                    return Some(Err(TransportError::Io(format!(
                        "nothing received for {}s",
                        self.idle_timeout.as_secs()
                    ))))
                }
            };
            match message {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                    Ok(text) => return Some(Ok(text)),
                    Err(_) => tracing::debug!("Ignoring non UTF-8 binary frame"),
                },
                // Pings are answered by the WebSocket layer; both count as activity.
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
                Ok(Message::Close(_)) => return None,
                Err(e) => return Some(Err(TransportError::Io(e.to_string()))),
            }
        }
    }
}

/// Split a socket into the session's read half and outbound queue.
///
/// The returned handle completes once the writer has flushed its last frame.
pub fn split(
    socket: WebSocket,
    limits: &LimitsConfig,
) -> (WsInbound, mpsc::Sender<Outbound>, JoinHandle<()>) {
    let (sink, stream) = socket.split();
    let (tx, rx) = mpsc::channel(limits.outbound_queue.max(1));
    let writer = Writer {
        sink,
        ping_interval: Duration::from_secs(limits.ping_interval_secs.max(1)),
        write_timeout: Duration::from_secs(limits.write_timeout_secs.max(1)),
    };
    let inbound = WsInbound {
        stream,
        idle_timeout: Duration::from_secs(limits.idle_timeout_secs.max(1)),
    };
    (inbound, tx, tokio::spawn(writer.run(rx)))
}

struct Writer {
    sink: SplitSink<WebSocket, Message>,
    ping_interval: Duration,
    write_timeout: Duration,
}

impl Writer {
    async fn run(mut self, mut rx: mpsc::Receiver<Outbound>) {
        let mut ping = interval(self.ping_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ping.tick().await;

        loop {
            let item = tokio::select! {
                item = rx.recv() => item,
                _ = ping.tick() => {
                    if !self.write(Message::Ping(Vec::new())).await {
                        return;
                    }
                    continue;
                }
            };

            match item {
                Some(Outbound::Frame(frame)) => {
                    let text = match frame.encode() {
                        Ok(text) => text,
                        Err(e) => {
                            tracing::warn!("Failed to encode outbound frame: {}", e);
                            continue;
                        }
                    };
                    if !self.write(Message::Text(text)).await {
                        return;
                    }
                }
                Some(Outbound::Close(reason)) => {
                    let frame = CloseFrame {
                        code: reason.code(),
                        reason: reason.description().into(),
                    };
                    self.write(Message::Close(Some(frame))).await;
                    return;
                }
                None => return,
            }
        }
    }

    /// Returns false when the socket should be abandoned.
    async fn write(&mut self, message: Message) -> bool {
        match timeout(self.write_timeout, self.sink.send(message)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::debug!("WebSocket write failed: {}", e);
                false
            }
            Err(_) => {
                tracing::debug!(
                    "WebSocket write stalled for {}s, dropping connection",
                    self.write_timeout.as_secs()
                );
                false
            }
        }
    }
}
