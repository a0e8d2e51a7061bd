//! WebSocket endpoint: `GET /ws/{session_id}?token=<credential>`.

use crate::server::CollabRelay;
use crate::transport::websocket;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Extension;
use collab_types::SessionId;
use serde::Deserialize;
use std::sync::Arc;

/// Query parameters of the upgrade request.
#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    /// Credential handed to the identity provider.
    pub token: Option<String>,
}

/// Upgrade to a WebSocket and run a session on it.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    Query(params): Query<ConnectParams>,
    Extension(relay): Extension<Arc<CollabRelay>>,
) -> Response {
    let session_id = match SessionId::parse(&session_id) {
        Ok(id) => id,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };
    let limits = relay.config().limits.clone();
    let max_frame = limits.max_frame_bytes;

    ws.max_message_size(max_frame)
        .max_frame_size(max_frame)
        .on_upgrade(move |socket| async move {
            let (inbound, outbound, writer) = websocket::split(socket, &limits);
            if let Err(e) = relay
                .serve_connection(session_id, params.token, inbound, outbound)
                .await
            {
                tracing::debug!("WebSocket session ended with error: {}", e);
            }
            // Let the writer flush the final close frame.
            let _ = writer.await;
        })
}
