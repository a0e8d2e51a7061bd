//! Client-facing frames.
//!
//! Clients send [`ClientEdit`]s and receive [`ServerFrame`]s. The relay never
//! interprets `content`; it only re-attributes it to the authenticated user.

use serde::{Deserialize, Serialize};

use crate::{CollabError, UserId};

/// An edit as it appears on the wire: `{"user": ..., "content": ...}`.
///
/// Only `content` survives from what a client sends. A JSON object with a
/// string `content` field contributes that field and nothing else: any other
/// fields it carries are dropped. Every other frame, JSON or not, becomes
/// `content` byte for byte. `user` is always the authenticated identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientEdit {
    /// Author of the edit
    pub user: String,
    /// Opaque edit payload
    pub content: String,
}

/// Inbound shape accepted from clients. Any `user` the client claims is ignored.
#[derive(Deserialize)]
struct InboundEdit {
    content: String,
}

impl ClientEdit {
    /// Build the edit to publish for an inbound text frame.
    ///
    /// A frame that parses as `{"content": ...}` contributes its `content`
    /// (other fields are discarded); anything else is relayed verbatim. The
    /// author is always `author`.
    pub fn from_inbound(text: &str, author: &UserId) -> Self {
        let content = match serde_json::from_str::<InboundEdit>(text) {
            Ok(edit) => edit.content,
            Err(_) => text.to_string(),
        };
        Self {
            user: author.as_str().to_string(),
            content,
        }
    }
}

/// Every frame the relay sends to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerFrame {
    /// Initial session content, sent once on attach as raw text
    Snapshot(String),
    /// An edit relayed from the session's broker topic
    Broadcast(ClientEdit),
    /// Non-fatal problem report (e.g. an edit could not be published)
    Warning {
        /// Human-readable description
        message: String,
    },
}

#[derive(Serialize)]
struct WarningFrame<'a> {
    warning: &'a str,
}

impl ServerFrame {
    /// Encode to the text sent over the transport.
    pub fn encode(&self) -> Result<String, CollabError> {
        match self {
            Self::Snapshot(content) => Ok(content.clone()),
            Self::Broadcast(edit) => Ok(serde_json::to_string(edit)?),
            Self::Warning { message } => Ok(serde_json::to_string(&WarningFrame {
                warning: message,
            })?),
        }
    }
}
