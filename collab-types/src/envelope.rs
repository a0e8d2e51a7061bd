//! Envelope - the broker wire format for relayed edits.

use serde::{Deserialize, Serialize};

use crate::{ClientEdit, CollabError, SessionId, UserId};

/// A broadcast message carried over the broker.
///
/// Ephemeral: the relay publishes and delivers envelopes but never stores them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Session (broker topic) this edit belongs to
    pub session_id: SessionId,
    /// Authenticated author of the edit
    pub author: UserId,
    /// Opaque edit payload
    pub payload: String,
    /// Unix timestamp (seconds) - informational only
    pub sent_at: u64,
}

impl Envelope {
    /// Create a new envelope stamped with the current time.
    pub fn new(session_id: SessionId, author: UserId, payload: String) -> Self {
        Self {
            session_id,
            author,
            payload,
            sent_at: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        }
    }

    /// Serialize to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CollabError> {
        rmp_serde::to_vec(self).map_err(CollabError::Serialization)
    }

    /// Deserialize from MessagePack bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CollabError> {
        rmp_serde::from_slice(bytes).map_err(CollabError::Deserialization)
    }

    /// The client-facing form of this envelope.
    pub fn to_edit(&self) -> ClientEdit {
        ClientEdit {
            user: self.author.as_str().to_string(),
            content: self.payload.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Envelope {
        Envelope::new(
            SessionId::parse("room1").unwrap(),
            UserId::new("alice"),
            "let x = 1;".into(),
        )
    }

    #[test]
    fn envelope_survives_broker_encoding() {
        let original = sample();
        let decoded = Envelope::from_bytes(&original.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn garbage_bytes_fail_to_decode() {
        assert!(Envelope::from_bytes(&[0xc1, 0x00, 0xff]).is_err());
    }

    #[test]
    fn envelope_with_invalid_session_id_is_rejected() {
        #[derive(Serialize)]
        struct Forged<'a> {
            session_id: &'a str,
            author: &'a str,
            payload: &'a str,
            sent_at: u64,
        }
        let bytes = rmp_serde::to_vec(&Forged {
            session_id: "",
            author: "mallory",
            payload: "x",
            sent_at: 1,
        })
        .unwrap();

        assert!(matches!(
            Envelope::from_bytes(&bytes),
            Err(CollabError::Deserialization(_))
        ));
    }

    #[test]
    fn to_edit_uses_author_as_user() {
        let edit = sample().to_edit();
        assert_eq!(edit.user, "alice");
        assert_eq!(edit.content, "let x = 1;");
    }

    #[test]
    fn new_envelope_is_timestamped() {
        assert!(sample().sent_at > 0);
    }
}
