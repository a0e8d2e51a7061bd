//! Error types for collab-relay.

use std::path::PathBuf;

/// Main error type for collab-relay operations.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Authentication error.
    #[error("authentication error: {0}")]
    Auth(#[from] AuthError),

    /// Broker error.
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    /// Transport error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Credential resolution failures. The connection is refused, never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    /// No credential, or one that is not even shaped like a credential.
    #[error("malformed credential")]
    Malformed,

    /// Credential is well-formed but bad or expired.
    #[error("invalid credential: {reason}")]
    Invalid {
        /// Why the credential was rejected.
        reason: String,
    },

    /// The identity provider could not be reached in time.
    #[error("identity provider unavailable: {0}")]
    Unavailable(String),
}

/// Broker failures.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// The connection to the broker is gone.
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    /// A message could not be encoded or decoded.
    #[error("broker codec error: {0}")]
    Codec(#[from] collab_types::CollabError),
}

/// Session store failures.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Store cannot be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Database path error.
    #[error("invalid database path: {path}")]
    InvalidPath {
        /// The invalid path.
        path: PathBuf,
    },
}

/// Peer disconnects and I/O failures on a client connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The peer closed the connection.
    #[error("connection closed")]
    Closed,

    /// The peer is not draining its outbound queue.
    #[error("outbound queue full")]
    Backlogged,

    /// Reading from or writing to the connection failed.
    #[error("connection I/O failed: {0}")]
    Io(String),
}

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

/// Result type alias for broker operations.
pub type BrokerResult<T> = std::result::Result<T, BrokerError>;

/// Result type alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_error_display() {
        let err = AuthError::Invalid {
            reason: "expired".into(),
        };
        assert_eq!(err.to_string(), "invalid credential: expired");
    }

    #[test]
    fn layer_errors_convert_into_relay_error() {
        let err: RelayError = BrokerError::Unavailable("redis down".into()).into();
        assert!(matches!(err, RelayError::Broker(BrokerError::Unavailable(_))));

        let err: RelayError = TransportError::Closed.into();
        assert_eq!(err.to_string(), "transport error: connection closed");
    }
}
