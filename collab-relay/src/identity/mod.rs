//! Identity provider: credential in, user id or failure out.
//!
//! How credentials are issued is outside the relay; it only validates them.

mod jwt;

pub use jwt::{Claims, JwtIdentityProvider};

use crate::error::AuthError;
use async_trait::async_trait;
use collab_types::UserId;
use std::collections::HashMap;

/// Resolves a credential to a stable user identifier.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Validate `credential` and return the user it belongs to.
    async fn resolve(&self, credential: &str) -> Result<UserId, AuthError>;
}

/// Fixed credential table, for development and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticIdentityProvider {
    tokens: HashMap<String, UserId>,
}

impl StaticIdentityProvider {
    /// Build from a credential -> user id table.
    pub fn new(tokens: HashMap<String, String>) -> Self {
        Self {
            tokens: tokens
                .into_iter()
                .map(|(token, user)| (token, UserId::new(user)))
                .collect(),
        }
    }

    /// Add one credential.
    pub fn with_token(mut self, token: impl Into<String>, user: impl Into<String>) -> Self {
        self.tokens.insert(token.into(), UserId::new(user));
        self
    }

    /// Number of known credentials.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentityProvider {
    async fn resolve(&self, credential: &str) -> Result<UserId, AuthError> {
        if credential.trim().is_empty() {
            return Err(AuthError::Malformed);
        }
        self.tokens
            .get(credential)
            .cloned()
            .ok_or_else(|| AuthError::Invalid {
                reason: "unknown token".into(),
            })
    }
}
