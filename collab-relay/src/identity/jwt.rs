//! HS256 JWT validation.

use super::IdentityProvider;
use crate::error::AuthError;
use async_trait::async_trait;
use collab_types::UserId;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

/// JWT claims the relay reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id
    pub sub: String,
    /// Expiration time (Unix timestamp)
    pub exp: u64,
}

/// Validates HS256 tokens signed with a shared secret; `sub` is the user id.
pub struct JwtIdentityProvider {
    key: DecodingKey,
    validation: Validation,
}

impl std::fmt::Debug for JwtIdentityProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtIdentityProvider")
            .field("algorithm", &"HS256")
            .finish_non_exhaustive()
    }
}

impl JwtIdentityProvider {
    /// Create a provider for tokens signed with `secret`.
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_required_spec_claims(&["exp", "sub"]);
        Self {
            key: DecodingKey::from_secret(secret),
            validation,
        }
    }
}

#[async_trait]
impl IdentityProvider for JwtIdentityProvider {
    async fn resolve(&self, credential: &str) -> Result<UserId, AuthError> {
        if credential.trim().is_empty() {
            return Err(AuthError::Malformed);
        }

        let data = decode::<Claims>(credential, &self.key, &self.validation).map_err(|e| {
            match e.kind() {
                ErrorKind::InvalidToken | ErrorKind::Base64(_) | ErrorKind::Json(_) | ErrorKind::Utf8(_) => {
                    AuthError::Malformed
                }
                _ => AuthError::Invalid {
                    reason: e.to_string(),
                },
            }
        })?;

        if data.claims.sub.is_empty() {
            return Err(AuthError::Invalid {
                reason: "empty subject".into(),
            });
        }
        Ok(UserId::new(data.claims.sub))
    }
}
