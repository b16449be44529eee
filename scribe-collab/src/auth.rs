//! Bearer-token verification for WebSocket handshakes.
//!
//! The subject claim carries the username; the server resolves it through
//! the user directory before any event reaches the coordinator.

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::model::now_millis;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Claims {
    /// Username
    pub sub: String,
    /// Expiry, seconds since the Unix epoch
    pub exp: u64,
}

/// Verifies a bearer token and returns its claims.
///
/// Synchronous: it runs inside the handshake callback.
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Option<Claims>;
}

pub struct Hs256Verifier {
    key: DecodingKey,
    validation: Validation,
}

impl Hs256Verifier {
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }
}

impl TokenVerifier for Hs256Verifier {
    fn verify(&self, token: &str) -> Option<Claims> {
        match decode::<Claims>(token, &self.key, &self.validation) {
            Ok(data) => Some(data.claims),
            Err(e) => {
                log::debug!("Rejected token: {e}");
                None
            }
        }
    }
}

/// Issues HS256 tokens for a shared secret (tooling and tests).
pub struct Hs256Issuer {
    key: EncodingKey,
}

impl Hs256Issuer {
    pub fn new(secret: &str) -> Self {
        Self {
            key: EncodingKey::from_secret(secret.as_bytes()),
        }
    }

    /// Token for `username`, valid for `ttl_secs`.
    pub fn issue(&self, username: &str, ttl_secs: u64) -> Result<String, jsonwebtoken::errors::Error> {
        let claims = Claims {
            sub: username.to_string(),
            exp: now_millis() / 1000 + ttl_secs,
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.key)
    }
}

/// Token part of an `Authorization: Bearer <token>` header value.
pub fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}
