//! Bearer token issuance and validation for the WebSocket upgrade.

use std::fmt;

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::{RngExt, rng};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::tunneler::telemetry::now_unix_secs;

pub const ISSUER: &str = "tunnelerd";
pub const ANONYMOUS_USER: &str = "anonymous";

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;
const RANDOM_KEY_LEN: usize = 64;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("secret key is random so tokens would be useless; set server.secret_key")]
    RandomKey,
    #[error("need to specify a username")]
    MissingUser,
    #[error("token lifetime must be at least one day")]
    InvalidLifetime,
    #[error("missing bearer token")]
    MissingToken,
    #[error("invalid token: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub iss: String,
    pub sub: String,
    pub iat: u64,
    pub exp: u64,
}

/// Signs and verifies HS512 tokens with one shared secret.
#[derive(Clone)]
pub struct TokenAuthority {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    random_key: bool,
}

impl fmt::Debug for TokenAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenAuthority")
            .field("random_key", &self.random_key)
            .finish_non_exhaustive()
    }
}

impl TokenAuthority {
    /// Uses `secret` when set, otherwise a per-process random key.
    pub fn new(secret: Option<&str>) -> Self {
        match secret.map(str::trim).filter(|s| !s.is_empty()) {
            Some(s) => Self::from_bytes(s.as_bytes(), false),
            None => {
                let mut r = rng();
                let key: Vec<u8> = (0..RANDOM_KEY_LEN).map(|_| r.random::<u8>()).collect();
                Self::from_bytes(&key, true)
            }
        }
    }

    fn from_bytes(secret: &[u8], random_key: bool) -> Self {
        let mut validation = Validation::new(Algorithm::HS512);
        validation.set_issuer(&[ISSUER]);

        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation,
            random_key,
        }
    }

    pub fn is_random(&self) -> bool {
        self.random_key
    }

    pub fn issue(&self, user: &str, days: u64) -> Result<String, AuthError> {
        if self.random_key {
            return Err(AuthError::RandomKey);
        }
        let user = user.trim();
        if user.is_empty() {
            return Err(AuthError::MissingUser);
        }
        if days == 0 {
            return Err(AuthError::InvalidLifetime);
        }

        tracing::info!(user = %user, days, "auth: generating token");

        let now = now_unix_secs();
        let claims = Claims {
            iss: ISSUER.to_string(),
            sub: user.to_string(),
            iat: now,
            exp: now.saturating_add(days.saturating_mul(SECONDS_PER_DAY)),
        };
        Ok(jsonwebtoken::encode(
            &Header::new(Algorithm::HS512),
            &claims,
            &self.encoding,
        )?)
    }

    pub fn validate(&self, token: &str) -> Result<Claims, AuthError> {
        let data = jsonwebtoken::decode::<Claims>(token.trim(), &self.decoding, &self.validation)?;
        Ok(data.claims)
    }

    /// Validates an `Authorization` header value of the form `Bearer <jwt>`.
    pub fn authorize(&self, header: Option<&str>) -> Result<Claims, AuthError> {
        let token = header
            .and_then(|h| h.trim().strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(AuthError::MissingToken)?;
        self.validate(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_token_validates() {
        let auth = TokenAuthority::new(Some("s3cret"));
        let token = auth.issue("alice", 30).unwrap();

        let claims = auth.validate(&token).unwrap();
        assert_eq!(claims.iss, ISSUER);
        assert_eq!(claims.sub, "alice");
        assert_eq!(claims.exp - claims.iat, 30 * SECONDS_PER_DAY);

        let via_header = auth.authorize(Some(&format!("Bearer {token}"))).unwrap();
        assert_eq!(via_header, claims);
    }

    #[test]
    fn token_from_other_key_is_rejected() {
        let a = TokenAuthority::new(Some("one"));
        let b = TokenAuthority::new(Some("two"));
        let token = a.issue("bob", 1).unwrap();
        assert!(matches!(b.validate(&token), Err(AuthError::InvalidToken(_))));
    }

    #[test]
    fn expired_token_is_rejected() {
        let auth = TokenAuthority::new(Some("k"));
        let now = now_unix_secs();
        let claims = Claims {
            iss: ISSUER.to_string(),
            sub: "carol".to_string(),
            iat: now - 10 * SECONDS_PER_DAY,
            exp: now - SECONDS_PER_DAY,
        };
        let token = jsonwebtoken::encode(
            &Header::new(Algorithm::HS512),
            &claims,
            &EncodingKey::from_secret(b"k"),
        )
        .unwrap();
        assert!(auth.validate(&token).is_err());
    }

    #[test]
    fn foreign_issuer_is_rejected() {
        let auth = TokenAuthority::new(Some("k"));
        let now = now_unix_secs();
        let claims = Claims {
            iss: "someone-else".to_string(),
            sub: "dave".to_string(),
            iat: now,
            exp: now + SECONDS_PER_DAY,
        };
        let token = jsonwebtoken::encode(
            &Header::new(Algorithm::HS512),
            &claims,
            &EncodingKey::from_secret(b"k"),
        )
        .unwrap();
        assert!(auth.validate(&token).is_err());
    }

    #[test]
    fn random_key_refuses_to_issue() {
        let auth = TokenAuthority::new(None);
        assert!(auth.is_random());
        assert!(matches!(auth.issue("alice", 1), Err(AuthError::RandomKey)));
        assert!(TokenAuthority::new(Some("   ")).is_random());
    }

    #[test]
    fn issue_checks_arguments() {
        let auth = TokenAuthority::new(Some("k"));
        assert!(matches!(auth.issue(" ", 1), Err(AuthError::MissingUser)));
        assert!(matches!(auth.issue("x", 0), Err(AuthError::InvalidLifetime)));
    }

    #[test]
    fn authorize_requires_bearer_scheme() {
        let auth = TokenAuthority::new(Some("k"));
        let token = auth.issue("eve", 1).unwrap();
        assert!(matches!(auth.authorize(None), Err(AuthError::MissingToken)));
        assert!(matches!(auth.authorize(Some("Bearer ")), Err(AuthError::MissingToken)));
        assert!(matches!(
            auth.authorize(Some(&format!("Basic {token}"))),
            Err(AuthError::MissingToken)
        ));
    }
}
