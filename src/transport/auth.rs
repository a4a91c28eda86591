//! Bearer tokens for the notification feed
//!
//! Tokens are HS256 JWTs whose `sub` claim is the numeric user id. A token
//! may be presented during the WebSocket handshake either as the `token`
//! query parameter or as an `Authorization: Bearer <token>` header.

use std::time::Duration;

use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use tungstenite::handshake::server::Request;
use tungstenite::http::header::AUTHORIZATION;

use crate::broker::topic::UserId;
use crate::utils::error::FeedError;

pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
}

pub struct TokenAuthority {
    secret: String,
    ttl: Duration,
}

impl TokenAuthority {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            ttl: DEFAULT_TOKEN_TTL,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn issue(&self, user: UserId) -> Result<String, jsonwebtoken::errors::Error> {
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::days(1));
        let claims = Claims {
            sub: user.to_string(),
            exp: (chrono::Utc::now() + ttl).timestamp() as usize,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
    }

    /// Validate `token` and return the user it was issued for.
    pub fn verify(&self, token: &str) -> Result<UserId, FeedError> {
        let data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &Validation::default(),
        )
        .map_err(|e| FeedError::Unauthorized(format!("invalid token: {e}")))?;

        data.claims
            .sub
            .parse()
            .map_err(|_| FeedError::Unauthorized(format!("bad subject '{}'", data.claims.sub)))
    }
}

impl std::fmt::Debug for TokenAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenAuthority")
            .field("secret", &"<redacted>")
            .field("ttl", &self.ttl)
            .finish()
    }
}

/// Token carried by a handshake request, query parameter first.
pub fn token_from_request(req: &Request) -> Option<String> {
    let from_query = req.uri().query().and_then(|query| {
        form_urlencoded::parse(query.as_bytes())
            .find(|(key, _)| key == "token")
            .map(|(_, value)| value.into_owned())
    });

    from_query.filter(|t| !t.is_empty()).or_else(|| {
        req.headers()
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(|token| token.trim().to_string())
            .filter(|t| !t.is_empty())
    })
}
