//! JWT token handling

use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::store::Subscriber;

const JWT_SECRET: &[u8] = b"chat-relay-secret-key-change-in-production";

/// Token lifetime in seconds (1 hour).
const TOKEN_TTL_SECS: i64 = 3600;

/// JWT claims
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    /// Subscriber id
    pub id: String,
    /// Display name
    pub name: String,
    /// Issued at
    pub iat: i64,
    /// Expiration time
    pub exp: i64,
}

/// Issued-token metadata returned by the login endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenMeta {
    #[serde(rename = "AccessToken")]
    pub access_token: String,

    /// Time in seconds from creation.
    #[serde(rename = "TTL")]
    pub ttl: i64,

    /// Timestamp in seconds of expiration.
    #[serde(rename = "ExpiresAt")]
    pub expires_at: i64,
}

/// Create a fresh token for a subscriber.
pub fn issue_token(subscriber: &Subscriber) -> Result<TokenMeta> {
    let now = chrono::Utc::now().timestamp();
    let claims = Claims {
        id: subscriber.id.clone(),
        name: subscriber.name.clone(),
        iat: now,
        exp: now + TOKEN_TTL_SECS,
    };

    let signed = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(JWT_SECRET),
    )
    .map_err(|e| Error::Auth(format!("Failed to create token: {}", e)))?;

    Ok(TokenMeta {
        access_token: signed,
        ttl: TOKEN_TTL_SECS,
        expires_at: claims.exp,
    })
}

/// Validate and decode a token.
pub fn verify_token(token: &str) -> Result<Claims> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(JWT_SECRET),
        &Validation::default(),
    )
    .map(|data| data.claims)
    .map_err(|e| Error::Auth(format!("Invalid token: {}", e)))
}
