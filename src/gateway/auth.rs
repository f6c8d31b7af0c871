//! Credential check and token issuance for the realtime gateway.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::config::{GatewayConfig, GatewayUser};

/// Role carried by every issued token.
pub const USER_ROLE: &str = "User";

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Invalid credentials.")]
    InvalidCredentials,
    #[error("token error: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub role: String,
    pub iss: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
}

/// Held by a connection after a successful handshake. Never persisted.
#[derive(Debug, Clone)]
pub struct AuthSession {
    pub user_id: String,
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl AuthSession {
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

pub struct Authenticator {
    users: Vec<GatewayUser>,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    issuer: String,
    audience: String,
    ttl: Duration,
}

impl Authenticator {
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            users: config.users.clone(),
            encoding_key: EncodingKey::from_secret(config.token_secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(config.token_secret.as_bytes()),
            issuer: config.issuer.clone(),
            audience: config.audience.clone(),
            ttl: Duration::minutes(config.token_ttl_minutes),
        }
    }

    /// Check the pair against the configured users and issue a signed HS256 token.
    pub fn authenticate(&self, user_id: &str, password: &str) -> Result<AuthSession, AuthError> {
        let known = self
            .users
            .iter()
            .any(|user| user.user_id == user_id && user.password == password);
        if !known {
            return Err(AuthError::InvalidCredentials);
        }

        let issued_at = Utc::now();
        let expires_at = issued_at + self.ttl;
        let claims = Claims {
            sub: user_id.to_string(),
            role: USER_ROLE.to_string(),
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            iat: issued_at.timestamp(),
            exp: expires_at.timestamp(),
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)?;

        Ok(AuthSession {
            user_id: user_id.to_string(),
            token,
            expires_at,
        })
    }

    /// Validate signature, issuer, audience and expiry.
    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[self.issuer.as_str()]);
        validation.set_audience(&[self.audience.as_str()]);
        let data = decode::<Claims>(token, &self.decoding_key, &validation)?;
        Ok(data.claims)
    }
}
