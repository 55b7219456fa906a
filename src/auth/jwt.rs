//! Subscriber credential handling.
//!
//! Validates the opaque signed tokens presented at the WebSocket handshake
//! and on protected routes, and honours refresh requests only inside the
//! final minutes of a token's validity. Issuance policy lives elsewhere;
//! the dev issuance endpoint is gated by configuration.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Token lifetime.
const EXPIRY_HOURS: i64 = 1;

/// Refresh is honoured only this close to expiry.
const REFRESH_WINDOW_MINUTES: i64 = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Authenticated subject.
    pub sub: String,
    pub exp: usize,
    pub iat: usize,
    /// Token id, for tracing.
    pub jti: String,
    #[serde(default)]
    pub permissions: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IssuedToken {
    pub token: String,
    pub expires_in: usize,
    pub token_type: &'static str,
}

/// JWT handler for token operations.
pub struct JwtHandler {
    secret: String,
}

impl JwtHandler {
    pub fn new(secret: String) -> Self {
        Self { secret }
    }

    /// Issue a token for a subject.
    pub fn issue(&self, subject: &str) -> Result<IssuedToken> {
        self.issue_with_ttl(subject, EXPIRY_HOURS * 3600)
    }

    fn issue_with_ttl(&self, subject: &str, ttl_secs: i64) -> Result<IssuedToken> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: subject.to_string(),
            exp: (now + ttl_secs) as usize,
            iat: now as usize,
            jti: format!("{}-{}", subject, now),
            permissions: vec!["price_stream".to_string()],
        };

        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .context("Failed to sign token")?;

        debug!(subject, ttl_secs, "Issued token");

        Ok(IssuedToken {
            token,
            expires_in: ttl_secs as usize,
            token_type: "Bearer",
        })
    }

    /// Validate a token and extract its claims.
    pub fn validate(&self, token: &str) -> Result<Claims> {
        let decoded = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &Validation::default(),
        )
        .context("Invalid or expired token")?;

        debug!(subject = %decoded.claims.sub, "Validated token");
        Ok(decoded.claims)
    }

    /// Exchange a still-valid token for a fresh one. Only allowed inside the
    /// refresh window before expiry.
    pub fn refresh(&self, token: &str) -> Result<IssuedToken> {
        let claims = self.validate(token)?;
        let now = Utc::now().timestamp();
        let remaining = claims.exp as i64 - now;

        if remaining > REFRESH_WINDOW_MINUTES * 60 {
            bail!(
                "refresh window not open yet ({}s of validity left)",
                remaining
            );
        }

        self.issue(&claims.sub)
    }
}
