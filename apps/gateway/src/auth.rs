//! Handshake token validation.
//!
//! The token is decoded exactly once at connection time and trusted for the
//! connection's lifetime. No per-message re-authentication.

use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;

/// Claims carried by the handshake token. `sub` is the user id.
#[derive(Debug, Serialize, Deserialize)]
pub struct TokenClaims {
    pub sub: String,
    pub exp: i64,
}

/// Validate a handshake token and return the authenticated user id.
pub fn authenticate(secret: &str, token: &str) -> Result<String, GatewayError> {
    let validation = Validation::new(Algorithm::HS256);
    let data = jsonwebtoken::decode::<TokenClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map_err(|_| GatewayError::unauthenticated("Invalid or expired token"))?;

    if data.claims.sub.is_empty() {
        return Err(GatewayError::unauthenticated("Token has no subject"));
    }

    Ok(data.claims.sub)
}
