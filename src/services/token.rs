//! Bearer-token verification.
//!
//! DESIGN
//! ======
//! Tokens are HS256 JWTs minted by the account system that shares
//! `JWT_SECRET` with this process. The verifier only decodes and validates;
//! it never issues tokens. Expiry is checked with jsonwebtoken's default
//! leeway, and claims beyond the ones modeled here are ignored.

use jsonwebtoken::{DecodingKey, Validation, decode};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,
    #[error("invalid token: {0}")]
    Invalid(#[from] jsonwebtoken::errors::Error),
}

/// Claims carried by an account-system token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthClaims {
    pub id: Uuid,
    pub role: String,
    pub iat: i64,
    pub exp: i64,
}

/// Validates bearer tokens against the shared signing secret.
#[derive(Clone)]
pub struct TokenVerifier {
    secret: Vec<u8>,
}

impl TokenVerifier {
    #[must_use]
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Build a verifier from `JWT_SECRET`. `None` when unset or empty.
    #[must_use]
    pub fn from_env() -> Option<Self> {
        let secret = std::env::var("JWT_SECRET").ok()?;
        if secret.is_empty() {
            return None;
        }
        Some(Self::new(secret))
    }

    /// Validate a bearer token and extract its claims.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::MissingToken` when the token is absent or empty,
    /// and `AuthError::Invalid` when the signature, shape, or expiry check
    /// fails.
    pub fn verify(&self, token: Option<&str>) -> Result<AuthClaims, AuthError> {
        let token = token
            .filter(|t| !t.is_empty())
            .ok_or(AuthError::MissingToken)?;
        let key = DecodingKey::from_secret(&self.secret);
        let data = decode::<AuthClaims>(token, &key, &Validation::default())?;
        Ok(data.claims)
    }
}


#[cfg(test)]
#[path = "token_test.rs"]
mod tests;
