//! Access token verification.
//!
//! Tokens are HS256 JWTs issued elsewhere, read from the access token cookie
//! or an `Authorization: Bearer` header.

use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::HeaderMap;
use axum::http::header::{AUTHORIZATION, COOKIE};
use axum::http::request::Parts;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::config::AuthConfig;
use crate::ids::UserId;
use crate::server::error::ApiError;
use crate::server::state::AppState;

/// Token verification failure.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum AuthError {
    /// No token in the cookie or header.
    #[error("Authentication required")]
    MissingToken,
    /// Token failed verification or has expired.
    #[error("Invalid or expired token")]
    InvalidToken,
}

impl AuthError {
    /// Stable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::MissingToken => "NO_TOKEN",
            Self::InvalidToken => "INVALID_TOKEN",
        }
    }
}

/// Claims carried by an access token.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Claims {
    /// Subject user id.
    pub user_id: String,
    /// Display name.
    pub username: String,
    /// Expiry, seconds since the epoch.
    pub exp: u64,
}

/// The requester, as established by a verified token.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VerifiedIdentity {
    /// User id.
    pub user_id: UserId,
    /// Display name.
    pub username: String,
}

/// HS256 token verifier.
#[derive(Clone)]
pub struct JwtVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
    cookie_name: String,
}

impl JwtVerifier {
    /// Create a verifier from auth settings.
    #[must_use]
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(config.jwt_secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
            cookie_name: config.cookie_name.clone(),
        }
    }

    /// Verify a raw token.
    ///
    /// # Errors
    /// Returns `InvalidToken` for bad signatures, malformed claims or expiry.
    pub fn verify(&self, token: &str) -> Result<VerifiedIdentity, AuthError> {
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation).map_err(|err| {
            debug!("token rejected: {err}");
            AuthError::InvalidToken
        })?;
        Ok(VerifiedIdentity {
            user_id: UserId::new(data.claims.user_id),
            username: data.claims.username,
        })
    }

    /// Find and verify the request's token, preferring the cookie.
    ///
    /// # Errors
    /// Returns `MissingToken` when no token is present, otherwise the
    /// verification error.
    pub fn authenticate(&self, headers: &HeaderMap) -> Result<VerifiedIdentity, AuthError> {
        let token = token_from_cookies(headers, &self.cookie_name)
            .or_else(|| bearer_token(headers))
            .ok_or(AuthError::MissingToken)?;
        self.verify(token)
    }
}

fn token_from_cookies<'a>(headers: &'a HeaderMap, cookie_name: &str) -> Option<&'a str> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|header| header.split(';'))
        .find_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            (name.trim() == cookie_name).then_some(value.trim())
        })
        .filter(|token| !token.is_empty())
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.trim().split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

impl FromRequestParts<Arc<AppState>> for VerifiedIdentity {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        Ok(state.auth.authenticate(&parts.headers)?)
    }
}

/// Issue a token the way the identity service does.
#[cfg(test)]
pub(crate) fn issue_token(secret: &str, user_id: &str, username: &str) -> String {
    use jsonwebtoken::{EncodingKey, Header, encode};

    let claims = Claims {
        user_id: user_id.to_string(),
        username: username.to_string(),
        exp: u64::try_from(chrono::Utc::now().timestamp()).unwrap() + 3600,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .unwrap()
}
