//! Bearer-token authentication.
//!
//! - `jwks` - signing-key cache in front of the identity provider
//! - `resolver` - token validation and claim resolution
//! - `claims` - the resolved identity and the scope priority chain

pub mod claims;
pub mod jwks;
pub mod resolver;

use thiserror::Error;

use crate::error::GatewayError;

pub use claims::{AuthClaims, AuthScheme, ClaimSource, WILDCARD_SCOPE};
pub use jwks::{JWKS_BREAKER, JwksCache, JwksConfig, JwksError, JwksSnapshot};
pub use resolver::{AuthClaimsResolver, ResolverConfig};

/// Authentication and authorization failures.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,

    #[error("malformed authorization header")]
    MalformedHeader,

    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("unsupported token algorithm {0}")]
    UnsupportedAlgorithm(String),

    #[error("token header has no key id")]
    MissingKid,

    #[error("unknown signing key '{0}'")]
    UnknownKey(String),

    #[error("token expired")]
    Expired,

    #[error("missing all authorization claims")]
    MissingClaims,

    #[error("signing keys unavailable")]
    KeysUnavailable(JwksError),

    #[error("missing required scope '{required_scope}'")]
    Forbidden { required_scope: String },
}

impl AuthError {
    /// Short label for metrics and logs.
    pub fn reason(&self) -> &'static str {
        match self {
            AuthError::MissingToken => "missing_token",
            AuthError::MalformedHeader => "malformed_header",
            AuthError::InvalidToken(_) => "invalid_token",
            AuthError::UnsupportedAlgorithm(_) => "unsupported_algorithm",
            AuthError::MissingKid => "missing_kid",
            AuthError::UnknownKey(_) => "unknown_key",
            AuthError::Expired => "expired",
            AuthError::MissingClaims => "missing_claims",
            AuthError::KeysUnavailable(_) => "keys_unavailable",
            AuthError::Forbidden { .. } => "forbidden",
        }
    }
}

impl From<JwksError> for AuthError {
    fn from(e: JwksError) -> Self {
        match e {
            JwksError::KeyNotFound(kid) => AuthError::UnknownKey(kid),
            other => AuthError::KeysUnavailable(other),
        }
    }
}

impl From<AuthError> for GatewayError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::Forbidden { required_scope } => GatewayError::Forbidden { required_scope },
            AuthError::KeysUnavailable(JwksError::Unavailable {
                breaker_open: true, ..
            }) => GatewayError::CircuitOpen {
                breaker: JWKS_BREAKER.to_string(),
            },
            AuthError::KeysUnavailable(inner) => GatewayError::ServiceUnavailable(inner.to_string()),
            other => GatewayError::Unauthorized(other.to_string()),
        }
    }
}
