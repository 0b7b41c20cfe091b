//! Resolved identity and the authorization-claim priority chain.
//!
//! Identity providers disagree on where granted scopes live. The resolver
//! accepts three shapes and picks the first one present:
//!
//! 1. `scope` - space-delimited string (RFC 8693 style)
//! 2. `scopes` - array of strings
//! 3. `permissions` - array of strings (Auth0 RBAC style)
//!
//! This order is a contract: a token carrying both `scope` and `permissions`
//! is authorized by `scope` alone.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::AuthError;

/// Which claim supplied the granted scopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimSource {
    Scope,
    Scopes,
    Permissions,
    None,
}

impl ClaimSource {
    pub fn as_str(self) -> &'static str {
        match self {
            ClaimSource::Scope => "scope",
            ClaimSource::Scopes => "scopes",
            ClaimSource::Permissions => "permissions",
            ClaimSource::None => "none",
        }
    }
}

impl fmt::Display for ClaimSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the token signature was verified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthScheme {
    /// Asymmetric key from the identity provider's JWKS.
    Jwks,
    /// Fallback shared-secret (HS256) verification.
    SharedSecret,
}

impl AuthScheme {
    pub fn as_str(self) -> &'static str {
        match self {
            AuthScheme::Jwks => "jwks",
            AuthScheme::SharedSecret => "shared_secret",
        }
    }
}

/// Wildcard scope that satisfies every requirement.
pub const WILDCARD_SCOPE: &str = "*";

/// Verified identity attached to the request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthClaims {
    pub subject: String,
    pub issuer: Option<String>,
    pub audience: Vec<String>,
    /// Expiry as seconds since the Unix epoch.
    pub expires_at: u64,
    pub granted_scopes: BTreeSet<String>,
    pub source: ClaimSource,
    pub scheme: AuthScheme,
}

impl AuthClaims {
    pub fn has_scope(&self, scope: &str) -> bool {
        self.granted_scopes.contains(scope) || self.granted_scopes.contains(WILDCARD_SCOPE)
    }

    /// Route-level authorization check.
    pub fn ensure_scope(&self, required: &str) -> Result<(), AuthError> {
        if self.has_scope(required) {
            Ok(())
        } else {
            Err(AuthError::Forbidden {
                required_scope: required.to_string(),
            })
        }
    }
}

/// Claims as they appear in the token payload.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RawClaims {
    pub sub: String,
    pub exp: u64,
    #[serde(default)]
    pub iss: Option<String>,
    #[serde(default)]
    pub aud: Option<Value>,
    #[serde(default)]
    pub scope: Option<Value>,
    #[serde(default)]
    pub scopes: Option<Value>,
    #[serde(default)]
    pub permissions: Option<Value>,
}

impl RawClaims {
    /// Walk the priority chain and return the winning source with its scopes.
    pub fn granted_scopes(&self) -> (ClaimSource, BTreeSet<String>) {
        let candidates = [
            (ClaimSource::Scope, &self.scope),
            (ClaimSource::Scopes, &self.scopes),
            (ClaimSource::Permissions, &self.permissions),
        ];

        candidates
            .into_iter()
            .find_map(|(source, value)| {
                value
                    .as_ref()
                    .and_then(scope_values)
                    .map(|scopes| (source, scopes))
            })
            .unwrap_or((ClaimSource::None, BTreeSet::new()))
    }

    pub fn audience(&self) -> Vec<String> {
        match &self.aud {
            Some(Value::String(aud)) => vec![aud.clone()],
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// Scopes from a string (space-delimited) or an array of strings.
///
/// Returns `None` for shapes that cannot carry scopes, which lets the chain
/// move on to the next claim.
fn scope_values(value: &Value) -> Option<BTreeSet<String>> {
    let scopes = match value {
        Value::String(s) => s.split_whitespace().map(str::to_string).collect(),
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        _ => return None,
    };
    Some(scopes)
}
