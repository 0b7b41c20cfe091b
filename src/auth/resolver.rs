//! Bearer token validation.

use std::sync::Arc;
use std::time::Duration;

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use tracing::{debug, warn};

use super::AuthError;
use super::claims::{AuthClaims, AuthScheme, ClaimSource, RawClaims};
use super::jwks::JwksCache;
use crate::metrics;

/// Claim checks applied to every token.
#[derive(Debug, Clone, Default)]
pub struct ResolverConfig {
    /// Required `iss`, when set.
    pub issuer: Option<String>,
    /// Required `aud` member, when set.
    pub audience: Option<String>,
    /// HS256 fallback secret. HS256 tokens are rejected without it.
    pub shared_secret: Option<String>,
    /// Clock skew tolerance for `exp` / `nbf`.
    pub leeway: Duration,
}

/// Validates bearer tokens and resolves their granted scopes.
///
/// RS256/RS384/RS512 tokens are verified against the JWKS cache; HS256 tokens
/// against the shared secret. Every other algorithm is rejected.
#[derive(Clone)]
pub struct AuthClaimsResolver {
    jwks: Option<Arc<JwksCache>>,
    shared_key: Option<DecodingKey>,
    config: ResolverConfig,
}

impl std::fmt::Debug for AuthClaimsResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthClaimsResolver")
            .field("jwks", &self.jwks.is_some())
            .field("shared_secret", &self.shared_key.is_some())
            .field("issuer", &self.config.issuer)
            .field("audience", &self.config.audience)
            .finish()
    }
}

impl AuthClaimsResolver {
    pub fn new(jwks: Option<Arc<JwksCache>>, config: ResolverConfig) -> Self {
        let shared_key = config
            .shared_secret
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(|s| DecodingKey::from_secret(s.as_bytes()));
        Self {
            jwks,
            shared_key,
            config,
        }
    }

    pub fn jwks(&self) -> Option<&Arc<JwksCache>> {
        self.jwks.as_ref()
    }

    /// Validate `token` and resolve its claims.
    pub async fn resolve(&self, token: &str) -> Result<AuthClaims, AuthError> {
        let result = self.resolve_inner(token).await;
        match &result {
            Ok(claims) => {
                metrics::record_auth_resolved(claims.source.as_str(), claims.scheme.as_str());
                debug!(
                    subject = %claims.subject,
                    source = %claims.source,
                    scheme = claims.scheme.as_str(),
                    scopes = claims.granted_scopes.len(),
                    "Token resolved"
                );
            }
            Err(e) => {
                metrics::record_auth_failure(e.reason());
                warn!(reason = e.reason(), error = %e, "Token rejected");
            }
        }
        result
    }

    async fn resolve_inner(&self, token: &str) -> Result<AuthClaims, AuthError> {
        let header = decode_header(token)
            .map_err(|_| AuthError::InvalidToken("malformed token".to_string()))?;

        let (key, scheme) = match header.alg {
            Algorithm::RS256 | Algorithm::RS384 | Algorithm::RS512 => {
                let jwks = self
                    .jwks
                    .as_ref()
                    .ok_or_else(|| AuthError::UnsupportedAlgorithm(format!("{:?}", header.alg)))?;
                let kid = header.kid.as_deref().ok_or(AuthError::MissingKid)?;
                (jwks.get_key(kid).await?, AuthScheme::Jwks)
            }
            Algorithm::HS256 => {
                let key = self
                    .shared_key
                    .clone()
                    .ok_or_else(|| AuthError::UnsupportedAlgorithm("HS256".to_string()))?;
                (key, AuthScheme::SharedSecret)
            }
            other => return Err(AuthError::UnsupportedAlgorithm(format!("{other:?}"))),
        };

        let data = decode::<RawClaims>(token, &key, &self.validation(header.alg))
            .map_err(|e| map_jwt_error(e.kind()))?;
        let raw = data.claims;

        let (source, granted_scopes) = raw.granted_scopes();
        if source == ClaimSource::None {
            return Err(AuthError::MissingClaims);
        }

        if scheme == AuthScheme::SharedSecret {
            debug!(subject = %raw.sub, "Token verified with shared-secret fallback");
        }

        Ok(AuthClaims {
            audience: raw.audience(),
            subject: raw.sub,
            issuer: raw.iss,
            expires_at: raw.exp,
            granted_scopes,
            source,
            scheme,
        })
    }

    fn validation(&self, alg: Algorithm) -> Validation {
        let mut validation = Validation::new(alg);
        validation.leeway = self.config.leeway.as_secs();
        validation.validate_exp = true;
        validation.validate_nbf = true;
        validation.set_required_spec_claims(&["exp", "sub"]);

        if let Some(issuer) = &self.config.issuer {
            validation.set_issuer(&[issuer]);
        }
        match &self.config.audience {
            Some(audience) => validation.set_audience(&[audience]),
            None => validation.validate_aud = false,
        }
        validation
    }
}

fn map_jwt_error(kind: &ErrorKind) -> AuthError {
    match kind {
        ErrorKind::ExpiredSignature => AuthError::Expired,
        ErrorKind::ImmatureSignature => AuthError::InvalidToken("token not yet valid".to_string()),
        ErrorKind::InvalidSignature => AuthError::InvalidToken("invalid signature".to_string()),
        ErrorKind::InvalidIssuer => AuthError::InvalidToken("invalid issuer".to_string()),
        ErrorKind::InvalidAudience => AuthError::InvalidToken("invalid audience".to_string()),
        ErrorKind::MissingRequiredClaim(claim) => {
            AuthError::InvalidToken(format!("missing required claim '{claim}'"))
        }
        ErrorKind::InvalidAlgorithm => AuthError::InvalidToken("algorithm mismatch".to_string()),
        _ => AuthError::InvalidToken("malformed token".to_string()),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use jsonwebtoken::{EncodingKey, Header, encode};
    use serde_json::{Value, json};

    const SECRET: &str = "test-shared-secret";

    fn now() -> u64 {
        chrono::Utc::now().timestamp() as u64
    }

    fn hs256(claims: Value) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    fn resolver(config: ResolverConfig) -> AuthClaimsResolver {
        AuthClaimsResolver::new(
            None,
            ResolverConfig {
                shared_secret: Some(SECRET.to_string()),
                ..config
            },
        )
    }

    #[tokio::test]
    async fn test_hs256_fallback_resolves_scope() {
        let token = hs256(json!({
            "sub": "student-7",
            "exp": now() + 600,
            "scope": "scholarships:read applications:write"
        }));

        let claims = resolver(ResolverConfig::default())
            .resolve(&token)
            .await
            .unwrap();

        assert_eq!(claims.subject, "student-7");
        assert_eq!(claims.scheme, AuthScheme::SharedSecret);
        assert_eq!(claims.source, ClaimSource::Scope);
        assert!(claims.has_scope("applications:write"));
    }

    #[tokio::test]
    async fn test_permissions_only_token() {
        let token = hs256(json!({
            "sub": "provider-1",
            "exp": now() + 600,
            "permissions": ["scholarships:write"]
        }));

        let claims = resolver(ResolverConfig::default())
            .resolve(&token)
            .await
            .unwrap();
        assert_eq!(claims.source, ClaimSource::Permissions);
        assert_eq!(
            claims.granted_scopes.into_iter().collect::<Vec<_>>(),
            vec!["scholarships:write".to_string()]
        );
    }

    #[tokio::test]
    async fn test_token_without_authorization_claims_is_rejected() {
        let token = hs256(json!({ "sub": "u", "exp": now() + 600 }));
        let err = resolver(ResolverConfig::default())
            .resolve(&token)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::MissingClaims));
        assert_eq!(err.to_string(), "missing all authorization claims");
    }

    #[tokio::test]
    async fn test_expired_token_is_rejected() {
        let token = hs256(json!({ "sub": "u", "exp": now() - 3600, "scope": "a" }));
        let err = resolver(ResolverConfig::default())
            .resolve(&token)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Expired));
    }

    #[tokio::test]
    async fn test_future_nbf_is_rejected() {
        let token = hs256(json!({
            "sub": "u",
            "exp": now() + 3600,
            "nbf": now() + 1800,
            "scope": "a"
        }));
        let err = resolver(ResolverConfig::default())
            .resolve(&token)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidToken(_)));
    }

    #[tokio::test]
    async fn test_issuer_and_audience_enforced() {
        let config = ResolverConfig {
            issuer: Some("https://id.example.com/".to_string()),
            audience: Some("scholarship-api".to_string()),
            ..ResolverConfig::default()
        };
        let r = resolver(config);

        let good = hs256(json!({
            "sub": "u", "exp": now() + 600, "scope": "a",
            "iss": "https://id.example.com/", "aud": "scholarship-api"
        }));
        assert!(r.resolve(&good).await.is_ok());

        let wrong_aud = hs256(json!({
            "sub": "u", "exp": now() + 600, "scope": "a",
            "iss": "https://id.example.com/", "aud": "other-api"
        }));
        assert!(r.resolve(&wrong_aud).await.is_err());

        let wrong_iss = hs256(json!({
            "sub": "u", "exp": now() + 600, "scope": "a",
            "iss": "https://evil.example.com/", "aud": "scholarship-api"
        }));
        assert!(r.resolve(&wrong_iss).await.is_err());
    }

    #[tokio::test]
    async fn test_wrong_secret_is_rejected() {
        let token = encode(
            &Header::new(Algorithm::HS256),
            &json!({ "sub": "u", "exp": now() + 600, "scope": "a" }),
            &EncodingKey::from_secret(b"not-the-secret"),
        )
        .unwrap();
        let err = resolver(ResolverConfig::default())
            .resolve(&token)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidToken(_)));
    }

    #[tokio::test]
    async fn test_hs256_without_secret_is_rejected() {
        let token = hs256(json!({ "sub": "u", "exp": now() + 600, "scope": "a" }));
        let r = AuthClaimsResolver::new(None, ResolverConfig::default());
        assert!(matches!(
            r.resolve(&token).await,
            Err(AuthError::UnsupportedAlgorithm(_))
        ));
    }

    #[tokio::test]
    async fn test_other_algorithms_are_rejected() {
        let token = encode(
            &Header::new(Algorithm::HS512),
            &json!({ "sub": "u", "exp": now() + 600, "scope": "a" }),
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap();
        assert!(matches!(
            resolver(ResolverConfig::default()).resolve(&token).await,
            Err(AuthError::UnsupportedAlgorithm(_))
        ));
    }

    #[tokio::test]
    async fn test_unsigned_token_is_rejected() {
        // {"alg":"none","typ":"JWT"} . {"sub":"u","scope":"a"} .
        let token = "eyJhbGciOiJub25lIiwidHlwIjoiSldUIn0.eyJzdWIiOiJ1Iiwic2NvcGUiOiJhIn0.";
        assert!(
            resolver(ResolverConfig::default())
                .resolve(token)
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_rs256_without_jwks_is_rejected() {
        let pem = include_bytes!("../../tests/fixtures/rsa_private.pem");
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some("test-key-1".to_string());
        let token = encode(
            &header,
            &json!({ "sub": "u", "exp": now() + 600, "scope": "a" }),
            &EncodingKey::from_rsa_pem(pem).unwrap(),
        )
        .unwrap();

        assert!(matches!(
            resolver(ResolverConfig::default()).resolve(&token).await,
            Err(AuthError::UnsupportedAlgorithm(_))
        ));
    }
}
