//! Bearer token authentication middleware.
//!
//! # Usage
//!
//! ```bash
//! curl -H "Authorization: Bearer eyJhbGciOi..." http://localhost:3000/scholarships
//! ```
//!
//! The token is validated by the [`AuthClaimsResolver`] and the resolved
//! claims are stored as an `Arc<AuthClaims>` request extension. Failures are
//! answered with the error envelope: `401` with `WWW-Authenticate: Bearer`
//! for bad tokens, `503` when signing keys are unavailable.
//!
//! # Public Paths
//!
//! Paths in the public list (default `/health`, `/ready`) skip authentication.
//! Matching is exact and case-sensitive: `/health/` is NOT public.

use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::{Request, Response, header};
use axum::response::IntoResponse;
use tower::{Layer, Service};
use tracing::{debug, warn};

use crate::auth::{AuthClaimsResolver, AuthError};
use crate::error::GatewayError;
use crate::metrics;

/// Default paths that bypass authentication.
pub const DEFAULT_PUBLIC_PATHS: [&str; 2] = ["/health", "/ready"];

const BEARER_PREFIX: &str = "bearer ";

/// Bearer authentication layer.
#[derive(Clone)]
pub struct BearerAuthLayer {
    resolver: Arc<AuthClaimsResolver>,
    public_paths: Arc<Vec<String>>,
}

impl BearerAuthLayer {
    pub fn new(resolver: Arc<AuthClaimsResolver>, public_paths: Vec<String>) -> Self {
        Self {
            resolver,
            public_paths: Arc::new(public_paths),
        }
    }

    /// Create with default public paths ("/health", "/ready").
    pub fn with_defaults(resolver: Arc<AuthClaimsResolver>) -> Self {
        Self::new(
            resolver,
            DEFAULT_PUBLIC_PATHS.iter().map(|s| (*s).to_string()).collect(),
        )
    }
}

impl<S> Layer<S> for BearerAuthLayer {
    type Service = BearerAuthService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        BearerAuthService {
            inner,
            resolver: self.resolver.clone(),
            public_paths: self.public_paths.clone(),
        }
    }
}

#[derive(Clone)]
pub struct BearerAuthService<S> {
    inner: S,
    resolver: Arc<AuthClaimsResolver>,
    public_paths: Arc<Vec<String>>,
}

impl<S> Service<Request<Body>> for BearerAuthService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        let path = req.uri().path();
        if self.public_paths.iter().any(|p| p == path) {
            debug!(path, "Bypassing auth for public path");
            return Box::pin(inner.call(req));
        }

        let resolver = self.resolver.clone();
        let token = extract_bearer_token(&req).map(str::to_string);

        Box::pin(async move {
            let result = match token {
                Ok(token) => resolver.resolve(&token).await,
                Err(e) => {
                    metrics::record_auth_failure(e.reason());
                    Err(e)
                }
            };

            match result {
                Ok(claims) => {
                    req.extensions_mut().insert(Arc::new(claims));
                    inner.call(req).await
                }
                Err(e) => {
                    warn!(
                        path = %req.uri().path(),
                        reason = e.reason(),
                        error = %e,
                        "Authentication failed"
                    );
                    Ok(GatewayError::from(e).into_response())
                }
            }
        })
    }
}

/// Token from `Authorization: Bearer <token>`. The scheme is case-insensitive.
fn extract_bearer_token<B>(req: &Request<B>) -> Result<&str, AuthError> {
    let value = req
        .headers()
        .get(header::AUTHORIZATION)
        .ok_or(AuthError::MissingToken)?
        .to_str()
        .map_err(|_| AuthError::MalformedHeader)?
        .trim();

    let prefix = value.get(..BEARER_PREFIX.len()).ok_or(AuthError::MalformedHeader)?;
    if !prefix.eq_ignore_ascii_case(BEARER_PREFIX) {
        return Err(AuthError::MalformedHeader);
    }

    let token = value.get(BEARER_PREFIX.len()..).unwrap_or_default().trim();
    if token.is_empty() || token.contains(char::is_whitespace) {
        return Err(AuthError::MalformedHeader);
    }
    Ok(token)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::auth::{AuthClaims, ResolverConfig};
    use axum::Router;
    use axum::extract::Extension;
    use axum::http::StatusCode;
    use axum::routing::get;
    use jsonwebtoken::{EncodingKey, Header, encode};
    use tower::ServiceExt;

    const SECRET: &str = "test-secret-test-secret-test-secret!";

    fn token(claims: serde_json::Value) -> String {
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    fn exp() -> u64 {
        (chrono::Utc::now().timestamp() + 600) as u64
    }

    fn app() -> Router {
        let resolver = AuthClaimsResolver::new(
            None,
            ResolverConfig {
                shared_secret: Some(SECRET.to_string()),
                ..ResolverConfig::default()
            },
        );
        Router::new()
            .route(
                "/me",
                get(|Extension(claims): Extension<Arc<AuthClaims>>| async move {
                    claims.subject.clone()
                }),
            )
            .route("/health", get(|| async { "ok" }))
            .layer(BearerAuthLayer::with_defaults(Arc::new(resolver)))
    }

    fn request(path: &str, auth: Option<&str>) -> Request<Body> {
        let mut builder = Request::get(path);
        if let Some(auth) = auth {
            builder = builder.header(header::AUTHORIZATION, auth);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn test_extract_bearer_token() {
        let req = request("/", Some("Bearer abc.def.ghi"));
        assert_eq!(extract_bearer_token(&req).unwrap(), "abc.def.ghi");

        let req = request("/", Some("bearer abc.def.ghi"));
        assert_eq!(extract_bearer_token(&req).unwrap(), "abc.def.ghi");
    }

    #[test]
    fn test_extract_bearer_token_errors() {
        assert!(matches!(
            extract_bearer_token(&request("/", None)),
            Err(AuthError::MissingToken)
        ));
        assert!(matches!(
            extract_bearer_token(&request("/", Some("Basic dXNlcjpwYXNz"))),
            Err(AuthError::MalformedHeader)
        ));
        assert!(matches!(
            extract_bearer_token(&request("/", Some("Bearer "))),
            Err(AuthError::MalformedHeader)
        ));
        assert!(matches!(
            extract_bearer_token(&request("/", Some("Bearer a b"))),
            Err(AuthError::MalformedHeader)
        ));
    }

    #[tokio::test]
    async fn test_valid_token_attaches_claims() {
        let token = token(serde_json::json!({
            "sub": "student-1",
            "exp": exp(),
            "scope": "scholarships:read"
        }));
        let response = app()
            .oneshot(request("/me", Some(&format!("Bearer {token}"))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"student-1");
    }

    #[tokio::test]
    async fn test_missing_token_is_401_with_challenge() {
        let response = app().oneshot(request("/me", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers().get(header::WWW_AUTHENTICATE).unwrap(),
            "Bearer"
        );
    }

    #[tokio::test]
    async fn test_token_without_claims_is_401() {
        let token = token(serde_json::json!({ "sub": "student-1", "exp": exp() }));
        let response = app()
            .oneshot(request("/me", Some(&format!("Bearer {token}"))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = axum::body::to_bytes(response.into_body(), 4096).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["message"], "missing all authorization claims");
    }

    #[tokio::test]
    async fn test_public_path_skips_auth() {
        let response = app().oneshot(request("/health", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app().oneshot(request("/health/", None)).await.unwrap();
        assert_ne!(response.status(), StatusCode::OK);
    }
}
