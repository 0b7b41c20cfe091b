//! Route-level scope check.
//!
//! Applied per route with `route_layer`, after authentication has attached the
//! caller's claims:
//!
//! ```rust,ignore
//! Router::new().route(
//!     "/scholarships",
//!     post(create).route_layer(RequireScope::new("scholarships:write")),
//! )
//! ```

use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::{Request, Response};
use axum::response::IntoResponse;
use tower::{Layer, Service};
use tracing::warn;

use crate::auth::AuthClaims;
use crate::context::RequiredScope;
use crate::error::GatewayError;

#[derive(Clone)]
pub struct RequireScope {
    scope: Arc<str>,
}

impl RequireScope {
    pub fn new(scope: &str) -> Self {
        Self {
            scope: Arc::from(scope),
        }
    }
}

impl<S> Layer<S> for RequireScope {
    type Service = RequireScopeService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequireScopeService {
            inner,
            scope: self.scope.clone(),
        }
    }
}

#[derive(Clone)]
pub struct RequireScopeService<S> {
    inner: S,
    scope: Arc<str>,
}

impl<S> Service<Request<Body>> for RequireScopeService<S>
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

        req.extensions_mut()
            .insert(RequiredScope(self.scope.to_string()));

        let Some(claims) = req.extensions().get::<Arc<AuthClaims>>().cloned() else {
            let err = GatewayError::Unauthorized("authentication required".to_string());
            return Box::pin(async move { Ok(err.into_response()) });
        };

        if let Err(e) = claims.ensure_scope(&self.scope) {
            warn!(
                subject = %claims.subject,
                required_scope = %self.scope,
                path = %req.uri().path(),
                "Caller lacks required scope"
            );
            let err = GatewayError::from(e);
            return Box::pin(async move { Ok(err.into_response()) });
        }

        Box::pin(inner.call(req))
    }
}
