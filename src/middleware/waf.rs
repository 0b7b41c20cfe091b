//! WAF middleware.
//!
//! Buffers the request body (up to the filter's inspection limit), runs
//! [`WafFilter::inspect`] over path, query and body, and either forwards the
//! rebuilt request or answers `403 waf_blocked`. Bodies that cannot be read
//! within the limit are blocked.

use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::{Request, Response, header};
use axum::response::IntoResponse;
use tower::{Layer, Service};
use tracing::debug;

use crate::error::GatewayError;
use crate::waf::{WafFilter, WafRequest, WafVerdict};

/// WAF layer for Tower middleware stack.
#[derive(Clone)]
pub struct WafLayer {
    filter: Arc<WafFilter>,
}

impl WafLayer {
    pub fn new(filter: Arc<WafFilter>) -> Self {
        Self { filter }
    }
}

impl<S> Layer<S> for WafLayer {
    type Service = WafService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        WafService {
            inner,
            filter: self.filter.clone(),
        }
    }
}

#[derive(Clone)]
pub struct WafService<S> {
    inner: S,
    filter: Arc<WafFilter>,
}

fn blocked(verdict: WafVerdict) -> Response<Body> {
    match verdict {
        WafVerdict::Block { rule_id, category } => GatewayError::WafBlocked {
            rule_id: rule_id.to_string(),
            category,
        }
        .into_response(),
        WafVerdict::Pass => {
            GatewayError::Internal("WAF pass verdict treated as block".to_string()).into_response()
        }
    }
}

impl<S> Service<Request<Body>> for WafService<S>
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

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let filter = self.filter.clone();
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        // Reject declared oversize bodies before reading anything.
        let declared_len = req
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<usize>().ok());
        if declared_len.is_some_and(|len| len > filter.max_body_bytes()) {
            let verdict = filter.oversize_verdict(req.uri().path());
            return Box::pin(async move { Ok(blocked(verdict)) });
        }

        let (parts, body) = req.into_parts();

        Box::pin(async move {
            let bytes = match axum::body::to_bytes(body, filter.max_body_bytes()).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    debug!(error = %e, path = %parts.uri.path(), "Failed to buffer request body");
                    return Ok(blocked(filter.oversize_verdict(parts.uri.path())));
                }
            };

            let verdict = filter.inspect(&WafRequest {
                method: &parts.method,
                path: parts.uri.path(),
                query: parts.uri.query(),
                content_type: parts
                    .headers
                    .get(header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok()),
                body: &bytes,
            });

            match verdict {
                WafVerdict::Pass => inner.call(Request::from_parts(parts, Body::from(bytes))).await,
                block => Ok(blocked(block)),
            }
        })
    }
}
