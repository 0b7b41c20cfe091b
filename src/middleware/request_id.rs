//! Request ID middleware for correlation.
//!
//! # Features
//!
//! - Accepts a client `X-Request-Id` or generates a UUIDv4
//! - Stores it as a [`CorrelationId`] extension and in the request headers
//! - Runs the rest of the chain with it as the task-local correlation id, so
//!   error envelopes built anywhere below carry it
//! - Echoes `X-Request-Id` on every response
//!
//! ```bash
//! curl -H "X-Request-Id: my-correlation-id" http://localhost:3000/scholarships
//! ```

use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::header::HeaderValue;
use axum::http::{Request, Response};
use tower::{Layer, Service};
use tracing::debug;
use uuid::Uuid;

use crate::context::{CorrelationId, scope_correlation_id};

/// Header name for request ID.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Client-supplied ids longer than this are replaced.
const MAX_REQUEST_ID_LEN: usize = 128;

/// Request ID layer for Tower middleware stack.
#[derive(Clone, Default)]
pub struct RequestIdLayer;

impl RequestIdLayer {
    pub fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for RequestIdLayer {
    type Service = RequestIdService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestIdService { inner }
    }
}

#[derive(Clone)]
pub struct RequestIdService<S> {
    inner: S,
}

impl<S> Service<Request<Body>> for RequestIdService<S>
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
        let (request_id, header_value) = extract_or_generate_request_id(&req);

        req.headers_mut()
            .insert(REQUEST_ID_HEADER, header_value.clone());
        req.extensions_mut()
            .insert(CorrelationId(request_id.clone()));

        debug!(request_id = %request_id, "Processing request");

        // Swap in the clone so the service that was polled ready is the one called.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(scope_correlation_id(request_id, async move {
            let mut response = inner.call(req).await?;
            response
                .headers_mut()
                .insert(REQUEST_ID_HEADER, header_value);
            Ok(response)
        }))
    }
}

/// Client id if present and sane, otherwise a fresh UUID.
fn extract_or_generate_request_id<B>(req: &Request<B>) -> (String, HeaderValue) {
    if let Some(header_value) = req.headers().get(REQUEST_ID_HEADER)
        && let Ok(value) = header_value.to_str()
        && !value.is_empty()
        && value.len() <= MAX_REQUEST_ID_LEN
    {
        return (value.to_string(), header_value.clone());
    }

    let id = Uuid::new_v4().to_string();
    // A hyphenated UUID is always a valid header value.
    let value = HeaderValue::from_str(&id).unwrap_or(HeaderValue::from_static("unknown"));
    (id, value)
}
