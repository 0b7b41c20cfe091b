//! The request-gateway middleware chain.
//!
//! # Architecture
//!
//! ```text
//! Request → Request ID → Trace → Deadline → WAF → Rate Limit → Auth → RequireScope → Handler
//!              ↓                    ↓        ↓         ↓          ↓          ↓
//!        X-Request-Id             504      403       429        401/503    403
//! ```
//!
//! A request rejected by the WAF or the rate limiter never reaches the token
//! validator. Every rejection is a [`GatewayError`](crate::error::GatewayError)
//! rendered as the standard error envelope.
//!
//! # Security Considerations
//!
//! - WAF and auth fail closed; rate-limit backend failures fall back to local limiting
//! - Trusted proxy configuration mitigates IP spoofing of the rate-limit key
//! - Request IDs enable audit trails and debugging

pub mod auth;
pub mod ip;
pub mod rate_limit;
pub mod request_id;
pub mod scope;
pub mod timeout;
pub mod waf;

pub use auth::{BearerAuthLayer, DEFAULT_PUBLIC_PATHS};
pub use ip::{CidrRange, TRUST_ALL_PROXIES, TrustedProxyConfig, UNKNOWN_IP, client_ip};
pub use rate_limit::RateLimitLayer;
pub use request_id::{REQUEST_ID_HEADER, RequestIdLayer};
pub use scope::RequireScope;
pub use timeout::{
    MIN_REQUEST_TIMEOUT, REQUEST_TIMEOUT_HEADER, RequestTimeoutLayer, TimeoutConfig,
};
pub use waf::WafLayer;
