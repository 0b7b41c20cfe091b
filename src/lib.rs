//! # Scholarship Gateway
//!
//! The request-gateway middleware chain in front of a scholarship-discovery
//! REST backend, built on Axum and Tower:
//!
//! - **Authentication**: JWT bearer tokens verified against a cached JWKS key
//!   set (with a shared-secret fallback), scopes resolved `scope` → `scopes`
//!   → `permissions`
//! - **Resilience**: circuit breaker with explicit retry policy in front of
//!   the identity provider, per-request deadlines
//! - **Rate limiting**: token buckets in Redis with automatic failover to
//!   in-process limiting
//! - **Filtering**: heuristic WAF with a declarative exemption table
//! - **Observability**: request ids, structured logging, Prometheus metrics
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Axum HTTP Server                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Request ID → Trace → Deadline → WAF → Rate Limit → Auth    │
//! ├─────────────────────────────────────────────────────────────┤
//! │  RequireScope → Handlers (health, auth, scholarships)       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  JwksCache + CircuitBreaker   │   RateLimiter backends      │
//! ├───────────────────────────────┼─────────────────────────────┤
//! │  Identity provider (JWKS)     │   Redis / local governor    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use scholarship_gateway::{AppState, Config, build_router};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!     let state = AppState::new(config)?;
//!     let app = build_router(state);
//!
//!     // Start the server...
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration
//!
//! ```bash
//! JWKS_URL=https://id.example.com/.well-known/jwks.json \
//! RATE_LIMIT_REDIS_URL=redis://127.0.0.1:6379 \
//! RATE_LIMIT_TIERS="default=120/60+30,auth=10/60+5" \
//! cargo run
//! ```

pub mod auth;
pub mod config;
pub mod context;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod rate_limit;
pub mod resilience;
pub mod routes;
pub mod state;
pub mod utils;
pub mod validation;
pub mod waf;

// Re-exports for convenience
pub use config::{Config, LogFormat};
pub use error::{GatewayError, GatewayResult};
pub use routes::build_router;
pub use state::AppState;
