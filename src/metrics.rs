//! Prometheus metrics for the gateway chain.
//!
//! Metrics are exposed via a dedicated HTTP listener (default: `0.0.0.0:9090`).
//! Every recording helper is a no-op when no recorder is installed, so the
//! components can be used in tests without initializing anything.
//!
//! # Available Metrics
//!
//! ## Counters
//! - `gateway_circuit_breaker_opens_total` - Times a breaker opened (label: breaker)
//! - `gateway_circuit_breaker_rejections_total` - Calls rejected while open (label: breaker)
//! - `gateway_circuit_breaker_transitions_total` - State transitions (labels: breaker, to)
//! - `gateway_jwks_refresh_total` - JWKS refresh outcomes (label: outcome)
//! - `gateway_jwks_stale_served_total` - Key lookups answered from a stale key set
//! - `gateway_auth_resolved_total` - Resolved tokens (labels: source, scheme)
//! - `gateway_auth_failures_total` - Rejected tokens (label: reason)
//! - `gateway_rate_limit_decisions_total` - Limiter decisions (labels: tier, outcome)
//! - `gateway_rate_limit_failovers_total` - Switches to the local backend
//! - `gateway_request_timeouts_total` - Requests cut off by the deadline
//! - `gateway_request_near_miss_total` - Requests that used >= 80% of their budget
//! - `gateway_waf_blocks_total` - WAF blocks (labels: rule, category)
//! - `gateway_waf_exempted_total` - Evaluations skipped by an exemption (label: category)
//! - `gateway_waf_false_positives_total` - Exempted evaluations that would have matched
//!
//! ## Histograms
//! - `gateway_request_duration_seconds` - Request duration (labels: method, status)
//!
//! ## Gauges
//! - `gateway_circuit_breaker_state` - Breaker state (0 = closed, 1 = half-open, 2 = open)
//! - `gateway_jwks_keys` - Keys in the current key set
//! - `gateway_rate_limit_degraded` - 1 while the limiter runs on the local backend

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::{error, info};

/// Metric names as constants for consistency.
pub mod names {
    pub const CIRCUIT_BREAKER_OPENS_TOTAL: &str = "gateway_circuit_breaker_opens_total";
    pub const CIRCUIT_BREAKER_REJECTIONS_TOTAL: &str = "gateway_circuit_breaker_rejections_total";
    pub const CIRCUIT_BREAKER_TRANSITIONS_TOTAL: &str = "gateway_circuit_breaker_transitions_total";
    pub const CIRCUIT_BREAKER_STATE: &str = "gateway_circuit_breaker_state";
    pub const JWKS_REFRESH_TOTAL: &str = "gateway_jwks_refresh_total";
    pub const JWKS_STALE_SERVED_TOTAL: &str = "gateway_jwks_stale_served_total";
    pub const JWKS_KEYS: &str = "gateway_jwks_keys";
    pub const AUTH_RESOLVED_TOTAL: &str = "gateway_auth_resolved_total";
    pub const AUTH_FAILURES_TOTAL: &str = "gateway_auth_failures_total";
    pub const RATE_LIMIT_DECISIONS_TOTAL: &str = "gateway_rate_limit_decisions_total";
    pub const RATE_LIMIT_FAILOVERS_TOTAL: &str = "gateway_rate_limit_failovers_total";
    pub const RATE_LIMIT_DEGRADED: &str = "gateway_rate_limit_degraded";
    pub const REQUEST_TIMEOUTS_TOTAL: &str = "gateway_request_timeouts_total";
    pub const REQUEST_NEAR_MISS_TOTAL: &str = "gateway_request_near_miss_total";
    pub const REQUEST_DURATION_SECONDS: &str = "gateway_request_duration_seconds";
    pub const WAF_BLOCKS_TOTAL: &str = "gateway_waf_blocks_total";
    pub const WAF_EXEMPTED_TOTAL: &str = "gateway_waf_exempted_total";
    pub const WAF_FALSE_POSITIVES_TOTAL: &str = "gateway_waf_false_positives_total";
}

/// Initialize the Prometheus metrics exporter.
///
/// Starts the HTTP listener on `metrics_addr` and registers descriptions for
/// every gateway metric.
pub fn init_metrics(metrics_addr: SocketAddr) -> Result<(), String> {
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .map_err(|e| format!("Failed to install Prometheus exporter: {e}"))?;

    describe_counter!(
        names::CIRCUIT_BREAKER_OPENS_TOTAL,
        "Total number of times a circuit breaker opened"
    );
    describe_counter!(
        names::CIRCUIT_BREAKER_REJECTIONS_TOTAL,
        "Total number of calls rejected by an open circuit breaker"
    );
    describe_counter!(
        names::CIRCUIT_BREAKER_TRANSITIONS_TOTAL,
        "Total number of circuit breaker state transitions"
    );
    describe_counter!(names::JWKS_REFRESH_TOTAL, "JWKS refresh attempts by outcome");
    describe_counter!(
        names::JWKS_STALE_SERVED_TOTAL,
        "Key lookups answered from a stale JWKS key set"
    );
    describe_counter!(
        names::AUTH_RESOLVED_TOTAL,
        "Successfully resolved bearer tokens by claim source and scheme"
    );
    describe_counter!(names::AUTH_FAILURES_TOTAL, "Rejected bearer tokens by reason");
    describe_counter!(
        names::RATE_LIMIT_DECISIONS_TOTAL,
        "Rate limiter decisions by tier and outcome"
    );
    describe_counter!(
        names::RATE_LIMIT_FAILOVERS_TOTAL,
        "Switches from the distributed rate-limit backend to the local backend"
    );
    describe_counter!(
        names::REQUEST_TIMEOUTS_TOTAL,
        "Requests cancelled by the request deadline"
    );
    describe_counter!(
        names::REQUEST_NEAR_MISS_TOTAL,
        "Requests that consumed at least 80% of their deadline"
    );
    describe_counter!(names::WAF_BLOCKS_TOTAL, "Requests blocked by the WAF");
    describe_counter!(
        names::WAF_EXEMPTED_TOTAL,
        "WAF rule evaluations skipped by an exemption"
    );
    describe_counter!(
        names::WAF_FALSE_POSITIVES_TOTAL,
        "Exempted WAF evaluations that would have matched"
    );

    describe_histogram!(
        names::REQUEST_DURATION_SECONDS,
        "HTTP request duration in seconds"
    );

    describe_gauge!(
        names::CIRCUIT_BREAKER_STATE,
        "Circuit breaker state (0 = closed, 1 = half-open, 2 = open)"
    );
    describe_gauge!(names::JWKS_KEYS, "Number of keys in the current JWKS key set");
    describe_gauge!(
        names::RATE_LIMIT_DEGRADED,
        "Rate limiter degraded mode (1 = local backend only)"
    );

    info!(addr = %metrics_addr, "Prometheus metrics endpoint started");
    Ok(())
}

/// Try to initialize metrics, logging any errors but not failing.
pub fn try_init_metrics(metrics_addr: SocketAddr) {
    if let Err(e) = init_metrics(metrics_addr) {
        error!(error = %e, "Failed to initialize metrics, continuing without metrics");
    }
}

// =============================================================================
// Circuit Breaker
// =============================================================================

/// Record a breaker opening.
pub fn record_circuit_breaker_open(breaker: &str) {
    counter!(names::CIRCUIT_BREAKER_OPENS_TOTAL, "breaker" => breaker.to_string()).increment(1);
}

/// Record a call rejected by an open breaker.
pub fn record_circuit_breaker_rejection(breaker: &str) {
    counter!(names::CIRCUIT_BREAKER_REJECTIONS_TOTAL, "breaker" => breaker.to_string())
        .increment(1);
}

/// Record a state transition and update the state gauge.
///
/// States: 0 = closed, 1 = half-open, 2 = open
pub fn record_circuit_breaker_transition(breaker: &str, to: &'static str, state: u8) {
    counter!(names::CIRCUIT_BREAKER_TRANSITIONS_TOTAL, "breaker" => breaker.to_string(), "to" => to)
        .increment(1);
    gauge!(names::CIRCUIT_BREAKER_STATE, "breaker" => breaker.to_string()).set(f64::from(state));
}

// =============================================================================
// JWKS / Auth
// =============================================================================

/// Record the outcome of a JWKS refresh (`updated`, `not_modified`, `failed`).
pub fn record_jwks_refresh(outcome: &'static str) {
    counter!(names::JWKS_REFRESH_TOTAL, "outcome" => outcome).increment(1);
}

/// Record a lookup answered from a stale key set.
pub fn record_jwks_stale_served() {
    counter!(names::JWKS_STALE_SERVED_TOTAL).increment(1);
}

/// Update the key count gauge.
pub fn set_jwks_keys(count: usize) {
    gauge!(names::JWKS_KEYS).set(count as f64);
}

/// Record a resolved token.
pub fn record_auth_resolved(source: &'static str, scheme: &'static str) {
    counter!(names::AUTH_RESOLVED_TOTAL, "source" => source, "scheme" => scheme).increment(1);
}

/// Record a rejected token.
pub fn record_auth_failure(reason: &'static str) {
    counter!(names::AUTH_FAILURES_TOTAL, "reason" => reason).increment(1);
}

// =============================================================================
// Rate Limiting
// =============================================================================

/// Record a limiter decision (`allowed` / `throttled`).
pub fn record_rate_limit_decision(tier: &str, outcome: &'static str) {
    counter!(names::RATE_LIMIT_DECISIONS_TOTAL, "tier" => tier.to_string(), "outcome" => outcome)
        .increment(1);
}

/// Record a failover to the local backend.
pub fn record_rate_limit_failover() {
    counter!(names::RATE_LIMIT_FAILOVERS_TOTAL).increment(1);
}

/// Update the degraded-mode gauge.
pub fn set_rate_limit_degraded(degraded: bool) {
    gauge!(names::RATE_LIMIT_DEGRADED).set(if degraded { 1.0 } else { 0.0 });
}

// =============================================================================
// Deadlines / Requests
// =============================================================================

/// Record a request cut off by its deadline.
pub fn record_request_timeout() {
    counter!(names::REQUEST_TIMEOUTS_TOTAL).increment(1);
}

/// Record a request that completed close to its deadline.
pub fn record_request_near_miss() {
    counter!(names::REQUEST_NEAR_MISS_TOTAL).increment(1);
}

/// Record HTTP request duration.
pub fn record_request_duration(method: &str, status: u16, duration_secs: f64) {
    histogram!(names::REQUEST_DURATION_SECONDS, "method" => method.to_string(), "status" => status.to_string())
        .record(duration_secs);
}

// =============================================================================
// WAF
// =============================================================================

/// Record a WAF block.
pub fn record_waf_block(rule_id: &'static str, category: &'static str) {
    counter!(names::WAF_BLOCKS_TOTAL, "rule" => rule_id, "category" => category).increment(1);
}

/// Record an exempted evaluation.
pub fn record_waf_exempted(category: &'static str) {
    counter!(names::WAF_EXEMPTED_TOTAL, "category" => category).increment(1);
}

/// Record an exempted evaluation whose rule would have matched.
pub fn record_waf_false_positive(rule_id: &'static str, category: &'static str) {
    counter!(names::WAF_FALSE_POSITIVES_TOTAL, "rule" => rule_id, "category" => category)
        .increment(1);
}
