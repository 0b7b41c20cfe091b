//! Gateway configuration loaded from environment variables.
//!
//! All configuration is loaded from environment variables with defaults suited
//! to development. In production, configure via environment variables or a
//! `.env` file.
//!
//! # Authentication
//!
//! - `JWKS_URL`: identity provider key set; enables RS256/RS384/RS512 tokens
//! - `JWT_SHARED_SECRET`: enables HS256 fallback tokens
//! - `JWT_ISSUER` / `JWT_AUDIENCE`: required `iss` / `aud` when set
//!
//! At least one of `JWKS_URL` and `JWT_SHARED_SECRET` must be set.
//!
//! # Rate limiting
//!
//! - `RATE_LIMIT_TIERS`: `name=capacity/window_secs+burst,...`
//! - `RATE_LIMIT_ROUTE_CLASSES`: `/prefix=tier,...`
//! - `RATE_LIMIT_REDIS_URL`: shared backend; local-only when unset
//! - `TRUSTED_PROXIES`: CIDRs whose `X-Forwarded-For` is believed; `*` trusts
//!   every source
//!
//! # WAF
//!
//! - `WAF_EXEMPTIONS`: `METHOD|* path[*]=cat+cat;...` (default exempts
//!   `POST /auth/login` from `sqli`)

use std::env;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::auth::{JwksConfig, ResolverConfig};
use crate::error::{GatewayError, GatewayResult};
use crate::middleware::timeout::{MIN_REQUEST_TIMEOUT, TimeoutConfig};
use crate::rate_limit::{RateLimiterConfig, RouteClasses, TierTable};
use crate::resilience::{CircuitBreakerConfig, RetryPolicy};
use crate::waf::{ExemptionTable, WafConfig};

/// Shortest shared secret accepted without a warning (HS256 key size).
const RECOMMENDED_SECRET_LEN: usize = 32;

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("expected 'text' or 'json', got '{other}'")),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Text => f.write_str("text"),
            LogFormat::Json => f.write_str("json"),
        }
    }
}

/// Gateway configuration.
///
/// ```rust,ignore
/// let config = Config::from_env()?;
/// println!("Server will listen on {}", config.server_addr());
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    // =========================================================================
    // Server
    // =========================================================================
    pub host: String,
    pub port: u16,

    // =========================================================================
    // Authentication
    // =========================================================================
    /// Identity provider key set URL. RS-signed tokens are rejected without it.
    pub jwks_url: Option<String>,
    pub jwt_issuer: Option<String>,
    pub jwt_audience: Option<String>,
    /// HS256 fallback secret.
    pub jwt_shared_secret: Option<String>,
    /// Clock skew tolerance for `exp` / `nbf` (default: 30s)
    pub jwt_leeway: Duration,

    // =========================================================================
    // JWKS cache
    // =========================================================================
    /// Used when the provider sends no `Cache-Control: max-age` (default: 300s)
    pub jwks_cache_ttl: Duration,
    /// How long past its TTL a key set may be served while refreshes fail (default: 600s)
    pub jwks_stale_grace: Duration,
    pub jwks_fetch_timeout: Duration,
    pub jwks_breaker_failure_threshold: u32,
    pub jwks_breaker_open_duration: Duration,
    pub jwks_retry_max_attempts: u32,
    pub jwks_retry_base_delay: Duration,
    pub jwks_retry_max_delay: Duration,

    // =========================================================================
    // Rate limiting
    // =========================================================================
    pub rate_limit_enabled: bool,
    /// Shared backend. When unset, each instance limits on its own.
    pub rate_limit_redis_url: Option<String>,
    pub rate_limit_tiers: TierTable,
    pub rate_limit_route_classes: RouteClasses,
    /// Round-trip budget before failing over to local limiting (default: 100ms)
    pub rate_limit_backend_timeout: Duration,
    /// Probe interval for the shared backend while degraded (default: 5 min)
    pub rate_limit_reconnect_interval: Duration,

    // =========================================================================
    // WAF
    // =========================================================================
    pub waf_enabled: bool,
    pub waf_exemptions: ExemptionTable,
    /// Bodies above this size are blocked without inspection (default: 1 MiB)
    pub waf_max_body_bytes: usize,

    // =========================================================================
    // Request deadline
    // =========================================================================
    /// Global per-request deadline (default: 5s)
    pub request_timeout: Duration,
    /// Paths exempt from the deadline.
    pub timeout_excluded_paths: Vec<String>,

    // =========================================================================
    // HTTP surface
    // =========================================================================
    /// Paths that skip bearer authentication. Default: `/health`, `/ready`.
    pub auth_public_paths: Vec<String>,

    /// Trusted proxy CIDR ranges. `X-Forwarded-For` is only honored for
    /// connections from these networks.
    ///
    /// Format: comma-separated CIDR notation (e.g. "10.0.0.0/8,172.16.0.0/12").
    /// Empty ignores forwarding headers and keys on the peer address. `*`
    /// trusts every source, which allows IP spoofing of the rate-limit key.
    pub trusted_proxies: Vec<String>,

    /// Hard cap on request bodies (default: 2 MiB)
    pub max_request_body_size: usize,

    /// Use "*" to allow all origins (not recommended for production)
    pub cors_allowed_origins: Vec<String>,

    // =========================================================================
    // Observability
    // =========================================================================
    pub log_level: String,
    pub log_format: LogFormat,
    /// Port for Prometheus metrics endpoint (default: 9090, 0 = disabled)
    pub metrics_port: u16,
}

impl Config {
    /// Load configuration from environment variables with defaults.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::ConfigError` if any value fails to parse or the
    /// combination is invalid.
    pub fn from_env() -> GatewayResult<Self> {
        // Load an .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();
        let defaults = Self::default();

        let config = Self {
            host: env::var("HOST").unwrap_or(defaults.host),
            port: parse_env("PORT", defaults.port)?,

            jwks_url: optional_env("JWKS_URL"),
            jwt_issuer: optional_env("JWT_ISSUER"),
            jwt_audience: optional_env("JWT_AUDIENCE"),
            jwt_shared_secret: optional_env("JWT_SHARED_SECRET"),
            jwt_leeway: Duration::from_secs(parse_env(
                "JWT_LEEWAY_SECS",
                defaults.jwt_leeway.as_secs(),
            )?),

            jwks_cache_ttl: Duration::from_secs(parse_env(
                "JWKS_CACHE_TTL_SECS",
                defaults.jwks_cache_ttl.as_secs(),
            )?),
            jwks_stale_grace: Duration::from_secs(parse_env(
                "JWKS_STALE_GRACE_SECS",
                defaults.jwks_stale_grace.as_secs(),
            )?),
            jwks_fetch_timeout: parse_millis("JWKS_FETCH_TIMEOUT_MS", defaults.jwks_fetch_timeout)?,
            jwks_breaker_failure_threshold: parse_env(
                "JWKS_BREAKER_FAILURE_THRESHOLD",
                defaults.jwks_breaker_failure_threshold,
            )?,
            jwks_breaker_open_duration: Duration::from_secs(parse_env(
                "JWKS_BREAKER_OPEN_SECS",
                defaults.jwks_breaker_open_duration.as_secs(),
            )?),
            jwks_retry_max_attempts: parse_env(
                "JWKS_RETRY_MAX_ATTEMPTS",
                defaults.jwks_retry_max_attempts,
            )?,
            jwks_retry_base_delay: parse_millis(
                "JWKS_RETRY_BASE_DELAY_MS",
                defaults.jwks_retry_base_delay,
            )?,
            jwks_retry_max_delay: parse_millis(
                "JWKS_RETRY_MAX_DELAY_MS",
                defaults.jwks_retry_max_delay,
            )?,

            rate_limit_enabled: parse_env("RATE_LIMIT_ENABLED", defaults.rate_limit_enabled)?,
            rate_limit_redis_url: optional_env("RATE_LIMIT_REDIS_URL"),
            rate_limit_tiers: parse_env("RATE_LIMIT_TIERS", defaults.rate_limit_tiers)?,
            rate_limit_route_classes: parse_env(
                "RATE_LIMIT_ROUTE_CLASSES",
                defaults.rate_limit_route_classes,
            )?,
            rate_limit_backend_timeout: parse_millis(
                "RATE_LIMIT_BACKEND_TIMEOUT_MS",
                defaults.rate_limit_backend_timeout,
            )?,
            rate_limit_reconnect_interval: Duration::from_secs(parse_env(
                "RATE_LIMIT_RECONNECT_SECS",
                defaults.rate_limit_reconnect_interval.as_secs(),
            )?),

            waf_enabled: parse_env("WAF_ENABLED", defaults.waf_enabled)?,
            waf_exemptions: parse_env("WAF_EXEMPTIONS", defaults.waf_exemptions)?,
            waf_max_body_bytes: parse_env("WAF_MAX_BODY_BYTES", defaults.waf_max_body_bytes)?,

            request_timeout: parse_millis("REQUEST_TIMEOUT_MS", defaults.request_timeout)?,
            timeout_excluded_paths: parse_paths(
                "TIMEOUT_EXCLUDED_PATHS",
                defaults.timeout_excluded_paths,
            ),

            auth_public_paths: parse_paths("AUTH_PUBLIC_PATHS", defaults.auth_public_paths),
            trusted_proxies: parse_list("TRUSTED_PROXIES").unwrap_or_default(),
            max_request_body_size: parse_env(
                "MAX_REQUEST_BODY_SIZE",
                defaults.max_request_body_size,
            )?,
            cors_allowed_origins: parse_list("CORS_ALLOWED_ORIGINS")
                .unwrap_or(defaults.cors_allowed_origins),

            log_level: env::var("RUST_LOG").unwrap_or(defaults.log_level),
            log_format: parse_env("LOG_FORMAT", defaults.log_format)?,
            metrics_port: parse_env("METRICS_PORT", defaults.metrics_port)?,
        };

        config.validate()?;

        Ok(config)
    }

    /// Check the combination of values.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::ConfigError` naming the offending variable.
    pub fn validate(&self) -> GatewayResult<()> {
        if self.jwks_url.is_none() && self.jwt_shared_secret.is_none() {
            return Err(config_error(
                "at least one of JWKS_URL or JWT_SHARED_SECRET must be set",
            ));
        }

        if let Some(url) = &self.jwks_url
            && !(url.starts_with("http://") || url.starts_with("https://"))
        {
            return Err(config_error(format!(
                "JWKS_URL must be an http(s) URL, got '{url}'"
            )));
        }

        if let Some(secret) = &self.jwt_shared_secret
            && secret.len() < RECOMMENDED_SECRET_LEN
        {
            warn!(
                length = secret.len(),
                recommended = RECOMMENDED_SECRET_LEN,
                "JWT_SHARED_SECRET is shorter than recommended"
            );
        }

        if self.jwks_breaker_failure_threshold == 0 {
            return Err(config_error(
                "JWKS_BREAKER_FAILURE_THRESHOLD must be greater than 0",
            ));
        }

        if self.jwks_retry_max_attempts == 0 {
            return Err(config_error("JWKS_RETRY_MAX_ATTEMPTS must be greater than 0"));
        }

        if self.jwks_retry_base_delay > self.jwks_retry_max_delay {
            return Err(config_error(format!(
                "JWKS_RETRY_BASE_DELAY_MS ({:?}) must be <= JWKS_RETRY_MAX_DELAY_MS ({:?})",
                self.jwks_retry_base_delay, self.jwks_retry_max_delay
            )));
        }

        if self.jwks_fetch_timeout.is_zero() {
            return Err(config_error("JWKS_FETCH_TIMEOUT_MS must be greater than 0"));
        }

        if self.request_timeout < MIN_REQUEST_TIMEOUT {
            return Err(config_error(format!(
                "REQUEST_TIMEOUT_MS must be at least {}",
                MIN_REQUEST_TIMEOUT.as_millis()
            )));
        }

        if self.rate_limit_backend_timeout.is_zero() {
            return Err(config_error(
                "RATE_LIMIT_BACKEND_TIMEOUT_MS must be greater than 0",
            ));
        }

        if self.rate_limit_reconnect_interval.is_zero() {
            return Err(config_error("RATE_LIMIT_RECONNECT_SECS must be greater than 0"));
        }

        if let Some(tier) = self
            .rate_limit_route_classes
            .tiers()
            .find(|tier| self.rate_limit_tiers.iter().all(|(name, _)| name != *tier))
        {
            return Err(config_error(format!(
                "RATE_LIMIT_ROUTE_CLASSES references unknown tier '{tier}'"
            )));
        }

        if self.waf_max_body_bytes == 0 {
            return Err(config_error("WAF_MAX_BODY_BYTES must be greater than 0"));
        }

        if self.max_request_body_size == 0 {
            return Err(config_error("MAX_REQUEST_BODY_SIZE must be greater than 0"));
        }

        Ok(())
    }

    /// Get the full server address for binding.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn metrics_enabled(&self) -> bool {
        self.metrics_port > 0
    }

    /// Get the metrics endpoint address, `None` if disabled (port = 0).
    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        self.metrics_enabled()
            .then(|| SocketAddr::from(([0, 0, 0, 0], self.metrics_port)))
    }

    /// JWKS cache settings, when a key set URL is configured.
    pub fn jwks_config(&self) -> Option<JwksConfig> {
        let url = self.jwks_url.as_ref()?;
        Some(JwksConfig {
            ttl: self.jwks_cache_ttl,
            stale_grace: self.jwks_stale_grace,
            fetch_timeout: self.jwks_fetch_timeout,
            breaker: CircuitBreakerConfig {
                failure_threshold: self.jwks_breaker_failure_threshold,
                open_timeout: self.jwks_breaker_open_duration,
                ..CircuitBreakerConfig::jwks()
            },
            retry: RetryPolicy::new(
                self.jwks_retry_max_attempts,
                self.jwks_retry_base_delay,
                self.jwks_retry_max_delay,
            ),
            ..JwksConfig::new(url.clone())
        })
    }

    pub fn resolver_config(&self) -> ResolverConfig {
        ResolverConfig {
            issuer: self.jwt_issuer.clone(),
            audience: self.jwt_audience.clone(),
            shared_secret: self.jwt_shared_secret.clone(),
            leeway: self.jwt_leeway,
        }
    }

    pub fn rate_limiter_config(&self) -> RateLimiterConfig {
        RateLimiterConfig {
            enabled: self.rate_limit_enabled,
            tiers: self.rate_limit_tiers.clone(),
            route_classes: self.rate_limit_route_classes.clone(),
            backend_timeout: self.rate_limit_backend_timeout,
            reconnect_interval: self.rate_limit_reconnect_interval,
            ..RateLimiterConfig::default()
        }
    }

    pub fn waf_config(&self) -> WafConfig {
        WafConfig {
            max_body_bytes: self.waf_max_body_bytes,
            exemptions: self.waf_exemptions.clone(),
        }
    }

    pub fn timeout_config(&self) -> TimeoutConfig {
        TimeoutConfig {
            global: self.request_timeout,
            excluded_paths: self.timeout_excluded_paths.clone(),
            ..TimeoutConfig::default()
        }
    }
}

/// Default configuration for testing and development.
///
/// No signing scheme is configured, so this does not pass [`Config::validate`]
/// on its own. Production deployments should use `Config::from_env()`.
impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,

            jwks_url: None,
            jwt_issuer: None,
            jwt_audience: None,
            jwt_shared_secret: None,
            jwt_leeway: Duration::from_secs(30),

            jwks_cache_ttl: Duration::from_secs(300),
            jwks_stale_grace: Duration::from_secs(600),
            jwks_fetch_timeout: Duration::from_secs(2),
            jwks_breaker_failure_threshold: 5,
            jwks_breaker_open_duration: Duration::from_secs(60),
            jwks_retry_max_attempts: 3,
            jwks_retry_base_delay: Duration::from_millis(200),
            jwks_retry_max_delay: Duration::from_secs(2),

            rate_limit_enabled: true,
            rate_limit_redis_url: None,
            rate_limit_tiers: TierTable::default(),
            rate_limit_route_classes: RouteClasses::new([
                ("/auth".to_string(), "auth".to_string()),
                ("/applications".to_string(), "write".to_string()),
            ]),
            rate_limit_backend_timeout: Duration::from_millis(100),
            rate_limit_reconnect_interval: Duration::from_secs(300),

            waf_enabled: true,
            waf_exemptions: ExemptionTable::default_policy(),
            waf_max_body_bytes: 1024 * 1024,

            request_timeout: Duration::from_secs(5),
            timeout_excluded_paths: vec![
                "/health".to_string(),
                "/ready".to_string(),
                "/metrics".to_string(),
            ],

            auth_public_paths: vec!["/health".to_string(), "/ready".to_string()],
            trusted_proxies: vec![], // Empty = key on the peer address
            max_request_body_size: 2 * 1024 * 1024,
            cors_allowed_origins: vec!["*".to_string()],

            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            metrics_port: 9090,
        }
    }
}

fn config_error(msg: impl Into<String>) -> GatewayError {
    GatewayError::ConfigError(msg.into())
}

/// Parse an environment variable into the specified type with a default value.
fn parse_env<T>(name: &str, default: T) -> GatewayResult<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match env::var(name) {
        Ok(val) if !val.trim().is_empty() => val
            .trim()
            .parse()
            .map_err(|e| config_error(format!("Invalid {name}: {e}"))),
        _ => Ok(default),
    }
}

fn parse_millis(name: &str, default: Duration) -> GatewayResult<Duration> {
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    parse_env(name, default_ms).map(Duration::from_millis)
}

fn optional_env(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Comma-separated list, `None` when unset or empty.
fn parse_list(name: &str) -> Option<Vec<String>> {
    optional_env(name).map(|s| {
        s.split(',')
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect()
    })
}

/// Comma-separated absolute paths. Entries not starting with `/` are dropped.
fn parse_paths(name: &str, default: Vec<String>) -> Vec<String> {
    parse_list(name)
        .map(|paths| paths.into_iter().filter(|p| p.starts_with('/')).collect())
        .unwrap_or(default)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn valid() -> Config {
        Config {
            jwt_shared_secret: Some("0123456789abcdef0123456789abcdef".to_string()),
            ..Config::default()
        }
    }

    #[test]
    fn test_default_config_values() {
        let config = Config::default();

        assert_eq!(config.port, 3000);
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert_eq!(config.auth_public_paths, vec!["/health", "/ready"]);
        assert!(config.rate_limit_enabled);
        assert!(config.waf_enabled);
        assert_eq!(config.log_format, LogFormat::Text);
    }

    #[test]
    fn test_server_addr_format() {
        let config = Config {
            host: "127.0.0.1".to_string(),
            port: 8080,
            ..Config::default()
        };
        assert_eq!(config.server_addr(), "127.0.0.1:8080");
    }

    #[test]
    fn test_validate_requires_a_signing_scheme() {
        let err = Config::default().validate().unwrap_err();
        assert!(err.to_string().contains("JWKS_URL"));
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_non_http_jwks_url() {
        let config = Config {
            jwks_url: Some("ftp://idp/keys".to_string()),
            ..valid()
        };
        assert!(config.validate().unwrap_err().to_string().contains("JWKS_URL"));
    }

    #[test]
    fn test_validate_retry_delay_ordering() {
        let config = Config {
            jwks_retry_base_delay: Duration::from_secs(5),
            jwks_retry_max_delay: Duration::from_secs(1),
            ..valid()
        };
        assert!(
            config
                .validate()
                .unwrap_err()
                .to_string()
                .contains("JWKS_RETRY_BASE_DELAY_MS")
        );
    }

    #[test]
    fn test_validate_request_timeout_floor() {
        let config = Config {
            request_timeout: Duration::from_millis(10),
            ..valid()
        };
        assert!(
            config
                .validate()
                .unwrap_err()
                .to_string()
                .contains("REQUEST_TIMEOUT_MS")
        );
    }

    #[test]
    fn test_validate_route_class_tier_must_exist() {
        let config = Config {
            rate_limit_route_classes: "/uploads=bulk".parse().unwrap(),
            ..valid()
        };
        assert!(config.validate().unwrap_err().to_string().contains("bulk"));
    }

    #[test]
    fn test_metrics_addr_disabled_on_zero_port() {
        let config = Config {
            metrics_port: 0,
            ..valid()
        };
        assert!(config.metrics_addr().is_none());
        assert_eq!(valid().metrics_addr().unwrap().port(), 9090);
    }

    #[test]
    fn test_jwks_config_only_with_url() {
        assert!(valid().jwks_config().is_none());

        let config = Config {
            jwks_url: Some("https://idp.example.com/.well-known/jwks.json".to_string()),
            jwks_breaker_failure_threshold: 7,
            jwks_retry_max_attempts: 2,
            ..valid()
        };
        let jwks = config.jwks_config().unwrap();
        assert_eq!(jwks.breaker.failure_threshold, 7);
        assert_eq!(jwks.breaker.open_timeout, Duration::from_secs(60));
        assert_eq!(jwks.retry.max_attempts, 2);
        assert_eq!(jwks.ttl, Duration::from_secs(300));
    }

    #[test]
    fn test_component_configs_follow_fields() {
        let config = Config {
            rate_limit_enabled: false,
            waf_max_body_bytes: 4096,
            request_timeout: Duration::from_secs(2),
            ..valid()
        };
        assert!(!config.rate_limiter_config().enabled);
        assert_eq!(config.waf_config().max_body_bytes, 4096);
        assert_eq!(config.timeout_config().global, Duration::from_secs(2));
        assert_eq!(
            config.resolver_config().shared_secret.as_deref(),
            Some("0123456789abcdef0123456789abcdef")
        );
    }

    #[test]
    fn test_log_format_parse() {
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("TEXT".parse::<LogFormat>().unwrap(), LogFormat::Text);
        assert!("xml".parse::<LogFormat>().is_err());
    }
}
