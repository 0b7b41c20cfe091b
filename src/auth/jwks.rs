//! Signing-key cache for the identity provider's JWKS endpoint.
//!
//! # Refresh behavior
//!
//! - A fresh key set (younger than its TTL) is served without I/O.
//! - A stale set within `stale_grace` past its TTL is still usable: the first
//!   caller to notice refreshes it, everyone else gets the stale set at once.
//!   If that refresh fails, the stale set keeps being served.
//! - With no usable set, callers queue on the single refresh; a caller that
//!   waited on a refresh shares its outcome instead of fetching again.
//! - Fetches go through the `jwks` circuit breaker with retry, so a dead
//!   endpoint is not hammered once the breaker opens.
//! - `ETag` / `If-None-Match` revalidation renews the current set on `304`.
//! - `Cache-Control: max-age` overrides the configured TTL, clamped to
//!   `[min_ttl, max_ttl]`.
//! - An unknown `kid` forces at most one refresh per `min_refresh_interval`,
//!   and the previous key set answers lookups for `rotation_grace` after it
//!   was replaced.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use jsonwebtoken::DecodingKey;
use jsonwebtoken::jwk::{JwkSet, PublicKeyUse};
use reqwest::StatusCode;
use reqwest::header::{CACHE_CONTROL, ETAG, HeaderMap, IF_NONE_MATCH};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::metrics;
use crate::resilience::{BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, RetryPolicy};

/// Name of the breaker guarding the JWKS endpoint.
pub const JWKS_BREAKER: &str = "jwks";

/// Errors returned to key lookups.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum JwksError {
    #[error("signing key '{0}' not found")]
    KeyNotFound(String),

    #[error("key set unavailable: {reason}")]
    Unavailable { reason: String, breaker_open: bool },

    #[error("failed to build JWKS client: {0}")]
    Client(String),
}

/// Errors from a single fetch attempt.
#[derive(Debug, Error)]
enum FetchError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status {0}")]
    Status(u16),

    #[error("key set contains no usable signing keys")]
    NoUsableKeys,
}

/// JWKS cache settings.
#[derive(Debug, Clone)]
pub struct JwksConfig {
    pub url: String,
    pub ttl: Duration,
    pub min_ttl: Duration,
    pub max_ttl: Duration,
    pub stale_grace: Duration,
    pub fetch_timeout: Duration,
    pub min_refresh_interval: Duration,
    pub rotation_grace: Duration,
    pub breaker: CircuitBreakerConfig,
    pub retry: RetryPolicy,
}

impl JwksConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ttl: Duration::from_secs(300),
            min_ttl: Duration::from_secs(30),
            max_ttl: Duration::from_secs(24 * 60 * 60),
            stale_grace: Duration::from_secs(600),
            fetch_timeout: Duration::from_secs(2),
            min_refresh_interval: Duration::from_secs(30),
            rotation_grace: Duration::from_secs(600),
            breaker: CircuitBreakerConfig::jwks(),
            retry: RetryPolicy::default(),
        }
    }

    /// TTL for a response, honoring `max-age` within the configured bounds.
    fn effective_ttl(&self, max_age: Option<Duration>) -> Duration {
        max_age
            .map(|age| age.max(self.min_ttl).min(self.max_ttl))
            .unwrap_or(self.ttl)
    }
}

/// An immutable generation of signing keys.
struct KeySet {
    keys: Arc<HashMap<String, DecodingKey>>,
    fetched_at: Instant,
    ttl: Duration,
    etag: Option<String>,
}

impl KeySet {
    fn is_fresh(&self) -> bool {
        self.fetched_at.elapsed() < self.ttl
    }

    fn within_grace(&self, grace: Duration) -> bool {
        self.fetched_at.elapsed() < self.ttl.saturating_add(grace)
    }

    fn get(&self, kid: &str) -> Option<DecodingKey> {
        self.keys.get(kid).cloned()
    }
}

struct RetiredSet {
    set: Arc<KeySet>,
    retired_at: Instant,
}

/// State owned by whoever holds the refresh lock.
#[derive(Debug, Default)]
struct RefreshState {
    last_failure: Option<JwksError>,
    last_forced: Option<Instant>,
}

enum FetchOutcome {
    Updated {
        keys: HashMap<String, DecodingKey>,
        etag: Option<String>,
        max_age: Option<Duration>,
    },
    NotModified {
        max_age: Option<Duration>,
    },
}

/// Health view of the cache.
#[derive(Debug, Clone, Serialize)]
pub struct JwksSnapshot {
    pub keys: usize,
    pub age_secs: Option<u64>,
    pub fresh: bool,
    pub usable: bool,
    pub breaker: BreakerSnapshot,
}

/// Cache of the identity provider's signing keys.
pub struct JwksCache {
    config: JwksConfig,
    client: reqwest::Client,
    breaker: CircuitBreaker,
    current: RwLock<Option<Arc<KeySet>>>,
    previous: RwLock<Option<RetiredSet>>,
    refresh: Mutex<RefreshState>,
    /// Incremented after every completed refresh attempt.
    generation: AtomicU64,
}

impl std::fmt::Debug for JwksCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwksCache")
            .field("url", &self.config.url)
            .finish_non_exhaustive()
    }
}

impl JwksCache {
    pub fn new(config: JwksConfig) -> Result<Self, JwksError> {
        let client = reqwest::Client::builder()
            .timeout(config.fetch_timeout)
            .build()
            .map_err(|e| JwksError::Client(e.to_string()))?;
        Ok(Self::with_client(config, client))
    }

    pub fn with_client(config: JwksConfig, client: reqwest::Client) -> Self {
        let breaker = CircuitBreaker::new(JWKS_BREAKER, config.breaker.clone());
        Self {
            config,
            client,
            breaker,
            current: RwLock::new(None),
            previous: RwLock::new(None),
            refresh: Mutex::new(RefreshState::default()),
            generation: AtomicU64::new(0),
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Look up the decoding key for `kid`.
    pub async fn get_key(&self, kid: &str) -> Result<DecodingKey, JwksError> {
        let set = self.usable_set().await?;
        if let Some(key) = set.get(kid) {
            return Ok(key);
        }
        if let Some(key) = self.previous_key(kid).await {
            debug!(kid, "Signing key served from previous key set");
            return Ok(key);
        }
        self.forced_lookup(kid).await
    }

    /// Load the key set eagerly (startup warm-up). Returns the number of keys.
    pub async fn prefetch(&self) -> Result<usize, JwksError> {
        let mut state = self.refresh.lock().await;
        let set = self.refresh_locked(&mut state).await?;
        Ok(set.keys.len())
    }

    pub async fn snapshot(&self) -> JwksSnapshot {
        let current = self.current_set().await;
        JwksSnapshot {
            keys: current.as_ref().map_or(0, |s| s.keys.len()),
            age_secs: current.as_ref().map(|s| s.fetched_at.elapsed().as_secs()),
            fresh: current.as_ref().is_some_and(|s| s.is_fresh()),
            usable: current
                .as_ref()
                .is_some_and(|s| s.within_grace(self.config.stale_grace)),
            breaker: self.breaker.snapshot().await,
        }
    }

    async fn current_set(&self) -> Option<Arc<KeySet>> {
        self.current.read().await.clone()
    }

    async fn usable_set(&self) -> Result<Arc<KeySet>, JwksError> {
        match self.current_set().await {
            Some(set) if set.is_fresh() => Ok(set),
            Some(set) if set.within_grace(self.config.stale_grace) => {
                let Ok(mut state) = self.refresh.try_lock() else {
                    // Refresh already in flight
                    metrics::record_jwks_stale_served();
                    return Ok(set);
                };
                match self.refresh_locked(&mut state).await {
                    Ok(fresh) => Ok(fresh),
                    Err(e) => {
                        warn!(
                            error = %e,
                            age_secs = set.fetched_at.elapsed().as_secs(),
                            "JWKS refresh failed, serving stale key set"
                        );
                        metrics::record_jwks_stale_served();
                        Ok(set)
                    }
                }
            }
            _ => {
                let seen = self.generation.load(Ordering::Acquire);
                let mut state = self.refresh.lock().await;
                if self.generation.load(Ordering::Acquire) != seen {
                    // Share the outcome of the refresh we waited on
                    if let Some(set) = self.current_set().await
                        && set.within_grace(self.config.stale_grace)
                    {
                        return Ok(set);
                    }
                    if let Some(err) = &state.last_failure {
                        return Err(err.clone());
                    }
                }
                self.refresh_locked(&mut state).await
            }
        }
    }

    async fn previous_key(&self, kid: &str) -> Option<DecodingKey> {
        let previous = self.previous.read().await;
        previous
            .as_ref()
            .filter(|p| p.retired_at.elapsed() < self.config.rotation_grace)
            .and_then(|p| p.set.get(kid))
    }

    /// Unknown `kid`: refresh once (rate limited) in case the provider rotated keys.
    async fn forced_lookup(&self, kid: &str) -> Result<DecodingKey, JwksError> {
        let not_found = || JwksError::KeyNotFound(kid.to_string());

        let seen = self.generation.load(Ordering::Acquire);
        let mut state = self.refresh.lock().await;
        if self.generation.load(Ordering::Acquire) != seen {
            // Another refresh ran while we waited and may have retired the key
            if let Some(key) = self.current_set().await.and_then(|s| s.get(kid)) {
                return Ok(key);
            }
            return self.previous_key(kid).await.ok_or_else(not_found);
        }

        if state
            .last_forced
            .is_some_and(|at| at.elapsed() < self.config.min_refresh_interval)
        {
            debug!(kid, "Unknown kid, forced JWKS refresh suppressed");
            return Err(not_found());
        }
        state.last_forced = Some(Instant::now());

        info!(kid, "Unknown kid, forcing JWKS refresh");
        match self.refresh_locked(&mut state).await {
            Ok(set) => set.get(kid).ok_or_else(not_found),
            Err(_) => Err(not_found()),
        }
    }

    /// Fetch and install a new key set. Caller holds the refresh lock.
    async fn refresh_locked(&self, state: &mut RefreshState) -> Result<Arc<KeySet>, JwksError> {
        let current = self.current_set().await;
        let etag = current.as_ref().and_then(|s| s.etag.clone());

        let outcome = self
            .breaker
            .call_with_retry(&self.config.retry, || self.fetch(etag.clone()))
            .await;

        let result = match (outcome, current) {
            (Ok(FetchOutcome::NotModified { max_age }), Some(current)) => {
                let renewed = Arc::new(KeySet {
                    keys: current.keys.clone(),
                    fetched_at: Instant::now(),
                    ttl: self.config.effective_ttl(max_age),
                    etag: current.etag.clone(),
                });
                *self.current.write().await = Some(renewed.clone());
                metrics::record_jwks_refresh("not_modified");
                debug!(ttl = ?renewed.ttl, "JWKS not modified, key set renewed");
                Ok(renewed)
            }
            (Ok(FetchOutcome::NotModified { .. }), None) => {
                metrics::record_jwks_refresh("failed");
                Err(JwksError::Unavailable {
                    reason: "not modified response without a cached key set".to_string(),
                    breaker_open: false,
                })
            }
            (Ok(FetchOutcome::Updated { keys, etag, max_age }), current) => {
                let set = Arc::new(KeySet {
                    keys: Arc::new(keys),
                    fetched_at: Instant::now(),
                    ttl: self.config.effective_ttl(max_age),
                    etag,
                });
                if let Some(old) = current {
                    *self.previous.write().await = Some(RetiredSet {
                        set: old,
                        retired_at: Instant::now(),
                    });
                }
                *self.current.write().await = Some(set.clone());
                metrics::record_jwks_refresh("updated");
                metrics::set_jwks_keys(set.keys.len());
                info!(keys = set.keys.len(), ttl = ?set.ttl, "JWKS key set refreshed");
                Ok(set)
            }
            (Err(e), _) => {
                metrics::record_jwks_refresh("failed");
                let breaker_open = e.is_open();
                warn!(error = %e, breaker_open, url = %self.config.url, "JWKS refresh failed");
                Err(JwksError::Unavailable {
                    reason: e.to_string(),
                    breaker_open,
                })
            }
        };

        state.last_failure = result.as_ref().err().cloned();
        self.generation.fetch_add(1, Ordering::AcqRel);
        result
    }

    async fn fetch(&self, etag: Option<String>) -> Result<FetchOutcome, FetchError> {
        let mut request = self
            .client
            .get(&self.config.url)
            .timeout(self.config.fetch_timeout);
        if let Some(etag) = &etag {
            request = request.header(IF_NONE_MATCH, etag);
        }

        let response = request.send().await?;
        let max_age = parse_max_age(response.headers());

        if response.status() == StatusCode::NOT_MODIFIED && etag.is_some() {
            return Ok(FetchOutcome::NotModified { max_age });
        }
        if !response.status().is_success() {
            return Err(FetchError::Status(response.status().as_u16()));
        }

        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let jwks: JwkSet = response.json().await?;
        let keys = decoding_keys(&jwks);
        if keys.is_empty() {
            return Err(FetchError::NoUsableKeys);
        }

        Ok(FetchOutcome::Updated {
            keys,
            etag,
            max_age,
        })
    }
}

/// Signature keys from a JWKS document; malformed or non-signing keys are skipped.
fn decoding_keys(jwks: &JwkSet) -> HashMap<String, DecodingKey> {
    let mut keys = HashMap::new();
    for jwk in &jwks.keys {
        let Some(kid) = jwk.common.key_id.as_deref() else {
            warn!("Skipping JWK without kid");
            continue;
        };
        match &jwk.common.public_key_use {
            None | Some(PublicKeyUse::Signature) => {}
            Some(_) => {
                debug!(kid, "Skipping non-signature JWK");
                continue;
            }
        }
        match DecodingKey::from_jwk(jwk) {
            Ok(key) => {
                keys.insert(kid.to_string(), key);
            }
            Err(e) => warn!(kid, error = %e, "Skipping malformed JWK"),
        }
    }
    keys
}

/// `max-age` from a `Cache-Control` header, if present.
fn parse_max_age(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get_all(CACHE_CONTROL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|directive| directive.trim().strip_prefix("max-age="))
        .find_map(|secs| secs.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn jwks(json: serde_json::Value) -> JwkSet {
        serde_json::from_value(json).unwrap()
    }

    const N: &str = "sXchDaQebHnPiGvyDOAT4saGEUetSyo9MKLOoWFsueri23bOdgWp4Dy1WlUzewbgBHod5pcM9H95GQRV3JDXboIRROSBigeC5yjU1hGzHHyXss8UDprecbAYxknTcQkhslANGRUZmdTOQ5qTRsLAt6BTYuyvVRdhS8exSZEy_c4gs_7svlJJQ4H9_NxsiIoLwAEk7-Q3UXERGYw_75IDrGA84-lA_-Ct4eTlXHBIY2EaV7t7LjJaynVJCpkv4LKjTTAumiGUIuQhrNhZLuF_RJLqHpM2kgWFLU7-VTdL1VbC2tejvcI2BlMkEpk1BzBZI0KQB0GaDWFLN-aEAw3vRw";

    #[test]
    fn test_decoding_keys_filters_by_use() {
        let set = jwks(serde_json::json!({
            "keys": [
                { "kty": "RSA", "kid": "sig", "use": "sig", "alg": "RS256", "n": N, "e": "AQAB" },
                { "kty": "RSA", "kid": "enc", "use": "enc", "alg": "RS256", "n": N, "e": "AQAB" },
                { "kty": "RSA", "kid": "nouse", "alg": "RS256", "n": N, "e": "AQAB" },
                { "kty": "RSA", "alg": "RS256", "n": N, "e": "AQAB" }
            ]
        }));

        let keys = decoding_keys(&set);
        assert!(keys.contains_key("sig"));
        assert!(keys.contains_key("nouse"));
        assert!(!keys.contains_key("enc"));
        assert_eq!(keys.len(), 2);
    }

    #[test]
    fn test_parse_max_age() {
        let mut headers = HeaderMap::new();
        headers.insert(
            CACHE_CONTROL,
            HeaderValue::from_static("public, max-age=120, must-revalidate"),
        );
        assert_eq!(parse_max_age(&headers), Some(Duration::from_secs(120)));

        headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        assert_eq!(parse_max_age(&headers), None);
    }

    #[test]
    fn test_effective_ttl_is_clamped() {
        let config = JwksConfig::new("http://localhost/jwks");
        assert_eq!(config.effective_ttl(None), config.ttl);
        assert_eq!(config.effective_ttl(Some(Duration::from_secs(1))), config.min_ttl);
        assert_eq!(
            config.effective_ttl(Some(Duration::from_secs(10 * 24 * 60 * 60))),
            config.max_ttl
        );
        assert_eq!(
            config.effective_ttl(Some(Duration::from_secs(120))),
            Duration::from_secs(120)
        );
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_unavailable() {
        let mut config = JwksConfig::new("http://127.0.0.1:9/jwks");
        config.retry = RetryPolicy::none();
        config.fetch_timeout = Duration::from_millis(200);
        let cache = JwksCache::new(config).unwrap();

        let Err(err) = cache.get_key("any").await else {
            panic!("expected get_key to fail");
        };
        assert!(matches!(err, JwksError::Unavailable { breaker_open: false, .. }));
        assert!(!cache.snapshot().await.usable);
    }

    fn key_set(kids: &[&str]) -> Arc<KeySet> {
        let keys = kids
            .iter()
            .map(|kid| (kid.to_string(), DecodingKey::from_secret(b"rotation")))
            .collect();
        Arc::new(KeySet {
            keys: Arc::new(keys),
            fetched_at: Instant::now(),
            ttl: Duration::from_secs(300),
            etag: None,
        })
    }

    #[tokio::test]
    async fn test_forced_lookup_finds_key_retired_by_concurrent_refresh() {
        let mut config = JwksConfig::new("http://127.0.0.1:9/jwks");
        config.retry = RetryPolicy::none();
        let cache = Arc::new(JwksCache::new(config).unwrap());
        *cache.current.write().await = Some(key_set(&["before"]));

        // Hold the refresh lock so the lookup queues behind a "refresh"
        let refresh = cache.refresh.lock().await;
        let lookup = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.forced_lookup("retiring").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        *cache.previous.write().await = Some(RetiredSet {
            set: key_set(&["retiring"]),
            retired_at: Instant::now(),
        });
        *cache.current.write().await = Some(key_set(&["after"]));
        cache.generation.fetch_add(1, Ordering::AcqRel);
        drop(refresh);

        assert!(lookup.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_forced_lookup_after_concurrent_refresh_misses_unknown_kid() {
        let mut config = JwksConfig::new("http://127.0.0.1:9/jwks");
        config.retry = RetryPolicy::none();
        let cache = Arc::new(JwksCache::new(config).unwrap());

        let refresh = cache.refresh.lock().await;
        let lookup = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.forced_lookup("never-issued").await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        *cache.current.write().await = Some(key_set(&["after"]));
        cache.generation.fetch_add(1, Ordering::AcqRel);
        drop(refresh);

        assert!(matches!(
            lookup.await.unwrap(),
            Err(JwksError::KeyNotFound(kid)) if kid == "never-issued"
        ));
    }
}
