use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::{AuthClaims, AuthScheme, ClaimSource, JwksSnapshot};
use crate::rate_limit::RateLimiterSnapshot;

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Always `"healthy"` while the process serves requests
    pub status: String,
    /// Service version
    pub version: String,
    /// Current timestamp
    pub timestamp: DateTime<Utc>,
    /// Seconds since startup
    pub uptime_seconds: u64,
}

/// Readiness response with the state of every fallible dependency.
#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    /// `"ready"` or `"not_ready"`
    pub status: String,
    /// Signing key cache (absent when only the shared secret is configured)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwks: Option<JwksSnapshot>,
    /// Rate limiter backend state
    pub rate_limiter: RateLimiterSnapshot,
    /// Whether the WAF layer is active
    pub waf_enabled: bool,
    pub timestamp: DateTime<Utc>,
}

/// Login request body.
///
/// Credential checking lives in the identity provider; the gateway only
/// inspects the body (WAF) and echoes who the bearer token says the caller is.
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

/// Response to an accepted login.
#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub username: String,
    pub session: SessionResponse,
}

/// What the gateway resolved about the caller.
#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub subject: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,
    pub audience: Vec<String>,
    pub scopes: Vec<String>,
    pub claim_source: ClaimSource,
    pub auth_scheme: AuthScheme,
    /// Token expiry
    pub expires_at: Option<DateTime<Utc>>,
    pub correlation_id: String,
}

impl SessionResponse {
    pub fn from_claims(claims: &AuthClaims, correlation_id: String) -> Self {
        Self {
            subject: claims.subject.clone(),
            issuer: claims.issuer.clone(),
            audience: claims.audience.clone(),
            scopes: claims.granted_scopes.iter().cloned().collect(),
            claim_source: claims.source,
            auth_scheme: claims.scheme,
            expires_at: i64::try_from(claims.expires_at)
                .ok()
                .and_then(|secs| DateTime::from_timestamp(secs, 0)),
            correlation_id,
        }
    }
}

/// Query parameters for `GET /scholarships`.
#[derive(Debug, Deserialize)]
pub struct ListScholarshipsQuery {
    /// Free-text search, forwarded to the search service
    #[serde(default)]
    pub q: Option<String>,
    /// Maximum number of results
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_limit() -> u32 {
    20
}

/// Gateway acknowledgement of a scholarship listing request.
///
/// Search results come from the external search service; the gateway reports
/// the normalized query and the caller it was made for.
#[derive(Debug, Serialize)]
pub struct ScholarshipListResponse {
    pub query: Option<String>,
    pub limit: u32,
    pub requested_by: String,
    pub correlation_id: String,
}

/// Request to publish a scholarship listing.
#[derive(Debug, Deserialize)]
pub struct CreateScholarshipRequest {
    pub title: String,
    /// Award amount in minor currency units
    pub amount_cents: u64,
    pub deadline: DateTime<Utc>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Accepted scholarship listing, handed to the provider-listing service.
#[derive(Debug, Serialize)]
pub struct ScholarshipAccepted {
    pub scholarship_id: Uuid,
    pub title: String,
    pub submitted_by: String,
    pub correlation_id: String,
    pub accepted_at: DateTime<Utc>,
}

/// Request to apply for a scholarship.
#[derive(Debug, Deserialize)]
pub struct ApplicationRequest {
    pub scholarship_id: String,
    pub statement: String,
}

/// Accepted application, handed to the applications service.
#[derive(Debug, Serialize)]
pub struct ApplicationAccepted {
    pub application_id: Uuid,
    pub scholarship_id: String,
    pub applicant: String,
    pub correlation_id: String,
    pub accepted_at: DateTime<Utc>,
}
