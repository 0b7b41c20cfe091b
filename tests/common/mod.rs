//! Shared fixtures for the integration tests: token minting, a local JWKS
//! server, and a gateway router built from test configuration.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, Request, Response, StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use serde_json::{Value, json};
use tokio::net::TcpListener;

use scholarship_gateway::{AppState, Config, build_router};

pub const SECRET: &str = "integration-secret-integration-secret";
pub const KID: &str = "test-key-1";
pub const JWKS_JSON: &str = include_str!("../fixtures/jwks.json");
const RSA_PRIVATE_PEM: &[u8] = include_bytes!("../fixtures/rsa_private.pem");
const JWKS_ETAG: &str = "\"jwks-v1\"";

pub fn exp() -> u64 {
    (chrono::Utc::now().timestamp() + 600) as u64
}

/// HS256 token signed with [`SECRET`].
pub fn hs256_token(claims: Value) -> String {
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .expect("encode HS256 token")
}

/// RS256 token signed with the fixture key, `kid` in the header.
pub fn rs256_token(claims: Value, kid: &str) -> String {
    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some(kid.to_string());
    encode(
        &header,
        &claims,
        &EncodingKey::from_rsa_pem(RSA_PRIVATE_PEM).expect("fixture RSA key"),
    )
    .expect("encode RS256 token")
}

/// Token for `sub` with the given `scope` string.
pub fn token_with_scope(sub: &str, scope: &str) -> String {
    hs256_token(json!({ "sub": sub, "exp": exp(), "scope": scope }))
}

pub fn bearer(token: &str) -> String {
    format!("Bearer {token}")
}

// =============================================================================
// JWKS server
// =============================================================================

/// How the local JWKS endpoint answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum JwksMode {
    /// 200 with the fixture key set, `ETag` and `Cache-Control: max-age`
    Serve = 0,
    /// Never answers within any sane timeout
    Hang = 1,
    /// 500
    Fail = 2,
}

#[derive(Clone)]
struct JwksServerState {
    hits: Arc<AtomicUsize>,
    not_modified: Arc<AtomicUsize>,
    mode: Arc<AtomicU8>,
    delay: Duration,
}

/// A JWKS endpoint on an ephemeral port, counting the requests it receives.
pub struct JwksServer {
    pub url: String,
    hits: Arc<AtomicUsize>,
    not_modified: Arc<AtomicUsize>,
    mode: Arc<AtomicU8>,
}

impl JwksServer {
    pub async fn start(mode: JwksMode) -> Self {
        Self::start_with_delay(mode, Duration::ZERO).await
    }

    /// Serve with an artificial delay before each successful answer.
    pub async fn start_with_delay(mode: JwksMode, delay: Duration) -> Self {
        let state = JwksServerState {
            hits: Arc::new(AtomicUsize::new(0)),
            not_modified: Arc::new(AtomicUsize::new(0)),
            mode: Arc::new(AtomicU8::new(mode as u8)),
            delay,
        };
        let app = Router::new()
            .route("/.well-known/jwks.json", get(jwks_handler))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind JWKS server");
        let addr = listener.local_addr().expect("JWKS server address");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self {
            url: format!("http://{addr}/.well-known/jwks.json"),
            hits: state.hits,
            not_modified: state.not_modified,
            mode: state.mode,
        }
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    pub fn not_modified_responses(&self) -> usize {
        self.not_modified.load(Ordering::SeqCst)
    }

    pub fn set_mode(&self, mode: JwksMode) {
        self.mode.store(mode as u8, Ordering::SeqCst);
    }
}

async fn jwks_handler(State(state): State<JwksServerState>, headers: HeaderMap) -> Response<Body> {
    state.hits.fetch_add(1, Ordering::SeqCst);

    match state.mode.load(Ordering::SeqCst) {
        1 => {
            tokio::time::sleep(Duration::from_secs(30)).await;
            StatusCode::GATEWAY_TIMEOUT.into_response()
        }
        2 => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        _ => {
            if !state.delay.is_zero() {
                tokio::time::sleep(state.delay).await;
            }
            let revalidating = headers
                .get(header::IF_NONE_MATCH)
                .is_some_and(|v| v.as_bytes() == JWKS_ETAG.as_bytes());
            if revalidating {
                state.not_modified.fetch_add(1, Ordering::SeqCst);
                return (
                    StatusCode::NOT_MODIFIED,
                    [(header::CACHE_CONTROL, "max-age=300")],
                )
                    .into_response();
            }
            (
                [
                    (header::CONTENT_TYPE, "application/json"),
                    (header::ETAG, JWKS_ETAG),
                    (header::CACHE_CONTROL, "public, max-age=300"),
                ],
                JWKS_JSON,
            )
                .into_response()
        }
    }
}

// =============================================================================
// Gateway
// =============================================================================

/// Configuration with the shared-secret scheme, local rate limiting and the
/// default WAF policy.
/// Test requests arrive from a local reverse proxy that sets `X-Forwarded-For`.
pub const PROXY_PEER: &str = "127.0.0.1:40000";

pub fn test_config() -> Config {
    Config {
        jwt_shared_secret: Some(SECRET.to_string()),
        trusted_proxies: vec!["127.0.0.1/32".to_string()],
        rate_limit_tiers: "default=100/60+0,auth=3/60+0,write=100/60+0"
            .parse()
            .expect("tiers"),
        ..Config::default()
    }
}

pub fn gateway(config: Config) -> (Router, AppState) {
    let state = AppState::new(config).expect("build gateway state");
    (build_router(state.clone()), state)
}

pub struct RequestBuilder {
    inner: axum::http::request::Builder,
}

fn proxy_peer() -> SocketAddr {
    PROXY_PEER.parse().expect("proxy peer address")
}

/// Start a request from a distinct client address (rate-limit key).
pub fn request(method: &str, path: &str, client_ip: &str) -> RequestBuilder {
    RequestBuilder {
        inner: Request::builder()
            .method(method)
            .uri(path)
            .header("x-forwarded-for", client_ip)
            .extension(ConnectInfo(proxy_peer())),
    }
}

impl RequestBuilder {
    pub fn bearer(mut self, token: &str) -> Self {
        self.inner = self.inner.header(header::AUTHORIZATION, bearer(token));
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.inner = self.inner.header(name, value);
        self
    }

    pub fn json(self, body: Value) -> Request<Body> {
        self.inner
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    pub fn form(self, body: &str) -> Request<Body> {
        self.inner
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    pub fn empty(self) -> Request<Body> {
        self.inner.body(Body::empty()).expect("request")
    }
}

pub async fn body_json(response: Response<Body>) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), 64 * 1024)
        .await
        .expect("read body");
    serde_json::from_slice(&bytes).expect("JSON body")
}
