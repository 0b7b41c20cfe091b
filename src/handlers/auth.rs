//! Authentication boundary endpoints.
//!
//! Both routes sit behind the bearer layer: the resolver has already verified
//! the token by the time these run, so they only report what it decided.

use axum::Json;
use axum::extract::rejection::JsonRejection;
use tracing::{info, instrument};

use crate::context::{Authenticated, RequestContext};
use crate::error::{GatewayError, GatewayResult};
use crate::models::{LoginRequest, LoginResponse, SessionResponse};
use crate::validation::validate_login;

/// `POST /auth/login`
///
/// The body has already passed the WAF (with the credential exemption) and
/// the `auth` rate-limit tier. Credential checks belong to the identity
/// provider; this echoes the session the bearer token resolved to.
#[instrument(skip_all)]
pub async fn login(
    Authenticated(claims): Authenticated,
    ctx: RequestContext,
    body: Result<Json<LoginRequest>, JsonRejection>,
) -> GatewayResult<Json<LoginResponse>> {
    let Json(request) = body.map_err(|e| GatewayError::BadRequest(e.body_text()))?;
    validate_login(&request)?;

    info!(username = %request.username, subject = %claims.subject, "Login accepted");

    Ok(Json(LoginResponse {
        username: request.username,
        session: SessionResponse::from_claims(&claims, ctx.correlation_id),
    }))
}

/// `GET /auth/session`
#[instrument(skip_all)]
pub async fn session(
    Authenticated(claims): Authenticated,
    ctx: RequestContext,
) -> Json<SessionResponse> {
    Json(SessionResponse::from_claims(&claims, ctx.correlation_id))
}
