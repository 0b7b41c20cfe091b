//! Scholarship and application boundary endpoints.
//!
//! Search, listing and application processing are external services. These
//! handlers run only after the full chain has allowed the request and the
//! route scope check passed, validate the payload, and acknowledge it with the
//! identity and correlation id downstream services need.

use axum::Json;
use axum::extract::Query;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::http::StatusCode;
use chrono::Utc;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::context::{Authenticated, RequestContext};
use crate::error::{GatewayError, GatewayResult};
use crate::models::{
    ApplicationAccepted, ApplicationRequest, CreateScholarshipRequest, ListScholarshipsQuery,
    ScholarshipAccepted, ScholarshipListResponse,
};
use crate::validation::{validate_application, validate_list_limit, validate_scholarship};

/// `GET /scholarships` (`scholarships:read`)
#[instrument(skip_all)]
pub async fn list_scholarships(
    Authenticated(claims): Authenticated,
    ctx: RequestContext,
    query: Result<Query<ListScholarshipsQuery>, QueryRejection>,
) -> GatewayResult<Json<ScholarshipListResponse>> {
    let Query(query) = query.map_err(|e| GatewayError::BadRequest(e.body_text()))?;
    validate_list_limit(query.limit)?;

    debug!(subject = %claims.subject, query = ?query.q, limit = query.limit, "Scholarship listing requested");

    Ok(Json(ScholarshipListResponse {
        query: query.q.map(|q| q.trim().to_string()).filter(|q| !q.is_empty()),
        limit: query.limit,
        requested_by: claims.subject.clone(),
        correlation_id: ctx.correlation_id,
    }))
}

/// `POST /scholarships` (`scholarships:write`)
#[instrument(skip_all)]
pub async fn create_scholarship(
    Authenticated(claims): Authenticated,
    ctx: RequestContext,
    body: Result<Json<CreateScholarshipRequest>, JsonRejection>,
) -> GatewayResult<(StatusCode, Json<ScholarshipAccepted>)> {
    let Json(request) = body.map_err(|e| GatewayError::BadRequest(e.body_text()))?;
    let now = Utc::now();
    validate_scholarship(&request, now)?;

    let scholarship_id = Uuid::new_v4();
    info!(
        %scholarship_id,
        subject = %claims.subject,
        title = %request.title,
        "Scholarship listing accepted"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(ScholarshipAccepted {
            scholarship_id,
            title: request.title,
            submitted_by: claims.subject.clone(),
            correlation_id: ctx.correlation_id,
            accepted_at: now,
        }),
    ))
}

/// `POST /applications` (`applications:write`)
#[instrument(skip_all)]
pub async fn submit_application(
    Authenticated(claims): Authenticated,
    ctx: RequestContext,
    body: Result<Json<ApplicationRequest>, JsonRejection>,
) -> GatewayResult<(StatusCode, Json<ApplicationAccepted>)> {
    let Json(request) = body.map_err(|e| GatewayError::BadRequest(e.body_text()))?;
    validate_application(&request)?;

    let application_id = Uuid::new_v4();
    info!(
        %application_id,
        subject = %claims.subject,
        scholarship_id = %request.scholarship_id,
        "Application accepted"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(ApplicationAccepted {
            application_id,
            scholarship_id: request.scholarship_id,
            applicant: claims.subject.clone(),
            correlation_id: ctx.correlation_id,
            accepted_at: Utc::now(),
        }),
    ))
}
