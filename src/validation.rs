use chrono::{DateTime, Utc};

use crate::error::{GatewayError, GatewayResult};
use crate::models::{ApplicationRequest, CreateScholarshipRequest, LoginRequest};

// =============================================================================
// Validation Constants
// =============================================================================

/// Maximum length for a scholarship title.
pub const MAX_TITLE_LENGTH: usize = 200;

/// Maximum length for scholarship descriptions and application statements.
pub const MAX_TEXT_LENGTH: usize = 10_000;

/// Maximum length for usernames and scholarship identifiers.
pub const MAX_IDENTIFIER_LENGTH: usize = 128;

/// Maximum page size for listings.
pub const MAX_LIST_LIMIT: u32 = 100;

fn validate_required_text(value: &str, field: &str, max_len: usize) -> GatewayResult<()> {
    if value.trim().is_empty() {
        return Err(GatewayError::BadRequest(format!("{field} cannot be empty")));
    }

    if value.chars().count() > max_len {
        return Err(GatewayError::BadRequest(format!(
            "{field} cannot exceed {max_len} characters"
        )));
    }

    Ok(())
}

/// Validate an identifier (username, scholarship id).
///
/// Rules:
/// - Must be between 1 and 128 characters
/// - Can contain alphanumeric characters, dots, underscores, hyphens and `@`
pub fn validate_identifier(value: &str, field: &str) -> GatewayResult<()> {
    validate_required_text(value, field, MAX_IDENTIFIER_LENGTH)?;

    if let Some((i, c)) = value
        .chars()
        .enumerate()
        .find(|(_, c)| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '@')))
    {
        return Err(GatewayError::BadRequest(format!(
            "{field} contains invalid character '{c}' at position {i}"
        )));
    }

    Ok(())
}

pub fn validate_login(request: &LoginRequest) -> GatewayResult<()> {
    validate_identifier(&request.username, "username")?;
    if request.password.is_empty() {
        return Err(GatewayError::BadRequest(
            "password cannot be empty".to_string(),
        ));
    }
    Ok(())
}

/// Validate a new scholarship listing against the current time.
pub fn validate_scholarship(
    request: &CreateScholarshipRequest,
    now: DateTime<Utc>,
) -> GatewayResult<()> {
    validate_required_text(&request.title, "title", MAX_TITLE_LENGTH)?;

    if let Some(pos) = request.title.chars().position(|c| c.is_control()) {
        return Err(GatewayError::BadRequest(format!(
            "title contains invalid control character at position {pos}"
        )));
    }

    if request.amount_cents == 0 {
        return Err(GatewayError::BadRequest(
            "amount_cents must be greater than zero".to_string(),
        ));
    }

    if request.deadline <= now {
        return Err(GatewayError::BadRequest(
            "deadline must be in the future".to_string(),
        ));
    }

    if let Some(description) = &request.description
        && description.chars().count() > MAX_TEXT_LENGTH
    {
        return Err(GatewayError::BadRequest(format!(
            "description cannot exceed {MAX_TEXT_LENGTH} characters"
        )));
    }

    Ok(())
}

pub fn validate_application(request: &ApplicationRequest) -> GatewayResult<()> {
    validate_identifier(&request.scholarship_id, "scholarship_id")?;
    validate_required_text(&request.statement, "statement", MAX_TEXT_LENGTH)
}

pub fn validate_list_limit(limit: u32) -> GatewayResult<()> {
    if limit == 0 || limit > MAX_LIST_LIMIT {
        return Err(GatewayError::BadRequest(format!(
            "limit must be between 1 and {MAX_LIST_LIMIT}"
        )));
    }
    Ok(())
}
