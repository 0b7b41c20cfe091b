mod auth;
mod fallback;
mod health;
mod scholarships;

pub use auth::{login, session};
pub use fallback::not_found;
pub use health::{health_check, readiness_check};
pub use scholarships::{create_scholarship, list_scholarships, submit_application};
