mod api;

pub use api::{
    ApplicationAccepted, ApplicationRequest, CreateScholarshipRequest, HealthResponse,
    ListScholarshipsQuery, LoginRequest, LoginResponse, ReadinessResponse, ScholarshipAccepted,
    ScholarshipListResponse, SessionResponse,
};
