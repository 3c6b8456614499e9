use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use engine::EngineError;

/// Error taxonomy at the HTTP edge (§6 "Exit codes & error envelope", §7).
/// `EngineError` covers the engine-internal cases; the façade adds the
/// handful of HTTP-only concerns (auth, routing, rate limiting) the engine
/// itself has no opinion about.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("unauthorised")]
    Unauthorised,
    #[error("forbidden")]
    Forbidden,
    #[error("not found")]
    NotFound,
    #[error("method not allowed")]
    MethodNotAllowed,
    #[error("rate limit exceeded")]
    RateLimitExceeded,
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl ApiError {
    fn code(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "BAD_REQUEST",
            ApiError::Unauthorised => "UNAUTHORISED",
            ApiError::Forbidden => "FORBIDDEN",
            ApiError::NotFound => "NOT_FOUND",
            ApiError::MethodNotAllowed => "METHOD_NOT_ALLOWED",
            ApiError::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            ApiError::Engine(err) => err.code(),
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorised => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ApiError::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Engine(EngineError::Validation(_)) => StatusCode::BAD_REQUEST,
            ApiError::Engine(EngineError::QuotaExceeded { .. }) => StatusCode::PAYMENT_REQUIRED,
            ApiError::Engine(EngineError::Transient(_)) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Engine(EngineError::Permanent(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Engine(EngineError::WorkerLoss { .. }) => StatusCode::CONFLICT,
            ApiError::Engine(EngineError::ConcurrentModification { .. }) => StatusCode::CONFLICT,
            ApiError::Engine(EngineError::NotFound { .. }) => StatusCode::NOT_FOUND,
            ApiError::Engine(EngineError::Database(_)) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// The `{status, data?, message?, code?}` envelope every response carries
/// (§6). `request_id` is propagated separately via the `X-Request-ID`
/// response header rather than the body, matching the spec's wording
/// ("every response carries `request_id` propagated from the header").
#[derive(Debug, Serialize)]
pub struct Envelope<T: Serialize> {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<&'static str>,
}

impl<T: Serialize> Envelope<T> {
    pub fn ok(data: T) -> Self {
        Self { status: "ok", data: Some(data), message: None, code: None }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code();
        let body = Envelope::<()> { status: "error", data: None, message: Some(self.to_string()), code: Some(code) };
        (status, Json(body)).into_response()
    }
}
