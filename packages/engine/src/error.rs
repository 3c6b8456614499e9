use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced across the engine's public boundaries (Job Manager, Task
/// Queue, façade). Mirrors the `ErrorKind`/`DeserializationError` split this
/// codebase already uses in `kernel::jobs` — typed, matchable, and mapped to
/// the `{code}` taxonomy at the HTTP edge.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("daily quota exceeded: used {used}/{limit}, resets at {resets_at}")]
    QuotaExceeded {
        used: i64,
        limit: i64,
        resets_at: chrono::DateTime<chrono::Utc>,
        plan: String,
    },

    #[error("transient failure: {0}")]
    Transient(#[source] anyhow::Error),

    #[error("permanent failure: {0}")]
    Permanent(String),

    #[error("worker lost lease for task {task_id}")]
    WorkerLoss { task_id: Uuid },

    #[error("concurrent modification on {entity} {id}")]
    ConcurrentModification { entity: &'static str, id: Uuid },

    #[error("not found: {entity} {id}")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl EngineError {
    /// Maps to the error-code taxonomy of the HTTP façade (§6).
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "VALIDATION_ERROR",
            EngineError::QuotaExceeded { .. } => "QUOTA_EXCEEDED",
            EngineError::Transient(_) => "SERVICE_UNAVAILABLE",
            EngineError::Permanent(_) => "INTERNAL_ERROR",
            EngineError::WorkerLoss { .. } => "CONFLICT",
            EngineError::ConcurrentModification { .. } => "CONFLICT",
            EngineError::NotFound { .. } => "NOT_FOUND",
            EngineError::Database(_) => "DATABASE_ERROR",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Transient(_) | EngineError::ConcurrentModification { .. }
        )
    }
}

/// Error kinds the Crawler distinguishes (§4.4.4), independent of `EngineError`
/// since they classify probe failures before a task-level decision is made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CrawlErrorKind {
    #[error("timeout")]
    Timeout,
    #[error("dns resolution failed")]
    Dns,
    #[error("tls error")]
    Tls,
    #[error("connection reset")]
    ConnectionReset,
    #[error("http 4xx")]
    Http4xx,
    #[error("http 5xx")]
    Http5xx,
    #[error("http redirect loop")]
    HttpRedirectLoop,
    #[error("robots denied")]
    RobotsDenied,
    #[error("body too large")]
    BodyTooLarge,
    #[error("other crawl error")]
    Other,
}

impl CrawlErrorKind {
    /// Only timeout | dns | connection_reset | http_5xx | 408/425/429 are
    /// retryable (§4.4.4). `status` disambiguates 4xx into retryable vs not.
    pub fn is_retryable(&self, status: Option<u16>) -> bool {
        match self {
            CrawlErrorKind::Timeout
            | CrawlErrorKind::Dns
            | CrawlErrorKind::ConnectionReset
            | CrawlErrorKind::Http5xx => true,
            CrawlErrorKind::Http4xx => matches!(status, Some(408) | Some(425) | Some(429)),
            CrawlErrorKind::Tls
            | CrawlErrorKind::HttpRedirectLoop
            | CrawlErrorKind::RobotsDenied
            | CrawlErrorKind::BodyTooLarge
            | CrawlErrorKind::Other => false,
        }
    }
}

#[derive(Debug, Error)]
pub struct CrawlError {
    pub kind: CrawlErrorKind,
    pub status: Option<u16>,
    #[source]
    pub source: anyhow::Error,
}

impl std::fmt::Display for CrawlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (status={:?}): {}", self.kind, self.status, self.source)
    }
}

impl CrawlError {
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable(self.status)
    }
}
