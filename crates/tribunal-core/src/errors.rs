use thiserror::Error;

/// Error taxonomy shared by every component. Variants map 1:1 onto the
/// `error_kind` strings that reach rows, logs, and HTTP bodies.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid: {0}")]
    Invalid(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("stale version: expected {expected}, found {found}")]
    StaleVersion { expected: i64, found: i64 },
    #[error("illegal transition: {from} -> {to}")]
    IllegalTransition { from: String, to: String },
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("transport: {0}")]
    Transport(String),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("circuit open")]
    CircuitOpen,
    #[error("cancelled")]
    Cancelled,
    #[error("internal: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;

impl CoreError {
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::Invalid(_) => "invalid",
            CoreError::NotFound(_) => "not_found",
            CoreError::Forbidden(_) => "forbidden",
            CoreError::Conflict(_) => "conflict",
            CoreError::StaleVersion { .. } => "stale_version",
            CoreError::IllegalTransition { .. } => "illegal_transition",
            CoreError::Timeout(_) => "timeout",
            CoreError::Transport(_) => "transport",
            CoreError::RateLimited(_) => "rate_limited",
            CoreError::CircuitOpen => "circuit_open",
            CoreError::Cancelled => "cancelled",
            CoreError::Internal(_) => "internal",
        }
    }

    /// Transient failures the connector is allowed to retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::Transport(_) | CoreError::RateLimited(_) | CoreError::Timeout(_)
        )
    }

    pub fn internal(e: impl std::fmt::Display) -> Self {
        CoreError::Internal(e.to_string())
    }
}

impl From<rusqlite::Error> for CoreError {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(code, _)
                if code.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                CoreError::Conflict(e.to_string())
            }
            _ => CoreError::Internal(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Internal(e.to_string())
    }
}
