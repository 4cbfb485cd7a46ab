//! Error taxonomy for the link service.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    /// A referenced identity does not exist where existence was required.
    /// Linking operations recover from this locally and report a no-op.
    #[error("not found: {0}")]
    NotFound(String),

    /// A uniqueness invariant would be violated by a non-replaceable write.
    /// Surfaced to callers as retryable.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The webhook event header does not parse into a known shape.
    #[error("malformed event header: {0}")]
    MalformedEvent(String),

    /// The header parses but maps to no handled event kind.
    #[error("unmatched event: {0}")]
    Unmatched(String),

    /// Accrual was asked to apply a negative duration.
    #[error("invalid duration: {0} seconds")]
    InvalidDuration(i64),

    /// Upstream read/write failed after retry.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("database error: {0}")]
    Database(String),
}

impl From<rusqlite::Error> for ServiceError {
    fn from(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::SqliteFailure(err, ref msg)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                ServiceError::Conflict(
                    msg.clone().unwrap_or_else(|| "uniqueness violation".to_string()),
                )
            }
            other => ServiceError::Database(other.to_string()),
        }
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;
