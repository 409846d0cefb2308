use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

/// Input shape or range problems. These never reach the network.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("INVALID_GRADE_VALUE: {0} is outside 0..=10")]
    InvalidGradeValue(f64),
    #[error("INVALID_TRIMESTER: {0} is not one of 0, 1, 2, 3, 4")]
    InvalidTrimester(i32),
    #[error("INVALID_ID: {0}")]
    InvalidId(String),
    #[error("INVALID_KIND: {0}")]
    InvalidKind(String),
    #[error("MISSING_FIELD: {0}")]
    MissingField(&'static str),
}

#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("UNSUPPORTED: {0}")]
    Unsupported(String),
    #[error("BACKEND: {0}")]
    Backend(String),
    #[error("IO_FAILURE: {0}")]
    Io(String),
}

impl From<sqlx::Error> for GatewayError {
    fn from(value: sqlx::Error) -> Self {
        Self::Backend(value.to_string())
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(value: serde_json::Error) -> Self {
        Self::Backend(value.to_string())
    }
}

#[derive(Debug, Error)]
pub enum GradeError {
    #[error("VALIDATION: {0}")]
    Validation(#[from] ValidationError),
    #[error("NOT_FOUND: grade {0} is not in the local snapshot")]
    NotFound(Uuid),
    #[error("MUTATION_FAILED: {reason}")]
    MutationFailed {
        record_id: Option<Uuid>,
        reason: String,
    },
    #[error("TIMEOUT: mutation did not resolve within {after:?}")]
    TimeoutFailed {
        record_id: Option<Uuid>,
        after: Duration,
    },
    #[error("PARTIAL_BULK_FAILURE: {count} of {total} deletes failed", count = .failed_ids.len())]
    PartialBulkFailure { failed_ids: Vec<Uuid>, total: usize },
    #[error("STREAM_DEGRADED: {0}")]
    StreamDegraded(String),
    #[error("GATEWAY: {0}")]
    Gateway(#[from] GatewayError),
}

impl GradeError {
    pub fn mutation_failed(record_id: Option<Uuid>, reason: impl Into<String>) -> Self {
        Self::MutationFailed {
            record_id,
            reason: reason.into(),
        }
    }

    /// Timeouts are handled exactly like rejected mutations.
    pub fn is_mutation_failure(&self) -> bool {
        matches!(self, Self::MutationFailed { .. } | Self::TimeoutFailed { .. })
    }
}

pub type GradeResult<T> = Result<T, GradeError>;
