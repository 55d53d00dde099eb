//! Error taxonomy shared by every layer of the harvester.

use thiserror::Error;

/// SQLite primary result code for constraint violations. Extended codes keep
/// it in the low byte.
const SQLITE_CONSTRAINT: i32 = 19;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HarvestError {
    /// Rejected by a validator before any network or database work.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The metadata provider failed or returned something unusable.
    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Integrity error: {0}")]
    Integrity(String),

    #[error("Persistence error: {0}")]
    Persistence(String),
}

pub type HarvestResult<T> = Result<T, HarvestError>;

impl HarvestError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        Self::Upstream(message.into())
    }
}

impl From<libsql::Error> for HarvestError {
    fn from(err: libsql::Error) -> Self {
        if is_constraint_violation(&err) {
            HarvestError::Integrity(err.to_string())
        } else {
            HarvestError::Persistence(err.to_string())
        }
    }
}

/// Classified by the primary result code; extended codes keep it in the low byte.
fn is_constraint_violation(err: &libsql::Error) -> bool {
    matches!(err, libsql::Error::SqliteFailure(code, _) if (*code & 0xff) == SQLITE_CONSTRAINT)
}
