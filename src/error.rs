use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("configuration absent: {0}")]
    ConfigAbsent(String),

    #[error("invalid review policy for contest {contest_id}: {reason}")]
    InvalidPolicy { contest_id: Uuid, reason: String },

    #[error("persistence failure: {0}")]
    Persistence(String),

    /// Duplicate live assignment, orphaned review and similar states that
    /// correct operation never produces.
    #[error("data integrity violation: {0}")]
    Integrity(String),

    #[error("stale write: {0}")]
    StaleWrite(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid review: {0}")]
    InvalidReview(String),

    #[error("assignment {0} is no longer open for review")]
    AssignmentClosed(Uuid),

    #[error("dispatch failed: {0}")]
    Dispatch(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// Short machine-readable tag used in JSON status reports.
    pub fn status(&self) -> &'static str {
        match self {
            Self::ConfigAbsent(_) => "config_missing",
            Self::InvalidPolicy { .. } => "invalid_policy",
            Self::Persistence(_) => "persistence_error",
            Self::Integrity(_) => "integrity_violation",
            Self::StaleWrite(_) => "stale_write",
            Self::NotFound(_) => "not_found",
            Self::InvalidReview(_) => "invalid_review",
            Self::AssignmentClosed(_) => "assignment_closed",
            Self::Dispatch(_) => "dispatch_failed",
        }
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            // 23505 = unique_violation
            if db_err.code().as_deref() == Some("23505") {
                return match db_err.constraint() {
                    Some("peer_assignments_live_pair") => {
                        Self::Integrity(format!("duplicate live assignment: {}", db_err.message()))
                    }
                    Some("peer_reviews_assignment_id_key") => {
                        Self::Integrity(format!("second review for one assignment: {}", db_err.message()))
                    }
                    _ => Self::StaleWrite(db_err.message().to_string()),
                };
            }
        }
        Self::Persistence(err.to_string())
    }
}
