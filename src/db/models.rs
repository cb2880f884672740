use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::model::{
    AssignmentStatus, ContestReviewPolicy, PeerAssignment, PeerOutcome, PeerReview, PeerScore,
    ReviewRecord, Reviewer, SubScores, Submission, SubmissionStatus,
};

fn corrupt(table: &str, column: &str, value: &str) -> EngineError {
    EngineError::Integrity(format!("{}.{} holds unknown value '{}'", table, column, value))
}

fn score_value(column: &str, value: i16) -> Result<u8> {
    u8::try_from(value).map_err(|_| corrupt("peer_reviews", column, &value.to_string()))
}

#[derive(Debug, FromRow)]
pub struct SubmissionRow {
    pub id: Uuid,
    pub contest_id: Uuid,
    pub author_id: Uuid,
    pub status: String,
    pub peer_outcome: Option<String>,
    pub is_finalist: bool,
}

impl TryFrom<SubmissionRow> for Submission {
    type Error = EngineError;

    fn try_from(row: SubmissionRow) -> Result<Self> {
        let status: SubmissionStatus = row
            .status
            .parse()
            .map_err(|_| corrupt("submissions", "status", &row.status))?;
        let peer_outcome = match row.peer_outcome.as_deref() {
            None | Some("none") => None,
            Some(raw) => Some(
                raw.parse::<PeerOutcome>()
                    .map_err(|_| corrupt("submissions", "peer_outcome", raw))?,
            ),
        };
        Ok(Submission {
            id: row.id,
            contest_id: row.contest_id,
            author_id: row.author_id,
            status,
            peer_outcome,
            is_finalist: row.is_finalist,
        })
    }
}

#[derive(Debug, FromRow)]
pub struct AssignmentRow {
    pub id: Uuid,
    pub submission_id: Uuid,
    pub reviewer_id: Uuid,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub expired_at: Option<DateTime<Utc>>,
    pub replaces_assignment_id: Option<Uuid>,
    pub warning_sent_at: Option<DateTime<Utc>>,
    pub final_reminder_sent_at: Option<DateTime<Utc>>,
}

impl TryFrom<AssignmentRow> for PeerAssignment {
    type Error = EngineError;

    fn try_from(row: AssignmentRow) -> Result<Self> {
        let status: AssignmentStatus = row
            .status
            .parse()
            .map_err(|_| corrupt("peer_assignments", "status", &row.status))?;
        Ok(PeerAssignment {
            id: row.id,
            submission_id: row.submission_id,
            reviewer_id: row.reviewer_id,
            status,
            created_at: row.created_at,
            deadline: row.deadline,
            completed_at: row.completed_at,
            expired_at: row.expired_at,
            replaces_assignment_id: row.replaces_assignment_id,
            warning_sent_at: row.warning_sent_at,
            final_reminder_sent_at: row.final_reminder_sent_at,
        })
    }
}

/// A review joined with its assignment's columns.
#[derive(Debug, FromRow)]
pub struct ReviewRecordRow {
    pub review_id: Uuid,
    pub assignment_id: Uuid,
    pub clarity: i16,
    pub argument: i16,
    pub style: i16,
    pub moral_depth: i16,
    pub justification: String,
    pub submitted_at: DateTime<Utc>,
    pub submission_id: Uuid,
    pub reviewer_id: Uuid,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub expired_at: Option<DateTime<Utc>>,
    pub replaces_assignment_id: Option<Uuid>,
    pub warning_sent_at: Option<DateTime<Utc>>,
    pub final_reminder_sent_at: Option<DateTime<Utc>>,
}

impl TryFrom<ReviewRecordRow> for ReviewRecord {
    type Error = EngineError;

    fn try_from(row: ReviewRecordRow) -> Result<Self> {
        let scores = SubScores {
            clarity: score_value("clarity", row.clarity)?,
            argument: score_value("argument", row.argument)?,
            style: score_value("style", row.style)?,
            moral_depth: score_value("moral_depth", row.moral_depth)?,
        };
        let assignment = PeerAssignment::try_from(AssignmentRow {
            id: row.assignment_id,
            submission_id: row.submission_id,
            reviewer_id: row.reviewer_id,
            status: row.status,
            created_at: row.created_at,
            deadline: row.deadline,
            completed_at: row.completed_at,
            expired_at: row.expired_at,
            replaces_assignment_id: row.replaces_assignment_id,
            warning_sent_at: row.warning_sent_at,
            final_reminder_sent_at: row.final_reminder_sent_at,
        })?;
        Ok(ReviewRecord {
            review: PeerReview {
                id: row.review_id,
                assignment_id: row.assignment_id,
                scores,
                justification: row.justification,
                submitted_at: row.submitted_at,
            },
            assignment,
        })
    }
}

#[derive(Debug, FromRow)]
pub struct ScoreRow {
    pub submission_id: Uuid,
    pub contest_id: Uuid,
    pub review_count: i32,
    pub clarity: f64,
    pub argument: f64,
    pub style: f64,
    pub moral_depth: f64,
    pub overall: f64,
    pub quorum_reached_at: Option<DateTime<Utc>>,
    pub computed_at: DateTime<Utc>,
}

impl From<ScoreRow> for PeerScore {
    fn from(row: ScoreRow) -> Self {
        PeerScore {
            submission_id: row.submission_id,
            contest_id: row.contest_id,
            review_count: row.review_count.max(0) as u32,
            clarity: row.clarity,
            argument: row.argument,
            style: row.style,
            moral_depth: row.moral_depth,
            overall: row.overall,
            quorum_reached_at: row.quorum_reached_at,
            computed_at: row.computed_at,
        }
    }
}

#[derive(Debug, FromRow)]
pub struct PolicyRow {
    pub id: Uuid,
    pub target_reviews: i32,
    pub deadline_offset_days: i32,
    pub quorum: i32,
    pub shortlist_size: i32,
    pub elimination_threshold: f64,
    pub results_visible_to_authors: bool,
    pub results_published: bool,
}

impl From<PolicyRow> for ContestReviewPolicy {
    fn from(row: PolicyRow) -> Self {
        // negative counts clamp to zero and are then rejected by validate()
        ContestReviewPolicy {
            contest_id: row.id,
            target_reviews: row.target_reviews.max(0) as u32,
            deadline_offset_days: row.deadline_offset_days as i64,
            quorum: row.quorum.max(0) as u32,
            shortlist_size: row.shortlist_size.max(0) as u32,
            elimination_threshold: row.elimination_threshold,
            results_visible_to_authors: row.results_visible_to_authors,
            results_published: row.results_published,
        }
    }
}

#[derive(Debug, FromRow)]
pub struct ReviewerRow {
    pub id: Uuid,
    pub banned: bool,
}

impl From<ReviewerRow> for Reviewer {
    fn from(row: ReviewerRow) -> Self {
        Reviewer {
            id: row.id,
            banned: row.banned,
        }
    }
}

#[derive(Debug, FromRow)]
pub struct StrikeRow {
    pub reviewer_id: Uuid,
    pub expired: i64,
}
