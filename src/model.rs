//! Domain types shared by the engine, the stores and the HTTP layer.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{EngineError, Result};

/// Number of expired assignments after which a reviewer stops receiving work.
pub const STRIKE_THRESHOLD: u32 = 2;

pub const SCORE_MIN: u8 = 1;
pub const SCORE_MAX: u8 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    Submitted,
    PeerVerificationPending,
    Eliminated,
    Reinstated,
}

impl SubmissionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::PeerVerificationPending => "peer_verification_pending",
            Self::Eliminated => "eliminated",
            Self::Reinstated => "reinstated",
        }
    }
}

impl FromStr for SubmissionStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "submitted" => Ok(Self::Submitted),
            "peer_verification_pending" => Ok(Self::PeerVerificationPending),
            "eliminated" => Ok(Self::Eliminated),
            "reinstated" => Ok(Self::Reinstated),
            other => Err(EngineError::Integrity(format!("unknown submission status '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerOutcome {
    Reinstated,
    Eliminated,
}

impl PeerOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reinstated => "reinstated",
            Self::Eliminated => "eliminated",
        }
    }

    /// Submission status that mirrors this outcome.
    pub fn status(&self) -> SubmissionStatus {
        match self {
            Self::Reinstated => SubmissionStatus::Reinstated,
            Self::Eliminated => SubmissionStatus::Eliminated,
        }
    }
}

impl FromStr for PeerOutcome {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "reinstated" => Ok(Self::Reinstated),
            "eliminated" => Ok(Self::Eliminated),
            other => Err(EngineError::Integrity(format!("unknown peer outcome '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    Pending,
    Done,
    Expired,
}

impl AssignmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Done => "done",
            Self::Expired => "expired",
        }
    }

    /// Pending and done assignments count toward a submission's target.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Pending | Self::Done)
    }
}

impl FromStr for AssignmentStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "done" => Ok(Self::Done),
            "expired" => Ok(Self::Expired),
            other => Err(EngineError::Integrity(format!("unknown assignment status '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    pub id: Uuid,
    pub contest_id: Uuid,
    pub author_id: Uuid,
    pub status: SubmissionStatus,
    pub peer_outcome: Option<PeerOutcome>,
    pub is_finalist: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerAssignment {
    pub id: Uuid,
    pub submission_id: Uuid,
    pub reviewer_id: Uuid,
    pub status: AssignmentStatus,
    pub created_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub expired_at: Option<DateTime<Utc>>,
    /// The lapsed assignment this one was created to replace.
    pub replaces_assignment_id: Option<Uuid>,
    pub warning_sent_at: Option<DateTime<Utc>>,
    pub final_reminder_sent_at: Option<DateTime<Utc>>,
}

/// An assignment the allocator has planned but not yet persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAssignment {
    pub submission_id: Uuid,
    pub reviewer_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub replaces_assignment_id: Option<Uuid>,
}

impl NewAssignment {
    pub fn into_assignment(self, id: Uuid) -> PeerAssignment {
        PeerAssignment {
            id,
            submission_id: self.submission_id,
            reviewer_id: self.reviewer_id,
            status: AssignmentStatus::Pending,
            created_at: self.created_at,
            deadline: self.deadline,
            completed_at: None,
            expired_at: None,
            replaces_assignment_id: self.replaces_assignment_id,
            warning_sent_at: None,
            final_reminder_sent_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubScores {
    pub clarity: u8,
    pub argument: u8,
    pub style: u8,
    pub moral_depth: u8,
}

impl SubScores {
    pub fn new(clarity: u8, argument: u8, style: u8, moral_depth: u8) -> Self {
        Self {
            clarity,
            argument,
            style,
            moral_depth,
        }
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("clarity", self.clarity),
            ("argument", self.argument),
            ("style", self.style),
            ("moral_depth", self.moral_depth),
        ] {
            if !(SCORE_MIN..=SCORE_MAX).contains(&value) {
                return Err(EngineError::InvalidReview(format!(
                    "{} must be between {} and {}, got {}",
                    name, SCORE_MIN, SCORE_MAX, value
                )));
            }
        }
        Ok(())
    }
}

/// Administrative correction: only the supplied criteria are rewritten.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScorePatch {
    pub clarity: Option<u8>,
    pub argument: Option<u8>,
    pub style: Option<u8>,
    pub moral_depth: Option<u8>,
}

impl ScorePatch {
    pub fn is_empty(&self) -> bool {
        self.clarity.is_none()
            && self.argument.is_none()
            && self.style.is_none()
            && self.moral_depth.is_none()
    }

    pub fn apply(&self, scores: SubScores) -> SubScores {
        SubScores {
            clarity: self.clarity.unwrap_or(scores.clarity),
            argument: self.argument.unwrap_or(scores.argument),
            style: self.style.unwrap_or(scores.style),
            moral_depth: self.moral_depth.unwrap_or(scores.moral_depth),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerReview {
    pub id: Uuid,
    pub assignment_id: Uuid,
    pub scores: SubScores,
    pub justification: String,
    pub submitted_at: DateTime<Utc>,
}

/// A review joined with the assignment it completes.
#[derive(Debug, Clone, PartialEq)]
pub struct ReviewRecord {
    pub review: PeerReview,
    pub assignment: PeerAssignment,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerScore {
    pub submission_id: Uuid,
    pub contest_id: Uuid,
    pub review_count: u32,
    pub clarity: f64,
    pub argument: f64,
    pub style: f64,
    pub moral_depth: f64,
    pub overall: f64,
    /// Submission time of the review that first brought the count to quorum.
    pub quorum_reached_at: Option<DateTime<Utc>>,
    pub computed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContestReviewPolicy {
    pub contest_id: Uuid,
    pub target_reviews: u32,
    pub deadline_offset_days: i64,
    pub quorum: u32,
    pub shortlist_size: u32,
    /// Aggregates strictly below this are eliminated.
    pub elimination_threshold: f64,
    pub results_visible_to_authors: bool,
    pub results_published: bool,
}

impl ContestReviewPolicy {
    pub fn validate(&self) -> Result<()> {
        let reason = if self.target_reviews == 0 {
            Some("target_reviews must be at least 1".to_string())
        } else if self.quorum == 0 || self.quorum > self.target_reviews {
            Some(format!(
                "quorum {} must be between 1 and target_reviews {}",
                self.quorum, self.target_reviews
            ))
        } else if self.deadline_offset_days <= 0 {
            Some("deadline_offset_days must be positive".to_string())
        } else {
            None
        };

        match reason {
            Some(reason) => Err(EngineError::InvalidPolicy {
                contest_id: self.contest_id,
                reason,
            }),
            None => Ok(()),
        }
    }

    pub fn deadline_for(&self, created_at: DateTime<Utc>) -> DateTime<Utc> {
        created_at + Duration::days(self.deadline_offset_days)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reviewer {
    pub id: Uuid,
    pub banned: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Shortfall {
    pub submission_id: Uuid,
    pub needed: u32,
    pub allocated: u32,
}

impl std::fmt::Display for Shortfall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "submission {}: needed {} reviewer(s), allocated {}",
            self.submission_id, self.needed, self.allocated
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AllocationResult {
    pub submission_id: Uuid,
    pub created: Vec<PeerAssignment>,
    pub shortfall: Option<Shortfall>,
}

/// Summary returned by every sweep entry point.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SweepReport {
    pub processed: usize,
    pub shortfalls: Vec<Shortfall>,
    pub errors: Vec<String>,
}

impl SweepReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Outcome {
    AwaitingQuorum { completed: u32, quorum: u32 },
    Decided { outcome: PeerOutcome },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShortlistEntry {
    pub rank: u32,
    pub submission_id: Uuid,
    pub overall: f64,
    pub quorum_reached_at: DateTime<Utc>,
}

/// Reminder tiers sent ahead of an assignment's deadline, at most once each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReminderTier {
    Warning,
    FinalReminder,
}

impl ReminderTier {
    pub fn lookahead(&self) -> Duration {
        match self {
            Self::Warning => Duration::hours(24),
            Self::FinalReminder => Duration::hours(2),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Warning => "warning",
            Self::FinalReminder => "final_reminder",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sub_scores_outside_range_are_rejected() {
        assert!(SubScores::new(1, 5, 3, 2).validate().is_ok());
        assert!(matches!(
            SubScores::new(0, 5, 3, 2).validate(),
            Err(EngineError::InvalidReview(_))
        ));
        assert!(SubScores::new(1, 5, 6, 2).validate().is_err());
    }

    #[test]
    fn patch_rewrites_only_supplied_criteria() {
        let patch = ScorePatch {
            style: Some(1),
            ..Default::default()
        };
        let patched = patch.apply(SubScores::new(3, 4, 5, 2));
        assert_eq!(patched, SubScores::new(3, 4, 1, 2));
    }

    #[test]
    fn policy_rejects_quorum_above_target() {
        let policy = ContestReviewPolicy {
            contest_id: Uuid::nil(),
            target_reviews: 2,
            deadline_offset_days: 7,
            quorum: 3,
            shortlist_size: 5,
            elimination_threshold: 3.0,
            results_visible_to_authors: false,
            results_published: false,
        };
        assert!(matches!(policy.validate(), Err(EngineError::InvalidPolicy { .. })));
    }

    #[test]
    fn status_strings_round_trip() {
        for status in [
            SubmissionStatus::Submitted,
            SubmissionStatus::PeerVerificationPending,
            SubmissionStatus::Eliminated,
            SubmissionStatus::Reinstated,
        ] {
            assert_eq!(status.as_str().parse::<SubmissionStatus>().ok(), Some(status));
        }
        assert!(matches!("lapsed".parse::<AssignmentStatus>(), Err(EngineError::Integrity(_))));
    }
}
