mod memory;

pub use memory::{MemoryPolicies, MemoryStore};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::Result;
use crate::model::{
    ContestReviewPolicy, NewAssignment, PeerAssignment, PeerOutcome, PeerReview, PeerScore,
    ReminderTier, ReviewRecord, Reviewer, SubScores, Submission, SubmissionStatus,
};

/// Persistence for submissions, assignments, reviews and scores.
///
/// Every status change is conditional on the row's current status at write
/// time, so overlapping sweeps serialize on the row rather than on a lock.
#[async_trait]
pub trait ReviewStore: Send + Sync {
    async fn submission(&self, id: Uuid) -> Result<Option<Submission>>;

    async fn submissions_in_status(&self, status: SubmissionStatus) -> Result<Vec<Submission>>;

    /// Move a submission from `from` to `to`; returns false if it was not in `from`.
    async fn transition_submission(
        &self,
        id: Uuid,
        from: SubmissionStatus,
        to: SubmissionStatus,
    ) -> Result<bool>;

    /// Persist a peer-verification outcome and the matching submission status.
    async fn record_outcome(&self, id: Uuid, outcome: PeerOutcome) -> Result<()>;

    /// Candidate reviewers for a contest, banned ones included.
    async fn reviewer_pool(&self, contest_id: Uuid) -> Result<Vec<Reviewer>>;

    /// System-wide expired assignment counts, keyed by reviewer.
    async fn expired_counts(&self, reviewer_ids: &[Uuid]) -> Result<HashMap<Uuid, u32>>;

    async fn assignment(&self, id: Uuid) -> Result<Option<PeerAssignment>>;

    async fn assignments_for_submission(&self, submission_id: Uuid) -> Result<Vec<PeerAssignment>>;

    /// Insert a batch of pending assignments for one submission as a single
    /// unit. Fails with `StaleWrite` if the submission's live assignment count
    /// is no longer `expected_live`, and with `Integrity` if a pending
    /// (submission, reviewer) pair would be duplicated.
    async fn insert_assignments(
        &self,
        submission_id: Uuid,
        expected_live: usize,
        batch: Vec<NewAssignment>,
    ) -> Result<Vec<PeerAssignment>>;

    async fn pending_past_deadline(&self, now: DateTime<Utc>) -> Result<Vec<PeerAssignment>>;

    /// pending -> expired, only if still pending and past deadline at write time.
    async fn expire_assignment(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool>;

    /// Expired assignments that no other assignment names as its predecessor.
    async fn unreplaced_expired(&self) -> Result<Vec<PeerAssignment>>;

    /// Pending assignments with `now < deadline <= until`.
    async fn pending_due_within(
        &self,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<PeerAssignment>>;

    /// Mark a reminder tier as sent; returns false if it already was or the
    /// assignment is no longer pending.
    async fn claim_reminder(&self, id: Uuid, tier: ReminderTier, now: DateTime<Utc>) -> Result<bool>;

    /// pending -> done together with the review row. Returns false if the
    /// assignment was not pending at write time.
    async fn complete_assignment(&self, review: &PeerReview) -> Result<bool>;

    async fn review(&self, id: Uuid) -> Result<Option<ReviewRecord>>;

    async fn reviews_for_submission(&self, submission_id: Uuid) -> Result<Vec<ReviewRecord>>;

    async fn update_review_scores(&self, review_id: Uuid, scores: SubScores) -> Result<()>;

    async fn save_score(&self, score: &PeerScore) -> Result<()>;

    async fn score(&self, submission_id: Uuid) -> Result<Option<PeerScore>>;

    async fn scores_for_contest(&self, contest_id: Uuid) -> Result<Vec<PeerScore>>;

    /// Flag exactly `finalists` within the contest, clearing everyone else.
    async fn mark_finalists(&self, contest_id: Uuid, finalists: &[Uuid]) -> Result<()>;
}

/// Read access to per-contest review configuration.
#[async_trait]
pub trait PolicySource: Send + Sync {
    async fn policy(&self, contest_id: Uuid) -> Result<Option<ContestReviewPolicy>>;
}
