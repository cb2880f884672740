use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{PolicySource, ReviewStore};
use crate::error::{EngineError, Result};
use crate::model::{
    AssignmentStatus, ContestReviewPolicy, NewAssignment, PeerAssignment, PeerOutcome,
    PeerReview, PeerScore, ReminderTier, ReviewRecord, Reviewer, SubScores, Submission,
    SubmissionStatus,
};

#[derive(Default)]
struct MemoryState {
    submissions: HashMap<Uuid, Submission>,
    reviewers: Vec<Reviewer>,
    // insertion order keeps sweeps deterministic
    assignments: Vec<PeerAssignment>,
    reviews: Vec<PeerReview>,
    scores: HashMap<Uuid, PeerScore>,
    failing: HashSet<Uuid>,
}

impl MemoryState {
    fn assignment_mut(&mut self, id: Uuid) -> Option<&mut PeerAssignment> {
        self.assignments.iter_mut().find(|a| a.id == id)
    }

    fn record(&self, review: &PeerReview) -> Result<ReviewRecord> {
        let assignment = self
            .assignments
            .iter()
            .find(|a| a.id == review.assignment_id)
            .cloned()
            .ok_or_else(|| {
                EngineError::Integrity(format!(
                    "review {} references unknown assignment {}",
                    review.id, review.assignment_id
                ))
            })?;
        Ok(ReviewRecord {
            review: review.clone(),
            assignment,
        })
    }

    fn check_failure(&self, id: Uuid) -> Result<()> {
        if self.failing.contains(&id) {
            return Err(EngineError::Persistence(format!("injected write failure for {}", id)));
        }
        Ok(())
    }
}

/// In-memory store for tests and local development. Every reviewer is in
/// every contest's pool.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_submission(&self, submission: Submission) {
        self.state
            .write()
            .await
            .submissions
            .insert(submission.id, submission);
    }

    pub async fn add_reviewer(&self, reviewer: Reviewer) {
        self.state.write().await.reviewers.push(reviewer);
    }

    pub async fn set_banned(&self, reviewer_id: Uuid, banned: bool) {
        let mut state = self.state.write().await;
        for reviewer in state.reviewers.iter_mut().filter(|r| r.id == reviewer_id) {
            reviewer.banned = banned;
        }
    }

    /// Insert an assignment as-is, bypassing the live-count checks. Used to
    /// seed history such as past expiries.
    pub async fn seed_assignment(&self, assignment: PeerAssignment) {
        self.state.write().await.assignments.push(assignment);
    }

    /// Make every write touching `assignment_id` fail with a persistence error.
    pub async fn fail_writes_for(&self, assignment_id: Uuid) {
        self.state.write().await.failing.insert(assignment_id);
    }

    pub async fn all_assignments(&self) -> Vec<PeerAssignment> {
        self.state.read().await.assignments.clone()
    }
}

#[async_trait]
impl ReviewStore for MemoryStore {
    async fn submission(&self, id: Uuid) -> Result<Option<Submission>> {
        Ok(self.state.read().await.submissions.get(&id).cloned())
    }

    async fn submissions_in_status(&self, status: SubmissionStatus) -> Result<Vec<Submission>> {
        let state = self.state.read().await;
        let mut found: Vec<Submission> = state
            .submissions
            .values()
            .filter(|s| s.status == status)
            .cloned()
            .collect();
        found.sort_by_key(|s| s.id);
        Ok(found)
    }

    async fn transition_submission(
        &self,
        id: Uuid,
        from: SubmissionStatus,
        to: SubmissionStatus,
    ) -> Result<bool> {
        let mut state = self.state.write().await;
        match state.submissions.get_mut(&id) {
            Some(submission) if submission.status == from => {
                submission.status = to;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(EngineError::NotFound(format!("submission {}", id))),
        }
    }

    async fn record_outcome(&self, id: Uuid, outcome: PeerOutcome) -> Result<()> {
        let mut state = self.state.write().await;
        let submission = state
            .submissions
            .get_mut(&id)
            .ok_or_else(|| EngineError::NotFound(format!("submission {}", id)))?;
        submission.peer_outcome = Some(outcome);
        submission.status = outcome.status();
        Ok(())
    }

    async fn reviewer_pool(&self, _contest_id: Uuid) -> Result<Vec<Reviewer>> {
        Ok(self.state.read().await.reviewers.clone())
    }

    async fn expired_counts(&self, reviewer_ids: &[Uuid]) -> Result<HashMap<Uuid, u32>> {
        let state = self.state.read().await;
        let wanted: HashSet<&Uuid> = reviewer_ids.iter().collect();
        let mut counts = HashMap::new();
        for assignment in state
            .assignments
            .iter()
            .filter(|a| a.status == AssignmentStatus::Expired && wanted.contains(&a.reviewer_id))
        {
            *counts.entry(assignment.reviewer_id).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn assignment(&self, id: Uuid) -> Result<Option<PeerAssignment>> {
        let state = self.state.read().await;
        Ok(state.assignments.iter().find(|a| a.id == id).cloned())
    }

    async fn assignments_for_submission(&self, submission_id: Uuid) -> Result<Vec<PeerAssignment>> {
        let state = self.state.read().await;
        Ok(state
            .assignments
            .iter()
            .filter(|a| a.submission_id == submission_id)
            .cloned()
            .collect())
    }

    async fn insert_assignments(
        &self,
        submission_id: Uuid,
        expected_live: usize,
        batch: Vec<NewAssignment>,
    ) -> Result<Vec<PeerAssignment>> {
        let mut state = self.state.write().await;

        let live = state
            .assignments
            .iter()
            .filter(|a| a.submission_id == submission_id && a.status.is_live())
            .count();
        if live != expected_live {
            return Err(EngineError::StaleWrite(format!(
                "submission {} has {} live assignments, expected {}",
                submission_id, live, expected_live
            )));
        }

        let mut pending: HashSet<Uuid> = state
            .assignments
            .iter()
            .filter(|a| a.submission_id == submission_id && a.status == AssignmentStatus::Pending)
            .map(|a| a.reviewer_id)
            .collect();
        let replaced: HashSet<Uuid> = state
            .assignments
            .iter()
            .filter_map(|a| a.replaces_assignment_id)
            .collect();

        let mut created = Vec::with_capacity(batch.len());
        for new in batch {
            if new.submission_id != submission_id {
                return Err(EngineError::Integrity(format!(
                    "assignment for submission {} in batch for {}",
                    new.submission_id, submission_id
                )));
            }
            if !pending.insert(new.reviewer_id) {
                return Err(EngineError::Integrity(format!(
                    "duplicate live assignment for reviewer {} on submission {}",
                    new.reviewer_id, submission_id
                )));
            }
            if let Some(previous) = new.replaces_assignment_id {
                state.check_failure(previous)?;
                if replaced.contains(&previous) {
                    return Err(EngineError::StaleWrite(format!(
                        "assignment {} already has a replacement",
                        previous
                    )));
                }
            }
            created.push(new.into_assignment(Uuid::new_v4()));
        }

        state.assignments.extend(created.iter().cloned());
        Ok(created)
    }

    async fn pending_past_deadline(&self, now: DateTime<Utc>) -> Result<Vec<PeerAssignment>> {
        let state = self.state.read().await;
        Ok(state
            .assignments
            .iter()
            .filter(|a| a.status == AssignmentStatus::Pending && a.deadline < now)
            .cloned()
            .collect())
    }

    async fn expire_assignment(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let mut state = self.state.write().await;
        state.check_failure(id)?;
        match state.assignment_mut(id) {
            Some(a) if a.status == AssignmentStatus::Pending && a.deadline < now => {
                a.status = AssignmentStatus::Expired;
                a.expired_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn unreplaced_expired(&self) -> Result<Vec<PeerAssignment>> {
        let state = self.state.read().await;
        let replaced: HashSet<Uuid> = state
            .assignments
            .iter()
            .filter_map(|a| a.replaces_assignment_id)
            .collect();
        Ok(state
            .assignments
            .iter()
            .filter(|a| a.status == AssignmentStatus::Expired && !replaced.contains(&a.id))
            .cloned()
            .collect())
    }

    async fn pending_due_within(
        &self,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<PeerAssignment>> {
        let state = self.state.read().await;
        Ok(state
            .assignments
            .iter()
            .filter(|a| {
                a.status == AssignmentStatus::Pending && a.deadline > now && a.deadline <= until
            })
            .cloned()
            .collect())
    }

    async fn claim_reminder(&self, id: Uuid, tier: ReminderTier, now: DateTime<Utc>) -> Result<bool> {
        let mut state = self.state.write().await;
        state.check_failure(id)?;
        let Some(a) = state.assignment_mut(id) else {
            return Ok(false);
        };
        if a.status != AssignmentStatus::Pending {
            return Ok(false);
        }
        let slot = match tier {
            ReminderTier::Warning => &mut a.warning_sent_at,
            ReminderTier::FinalReminder => &mut a.final_reminder_sent_at,
        };
        if slot.is_some() {
            return Ok(false);
        }
        *slot = Some(now);
        Ok(true)
    }

    async fn complete_assignment(&self, review: &PeerReview) -> Result<bool> {
        let mut state = self.state.write().await;
        state.check_failure(review.assignment_id)?;
        if state.reviews.iter().any(|r| r.assignment_id == review.assignment_id) {
            return Err(EngineError::Integrity(format!(
                "assignment {} already has a review",
                review.assignment_id
            )));
        }
        match state.assignment_mut(review.assignment_id) {
            Some(a) if a.status == AssignmentStatus::Pending => {
                a.status = AssignmentStatus::Done;
                a.completed_at = Some(review.submitted_at);
            }
            Some(_) => return Ok(false),
            None => {
                return Err(EngineError::NotFound(format!(
                    "assignment {}",
                    review.assignment_id
                )))
            }
        }
        state.reviews.push(review.clone());
        Ok(true)
    }

    async fn review(&self, id: Uuid) -> Result<Option<ReviewRecord>> {
        let state = self.state.read().await;
        match state.reviews.iter().find(|r| r.id == id) {
            Some(review) => state.record(review).map(Some),
            None => Ok(None),
        }
    }

    async fn reviews_for_submission(&self, submission_id: Uuid) -> Result<Vec<ReviewRecord>> {
        let state = self.state.read().await;
        let mut records = Vec::new();
        for review in &state.reviews {
            let record = state.record(review)?;
            if record.assignment.submission_id == submission_id {
                records.push(record);
            }
        }
        Ok(records)
    }

    async fn update_review_scores(&self, review_id: Uuid, scores: SubScores) -> Result<()> {
        let mut state = self.state.write().await;
        let review = state
            .reviews
            .iter_mut()
            .find(|r| r.id == review_id)
            .ok_or_else(|| EngineError::NotFound(format!("review {}", review_id)))?;
        review.scores = scores;
        Ok(())
    }

    async fn save_score(&self, score: &PeerScore) -> Result<()> {
        self.state
            .write()
            .await
            .scores
            .insert(score.submission_id, score.clone());
        Ok(())
    }

    async fn score(&self, submission_id: Uuid) -> Result<Option<PeerScore>> {
        Ok(self.state.read().await.scores.get(&submission_id).cloned())
    }

    async fn scores_for_contest(&self, contest_id: Uuid) -> Result<Vec<PeerScore>> {
        let state = self.state.read().await;
        Ok(state
            .scores
            .values()
            .filter(|s| s.contest_id == contest_id)
            .cloned()
            .collect())
    }

    async fn mark_finalists(&self, contest_id: Uuid, finalists: &[Uuid]) -> Result<()> {
        let mut state = self.state.write().await;
        for submission in state
            .submissions
            .values_mut()
            .filter(|s| s.contest_id == contest_id)
        {
            submission.is_finalist = finalists.contains(&submission.id);
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryPolicies {
    policies: RwLock<HashMap<Uuid, ContestReviewPolicy>>,
}

impl MemoryPolicies {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, policy: ContestReviewPolicy) {
        self.policies.write().await.insert(policy.contest_id, policy);
    }
}

#[async_trait]
impl PolicySource for MemoryPolicies {
    async fn policy(&self, contest_id: Uuid) -> Result<Option<ContestReviewPolicy>> {
        Ok(self.policies.read().await.get(&contest_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn pending(submission_id: Uuid, reviewer_id: Uuid, deadline: DateTime<Utc>) -> PeerAssignment {
        NewAssignment {
            submission_id,
            reviewer_id,
            created_at: deadline - Duration::days(7),
            deadline,
            replaces_assignment_id: None,
        }
        .into_assignment(Uuid::new_v4())
    }

    #[tokio::test]
    async fn insert_rejects_stale_live_count() {
        let store = MemoryStore::new();
        let submission_id = Uuid::new_v4();
        let now = Utc::now();
        store.seed_assignment(pending(submission_id, Uuid::new_v4(), now)).await;

        let batch = vec![NewAssignment {
            submission_id,
            reviewer_id: Uuid::new_v4(),
            created_at: now,
            deadline: now + Duration::days(7),
            replaces_assignment_id: None,
        }];
        let err = store.insert_assignments(submission_id, 0, batch).await.unwrap_err();
        assert!(matches!(err, EngineError::StaleWrite(_)));
    }

    #[tokio::test]
    async fn insert_rejects_second_pending_for_same_pair() {
        let store = MemoryStore::new();
        let submission_id = Uuid::new_v4();
        let reviewer_id = Uuid::new_v4();
        let now = Utc::now();
        store.seed_assignment(pending(submission_id, reviewer_id, now)).await;

        let batch = vec![NewAssignment {
            submission_id,
            reviewer_id,
            created_at: now,
            deadline: now + Duration::days(7),
            replaces_assignment_id: None,
        }];
        let err = store.insert_assignments(submission_id, 1, batch).await.unwrap_err();
        assert!(matches!(err, EngineError::Integrity(_)));
        assert_eq!(store.all_assignments().await.len(), 1);
    }

    #[tokio::test]
    async fn expire_only_transitions_rows_still_pending() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let assignment = pending(Uuid::new_v4(), Uuid::new_v4(), now - Duration::hours(1));
        let id = assignment.id;
        store.seed_assignment(assignment).await;

        assert!(store.expire_assignment(id, now).await.unwrap());
        assert!(!store.expire_assignment(id, now).await.unwrap());
    }

    #[tokio::test]
    async fn reminder_claim_is_at_most_once_per_tier() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let assignment = pending(Uuid::new_v4(), Uuid::new_v4(), now + Duration::hours(1));
        let id = assignment.id;
        store.seed_assignment(assignment).await;

        assert!(store.claim_reminder(id, ReminderTier::Warning, now).await.unwrap());
        assert!(!store.claim_reminder(id, ReminderTier::Warning, now).await.unwrap());
        assert!(store.claim_reminder(id, ReminderTier::FinalReminder, now).await.unwrap());
    }
}
