use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use super::Engine;
use crate::dispatch::{AuditAction, AuditEntry};
use crate::error::{EngineError, Result};
use crate::model::{AssignmentStatus, Outcome, PeerReview, PeerScore, ScorePatch, SubScores};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReviewOutcome {
    pub review: PeerReview,
    pub score: PeerScore,
    pub outcome: Outcome,
}

impl Engine {
    /// Record a reviewer's review, close their assignment and refresh the
    /// submission's aggregate. The outcome is decided the first time the
    /// completed count reaches quorum; later reviews only move the score.
    pub async fn complete_review(
        &self,
        assignment_id: Uuid,
        reviewer_id: Uuid,
        scores: SubScores,
        justification: String,
        now: DateTime<Utc>,
    ) -> Result<ReviewOutcome> {
        scores.validate()?;

        let assignment = self
            .store
            .assignment(assignment_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("assignment {}", assignment_id)))?;
        if assignment.reviewer_id != reviewer_id {
            return Err(EngineError::InvalidReview(format!(
                "reviewer {} does not hold assignment {}",
                reviewer_id, assignment_id
            )));
        }
        if assignment.status != AssignmentStatus::Pending {
            return Err(EngineError::AssignmentClosed(assignment_id));
        }

        let review = PeerReview {
            id: Uuid::new_v4(),
            assignment_id,
            scores,
            justification,
            submitted_at: now,
        };
        if !self.store.complete_assignment(&review).await? {
            // expired between our read and the write
            return Err(EngineError::AssignmentClosed(assignment_id));
        }
        info!(
            assignment_id = %assignment_id,
            submission_id = %assignment.submission_id,
            "Review completed"
        );

        let submission = self.load_submission(assignment.submission_id).await?;
        let policy = self.policy_cache().get(submission.contest_id).await?;
        let score = self.recompute_for(&submission, policy.quorum, now).await?;

        let outcome = match submission.peer_outcome {
            Some(outcome) => Outcome::Decided { outcome },
            None => self.decide_with(&submission, &policy, &score, None, now).await?,
        };

        Ok(ReviewOutcome {
            review,
            score,
            outcome,
        })
    }

    /// Administrative correction of a review's sub-scores. The aggregate is
    /// recomputed and the outcome re-evaluated as part of the same call.
    pub async fn override_review(
        &self,
        review_id: Uuid,
        patch: ScorePatch,
        admin_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ReviewOutcome> {
        if patch.is_empty() {
            return Err(EngineError::InvalidReview("override changes no sub-score".to_string()));
        }

        let record = self
            .store
            .review(review_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("review {}", review_id)))?;
        if record.assignment.status != AssignmentStatus::Done {
            return Err(EngineError::Integrity(format!(
                "review {} attached to {} assignment {}",
                review_id,
                record.assignment.status.as_str(),
                record.assignment.id
            )));
        }

        let before = record.review.scores;
        let after = patch.apply(before);
        after.validate()?;
        self.store.update_review_scores(review_id, after).await?;

        warn!(
            review_id = %review_id,
            admin_id = %admin_id,
            "Review sub-scores overridden"
        );
        self.record_audit(AuditEntry {
            action: AuditAction::ScoreOverridden,
            actor_id: Some(admin_id),
            subject_id: review_id,
            detail: json!({ "before": before, "after": after }),
            at: now,
        })
        .await;

        let submission = self.load_submission(record.assignment.submission_id).await?;
        let policy = self.policy_cache().get(submission.contest_id).await?;
        let score = self.recompute_for(&submission, policy.quorum, now).await?;
        let outcome = self
            .decide_with(&submission, &policy, &score, Some(admin_id), now)
            .await?;

        Ok(ReviewOutcome {
            review: PeerReview {
                scores: after,
                ..record.review
            },
            score,
            outcome,
        })
    }
}
