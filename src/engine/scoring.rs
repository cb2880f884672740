use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use super::Engine;
use crate::error::{EngineError, Result};
use crate::model::{AssignmentStatus, PeerScore, ReviewRecord, Submission, SubmissionStatus};

/// Arithmetic means of every criterion over all completed reviews.
///
/// Every record must belong to a done assignment; anything else means the
/// review and assignment tables disagree and is reported as an integrity
/// violation instead of being skipped.
pub fn aggregate(
    submission: &Submission,
    records: &[ReviewRecord],
    quorum: u32,
    now: DateTime<Utc>,
) -> Result<PeerScore> {
    for record in records {
        if record.assignment.status != AssignmentStatus::Done {
            return Err(EngineError::Integrity(format!(
                "review {} belongs to {} assignment {}",
                record.review.id,
                record.assignment.status.as_str(),
                record.assignment.id
            )));
        }
        if record.assignment.submission_id != submission.id {
            return Err(EngineError::Integrity(format!(
                "review {} aggregated under submission {} but belongs to {}",
                record.review.id, submission.id, record.assignment.submission_id
            )));
        }
    }

    let count = records.len();
    let mean = |pick: fn(&ReviewRecord) -> u8| -> f64 {
        if count == 0 {
            return 0.0;
        }
        records.iter().map(|r| pick(r) as f64).sum::<f64>() / count as f64
    };

    let clarity = mean(|r| r.review.scores.clarity);
    let argument = mean(|r| r.review.scores.argument);
    let style = mean(|r| r.review.scores.style);
    let moral_depth = mean(|r| r.review.scores.moral_depth);

    let mut completions: Vec<DateTime<Utc>> = records.iter().map(|r| r.review.submitted_at).collect();
    completions.sort();
    let quorum_reached_at = if quorum > 0 {
        completions.get(quorum as usize - 1).copied()
    } else {
        None
    };

    Ok(PeerScore {
        submission_id: submission.id,
        contest_id: submission.contest_id,
        review_count: count as u32,
        clarity,
        argument,
        style,
        moral_depth,
        overall: (clarity + argument + style + moral_depth) / 4.0,
        quorum_reached_at,
        computed_at: now,
    })
}

/// What an author may see of their own submission's peer score.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "visibility", rename_all = "snake_case")]
pub enum AuthorView {
    Hidden,
    NotScored,
    Visible { score: PeerScore },
}

impl Engine {
    /// Rebuild and persist the aggregate for one submission.
    pub async fn recompute_score(&self, submission_id: Uuid, now: DateTime<Utc>) -> Result<PeerScore> {
        let submission = self.load_submission(submission_id).await?;
        let policy = self.policy_cache().get(submission.contest_id).await?;
        self.recompute_for(&submission, policy.quorum, now).await
    }

    pub(super) async fn recompute_for(
        &self,
        submission: &Submission,
        quorum: u32,
        now: DateTime<Utc>,
    ) -> Result<PeerScore> {
        let records = self.store.reviews_for_submission(submission.id).await?;
        let score = aggregate(submission, &records, quorum, now)?;
        self.store.save_score(&score).await?;
        debug!(
            submission_id = %submission.id,
            reviews = score.review_count,
            overall = score.overall,
            "Recomputed peer score"
        );
        Ok(score)
    }

    pub(super) async fn load_submission(&self, submission_id: Uuid) -> Result<Submission> {
        self.store
            .submission(submission_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("submission {}", submission_id)))
    }

    /// The author's view of their peer score, gated by the contest's
    /// visibility flag until results are published.
    pub async fn author_view(&self, submission_id: Uuid, requester_id: Uuid) -> Result<AuthorView> {
        let submission = self.load_submission(submission_id).await?;
        if submission.author_id != requester_id {
            // do not reveal that the submission exists
            return Err(EngineError::NotFound(format!("submission {}", submission_id)));
        }

        let policy = self.policy_cache().get(submission.contest_id).await?;
        if !policy.results_visible_to_authors && !policy.results_published {
            return Ok(AuthorView::Hidden);
        }
        if submission.status == SubmissionStatus::Submitted {
            return Ok(AuthorView::NotScored);
        }

        Ok(match self.store.score(submission_id).await? {
            Some(score) => AuthorView::Visible { score },
            None => AuthorView::NotScored,
        })
    }
}
