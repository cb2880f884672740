use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use uuid::Uuid;

use super::models::{
    AssignmentRow, PolicyRow, ReviewRecordRow, ReviewerRow, ScoreRow, StrikeRow, SubmissionRow,
};
use super::DbPool;
use crate::dispatch::{AuditEntry, AuditSink};
use crate::error::{EngineError, Result};
use crate::model::{
    ContestReviewPolicy, NewAssignment, PeerAssignment, PeerOutcome, PeerReview, PeerScore,
    ReminderTier, ReviewRecord, Reviewer, SubScores, Submission, SubmissionStatus,
};
use crate::storage::{PolicySource, ReviewStore};

const SUBMISSION_COLUMNS: &str = "id, contest_id, author_id, status, peer_outcome, is_finalist";

const ASSIGNMENT_COLUMNS: &str = "id, submission_id, reviewer_id, status, created_at, deadline, \
     completed_at, expired_at, replaces_assignment_id, warning_sent_at, final_reminder_sent_at";

const REVIEW_RECORD_SELECT: &str = r#"
    SELECT r.id AS review_id, r.assignment_id, r.clarity, r.argument, r.style, r.moral_depth,
           r.justification, r.submitted_at,
           a.submission_id, a.reviewer_id, a.status, a.created_at, a.deadline, a.completed_at,
           a.expired_at, a.replaces_assignment_id, a.warning_sent_at, a.final_reminder_sent_at
    FROM peer_reviews r
    JOIN peer_assignments a ON a.id = r.assignment_id
"#;

const SCORE_COLUMNS: &str = "submission_id, contest_id, review_count, clarity, argument, style, \
     moral_depth, overall, quorum_reached_at, computed_at";

fn assignments(rows: Vec<AssignmentRow>) -> Result<Vec<PeerAssignment>> {
    rows.into_iter().map(PeerAssignment::try_from).collect()
}

pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn submission_exists(&self, id: Uuid) -> Result<bool> {
        let found: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM submissions WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool.as_ref())
            .await?;
        Ok(found.is_some())
    }
}

#[async_trait]
impl ReviewStore for PgStore {
    async fn submission(&self, id: Uuid) -> Result<Option<Submission>> {
        let row = sqlx::query_as::<_, SubmissionRow>(&format!(
            "SELECT {} FROM submissions WHERE id = $1",
            SUBMISSION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(self.pool.as_ref())
        .await?;
        row.map(Submission::try_from).transpose()
    }

    async fn submissions_in_status(&self, status: SubmissionStatus) -> Result<Vec<Submission>> {
        let rows = sqlx::query_as::<_, SubmissionRow>(&format!(
            "SELECT {} FROM submissions WHERE status = $1 ORDER BY created_at, id",
            SUBMISSION_COLUMNS
        ))
        .bind(status.as_str())
        .fetch_all(self.pool.as_ref())
        .await?;
        rows.into_iter().map(Submission::try_from).collect()
    }

    async fn transition_submission(
        &self,
        id: Uuid,
        from: SubmissionStatus,
        to: SubmissionStatus,
    ) -> Result<bool> {
        let result = sqlx::query("UPDATE submissions SET status = $3 WHERE id = $1 AND status = $2")
            .bind(id)
            .bind(from.as_str())
            .bind(to.as_str())
            .execute(self.pool.as_ref())
            .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        if !self.submission_exists(id).await? {
            return Err(EngineError::NotFound(format!("submission {}", id)));
        }
        Ok(false)
    }

    async fn record_outcome(&self, id: Uuid, outcome: PeerOutcome) -> Result<()> {
        let result = sqlx::query("UPDATE submissions SET status = $2, peer_outcome = $3 WHERE id = $1")
            .bind(id)
            .bind(outcome.status().as_str())
            .bind(outcome.as_str())
            .execute(self.pool.as_ref())
            .await?;
        if result.rows_affected() == 0 {
            return Err(EngineError::NotFound(format!("submission {}", id)));
        }
        Ok(())
    }

    async fn reviewer_pool(&self, contest_id: Uuid) -> Result<Vec<Reviewer>> {
        let rows = sqlx::query_as::<_, ReviewerRow>(
            r#"
            SELECT u.id, u.banned
            FROM users u
            WHERE u.role = 'reviewer'
               OR EXISTS (
                   SELECT 1 FROM submissions s
                   WHERE s.author_id = u.id AND s.contest_id = $1
               )
            ORDER BY u.id
            "#,
        )
        .bind(contest_id)
        .fetch_all(self.pool.as_ref())
        .await?;
        Ok(rows.into_iter().map(Reviewer::from).collect())
    }

    async fn expired_counts(&self, reviewer_ids: &[Uuid]) -> Result<HashMap<Uuid, u32>> {
        if reviewer_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = sqlx::query_as::<_, StrikeRow>(
            r#"
            SELECT reviewer_id, COUNT(*) AS expired
            FROM peer_assignments
            WHERE status = 'expired' AND reviewer_id = ANY($1)
            GROUP BY reviewer_id
            "#,
        )
        .bind(reviewer_ids)
        .fetch_all(self.pool.as_ref())
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| (r.reviewer_id, r.expired.max(0) as u32))
            .collect())
    }

    async fn assignment(&self, id: Uuid) -> Result<Option<PeerAssignment>> {
        let row = sqlx::query_as::<_, AssignmentRow>(&format!(
            "SELECT {} FROM peer_assignments WHERE id = $1",
            ASSIGNMENT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(self.pool.as_ref())
        .await?;
        row.map(PeerAssignment::try_from).transpose()
    }

    async fn assignments_for_submission(&self, submission_id: Uuid) -> Result<Vec<PeerAssignment>> {
        let rows = sqlx::query_as::<_, AssignmentRow>(&format!(
            "SELECT {} FROM peer_assignments WHERE submission_id = $1 ORDER BY created_at, id",
            ASSIGNMENT_COLUMNS
        ))
        .bind(submission_id)
        .fetch_all(self.pool.as_ref())
        .await?;
        assignments(rows)
    }

    async fn insert_assignments(
        &self,
        submission_id: Uuid,
        expected_live: usize,
        batch: Vec<NewAssignment>,
    ) -> Result<Vec<PeerAssignment>> {
        let mut tx = self.pool.begin().await?;

        // serializes concurrent allocations for the same submission
        let locked: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM submissions WHERE id = $1 FOR UPDATE")
            .bind(submission_id)
            .fetch_optional(&mut *tx)
            .await?;
        if locked.is_none() {
            return Err(EngineError::NotFound(format!("submission {}", submission_id)));
        }

        let (live,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM peer_assignments WHERE submission_id = $1 AND status IN ('pending', 'done')",
        )
        .bind(submission_id)
        .fetch_one(&mut *tx)
        .await?;
        if live as usize != expected_live {
            return Err(EngineError::StaleWrite(format!(
                "submission {} has {} live assignments, expected {}",
                submission_id, live, expected_live
            )));
        }

        let mut created = Vec::with_capacity(batch.len());
        for new in batch {
            if new.submission_id != submission_id {
                return Err(EngineError::Integrity(format!(
                    "assignment for submission {} in batch for {}",
                    new.submission_id, submission_id
                )));
            }
            let row = sqlx::query_as::<_, AssignmentRow>(&format!(
                r#"
                INSERT INTO peer_assignments
                    (id, submission_id, reviewer_id, status, created_at, deadline, replaces_assignment_id)
                VALUES ($1, $2, $3, 'pending', $4, $5, $6)
                RETURNING {}
                "#,
                ASSIGNMENT_COLUMNS
            ))
            .bind(Uuid::new_v4())
            .bind(new.submission_id)
            .bind(new.reviewer_id)
            .bind(new.created_at)
            .bind(new.deadline)
            .bind(new.replaces_assignment_id)
            .fetch_one(&mut *tx)
            .await?;
            created.push(PeerAssignment::try_from(row)?);
        }

        tx.commit().await?;
        Ok(created)
    }

    async fn pending_past_deadline(&self, now: DateTime<Utc>) -> Result<Vec<PeerAssignment>> {
        let rows = sqlx::query_as::<_, AssignmentRow>(&format!(
            "SELECT {} FROM peer_assignments WHERE status = 'pending' AND deadline < $1 ORDER BY deadline, id",
            ASSIGNMENT_COLUMNS
        ))
        .bind(now)
        .fetch_all(self.pool.as_ref())
        .await?;
        assignments(rows)
    }

    async fn expire_assignment(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE peer_assignments
            SET status = 'expired', expired_at = $2
            WHERE id = $1 AND status = 'pending' AND deadline < $2
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(self.pool.as_ref())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn unreplaced_expired(&self) -> Result<Vec<PeerAssignment>> {
        let rows = sqlx::query_as::<_, AssignmentRow>(&format!(
            r#"
            SELECT {} FROM peer_assignments
            WHERE status = 'expired'
              AND NOT EXISTS (
                  SELECT 1 FROM peer_assignments r
                  WHERE r.replaces_assignment_id = peer_assignments.id
              )
            ORDER BY expired_at, id
            "#,
            ASSIGNMENT_COLUMNS
        ))
        .fetch_all(self.pool.as_ref())
        .await?;
        assignments(rows)
    }

    async fn pending_due_within(
        &self,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<Vec<PeerAssignment>> {
        let rows = sqlx::query_as::<_, AssignmentRow>(&format!(
            r#"
            SELECT {} FROM peer_assignments
            WHERE status = 'pending' AND deadline > $1 AND deadline <= $2
            ORDER BY deadline, id
            "#,
            ASSIGNMENT_COLUMNS
        ))
        .bind(now)
        .bind(until)
        .fetch_all(self.pool.as_ref())
        .await?;
        assignments(rows)
    }

    async fn claim_reminder(&self, id: Uuid, tier: ReminderTier, now: DateTime<Utc>) -> Result<bool> {
        let column = match tier {
            ReminderTier::Warning => "warning_sent_at",
            ReminderTier::FinalReminder => "final_reminder_sent_at",
        };
        let result = sqlx::query(&format!(
            "UPDATE peer_assignments SET {col} = $2 WHERE id = $1 AND status = 'pending' AND {col} IS NULL",
            col = column
        ))
        .bind(id)
        .bind(now)
        .execute(self.pool.as_ref())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn complete_assignment(&self, review: &PeerReview) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "UPDATE peer_assignments SET status = 'done', completed_at = $2 WHERE id = $1 AND status = 'pending'",
        )
        .bind(review.assignment_id)
        .bind(review.submitted_at)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            let found: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM peer_assignments WHERE id = $1")
                .bind(review.assignment_id)
                .fetch_optional(&mut *tx)
                .await?;
            return match found {
                Some(_) => Ok(false),
                None => Err(EngineError::NotFound(format!("assignment {}", review.assignment_id))),
            };
        }

        sqlx::query(
            r#"
            INSERT INTO peer_reviews
                (id, assignment_id, clarity, argument, style, moral_depth, justification, submitted_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(review.id)
        .bind(review.assignment_id)
        .bind(review.scores.clarity as i16)
        .bind(review.scores.argument as i16)
        .bind(review.scores.style as i16)
        .bind(review.scores.moral_depth as i16)
        .bind(&review.justification)
        .bind(review.submitted_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn review(&self, id: Uuid) -> Result<Option<ReviewRecord>> {
        let row = sqlx::query_as::<_, ReviewRecordRow>(&format!("{} WHERE r.id = $1", REVIEW_RECORD_SELECT))
            .bind(id)
            .fetch_optional(self.pool.as_ref())
            .await?;
        row.map(ReviewRecord::try_from).transpose()
    }

    async fn reviews_for_submission(&self, submission_id: Uuid) -> Result<Vec<ReviewRecord>> {
        let rows = sqlx::query_as::<_, ReviewRecordRow>(&format!(
            "{} WHERE a.submission_id = $1 ORDER BY r.submitted_at, r.id",
            REVIEW_RECORD_SELECT
        ))
        .bind(submission_id)
        .fetch_all(self.pool.as_ref())
        .await?;
        rows.into_iter().map(ReviewRecord::try_from).collect()
    }

    async fn update_review_scores(&self, review_id: Uuid, scores: SubScores) -> Result<()> {
        let result = sqlx::query(
            "UPDATE peer_reviews SET clarity = $2, argument = $3, style = $4, moral_depth = $5 WHERE id = $1",
        )
        .bind(review_id)
        .bind(scores.clarity as i16)
        .bind(scores.argument as i16)
        .bind(scores.style as i16)
        .bind(scores.moral_depth as i16)
        .execute(self.pool.as_ref())
        .await?;
        if result.rows_affected() == 0 {
            return Err(EngineError::NotFound(format!("review {}", review_id)));
        }
        Ok(())
    }

    async fn save_score(&self, score: &PeerScore) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO peer_scores
                (submission_id, contest_id, review_count, clarity, argument, style, moral_depth,
                 overall, quorum_reached_at, computed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (submission_id) DO UPDATE SET
                review_count = EXCLUDED.review_count,
                clarity = EXCLUDED.clarity,
                argument = EXCLUDED.argument,
                style = EXCLUDED.style,
                moral_depth = EXCLUDED.moral_depth,
                overall = EXCLUDED.overall,
                quorum_reached_at = EXCLUDED.quorum_reached_at,
                computed_at = EXCLUDED.computed_at
            "#,
        )
        .bind(score.submission_id)
        .bind(score.contest_id)
        .bind(score.review_count as i32)
        .bind(score.clarity)
        .bind(score.argument)
        .bind(score.style)
        .bind(score.moral_depth)
        .bind(score.overall)
        .bind(score.quorum_reached_at)
        .bind(score.computed_at)
        .execute(self.pool.as_ref())
        .await?;
        Ok(())
    }

    async fn score(&self, submission_id: Uuid) -> Result<Option<PeerScore>> {
        let row = sqlx::query_as::<_, ScoreRow>(&format!(
            "SELECT {} FROM peer_scores WHERE submission_id = $1",
            SCORE_COLUMNS
        ))
        .bind(submission_id)
        .fetch_optional(self.pool.as_ref())
        .await?;
        Ok(row.map(PeerScore::from))
    }

    async fn scores_for_contest(&self, contest_id: Uuid) -> Result<Vec<PeerScore>> {
        let rows = sqlx::query_as::<_, ScoreRow>(&format!(
            "SELECT {} FROM peer_scores WHERE contest_id = $1",
            SCORE_COLUMNS
        ))
        .bind(contest_id)
        .fetch_all(self.pool.as_ref())
        .await?;
        Ok(rows.into_iter().map(PeerScore::from).collect())
    }

    async fn mark_finalists(&self, contest_id: Uuid, finalists: &[Uuid]) -> Result<()> {
        sqlx::query("UPDATE submissions SET is_finalist = (id = ANY($2)) WHERE contest_id = $1")
            .bind(contest_id)
            .bind(finalists)
            .execute(self.pool.as_ref())
            .await?;
        Ok(())
    }
}

/// Reads review policy from the `contests` table.
pub struct PgPolicySource {
    pool: DbPool,
}

impl PgPolicySource {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PolicySource for PgPolicySource {
    async fn policy(&self, contest_id: Uuid) -> Result<Option<ContestReviewPolicy>> {
        let row = sqlx::query_as::<_, PolicyRow>(
            r#"
            SELECT id, target_reviews, deadline_offset_days, quorum, shortlist_size,
                   elimination_threshold, results_visible_to_authors, results_published
            FROM contests WHERE id = $1
            "#,
        )
        .bind(contest_id)
        .fetch_optional(self.pool.as_ref())
        .await?;
        Ok(row.map(ContestReviewPolicy::from))
    }
}

/// Appends audit entries to the `audit_log` table.
pub struct PgAudit {
    pool: DbPool,
}

impl PgAudit {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditSink for PgAudit {
    async fn record(&self, entry: &AuditEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO audit_log (action, actor_id, subject_id, detail, created_at) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(entry.action.as_str())
        .bind(entry.actor_id)
        .bind(entry.subject_id)
        .bind(&entry.detail)
        .bind(entry.at)
        .execute(self.pool.as_ref())
        .await?;
        Ok(())
    }
}
