use chrono::{DateTime, Utc};
use serde_json::json;
use std::cmp::Ordering;
use tracing::info;
use uuid::Uuid;

use super::Engine;
use crate::dispatch::{AuditAction, AuditEntry};
use crate::error::Result;
use crate::model::{ContestReviewPolicy, Outcome, PeerOutcome, PeerScore, ShortlistEntry, Submission};

fn outcome_for(score: &PeerScore, policy: &ContestReviewPolicy) -> PeerOutcome {
    if score.overall < policy.elimination_threshold {
        PeerOutcome::Eliminated
    } else {
        PeerOutcome::Reinstated
    }
}

/// Rank quorum-reached scores: aggregate descending, then earliest quorum,
/// then submission id so equal inputs always give the same list.
pub fn rank_shortlist(scores: &[PeerScore], quorum: u32, size: u32) -> Vec<ShortlistEntry> {
    let mut ranked: Vec<(&PeerScore, DateTime<Utc>)> = scores
        .iter()
        .filter(|s| s.review_count >= quorum)
        .filter_map(|s| s.quorum_reached_at.map(|at| (s, at)))
        .collect();

    ranked.sort_by(|(a, a_at), (b, b_at)| {
        b.overall
            .partial_cmp(&a.overall)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a_at.cmp(b_at))
            .then_with(|| a.submission_id.cmp(&b.submission_id))
    });

    ranked
        .into_iter()
        .take(size as usize)
        .enumerate()
        .map(|(i, (score, at))| ShortlistEntry {
            rank: i as u32 + 1,
            submission_id: score.submission_id,
            overall: score.overall,
            quorum_reached_at: at,
        })
        .collect()
}

impl Engine {
    /// Evaluate a submission against its contest's elimination threshold.
    /// Below quorum nothing is written.
    pub async fn decide(&self, submission_id: Uuid, now: DateTime<Utc>) -> Result<Outcome> {
        let submission = self.load_submission(submission_id).await?;
        let policy = self.policy_cache().get(submission.contest_id).await?;
        let score = match self.store.score(submission_id).await? {
            Some(score) => score,
            None => self.recompute_for(&submission, policy.quorum, now).await?,
        };
        self.decide_with(&submission, &policy, &score, None, now).await
    }

    pub(super) async fn decide_with(
        &self,
        submission: &Submission,
        policy: &ContestReviewPolicy,
        score: &PeerScore,
        actor_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<Outcome> {
        if score.review_count < policy.quorum {
            return Ok(Outcome::AwaitingQuorum {
                completed: score.review_count,
                quorum: policy.quorum,
            });
        }

        let outcome = outcome_for(score, policy);
        let changed = submission.peer_outcome != Some(outcome) || submission.status != outcome.status();
        if changed {
            self.store.record_outcome(submission.id, outcome).await?;
            info!(
                submission_id = %submission.id,
                outcome = outcome.as_str(),
                overall = score.overall,
                "Peer verification decided"
            );
            self.record_audit(AuditEntry {
                action: AuditAction::OutcomeDecided,
                actor_id,
                subject_id: submission.id,
                detail: json!({
                    "previous": submission.peer_outcome.map(|o| o.as_str()),
                    "outcome": outcome.as_str(),
                    "overall": score.overall,
                    "threshold": policy.elimination_threshold,
                    "reviews": score.review_count,
                }),
                at: now,
            })
            .await;
        }

        Ok(Outcome::Decided { outcome })
    }

    /// Rank every quorum-reached submission in the contest and flag the top
    /// `shortlist_size` as finalists.
    pub async fn select_shortlist(&self, contest_id: Uuid, now: DateTime<Utc>) -> Result<Vec<ShortlistEntry>> {
        let policy = self.policy_cache().get(contest_id).await?;
        let scores = self.store.scores_for_contest(contest_id).await?;
        let shortlist = rank_shortlist(&scores, policy.quorum, policy.shortlist_size);

        let finalists: Vec<Uuid> = shortlist.iter().map(|e| e.submission_id).collect();
        self.store.mark_finalists(contest_id, &finalists).await?;

        info!(contest_id = %contest_id, finalists = finalists.len(), "Shortlist selected");
        self.record_audit(AuditEntry::system(
            AuditAction::FinalistsMarked,
            contest_id,
            json!({ "finalists": finalists }),
            now,
        ))
        .await;

        Ok(shortlist)
    }
}
