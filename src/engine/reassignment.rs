use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::allocator::Slot;
use super::Engine;
use crate::error::{EngineError, Result};
use crate::model::{
    ContestReviewPolicy, PeerAssignment, Shortfall, Submission, SubmissionStatus, SweepReport,
};

enum Replacement {
    Created,
    Short(Shortfall),
    NotNeeded,
}

impl Engine {
    /// Give every lapsed, not-yet-replaced assignment a fresh one with a new
    /// reviewer and deadline. The lapsed row is never touched; the new row
    /// points back at it.
    pub async fn reassign_expired(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();

        let lapsed = match self.store.unreplaced_expired().await {
            Ok(rows) => rows,
            Err(e) => {
                error!("Failed to list lapsed assignments: {}", e);
                report.errors.push(format!("listing lapsed assignments: {}", e));
                return report;
            }
        };

        let mut policies = self.policy_cache();
        let mut submissions: HashMap<Uuid, Submission> = HashMap::new();

        for expired in lapsed {
            let submission = match submissions.get(&expired.submission_id) {
                Some(s) => s.clone(),
                None => match self.store.submission(expired.submission_id).await {
                    Ok(Some(s)) => {
                        submissions.insert(s.id, s.clone());
                        s
                    }
                    Ok(None) => {
                        report.errors.push(format!(
                            "assignment {}: {}",
                            expired.id,
                            EngineError::Integrity(format!(
                                "references missing submission {}",
                                expired.submission_id
                            ))
                        ));
                        continue;
                    }
                    Err(e) => {
                        report.errors.push(format!("assignment {}: {}", expired.id, e));
                        continue;
                    }
                },
            };

            let outcome = match policies.get(submission.contest_id).await {
                Ok(policy) => self.replace(&submission, &policy, &expired, now).await,
                Err(e) => Err(e),
            };

            match outcome {
                Ok(Replacement::Created) => report.processed += 1,
                Ok(Replacement::Short(shortfall)) => report.shortfalls.push(shortfall),
                Ok(Replacement::NotNeeded) => {}
                Err(EngineError::StaleWrite(reason)) => {
                    debug!(assignment_id = %expired.id, "Replacement raced: {}", reason);
                }
                Err(e) => {
                    error!(assignment_id = %expired.id, "Reassignment failed: {}", e);
                    report.errors.push(format!("assignment {}: {}", expired.id, e));
                }
            }
        }

        if report.processed > 0 || !report.shortfalls.is_empty() {
            info!(
                reassigned = report.processed,
                shortfalls = report.shortfalls.len(),
                "Reassignment sweep finished"
            );
        }
        report
    }

    async fn replace(
        &self,
        submission: &Submission,
        policy: &ContestReviewPolicy,
        expired: &PeerAssignment,
        now: DateTime<Utc>,
    ) -> Result<Replacement> {
        if submission.status == SubmissionStatus::Submitted {
            return Err(EngineError::Integrity(format!(
                "lapsed assignment {} on submission {} that never entered peer verification",
                expired.id, submission.id
            )));
        }

        let slot = Slot {
            exclude: Some(expired.reviewer_id),
            replaces: Some(expired.id),
        };
        let result = self.fill_slots(submission, policy, vec![slot], now).await?;

        if let Some(created) = result.created.first() {
            info!(
                submission_id = %submission.id,
                expired_id = %expired.id,
                assignment_id = %created.id,
                "Reassigned lapsed review"
            );
            return Ok(Replacement::Created);
        }

        let live = self
            .store
            .assignments_for_submission(submission.id)
            .await?
            .iter()
            .filter(|a| a.status.is_live())
            .count() as u32;
        if live >= policy.target_reviews {
            debug!(expired_id = %expired.id, "Target already met, no replacement needed");
            return Ok(Replacement::NotNeeded);
        }

        warn!(
            submission_id = %submission.id,
            expired_id = %expired.id,
            "No eligible reviewer for reassignment"
        );
        Ok(Replacement::Short(result.shortfall.unwrap_or(Shortfall {
            submission_id: submission.id,
            needed: 1,
            allocated: 0,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::AuditAction;
    use crate::engine::testkit::harness;
    use crate::model::AssignmentStatus;
    use crate::storage::ReviewStore;
    use chrono::Duration;

    #[tokio::test]
    async fn replacement_excludes_original_and_keeps_history() {
        let h = harness(vec![]).await;
        h.reviewers(6).await;
        let s = h.submission(Uuid::new_v4(), SubmissionStatus::Submitted).await;
        let t0 = Utc::now();
        let original = h.engine.begin_peer_verification(s.id, t0).await.unwrap().created;

        let sweep_at = t0 + Duration::days(8);
        h.engine.sweep_expired(sweep_at).await;
        let before: Vec<PeerAssignment> = h.store.all_assignments().await;

        let report = h.engine.reassign_expired(sweep_at).await;
        assert_eq!(report.processed, 3);
        assert!(report.is_clean());

        let after = h.store.all_assignments().await;
        for old in &original {
            let kept = after.iter().find(|a| a.id == old.id).unwrap();
            assert_eq!(kept.status, AssignmentStatus::Expired);
            assert_eq!(Some(kept), before.iter().find(|a| a.id == old.id));

            let fresh: Vec<&PeerAssignment> = after
                .iter()
                .filter(|a| a.replaces_assignment_id == Some(old.id))
                .collect();
            assert_eq!(fresh.len(), 1);
            assert_ne!(fresh[0].reviewer_id, old.reviewer_id);
            assert_eq!(fresh[0].status, AssignmentStatus::Pending);
            assert_eq!(fresh[0].deadline, sweep_at + Duration::days(7));
        }
        assert_eq!(h.audit.count(AuditAction::AssignmentReplaced), 3);
    }

    #[tokio::test]
    async fn rerun_does_not_replace_twice() {
        let h = harness(vec![]).await;
        h.reviewers(6).await;
        let s = h.submission(Uuid::new_v4(), SubmissionStatus::Submitted).await;
        let t0 = Utc::now();
        h.engine.begin_peer_verification(s.id, t0).await.unwrap();

        let sweep_at = t0 + Duration::days(8);
        h.engine.sweep_expired(sweep_at).await;
        h.engine.reassign_expired(sweep_at).await;
        let again = h.engine.reassign_expired(sweep_at).await;

        assert_eq!(again.processed, 0);
        assert_eq!(h.store.all_assignments().await.len(), 6);
    }

    #[tokio::test]
    async fn exhausted_pool_is_a_shortfall_and_retried_later() {
        let h = harness(vec![]).await;
        h.reviewers(3).await;
        let s = h.submission(Uuid::new_v4(), SubmissionStatus::Submitted).await;
        let t0 = Utc::now();
        let created = h.engine.begin_peer_verification(s.id, t0).await.unwrap().created;

        // only the first lapses
        for a in &created[1..] {
            h.engine
                .complete_review(a.id, a.reviewer_id, crate::model::SubScores::new(3, 3, 3, 3), String::new(), t0 + Duration::days(1))
                .await
                .unwrap();
        }
        let sweep_at = t0 + Duration::days(8);
        h.engine.sweep_expired(sweep_at).await;

        let report = h.engine.reassign_expired(sweep_at).await;
        assert_eq!(report.processed, 0);
        assert_eq!(report.shortfalls.len(), 1);
        assert!(report.is_clean());

        h.store
            .add_reviewer(crate::model::Reviewer {
                id: Uuid::from_u128(99),
                banned: false,
            })
            .await;
        let retry = h.engine.reassign_expired(sweep_at + Duration::hours(1)).await;
        assert_eq!(retry.processed, 1);
        let fresh = h
            .store
            .assignments_for_submission(s.id)
            .await
            .unwrap()
            .into_iter()
            .find(|a| a.replaces_assignment_id == Some(created[0].id))
            .unwrap();
        assert_eq!(fresh.reviewer_id, Uuid::from_u128(99));
    }

    #[tokio::test]
    async fn reviewers_at_strike_threshold_are_not_chosen() {
        let h = harness(vec![]).await;
        let ids = h.reviewers(5).await;
        let t0 = Utc::now();

        // reviewer 4 already lapsed twice elsewhere
        let elsewhere = h.submission(Uuid::new_v4(), SubmissionStatus::PeerVerificationPending).await;
        for _ in 0..2 {
            let mut lapsed = crate::model::NewAssignment {
                submission_id: elsewhere.id,
                reviewer_id: ids[3],
                created_at: t0 - Duration::days(20),
                deadline: t0 - Duration::days(13),
                replaces_assignment_id: None,
            }
            .into_assignment(Uuid::new_v4());
            lapsed.status = AssignmentStatus::Expired;
            h.store.seed_assignment(lapsed).await;
        }

        let s = h.submission(Uuid::new_v4(), SubmissionStatus::Submitted).await;
        let created = h.engine.begin_peer_verification(s.id, t0).await.unwrap().created;
        assert!(created.iter().all(|a| a.reviewer_id != ids[3]));

        h.engine.sweep_expired(t0 + Duration::days(8)).await;
        h.engine.reassign_expired(t0 + Duration::days(8)).await;
        let all = h.store.assignments_for_submission(s.id).await.unwrap();
        assert!(all.iter().all(|a| a.reviewer_id != ids[3]));
    }

    #[tokio::test]
    async fn lapsed_reviewers_may_cover_each_others_slots() {
        let h = harness(vec![]).await;
        let ids = h.reviewers(4).await;
        let s = h.submission(Uuid::new_v4(), SubmissionStatus::Submitted).await;
        let t0 = Utc::now();
        let original = h.engine.begin_peer_verification(s.id, t0).await.unwrap().created;
        assert_eq!(original.len(), 3);

        let sweep_at = t0 + Duration::days(8);
        assert_eq!(h.engine.sweep_expired(sweep_at).await.processed, 3);

        let eligible = h.engine.resolve_eligible(&s, Some(ids[0])).await.unwrap();
        assert_eq!(eligible.into_iter().collect::<Vec<_>>(), vec![ids[1], ids[2], ids[3]]);

        let report = h.engine.reassign_expired(sweep_at).await;
        assert_eq!(report.processed, 3);
        assert!(report.shortfalls.is_empty());

        let pending: Vec<PeerAssignment> = h
            .store
            .assignments_for_submission(s.id)
            .await
            .unwrap()
            .into_iter()
            .filter(|a| a.status == AssignmentStatus::Pending)
            .collect();
        assert_eq!(pending.len(), 3);
        for fresh in &pending {
            let old = original
                .iter()
                .find(|a| Some(a.id) == fresh.replaces_assignment_id)
                .unwrap();
            assert_ne!(fresh.reviewer_id, old.reviewer_id);
        }
        let mut reviewers: Vec<Uuid> = pending.iter().map(|a| a.reviewer_id).collect();
        reviewers.sort();
        reviewers.dedup();
        assert_eq!(reviewers.len(), 3);
    }
}
