use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::eligibility::eligible_reviewers;
use super::Engine;
use crate::dispatch::{AuditAction, AuditEntry, Notification, NotificationKind};
use crate::error::{EngineError, Result};
use crate::model::{
    AllocationResult, AssignmentStatus, ContestReviewPolicy, NewAssignment, PeerAssignment,
    Shortfall, Submission, SubmissionStatus, SweepReport,
};

/// One assignment the caller wants created.
#[derive(Debug, Clone, Copy, Default)]
pub(super) struct Slot {
    pub exclude: Option<Uuid>,
    pub replaces: Option<Uuid>,
}

/// Assignments still owed to a submission: the target minus live ones,
/// minus lapsed ones the reassignment sweep has yet to replace.
pub(super) fn outstanding_need(history: &[PeerAssignment], policy: &ContestReviewPolicy) -> u32 {
    let live = history.iter().filter(|a| a.status.is_live()).count() as u32;
    let awaiting_replacement = history
        .iter()
        .filter(|a| a.status == AssignmentStatus::Expired)
        .filter(|a| !history.iter().any(|b| b.replaces_assignment_id == Some(a.id)))
        .count() as u32;
    policy
        .target_reviews
        .saturating_sub(live)
        .saturating_sub(awaiting_replacement)
}

impl Engine {
    /// Draw `count_needed` reviewers for `submission` and persist them as one
    /// batch. Falls short (without erroring) when the pool runs dry.
    pub async fn allocate(
        &self,
        submission: &Submission,
        count_needed: u32,
        policy: &ContestReviewPolicy,
        now: DateTime<Utc>,
    ) -> Result<AllocationResult> {
        let slots = vec![Slot::default(); count_needed as usize];
        self.fill_slots(submission, policy, slots, now).await
    }

    pub(super) async fn fill_slots(
        &self,
        submission: &Submission,
        policy: &ContestReviewPolicy,
        slots: Vec<Slot>,
        now: DateTime<Utc>,
    ) -> Result<AllocationResult> {
        let needed = slots.len() as u32;
        let snapshot = self.eligibility_snapshot(submission).await?;
        let expected_live = snapshot.history.iter().filter(|a| a.status.is_live()).count();

        // never plan past the contest's target
        let room = (policy.target_reviews as usize).saturating_sub(expected_live);
        let mut history = snapshot.history;
        let mut batch = Vec::new();

        for slot in slots.into_iter().take(room) {
            let eligible: Vec<Uuid> = eligible_reviewers(
                submission,
                slot.exclude,
                &snapshot.pool,
                &history,
                &snapshot.strikes,
            )
            .into_iter()
            .collect();

            if eligible.is_empty() {
                break;
            }

            let reviewer_id = eligible[self.draw(eligible.len())];
            let planned = NewAssignment {
                submission_id: submission.id,
                reviewer_id,
                created_at: now,
                deadline: policy.deadline_for(now),
                replaces_assignment_id: slot.replaces,
            };
            // planned picks count as history for the next draw
            history.push(planned.clone().into_assignment(Uuid::nil()));
            batch.push(planned);
        }

        let shortfall = if (batch.len() as u32) < needed {
            Some(Shortfall {
                submission_id: submission.id,
                needed,
                allocated: batch.len() as u32,
            })
        } else {
            None
        };

        let created = if batch.is_empty() {
            Vec::new()
        } else {
            self.store
                .insert_assignments(submission.id, expected_live, batch)
                .await?
        };

        for assignment in &created {
            let action = if assignment.replaces_assignment_id.is_some() {
                AuditAction::AssignmentReplaced
            } else {
                AuditAction::AssignmentCreated
            };
            self.record_audit(AuditEntry::system(
                action,
                assignment.id,
                json!({
                    "submission_id": assignment.submission_id,
                    "reviewer_id": assignment.reviewer_id,
                    "deadline": assignment.deadline,
                    "replaces_assignment_id": assignment.replaces_assignment_id,
                }),
                now,
            ))
            .await;
            self.notify(Notification::for_assignment(NotificationKind::NewAssignment, assignment))
                .await;
        }

        if let Some(ref shortfall) = shortfall {
            warn!(
                submission_id = %submission.id,
                needed = shortfall.needed,
                allocated = shortfall.allocated,
                "Reviewer shortfall, will retry on next sweep"
            );
        } else {
            debug!(submission_id = %submission.id, created = created.len(), "Allocated reviewers");
        }

        Ok(AllocationResult {
            submission_id: submission.id,
            created,
            shortfall,
        })
    }

    /// Move a submission into peer verification and give it its reviewers.
    ///
    /// Safe to call repeatedly: once the assignment set is complete further
    /// calls create nothing. A concurrent caller winning the insert race also
    /// turns this call into a no-op.
    pub async fn begin_peer_verification(
        &self,
        submission_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<AllocationResult> {
        let submission = self
            .store
            .submission(submission_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("submission {}", submission_id)))?;
        let policy = self.policy_cache().get(submission.contest_id).await?;

        let submission = match submission.status {
            SubmissionStatus::Submitted => {
                if self
                    .store
                    .transition_submission(
                        submission_id,
                        SubmissionStatus::Submitted,
                        SubmissionStatus::PeerVerificationPending,
                    )
                    .await?
                {
                    info!(submission_id = %submission_id, "Submission entered peer verification");
                }
                Submission {
                    status: SubmissionStatus::PeerVerificationPending,
                    ..submission
                }
            }
            SubmissionStatus::PeerVerificationPending => submission,
            _ => {
                debug!(submission_id = %submission_id, "Peer verification already decided");
                return Ok(AllocationResult {
                    submission_id,
                    created: Vec::new(),
                    shortfall: None,
                });
            }
        };

        self.top_up(&submission, &policy, now).await
    }

    /// Begin peer verification for several submissions; one submission's
    /// failure or shortfall does not affect the others.
    pub async fn begin_peer_verification_batch(
        &self,
        submission_ids: &[Uuid],
        now: DateTime<Utc>,
    ) -> SweepReport {
        let mut report = SweepReport::default();
        for &submission_id in submission_ids {
            match self.begin_peer_verification(submission_id, now).await {
                Ok(result) => {
                    report.processed += result.created.len();
                    report.shortfalls.extend(result.shortfall);
                }
                Err(e) => report
                    .errors
                    .push(format!("submission {}: {}", submission_id, e)),
            }
        }
        report
    }

    /// Retry initial-allocation shortfalls for every submission still in
    /// peer verification.
    pub async fn top_up_sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();
        let submissions = match self
            .store
            .submissions_in_status(SubmissionStatus::PeerVerificationPending)
            .await
        {
            Ok(s) => s,
            Err(e) => {
                report.errors.push(format!("listing submissions: {}", e));
                return report;
            }
        };

        let mut policies = self.policy_cache();
        for submission in submissions {
            let result = match policies.get(submission.contest_id).await {
                Ok(policy) => self.top_up(&submission, &policy, now).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(result) => {
                    report.processed += result.created.len();
                    report.shortfalls.extend(result.shortfall);
                }
                Err(e) => report
                    .errors
                    .push(format!("submission {}: {}", submission.id, e)),
            }
        }
        report
    }

    async fn top_up(
        &self,
        submission: &Submission,
        policy: &ContestReviewPolicy,
        now: DateTime<Utc>,
    ) -> Result<AllocationResult> {
        let history = self.store.assignments_for_submission(submission.id).await?;
        let need = outstanding_need(&history, policy);
        if need == 0 {
            return Ok(AllocationResult {
                submission_id: submission.id,
                created: Vec::new(),
                shortfall: None,
            });
        }

        match self.allocate(submission, need, policy, now).await {
            Err(EngineError::StaleWrite(reason)) => {
                debug!(submission_id = %submission.id, "Concurrent allocation won: {}", reason);
                Ok(AllocationResult {
                    submission_id: submission.id,
                    created: Vec::new(),
                    shortfall: None,
                })
            }
            other => other,
        }
    }
}
