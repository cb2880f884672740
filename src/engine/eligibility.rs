use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::debug;
use uuid::Uuid;

use super::Engine;
use crate::error::Result;
use crate::model::{PeerAssignment, Reviewer, Submission, STRIKE_THRESHOLD};

/// Reviewers allowed to take a new assignment on `submission`.
///
/// `history` is every assignment the submission has ever had. Reviewers with
/// a pending or done assignment on it are skipped; a lapsed one may be drawn
/// again for a sibling slot unless it is `exclude`. `strikes` holds
/// system-wide expired counts; reviewers at the threshold are skipped.
///
/// The result is ordered so that draws over it are reproducible.
pub fn eligible_reviewers(
    submission: &Submission,
    exclude: Option<Uuid>,
    pool: &[Reviewer],
    history: &[PeerAssignment],
    strikes: &HashMap<Uuid, u32>,
) -> BTreeSet<Uuid> {
    let seen: HashSet<Uuid> = history
        .iter()
        .filter(|a| a.submission_id == submission.id && a.status.is_live())
        .map(|a| a.reviewer_id)
        .collect();

    pool.iter()
        .filter(|r| r.id != submission.author_id)
        .filter(|r| !r.banned)
        .filter(|r| Some(r.id) != exclude)
        .filter(|r| !seen.contains(&r.id))
        .filter(|r| strikes.get(&r.id).copied().unwrap_or(0) < STRIKE_THRESHOLD)
        .map(|r| r.id)
        .collect()
}

/// Everything eligibility depends on, read once per allocation.
pub(super) struct EligibilitySnapshot {
    pub pool: Vec<Reviewer>,
    pub history: Vec<PeerAssignment>,
    pub strikes: HashMap<Uuid, u32>,
}

impl Engine {
    pub(super) async fn eligibility_snapshot(&self, submission: &Submission) -> Result<EligibilitySnapshot> {
        let pool = self.store.reviewer_pool(submission.contest_id).await?;
        let history = self.store.assignments_for_submission(submission.id).await?;
        let ids: Vec<Uuid> = pool.iter().map(|r| r.id).collect();
        let strikes = self.store.expired_counts(&ids).await?;
        Ok(EligibilitySnapshot {
            pool,
            history,
            strikes,
        })
    }

    /// Reviewers who may be assigned to `submission`, never including its
    /// author or `exclude_reviewer`. An empty set is a shortfall, not an error.
    pub async fn resolve_eligible(
        &self,
        submission: &Submission,
        exclude_reviewer: Option<Uuid>,
    ) -> Result<BTreeSet<Uuid>> {
        let snapshot = self.eligibility_snapshot(submission).await?;
        let eligible = eligible_reviewers(
            submission,
            exclude_reviewer,
            &snapshot.pool,
            &snapshot.history,
            &snapshot.strikes,
        );
        debug!(
            submission_id = %submission.id,
            pool = snapshot.pool.len(),
            eligible = eligible.len(),
            "Resolved eligible reviewers"
        );
        Ok(eligible)
    }
}
