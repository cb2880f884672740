use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, error, info};

use super::Engine;
use crate::dispatch::{AuditAction, AuditEntry};
use crate::model::SweepReport;

impl Engine {
    /// Expire every pending assignment whose deadline is before `now`.
    ///
    /// Each row is transitioned only if it is still pending at write time, so
    /// a review landing between the scan and the write wins, and a second
    /// overlapping sweep finds nothing left to do.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();

        let overdue = match self.store.pending_past_deadline(now).await {
            Ok(rows) => rows,
            Err(e) => {
                error!("Failed to scan overdue assignments: {}", e);
                report.errors.push(format!("scanning overdue assignments: {}", e));
                return report;
            }
        };

        for assignment in overdue {
            match self.store.expire_assignment(assignment.id, now).await {
                Ok(true) => {
                    report.processed += 1;
                    self.record_audit(AuditEntry::system(
                        AuditAction::AssignmentExpired,
                        assignment.id,
                        json!({
                            "submission_id": assignment.submission_id,
                            "reviewer_id": assignment.reviewer_id,
                            "deadline": assignment.deadline,
                        }),
                        now,
                    ))
                    .await;
                }
                Ok(false) => {
                    debug!(assignment_id = %assignment.id, "Assignment left pending state before expiry");
                }
                Err(e) => {
                    error!(assignment_id = %assignment.id, "Failed to expire assignment: {}", e);
                    report
                        .errors
                        .push(format!("assignment {}: {}", assignment.id, e));
                }
            }
        }

        if report.processed > 0 {
            info!(expired = report.processed, "Expired overdue assignments");
        }
        report
    }
}
