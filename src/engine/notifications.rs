use chrono::{DateTime, Utc};
use tracing::{error, info};

use super::Engine;
use crate::dispatch::Notification;
use crate::model::{ReminderTier, SweepReport};

impl Engine {
    /// Deadline warnings for assignments due within the next 24 hours.
    pub async fn sweep_warnings(&self, now: DateTime<Utc>) -> SweepReport {
        self.sweep_reminders(ReminderTier::Warning, now).await
    }

    /// Final reminders for assignments due within the next 2 hours.
    pub async fn sweep_final_reminders(&self, now: DateTime<Utc>) -> SweepReport {
        self.sweep_reminders(ReminderTier::FinalReminder, now).await
    }

    // The tier is claimed before dispatch: a crash or failed hand-off after
    // the claim loses that reminder rather than risking a duplicate.
    async fn sweep_reminders(&self, tier: ReminderTier, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();

        let due = match self.store.pending_due_within(now, now + tier.lookahead()).await {
            Ok(rows) => rows,
            Err(e) => {
                error!(tier = tier.as_str(), "Failed to scan due assignments: {}", e);
                report.errors.push(format!("scanning {} window: {}", tier.as_str(), e));
                return report;
            }
        };

        for assignment in due {
            let already_sent = match tier {
                ReminderTier::Warning => assignment.warning_sent_at.is_some(),
                ReminderTier::FinalReminder => assignment.final_reminder_sent_at.is_some(),
            };
            if already_sent {
                continue;
            }

            match self.store.claim_reminder(assignment.id, tier, now).await {
                Ok(true) => {
                    if self
                        .notify(Notification::for_assignment(tier.into(), &assignment))
                        .await
                    {
                        report.processed += 1;
                    } else {
                        report.errors.push(format!(
                            "assignment {}: {} dispatch failed",
                            assignment.id,
                            tier.as_str()
                        ));
                    }
                }
                Ok(false) => {}
                Err(e) => report
                    .errors
                    .push(format!("assignment {}: {}", assignment.id, e)),
            }
        }

        if report.processed > 0 {
            info!(tier = tier.as_str(), sent = report.processed, "Sent deadline reminders");
        }
        report
    }
}
