use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::model::{PeerAssignment, ReminderTier};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    NewAssignment,
    DeadlineWarning,
    FinalReminder,
}

impl From<ReminderTier> for NotificationKind {
    fn from(tier: ReminderTier) -> Self {
        match tier {
            ReminderTier::Warning => Self::DeadlineWarning,
            ReminderTier::FinalReminder => Self::FinalReminder,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub assignment_id: Uuid,
    pub submission_id: Uuid,
    pub reviewer_id: Uuid,
    pub deadline: DateTime<Utc>,
}

impl Notification {
    pub fn for_assignment(kind: NotificationKind, assignment: &PeerAssignment) -> Self {
        Self {
            kind,
            assignment_id: assignment.id,
            submission_id: assignment.submission_id,
            reviewer_id: assignment.reviewer_id,
            deadline: assignment.deadline,
        }
    }
}

/// Outbound reviewer notifications. Delivery is the collaborator's problem;
/// the engine only cares whether the hand-off succeeded.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<()>;
}

/// Posts notifications as JSON to the application's mailer endpoint.
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: String, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EngineError::Dispatch(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self { client, url })
    }
}

/// One POST per notification. Retrying is left to the next sweep or to the
/// receiving mailer, so a dead endpoint costs at most one timeout per call.
#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, notification: &Notification) -> Result<()> {
        let resp = self
            .client
            .post(&self.url)
            .json(notification)
            .send()
            .await
            .map_err(|e| EngineError::Dispatch(format!("notification request failed: {}", e)))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(EngineError::Dispatch(format!(
                "notification endpoint answered {:?} with {}",
                notification.kind, status
            )));
        }
        Ok(())
    }
}

/// Used when no webhook is configured.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: &Notification) -> Result<()> {
        info!(
            kind = ?notification.kind,
            assignment_id = %notification.assignment_id,
            reviewer_id = %notification.reviewer_id,
            deadline = %notification.deadline,
            "Reviewer notification"
        );
        Ok(())
    }
}

/// Records notifications in memory; can be told to fail every call.
#[derive(Default)]
pub struct MemoryNotifier {
    sent: Mutex<Vec<Notification>>,
    failing: AtomicBool,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn sent_of(&self, kind: NotificationKind) -> Vec<Notification> {
        self.sent().into_iter().filter(|n| n.kind == kind).collect()
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn notify(&self, notification: &Notification) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(EngineError::Dispatch("notifier offline".to_string()));
        }
        self.sent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(notification.clone());
        Ok(())
    }
}
