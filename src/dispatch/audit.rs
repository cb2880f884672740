use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Mutex;
use uuid::Uuid;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    AssignmentCreated,
    AssignmentExpired,
    AssignmentReplaced,
    OutcomeDecided,
    ScoreOverridden,
    FinalistsMarked,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AssignmentCreated => "assignment_created",
            Self::AssignmentExpired => "assignment_expired",
            Self::AssignmentReplaced => "assignment_replaced",
            Self::OutcomeDecided => "outcome_decided",
            Self::ScoreOverridden => "score_overridden",
            Self::FinalistsMarked => "finalists_marked",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEntry {
    pub action: AuditAction,
    /// None for sweeps run by the scheduler.
    pub actor_id: Option<Uuid>,
    pub subject_id: Uuid,
    pub detail: serde_json::Value,
    pub at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn system(action: AuditAction, subject_id: Uuid, detail: serde_json::Value, at: DateTime<Utc>) -> Self {
        Self {
            action,
            actor_id: None,
            subject_id,
            detail,
            at,
        }
    }
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, entry: &AuditEntry) -> Result<()>;
}

#[derive(Default)]
pub struct MemoryAudit {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemoryAudit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn count(&self, action: AuditAction) -> usize {
        self.entries().iter().filter(|e| e.action == action).count()
    }
}

#[async_trait]
impl AuditSink for MemoryAudit {
    async fn record(&self, entry: &AuditEntry) -> Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(entry.clone());
        Ok(())
    }
}
