//! Peer verification lifecycle engine.
//!
//! The engine holds no background tasks. Each entry point is a short batch
//! operation driven by an external trigger: the hourly deadline sweep, the
//! warning sweep, a submission entering peer review, or a reviewer finishing
//! a review. All state lives in the [`ReviewStore`]; status transitions are
//! conditional on the current row status so overlapping calls stay safe.

mod allocator;
mod decision;
mod deadlines;
mod eligibility;
mod notifications;
mod reassignment;
mod reviews;
mod rng;
mod scoring;

pub use decision::rank_shortlist;
pub use eligibility::eligible_reviewers;
pub use reviews::ReviewOutcome;
pub use rng::{RandomSource, RngSource, ScriptedSource};
pub use scoring::{aggregate, AuthorView};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

use crate::dispatch::{AuditEntry, AuditSink, Notification, Notifier};
use crate::error::{EngineError, Result};
use crate::model::ContestReviewPolicy;
use crate::storage::{PolicySource, ReviewStore};

const DEFAULT_DISPATCH_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Engine {
    store: Arc<dyn ReviewStore>,
    policies: Arc<dyn PolicySource>,
    notifier: Arc<dyn Notifier>,
    audit: Arc<dyn AuditSink>,
    rng: Mutex<Box<dyn RandomSource>>,
    dispatch_timeout: Duration,
}

impl Engine {
    pub fn new(
        store: Arc<dyn ReviewStore>,
        policies: Arc<dyn PolicySource>,
        notifier: Arc<dyn Notifier>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            store,
            policies,
            notifier,
            audit,
            rng: Mutex::new(Box::new(RngSource::from_entropy())),
            dispatch_timeout: DEFAULT_DISPATCH_TIMEOUT,
        }
    }

    /// Upper bound on a single notification hand-off inside a sweep.
    pub fn with_dispatch_timeout(self, timeout: Duration) -> Self {
        Self {
            dispatch_timeout: timeout,
            ..self
        }
    }

    pub fn with_random_source(self, source: impl RandomSource + 'static) -> Self {
        Self {
            rng: Mutex::new(Box::new(source)),
            ..self
        }
    }

    /// Policy lookups scoped to a single engine call.
    pub fn policy_cache(&self) -> PolicyCache<'_> {
        PolicyCache {
            source: self.policies.as_ref(),
            loaded: HashMap::new(),
        }
    }

    fn draw(&self, len: usize) -> usize {
        let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        rng.pick(len)
    }

    /// Fire-and-forget: one attempt, bounded by `dispatch_timeout`. A failed
    /// or stalled hand-off is logged, never propagated.
    async fn notify(&self, notification: Notification) -> bool {
        let attempt = tokio::time::timeout(self.dispatch_timeout, self.notifier.notify(&notification)).await;
        let result = attempt.unwrap_or_else(|_| {
            Err(EngineError::Dispatch(format!(
                "no response within {}ms",
                self.dispatch_timeout.as_millis()
            )))
        });
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    kind = ?notification.kind,
                    assignment_id = %notification.assignment_id,
                    "Notification dispatch failed: {}",
                    e
                );
                false
            }
        }
    }

    async fn record_audit(&self, entry: AuditEntry) {
        if let Err(e) = self.audit.record(&entry).await {
            warn!(
                action = entry.action.as_str(),
                subject_id = %entry.subject_id,
                "Audit write failed: {}",
                e
            );
        }
    }
}

/// Contest policies read at most once per sweep and dropped with it.
pub struct PolicyCache<'a> {
    source: &'a dyn PolicySource,
    loaded: HashMap<Uuid, ContestReviewPolicy>,
}

impl PolicyCache<'_> {
    pub async fn get(&mut self, contest_id: Uuid) -> Result<ContestReviewPolicy> {
        if let Some(policy) = self.loaded.get(&contest_id) {
            return Ok(policy.clone());
        }

        let policy = self
            .source
            .policy(contest_id)
            .await?
            .ok_or_else(|| EngineError::ConfigAbsent(format!("review policy for contest {}", contest_id)))?;
        policy.validate()?;

        self.loaded.insert(contest_id, policy.clone());
        Ok(policy)
    }
}
