use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

use peerverify::dispatch::{AuditAction, MemoryAudit, MemoryNotifier, NotificationKind};
use peerverify::engine::{AuthorView, Engine, ScriptedSource};
use peerverify::model::{
    AssignmentStatus, ContestReviewPolicy, Outcome, PeerAssignment, PeerOutcome, Reviewer,
    ScorePatch, SubScores, Submission, SubmissionStatus,
};
use peerverify::storage::{MemoryPolicies, MemoryStore, ReviewStore};
use peerverify::EngineError;

struct World {
    store: Arc<MemoryStore>,
    policies: Arc<MemoryPolicies>,
    notifier: Arc<MemoryNotifier>,
    audit: Arc<MemoryAudit>,
    engine: Arc<Engine>,
    contest_id: Uuid,
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

fn policy(contest_id: Uuid, target_reviews: u32) -> ContestReviewPolicy {
    ContestReviewPolicy {
        contest_id,
        target_reviews,
        deadline_offset_days: 7,
        quorum: 2,
        shortlist_size: 1,
        elimination_threshold: 3.0,
        results_visible_to_authors: false,
        results_published: false,
    }
}

/// Scripted index 0 always draws the lowest eligible reviewer id.
async fn world(target_reviews: u32) -> World {
    let store = Arc::new(MemoryStore::new());
    let policies = Arc::new(MemoryPolicies::new());
    let notifier = Arc::new(MemoryNotifier::new());
    let audit = Arc::new(MemoryAudit::new());
    let contest_id = Uuid::new_v4();
    policies.insert(policy(contest_id, target_reviews)).await;

    let engine = Arc::new(
        Engine::new(store.clone(), policies.clone(), notifier.clone(), audit.clone())
            .with_random_source(ScriptedSource::default()),
    );

    World {
        store,
        policies,
        notifier,
        audit,
        engine,
        contest_id,
    }
}

fn reviewer(n: u128) -> Uuid {
    Uuid::from_u128(n)
}

impl World {
    async fn reviewers(&self, range: std::ops::RangeInclusive<u128>) {
        for n in range {
            self.store
                .add_reviewer(Reviewer {
                    id: reviewer(n),
                    banned: false,
                })
                .await;
        }
    }

    async fn submission(&self, author_id: Uuid) -> Uuid {
        let id = Uuid::new_v4();
        self.store
            .add_submission(Submission {
                id,
                contest_id: self.contest_id,
                author_id,
                status: SubmissionStatus::Submitted,
                peer_outcome: None,
                is_finalist: false,
            })
            .await;
        id
    }

    async fn assignments(&self, submission_id: Uuid) -> Vec<PeerAssignment> {
        self.store
            .assignments_for_submission(submission_id)
            .await
            .unwrap()
    }
}

#[tokio::test]
async fn lapsed_reviewers_are_replaced_with_fresh_deadlines() {
    let w = world(3).await;
    w.reviewers(1..=4).await;
    let author = reviewer(100);
    let submission_id = w.submission(author).await;

    let start = w.engine.begin_peer_verification(submission_id, t0()).await.unwrap();
    assert_eq!(start.created.len(), 3);
    assert!(start.shortfall.is_none());
    for a in &start.created {
        assert_eq!(a.status, AssignmentStatus::Pending);
        assert_eq!(a.deadline, t0() + Duration::days(7));
    }
    assert_eq!(w.notifier.sent_of(NotificationKind::NewAssignment).len(), 3);

    let sweep_at = t0() + Duration::days(8);
    let expired = w.engine.sweep_expired(sweep_at).await;
    assert_eq!(expired.processed, 3);
    assert!(expired.is_clean());

    let reassigned = w.engine.reassign_expired(sweep_at).await;
    assert_eq!(reassigned.processed, 3);
    assert!(reassigned.shortfalls.is_empty());

    let all = w.assignments(submission_id).await;
    let pending: Vec<_> = all
        .iter()
        .filter(|a| a.status == AssignmentStatus::Pending)
        .collect();
    assert_eq!(pending.len(), 3);

    for replacement in pending {
        let original_id = replacement.replaces_assignment_id.unwrap();
        let original = start.created.iter().find(|a| a.id == original_id).unwrap();
        assert_ne!(replacement.reviewer_id, original.reviewer_id);
        assert_ne!(replacement.reviewer_id, author);
        assert_eq!(replacement.deadline, sweep_at + Duration::days(7));
    }
    assert_eq!(w.audit.count(AuditAction::AssignmentReplaced), 3);

    // nothing left to replace
    let again = w.engine.reassign_expired(sweep_at).await;
    assert_eq!(again.processed, 0);
    assert_eq!(w.assignments(submission_id).await.len(), 6);
}

#[tokio::test]
async fn empty_pool_does_not_block_sibling_allocation() {
    let w = world(3).await;
    w.reviewers(1..=1).await;
    w.store
        .add_reviewer(Reviewer {
            id: reviewer(2),
            banned: true,
        })
        .await;
    w.reviewers(3..=3).await;

    // reviewer 3 has two lapsed assignments elsewhere
    let elsewhere = w.submission(reviewer(50)).await;
    for day in [30, 20] {
        w.store
            .seed_assignment(PeerAssignment {
                id: Uuid::new_v4(),
                submission_id: elsewhere,
                reviewer_id: reviewer(3),
                status: AssignmentStatus::Expired,
                created_at: t0() - Duration::days(day),
                deadline: t0() - Duration::days(day - 7),
                completed_at: None,
                expired_at: Some(t0() - Duration::days(day - 8)),
                replaces_assignment_id: None,
                warning_sent_at: None,
                final_reminder_sent_at: None,
            })
            .await;
    }

    // reviewer 1 wrote the first submission, so it has nobody left
    let stranded = w.submission(reviewer(1)).await;
    let sibling = w.submission(reviewer(60)).await;

    let report = w
        .engine
        .begin_peer_verification_batch(&[stranded, sibling], t0())
        .await;

    assert!(report.is_clean(), "{:?}", report.errors);
    assert_eq!(report.processed, 1);
    assert_eq!(report.shortfalls.len(), 2);

    let stranded_short = report
        .shortfalls
        .iter()
        .find(|s| s.submission_id == stranded)
        .unwrap();
    assert_eq!(stranded_short.allocated, 0);
    assert!(w.assignments(stranded).await.is_empty());

    let sibling_assignments = w.assignments(sibling).await;
    assert_eq!(sibling_assignments.len(), 1);
    assert_eq!(sibling_assignments[0].reviewer_id, reviewer(1));

    // both entered peer verification regardless of the shortfall
    for id in [stranded, sibling] {
        let s = w.store.submission(id).await.unwrap().unwrap();
        assert_eq!(s.status, SubmissionStatus::PeerVerificationPending);
    }

    // a newcomer lets the top-up sweep fill the stranded submission
    w.reviewers(4..=4).await;
    let topped = w.engine.top_up_sweep(t0() + Duration::hours(1)).await;
    assert!(topped.processed >= 1);
    assert!(w
        .assignments(stranded)
        .await
        .iter()
        .any(|a| a.reviewer_id == reviewer(4)));
}

#[tokio::test]
async fn expiry_round_trip_leaves_original_untouched() {
    let w = world(1).await;
    w.reviewers(1..=2).await;
    let submission_id = w.submission(reviewer(100)).await;

    w.engine.begin_peer_verification(submission_id, t0()).await.unwrap();
    let sweep_at = t0() + Duration::days(7) + Duration::minutes(1);

    assert_eq!(w.engine.sweep_expired(sweep_at).await.processed, 1);
    assert_eq!(w.engine.sweep_expired(sweep_at).await.processed, 0);

    let original = w.assignments(submission_id).await.remove(0);
    assert_eq!(original.status, AssignmentStatus::Expired);
    assert_eq!(original.expired_at, Some(sweep_at));

    w.engine.reassign_expired(sweep_at).await;

    let after = w.assignments(submission_id).await;
    assert_eq!(after.len(), 2);
    assert_eq!(after.iter().find(|a| a.id == original.id), Some(&original));

    let fresh = after.iter().find(|a| a.id != original.id).unwrap();
    assert_eq!(fresh.status, AssignmentStatus::Pending);
    assert_eq!(fresh.replaces_assignment_id, Some(original.id));
    assert_eq!(fresh.reviewer_id, reviewer(2));

    // a late review on the lapsed assignment is refused
    let late = w
        .engine
        .complete_review(
            original.id,
            original.reviewer_id,
            SubScores::new(4, 4, 4, 4),
            String::new(),
            sweep_at,
        )
        .await;
    assert!(matches!(late, Err(EngineError::AssignmentClosed(id)) if id == original.id));
}

#[tokio::test]
async fn reviews_drive_decision_override_and_shortlist() {
    let w = world(2).await;
    w.reviewers(1..=4).await;
    let strong_author = reviewer(100);
    let weak_author = reviewer(101);
    let strong = w.submission(strong_author).await;
    let weak = w.submission(weak_author).await;

    w.engine
        .begin_peer_verification_batch(&[strong, weak], t0())
        .await;

    let review = |submission_id: Uuid, scores: [SubScores; 2], at: DateTime<Utc>| {
        let w = &w;
        async move {
            let mut last = None;
            for (a, s) in w.assignments(submission_id).await.into_iter().zip(scores) {
                last = Some(
                    w.engine
                        .complete_review(a.id, a.reviewer_id, s, "considered".into(), at)
                        .await
                        .unwrap(),
                );
            }
            last.unwrap()
        }
    };

    let strong_result = review(
        strong,
        [SubScores::new(3, 4, 5, 2), SubScores::new(5, 5, 5, 5)],
        t0() + Duration::days(1),
    )
    .await;
    assert_eq!(strong_result.score.clarity, 4.0);
    assert_eq!(strong_result.score.argument, 4.5);
    assert_eq!(strong_result.score.style, 5.0);
    assert_eq!(strong_result.score.moral_depth, 3.5);
    assert_eq!(strong_result.score.overall, 4.25);
    assert_eq!(
        strong_result.outcome,
        Outcome::Decided {
            outcome: PeerOutcome::Reinstated
        }
    );

    let weak_result = review(
        weak,
        [SubScores::new(2, 2, 3, 2), SubScores::new(3, 2, 2, 2)],
        t0() + Duration::days(2),
    )
    .await;
    assert_eq!(
        weak_result.outcome,
        Outcome::Decided {
            outcome: PeerOutcome::Eliminated
        }
    );
    let weak_row = w.store.submission(weak).await.unwrap().unwrap();
    assert_eq!(weak_row.status, SubmissionStatus::Eliminated);

    // an admin correction lifting the weak entry above the threshold reinstates it
    let patched = w
        .engine
        .override_review(
            weak_result.review.id,
            ScorePatch {
                clarity: Some(5),
                argument: Some(5),
                style: Some(5),
                moral_depth: Some(5),
            },
            reviewer(999),
            t0() + Duration::days(3),
        )
        .await
        .unwrap();
    assert_eq!(
        patched.outcome,
        Outcome::Decided {
            outcome: PeerOutcome::Reinstated
        }
    );
    assert_eq!(w.audit.count(AuditAction::ScoreOverridden), 1);

    let shortlist = w
        .engine
        .select_shortlist(w.contest_id, t0() + Duration::days(4))
        .await
        .unwrap();
    assert_eq!(shortlist.len(), 1);
    assert_eq!(shortlist[0].submission_id, strong);
    assert!(w.store.submission(strong).await.unwrap().unwrap().is_finalist);
    assert!(!w.store.submission(weak).await.unwrap().unwrap().is_finalist);

    // authors see nothing until results are released
    assert_eq!(
        w.engine.author_view(strong, strong_author).await.unwrap(),
        AuthorView::Hidden
    );
    assert!(matches!(
        w.engine.author_view(strong, weak_author).await,
        Err(EngineError::NotFound(_))
    ));

    w.policies
        .insert(ContestReviewPolicy {
            results_published: true,
            ..policy(w.contest_id, 2)
        })
        .await;
    match w.engine.author_view(strong, strong_author).await.unwrap() {
        AuthorView::Visible { score } => assert_eq!(score.overall, 4.25),
        other => panic!("expected visible score, got {:?}", other),
    }
}

#[tokio::test]
async fn reminders_go_out_once_per_tier() {
    let w = world(1).await;
    w.reviewers(1..=1).await;
    let submission_id = w.submission(reviewer(100)).await;
    w.engine.begin_peer_verification(submission_id, t0()).await.unwrap();

    let deadline = t0() + Duration::days(7);
    let day_before = deadline - Duration::hours(20);

    assert_eq!(w.engine.sweep_warnings(day_before).await.processed, 1);
    assert_eq!(w.engine.sweep_warnings(day_before + Duration::hours(6)).await.processed, 0);
    assert_eq!(w.engine.sweep_final_reminders(day_before).await.processed, 0);

    let hour_before = deadline - Duration::hours(1);
    assert_eq!(w.engine.sweep_final_reminders(hour_before).await.processed, 1);
    assert_eq!(w.engine.sweep_final_reminders(hour_before).await.processed, 0);

    assert_eq!(w.notifier.sent_of(NotificationKind::DeadlineWarning).len(), 1);
    assert_eq!(w.notifier.sent_of(NotificationKind::FinalReminder).len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn overlapping_triggers_allocate_a_single_set() {
    let w = world(3).await;
    w.reviewers(1..=6).await;
    let submission_id = w.submission(reviewer(100)).await;

    let begin = |engine: Arc<Engine>| {
        tokio::spawn(async move { engine.begin_peer_verification(submission_id, t0()).await })
    };
    let first = begin(w.engine.clone());
    let second = begin(w.engine.clone());
    let first = first.await.unwrap().unwrap();
    let second = second.await.unwrap().unwrap();

    assert_eq!(first.created.len() + second.created.len(), 3);

    let live: Vec<PeerAssignment> = w
        .assignments(submission_id)
        .await
        .into_iter()
        .filter(|a| a.status.is_live())
        .collect();
    assert_eq!(live.len(), 3);
    let reviewers: HashSet<Uuid> = live.iter().map(|a| a.reviewer_id).collect();
    assert_eq!(reviewers.len(), live.len());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn overlapping_sweeps_replace_each_lapse_once() {
    let w = world(3).await;
    w.reviewers(1..=5).await;
    let submission_id = w.submission(reviewer(100)).await;
    let original = w
        .engine
        .begin_peer_verification(submission_id, t0())
        .await
        .unwrap()
        .created;

    let sweep_at = t0() + Duration::days(8);
    let sweep = |engine: Arc<Engine>| {
        tokio::spawn(async move {
            let expired = engine.sweep_expired(sweep_at).await;
            let reassigned = engine.reassign_expired(sweep_at).await;
            (expired, reassigned)
        })
    };
    let first = sweep(w.engine.clone());
    let second = sweep(w.engine.clone());
    let (expired_a, reassigned_a) = first.await.unwrap();
    let (expired_b, reassigned_b) = second.await.unwrap();

    assert_eq!(expired_a.processed + expired_b.processed, 3);
    for report in [&expired_a, &reassigned_a, &expired_b, &reassigned_b] {
        assert!(report.is_clean(), "{:?}", report.errors);
    }

    let check = |all: &[PeerAssignment]| {
        let live = all.iter().filter(|a| a.status.is_live()).count();
        assert!(live <= 3, "{} live assignments", live);
        for old in &original {
            let replacements = all
                .iter()
                .filter(|a| a.replaces_assignment_id == Some(old.id))
                .count();
            assert!(replacements <= 1, "assignment {} replaced {} times", old.id, replacements);
        }
    };
    check(&w.assignments(submission_id).await);

    // a later sequential run finishes whatever the race deferred
    w.engine.reassign_expired(sweep_at).await;
    let all = w.assignments(submission_id).await;
    check(&all);
    assert_eq!(
        all.iter().filter(|a| a.status == AssignmentStatus::Pending).count(),
        3
    );
}
