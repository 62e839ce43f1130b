// ABOUTME: Tests for deadlock resolution strategies and their side effects.
// ABOUTME: Covers victim selection, manual validation, no-op resolution, and conflict closing.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::mpsc::UnboundedReceiver;

use super::detector::DeadlockDetector;
use super::graph::HeldLock;
use super::resolver::{DeadlockResolver, ResolutionStrategy, select_victim};
use crate::config::{ManagerConfig, SeverityPolicy};
use crate::error::ResolveError;
use crate::events::pipeline::{PipelineHandle, PipelineMsg, Record};
use crate::events::{LockEventDetails, OverrideCause};
use crate::lock::{AcquireRequest, Acquisition, LockGrant, LockId, LockManager, PendingLock, Priority};

struct Fixture {
    manager: LockManager,
    detector: Arc<DeadlockDetector>,
    resolver: DeadlockResolver,
    rx: UnboundedReceiver<PipelineMsg>,
}

fn fixture() -> Fixture {
    let (pipeline, rx) = PipelineHandle::detached();
    let manager = LockManager::new(Arc::new(ManagerConfig::default()), pipeline.clone());
    let detector = Arc::new(DeadlockDetector::new(
        manager.clone(),
        SeverityPolicy::default(),
        pipeline.clone(),
    ));
    let resolver = DeadlockResolver::new(manager.clone(), detector.clone(), pipeline);
    Fixture {
        manager,
        detector,
        resolver,
        rx,
    }
}

fn grant(manager: &LockManager, agent: &str, resource: &str, priority: u8) -> LockGrant {
    match manager
        .request(AcquireRequest::new(agent, resource).priority(priority))
        .unwrap()
    {
        Acquisition::Granted(grant) => grant,
        Acquisition::Queued(_) => panic!("expected {resource} to be free"),
    }
}

fn queue(manager: &LockManager, agent: &str, resource: &str, priority: u8) -> PendingLock {
    match manager
        .request(AcquireRequest::new(agent, resource).priority(priority))
        .unwrap()
    {
        Acquisition::Queued(pending) => pending,
        Acquisition::Granted(_) => panic!("expected {resource} to be held"),
    }
}

fn drain(rx: &mut UnboundedReceiver<PipelineMsg>) -> Vec<Record> {
    let mut records = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        if let PipelineMsg::Record(record) = msg {
            records.push(record);
        }
    }
    records
}

struct Deadlock {
    x: LockGrant,
    y: LockGrant,
    waiting: Vec<PendingLock>,
}

/// A holds X (granted first) and waits on Y; B holds Y and waits on X.
fn deadlock(manager: &LockManager, pa: u8, pb: u8) -> Deadlock {
    let x = grant(manager, "A", "X", pa);
    let y = grant(manager, "B", "Y", pb);
    let waiting = vec![queue(manager, "A", "Y", pa), queue(manager, "B", "X", pb)];
    Deadlock { x, y, waiting }
}

fn cycle() -> Vec<String> {
    vec!["A".to_string(), "B".to_string()]
}

#[tokio::test]
async fn test_priority_strategy_releases_least_urgent() {
    let f = fixture();
    let d = deadlock(&f.manager, 2, 7);

    let resolution = f
        .resolver
        .resolve(&cycle(), ResolutionStrategy::Priority, None)
        .unwrap();

    assert_eq!(resolution.victims, vec![d.y.lock_id]);
    assert!(resolution.cycle_broken);
    assert_eq!(f.manager.holder_of("Y").unwrap().holder, "A");
    assert_eq!(f.manager.holder_of("X").unwrap().holder, "A");
    assert!(!f.detector.is_deadlocked(&cycle()));
}

#[tokio::test]
async fn test_priority_tie_releases_longest_held() {
    let f = fixture();
    let d = deadlock(&f.manager, 5, 5);

    let resolution = f
        .resolver
        .resolve(&cycle(), ResolutionStrategy::Priority, None)
        .unwrap();
    assert_eq!(resolution.victims, vec![d.x.lock_id]);
}

#[tokio::test]
async fn test_youngest_and_oldest_strategies() {
    let f = fixture();
    let d = deadlock(&f.manager, 5, 5);
    let resolution = f
        .resolver
        .resolve(&cycle(), ResolutionStrategy::Youngest, None)
        .unwrap();
    assert_eq!(resolution.victims, vec![d.y.lock_id]);

    let g = fixture();
    let d = deadlock(&g.manager, 5, 5);
    let resolution = g
        .resolver
        .resolve(&cycle(), ResolutionStrategy::Oldest, None)
        .unwrap();
    assert_eq!(resolution.victims, vec![d.x.lock_id]);
}

#[tokio::test]
async fn test_random_strategy_releases_a_cycle_lock() {
    let f = fixture();
    let d = deadlock(&f.manager, 5, 5);

    let resolution = f
        .resolver
        .resolve(&cycle(), ResolutionStrategy::Random, None)
        .unwrap();
    assert_eq!(resolution.victims.len(), 1);
    assert!([d.x.lock_id, d.y.lock_id].contains(&resolution.victims[0]));
    assert!(resolution.cycle_broken);
}

#[tokio::test]
async fn test_manual_requires_victim() {
    let f = fixture();
    let _d = deadlock(&f.manager, 5, 5);

    let err = f
        .resolver
        .resolve(&cycle(), ResolutionStrategy::Manual, None)
        .unwrap_err();
    assert_eq!(err, ResolveError::MissingVictim);
}

#[tokio::test]
async fn test_manual_rejects_victim_outside_cycle() {
    let f = fixture();
    let _d = deadlock(&f.manager, 5, 5);
    let bystander = grant(&f.manager, "C", "Z", 5);

    let err = f
        .resolver
        .resolve(&cycle(), ResolutionStrategy::Manual, Some(bystander.lock_id))
        .unwrap_err();
    assert_eq!(
        err,
        ResolveError::VictimNotInCycle {
            victim: bystander.lock_id
        }
    );
    // Nothing was released.
    assert_eq!(f.manager.active_count(), 3);
    assert!(f.detector.is_deadlocked(&cycle()));
}

#[tokio::test]
async fn test_manual_releases_named_victim() {
    let mut f = fixture();
    let d = deadlock(&f.manager, 5, 5);
    f.detector.detect();
    drain(&mut f.rx);

    let resolution = f
        .resolver
        .resolve(&cycle(), ResolutionStrategy::Manual, Some(d.y.lock_id))
        .unwrap();
    assert_eq!(resolution.victims, vec![d.y.lock_id]);

    let records = drain(&mut f.rx);
    let closed = records
        .iter()
        .find_map(|r| match r {
            Record::ConflictResolved(resolution) => Some(resolution),
            _ => None,
        })
        .expect("conflict closed");
    assert!(!closed.auto_resolved);
}

#[tokio::test]
async fn test_victim_release_is_an_override() {
    let mut f = fixture();
    let d = deadlock(&f.manager, 5, 9);
    drain(&mut f.rx);

    f.resolver
        .resolve(&cycle(), ResolutionStrategy::Priority, None)
        .unwrap();

    let records = drain(&mut f.rx);
    let overridden = records
        .iter()
        .find_map(|r| match r {
            Record::Lock(event) if event.lock_id == d.y.lock_id => Some(event.details.clone()),
            _ => None,
        })
        .expect("override event");
    match overridden {
        LockEventDetails::Overridden { reason, cause, .. } => {
            assert_eq!(reason, "deadlock resolution: strategy=priority");
            assert_eq!(cause, OverrideCause::DeadlockResolution);
        }
        other => panic!("Expected Overridden, got {:?}", other),
    }
}

#[tokio::test]
async fn test_detected_conflict_is_closed_automatically() {
    let mut f = fixture();
    let _d = deadlock(&f.manager, 5, 5);
    f.detector.detect();

    let raised = drain(&mut f.rx)
        .into_iter()
        .find_map(|r| match r {
            Record::Conflict(conflict) => Some(conflict),
            _ => None,
        })
        .expect("deadlock conflict");

    f.resolver
        .resolve(&cycle(), ResolutionStrategy::Oldest, None)
        .unwrap();

    let closed = drain(&mut f.rx)
        .into_iter()
        .find_map(|r| match r {
            Record::ConflictResolved(resolution) => Some(resolution),
            _ => None,
        })
        .expect("conflict closed");
    assert_eq!(closed.conflict_id, raised.conflict_id);
    assert!(closed.auto_resolved);
}

#[tokio::test]
async fn test_dissolved_cycle_is_a_noop() {
    let mut f = fixture();
    let d = deadlock(&f.manager, 5, 5);
    drop(d.waiting);
    drain(&mut f.rx);

    let resolution = f
        .resolver
        .resolve(&cycle(), ResolutionStrategy::Priority, None)
        .unwrap();
    assert!(resolution.was_noop());
    assert!(resolution.cycle_broken);
    assert_eq!(f.manager.active_count(), 2);
    assert!(drain(&mut f.rx).is_empty());
}

#[tokio::test]
async fn test_short_cycle_rejected() {
    let f = fixture();
    let err = f
        .resolver
        .resolve(&["A".to_string()], ResolutionStrategy::Priority, None)
        .unwrap_err();
    assert_eq!(err, ResolveError::EmptyCycle);
}

#[test]
fn test_select_victim_orders() {
    let now = Utc::now();
    let lock = |priority: u8, seq: u64, offset_ms: i64| HeldLock {
        lock_id: LockId::new(),
        holder: format!("agent-{seq}"),
        priority: Priority::new(priority).unwrap(),
        acquired_at: now + ChronoDuration::milliseconds(offset_ms),
        grant_seq: seq,
    };
    let candidates = vec![lock(4, 1, 0), lock(9, 2, 10), lock(9, 3, 20), lock(1, 4, 30)];

    let pick = |strategy| select_victim(strategy, &candidates).map(|l| l.grant_seq);
    assert_eq!(pick(ResolutionStrategy::Priority), Some(2));
    assert_eq!(pick(ResolutionStrategy::Youngest), Some(4));
    assert_eq!(pick(ResolutionStrategy::Oldest), Some(1));
    assert_eq!(pick(ResolutionStrategy::Manual), None);
    assert!(pick(ResolutionStrategy::Random).is_some());
    assert_eq!(select_victim(ResolutionStrategy::Priority, &[]), None);
}

#[test]
fn test_strategy_parses_and_displays() {
    for strategy in [
        ResolutionStrategy::Priority,
        ResolutionStrategy::Youngest,
        ResolutionStrategy::Oldest,
        ResolutionStrategy::Random,
        ResolutionStrategy::Manual,
    ] {
        assert_eq!(strategy.to_string().parse::<ResolutionStrategy>(), Ok(strategy));
    }
    assert!("fastest".parse::<ResolutionStrategy>().is_err());
}
