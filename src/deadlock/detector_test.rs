// ABOUTME: Tests for deadlock detection against a live lock manager.
// ABOUTME: Covers cycle reporting, severity, de-duplication, and forgetting dissolved cycles.

use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;

use super::detector::{DeadlockDetector, Severity};
use crate::config::{ManagerConfig, SeverityPolicy};
use crate::events::ConflictType;
use crate::events::pipeline::{PipelineHandle, PipelineMsg, Record};
use crate::lock::{AcquireRequest, Acquisition, LockGrant, LockManager, PendingLock, Priority};

struct Fixture {
    manager: LockManager,
    detector: DeadlockDetector,
    rx: UnboundedReceiver<PipelineMsg>,
}

fn fixture() -> Fixture {
    let (pipeline, rx) = PipelineHandle::detached();
    let manager = LockManager::new(Arc::new(ManagerConfig::default()), pipeline.clone());
    let detector = DeadlockDetector::new(manager.clone(), SeverityPolicy::default(), pipeline);
    Fixture {
        manager,
        detector,
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

/// A holds X and waits on Y; B holds Y and waits on X.
fn two_agent_deadlock(manager: &LockManager, pa: u8, pb: u8) -> Vec<PendingLock> {
    grant(manager, "A", "X", pa);
    grant(manager, "B", "Y", pb);
    vec![queue(manager, "A", "Y", pa), queue(manager, "B", "X", pb)]
}

#[tokio::test]
async fn test_no_deadlock_without_cycle() {
    let f = fixture();
    grant(&f.manager, "A", "X", 5);
    let _waiting = queue(&f.manager, "B", "X", 5);

    assert!(f.detector.detect().is_empty());
}

#[tokio::test]
async fn test_detects_two_agent_cycle() {
    let f = fixture();
    let _waiting = two_agent_deadlock(&f.manager, 5, 5);

    let found = f.detector.detect();
    assert_eq!(found.len(), 1);
    let info = &found[0];
    assert_eq!(info.cycle, vec!["A".to_string(), "B".to_string()]);
    assert_eq!(info.involved_locks.len(), 2);
    assert_eq!(info.severity, Severity::Medium);
    assert_eq!(info.describe(), "A -> B -> A");
}

#[tokio::test]
async fn test_involved_locks_are_the_held_locks() {
    let f = fixture();
    let x = grant(&f.manager, "A", "X", 5);
    let y = grant(&f.manager, "B", "Y", 5);
    let _a = queue(&f.manager, "A", "Y", 5);
    let _b = queue(&f.manager, "B", "X", 5);

    let info = f.detector.detect().remove(0);
    assert!(info.involved_locks.contains(&x.lock_id));
    assert!(info.involved_locks.contains(&y.lock_id));
}

#[tokio::test]
async fn test_three_agent_cycle() {
    let f = fixture();
    grant(&f.manager, "A", "X", 5);
    grant(&f.manager, "B", "Y", 5);
    grant(&f.manager, "C", "Z", 5);
    let _waiting = vec![
        queue(&f.manager, "A", "Y", 5),
        queue(&f.manager, "B", "Z", 5),
        queue(&f.manager, "C", "X", 5),
    ];

    let found = f.detector.detect();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].cycle, vec!["A", "B", "C"]);
    assert!(found[0].severity >= Severity::Medium);
}

#[tokio::test]
async fn test_severity_follows_priorities() {
    let f = fixture();
    let _waiting = two_agent_deadlock(&f.manager, 2, 7);
    assert_eq!(f.detector.detect()[0].severity, Severity::High);

    let g = fixture();
    let _waiting = two_agent_deadlock(&g.manager, 8, 9);
    assert_eq!(g.detector.detect()[0].severity, Severity::Low);
}

#[tokio::test]
async fn test_cycle_raised_once_while_it_persists() {
    let mut f = fixture();
    let _waiting = two_agent_deadlock(&f.manager, 5, 5);
    drain(&mut f.rx);

    let first = f.detector.detect();
    let second = f.detector.detect();
    assert_eq!(first[0].deadlock_id, second[0].deadlock_id);

    let records = drain(&mut f.rx);
    let conflicts = records
        .iter()
        .filter(|r| matches!(r, Record::Conflict(c) if c.conflict_type == ConflictType::Deadlock))
        .count();
    let deadlocks = records
        .iter()
        .filter(|r| matches!(r, Record::Deadlock(_)))
        .count();
    assert_eq!(conflicts, 1);
    assert_eq!(deadlocks, 1);
}

#[tokio::test]
async fn test_dissolved_cycle_is_forgotten() {
    let f = fixture();
    let waiting = two_agent_deadlock(&f.manager, 5, 5);
    let first = f.detector.detect().remove(0);

    // Withdrawing one request breaks the cycle.
    drop(waiting);
    assert!(f.detector.detect().is_empty());
    assert!(!f.detector.is_deadlocked(&first.cycle));

    let _again = vec![
        queue(&f.manager, "A", "Y", 5),
        queue(&f.manager, "B", "X", 5),
    ];
    let second = f.detector.detect().remove(0);
    assert_ne!(first.deadlock_id, second.deadlock_id);
}

#[tokio::test]
async fn test_is_deadlocked_accepts_any_rotation() {
    let f = fixture();
    let _waiting = two_agent_deadlock(&f.manager, 5, 5);
    assert!(f.detector.is_deadlocked(&["B".to_string(), "A".to_string()]));
}

#[test]
fn test_classify_thresholds() {
    let policy = SeverityPolicy::default();
    let p = |v: u8| Priority::new(v).unwrap();

    assert_eq!(Severity::classify(2, &[p(5), p(5)], &policy), Severity::Medium);
    assert_eq!(Severity::classify(2, &[p(3), p(9)], &policy), Severity::High);
    assert_eq!(Severity::classify(2, &[p(6), p(10)], &policy), Severity::Low);
    assert_eq!(Severity::classify(3, &[p(8), p(8), p(8)], &policy), Severity::Medium);
    assert_eq!(Severity::classify(4, &[p(9); 4], &policy), Severity::High);
}

#[test]
fn test_classify_uses_policy() {
    let policy = SeverityPolicy {
        high_priority_max: 1,
        low_priority_min: 4,
        high_cycle_len: 3,
    };
    let p = |v: u8| Priority::new(v).unwrap();

    assert_eq!(Severity::classify(2, &[p(2), p(3)], &policy), Severity::Medium);
    assert_eq!(Severity::classify(2, &[p(4), p(4)], &policy), Severity::Low);
    assert_eq!(Severity::classify(3, &[p(9); 3], &policy), Severity::High);
}
