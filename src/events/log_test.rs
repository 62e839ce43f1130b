// ABOUTME: Tests for the bounded event log.
// ABOUTME: Covers eviction, recency ordering, and the per-resource/agent/lock filters.

use super::log::EventLog;
use super::types::{LockEvent, LockEventDetails};
use crate::lock::LockId;

fn released(agent: &str, resource: &str, lock_id: LockId) -> LockEvent {
    LockEvent::new(agent, resource, lock_id, LockEventDetails::Released { held_ms: 1 })
}

#[test]
fn test_recent_is_newest_first() {
    let log = EventLog::new(10);
    let ids: Vec<LockId> = (0..3).map(|_| LockId::new()).collect();
    for id in &ids {
        log.append(released("A", "X", *id));
    }

    let recent: Vec<LockId> = log.recent(2).into_iter().map(|e| e.lock_id).collect();
    assert_eq!(recent, vec![ids[2], ids[1]]);
    assert_eq!(log.recent(100).len(), 3);
}

#[test]
fn test_oldest_evicted_at_capacity() {
    let log = EventLog::new(2);
    let first = LockId::new();
    log.append(released("A", "X", first));
    log.append(released("A", "X", LockId::new()));
    log.append(released("A", "X", LockId::new()));

    assert_eq!(log.len(), 2);
    assert_eq!(log.capacity(), 2);
    assert!(log.for_lock(first).is_empty());
}

#[test]
fn test_filters() {
    let log = EventLog::new(10);
    let lock = LockId::new();
    log.append(released("A", "X", lock));
    log.append(released("B", "Y", LockId::new()));
    log.append(released("A", "Y", LockId::new()));

    assert_eq!(log.for_resource("Y", 10).len(), 2);
    assert_eq!(log.for_agent("A", 10).len(), 2);
    assert_eq!(log.for_agent("A", 1)[0].resource, "Y");
    assert_eq!(log.for_lock(lock).len(), 1);
}

#[test]
fn test_empty_log() {
    let log = EventLog::new(5);
    assert!(log.is_empty());
    assert!(log.recent(5).is_empty());
}

#[test]
#[should_panic(expected = "capacity must be positive")]
fn test_zero_capacity_panics() {
    let _ = EventLog::new(0);
}
