// ABOUTME: Bounded, append-only log of lock lifecycle events.
// ABOUTME: Oldest events are evicted once capacity is reached.

use std::collections::VecDeque;

use parking_lot::Mutex;

use super::types::LockEvent;
use crate::lock::LockId;

/// Time-ordered record of lock events, queryable by recency.
pub struct EventLog {
    events: Mutex<VecDeque<LockEvent>>,
    capacity: usize,
}

impl EventLog {
    /// Create a log holding at most `capacity` events.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "capacity must be positive");

        Self {
            events: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
        }
    }

    pub(crate) fn append(&self, event: LockEvent) {
        let mut events = self.events.lock();
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }

    /// The `limit` most recent events, newest first.
    pub fn recent(&self, limit: usize) -> Vec<LockEvent> {
        let events = self.events.lock();
        events.iter().rev().take(limit).cloned().collect()
    }

    /// The `limit` most recent events for one resource, newest first.
    pub fn for_resource(&self, resource: &str, limit: usize) -> Vec<LockEvent> {
        let events = self.events.lock();
        events
            .iter()
            .rev()
            .filter(|e| e.resource == resource)
            .take(limit)
            .cloned()
            .collect()
    }

    /// The `limit` most recent events for one agent, newest first.
    pub fn for_agent(&self, agent: &str, limit: usize) -> Vec<LockEvent> {
        let events = self.events.lock();
        events
            .iter()
            .rev()
            .filter(|e| e.agent == agent)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Every retained event about one lock id, oldest first.
    pub fn for_lock(&self, lock_id: LockId) -> Vec<LockEvent> {
        let events = self.events.lock();
        events
            .iter()
            .filter(|e| e.lock_id == lock_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
