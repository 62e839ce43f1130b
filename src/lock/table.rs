// ABOUTME: The authoritative lock table - one holder and one ordered queue per resource.
// ABOUTME: Pure data structure; callers serialize access and emit the events.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use tokio::time::Instant;
use uuid::Uuid;

use super::types::{
    ActiveLock, ExecutionStage, LockGrant, LockId, LockRequest, Priority, expiry_after,
};
use crate::error::LockError;

pub(crate) type GrantSender = oneshot::Sender<Result<LockGrant, LockError>>;

/// Internal state of a held lock.
#[derive(Debug)]
pub(crate) struct Held {
    pub lock_id: LockId,
    pub agent: String,
    pub priority: Priority,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub context_id: Option<String>,
    pub stage: ExecutionStage,
    pub held_since: Instant,
    pub lease_deadline: Option<Instant>,
    /// Monotonic grant order, used to break timestamp ties.
    pub grant_seq: u64,
    /// Open priority-inversion conflicts caused by this holder.
    pub inversions: Vec<Uuid>,
}

impl Held {
    pub(crate) fn held_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.held_since)
    }
}

/// Internal state of a queued request.
#[derive(Debug)]
pub(crate) struct Queued {
    pub request: LockRequest,
    pub context_id: Option<String>,
    pub lease: Option<Duration>,
    pub enqueued: Instant,
    pub deadline: Instant,
    pub seq: u64,
    pub notify: Option<GrantSender>,
}

impl Queued {
    fn order_key(&self) -> (Priority, u64) {
        (self.request.priority, self.seq)
    }
}

#[derive(Debug)]
pub(crate) struct Slot {
    pub holder: Held,
    /// Sorted by priority ascending, then arrival.
    pub queue: Vec<Queued>,
}

/// What a grant needs to know about the new holder.
pub(crate) struct Claim {
    pub lock_id: LockId,
    pub agent: String,
    pub priority: Priority,
    pub context_id: Option<String>,
    pub lease: Option<Duration>,
}

/// Result of removing a holder.
pub(crate) struct Handoff {
    pub resource: String,
    pub released: Held,
    pub promoted: Option<Promotion>,
}

/// A queued request that became the holder.
pub(crate) struct Promotion {
    pub request: LockRequest,
    pub waited: Duration,
    pub grant: LockGrant,
}

/// Point-in-time view of one held resource, for wait-for analysis.
#[derive(Debug, Clone)]
pub(crate) struct HoldSnapshot {
    pub lock_id: LockId,
    pub resource: String,
    pub holder: String,
    pub priority: Priority,
    pub acquired_at: DateTime<Utc>,
    pub grant_seq: u64,
    /// (agent, priority) of every waiter, in queue order.
    pub waiters: Vec<(String, Priority)>,
}

#[derive(Debug, Default)]
pub(crate) struct LockTable {
    slots: HashMap<String, Slot>,
    /// Held lock id -> resource.
    held: HashMap<LockId, String>,
    /// Queued request id -> resource.
    queued: HashMap<LockId, String>,
    next_seq: u64,
    pub closed: bool,
}

impl LockTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    pub(crate) fn slot(&self, resource: &str) -> Option<&Slot> {
        self.slots.get(resource)
    }

    pub(crate) fn holder_mut(&mut self, lock_id: LockId) -> Option<&mut Held> {
        let resource = self.held.get(&lock_id)?;
        self.slots.get_mut(resource).map(|slot| &mut slot.holder)
    }

    #[cfg(test)]
    pub(crate) fn is_held(&self, lock_id: LockId) -> bool {
        self.held.contains_key(&lock_id)
    }

    #[cfg(test)]
    pub(crate) fn is_queued(&self, request_id: LockId) -> bool {
        self.queued.contains_key(&request_id)
    }

    /// Make `claim.agent` the holder of a free resource.
    pub(crate) fn grant(&mut self, resource: &str, claim: Claim) -> LockGrant {
        debug_assert!(!self.slots.contains_key(resource), "resource already held");
        let held = self.new_holder(claim);
        let grant = grant_for(resource, &held, Duration::ZERO);
        self.held.insert(held.lock_id, resource.to_string());
        self.slots.insert(
            resource.to_string(),
            Slot {
                holder: held,
                queue: Vec::new(),
            },
        );
        grant
    }

    /// Queue a request behind the current holder. Returns its 1-based
    /// position, or `None` if the resource has no holder.
    pub(crate) fn enqueue(
        &mut self,
        request: LockRequest,
        context_id: Option<String>,
        lease: Option<Duration>,
        deadline: Instant,
        notify: Option<GrantSender>,
    ) -> Option<usize> {
        if !self.slots.contains_key(&request.resource) {
            return None;
        }

        let seq = self.next_seq();
        let resource = request.resource.clone();
        let queued = Queued {
            request,
            context_id,
            lease,
            enqueued: Instant::now(),
            deadline,
            seq,
            notify,
        };

        let slot = self.slots.get_mut(&resource)?;
        let key = queued.order_key();
        let position = slot.queue.partition_point(|q| q.order_key() <= key);
        self.queued.insert(queued.request.request_id, resource);
        slot.queue.insert(position, queued);
        Some(position + 1)
    }

    /// Remove a holder and hand the resource to the head of its queue.
    ///
    /// Waiters whose receiver is gone are skipped. The hand-off happens
    /// inside this call, so nobody can take the resource in between.
    pub(crate) fn release(&mut self, lock_id: LockId) -> Option<Handoff> {
        let resource = self.held.remove(&lock_id)?;
        let mut slot = self.slots.remove(&resource)?;
        slot.holder.stage = ExecutionStage::Releasing;

        let mut queue = std::mem::take(&mut slot.queue);
        let mut promoted = None;
        while !queue.is_empty() {
            let mut head = queue.remove(0);
            self.queued.remove(&head.request.request_id);

            let waited = head.enqueued.elapsed();
            let held = self.new_holder(Claim {
                lock_id: head.request.request_id,
                agent: head.request.agent.clone(),
                priority: head.request.priority,
                context_id: head.context_id.take(),
                lease: head.lease,
            });
            let grant = grant_for(&resource, &held, waited);

            if let Some(notify) = head.notify.take() {
                if notify.send(Ok(grant.clone())).is_err() {
                    continue;
                }
            }

            self.held.insert(held.lock_id, resource.clone());
            self.slots.insert(resource.clone(), Slot { holder: held, queue });
            promoted = Some(Promotion {
                request: head.request,
                waited,
                grant,
            });
            break;
        }

        Some(Handoff {
            resource,
            released: slot.holder,
            promoted,
        })
    }

    /// Remove a queued request without granting it.
    pub(crate) fn remove_queued(&mut self, request_id: LockId) -> Option<Queued> {
        let resource = self.queued.remove(&request_id)?;
        let slot = self.slots.get_mut(&resource)?;
        let index = slot
            .queue
            .iter()
            .position(|q| q.request.request_id == request_id)?;
        Some(slot.queue.remove(index))
    }

    /// Queued requests whose deadline has passed.
    pub(crate) fn overdue_requests(&self, now: Instant) -> Vec<LockId> {
        self.slots
            .values()
            .flat_map(|slot| slot.queue.iter())
            .filter(|q| q.deadline <= now)
            .map(|q| q.request.request_id)
            .collect()
    }

    /// Held locks whose lease has run out.
    pub(crate) fn expired_leases(&self, now: Instant) -> Vec<LockId> {
        self.slots
            .values()
            .filter(|slot| slot.holder.lease_deadline.is_some_and(|d| d <= now))
            .map(|slot| slot.holder.lock_id)
            .collect()
    }

    /// Lock ids held by one agent.
    pub(crate) fn held_by(&self, agent: &str) -> Vec<LockId> {
        self.slots
            .values()
            .filter(|slot| slot.holder.agent == agent)
            .map(|slot| slot.holder.lock_id)
            .collect()
    }

    pub(crate) fn views(&self) -> Vec<ActiveLock> {
        let mut views: Vec<_> = self
            .slots
            .iter()
            .map(|(resource, slot)| view(resource, slot))
            .collect();
        views.sort_by(|a, b| a.resource.cmp(&b.resource));
        views
    }

    pub(crate) fn view(&self, lock_id: LockId) -> Option<ActiveLock> {
        let resource = self.held.get(&lock_id)?;
        self.slots.get(resource).map(|slot| view(resource, slot))
    }

    pub(crate) fn snapshot(&self) -> Vec<HoldSnapshot> {
        self.slots
            .iter()
            .map(|(resource, slot)| HoldSnapshot {
                lock_id: slot.holder.lock_id,
                resource: resource.clone(),
                holder: slot.holder.agent.clone(),
                priority: slot.holder.priority,
                acquired_at: slot.holder.acquired_at,
                grant_seq: slot.holder.grant_seq,
                waiters: slot
                    .queue
                    .iter()
                    .map(|q| (q.request.agent.clone(), q.request.priority))
                    .collect(),
            })
            .collect()
    }

    /// Drop every queued request, returning them so callers can notify.
    pub(crate) fn drain_queues(&mut self) -> Vec<Queued> {
        self.queued.clear();
        self.slots
            .values_mut()
            .flat_map(|slot| std::mem::take(&mut slot.queue))
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    fn new_holder(&mut self, claim: Claim) -> Held {
        let grant_seq = self.next_seq();
        let acquired_at = Utc::now();
        let held_since = Instant::now();
        let expiry = claim
            .lease
            .and_then(|lease| expiry_after(acquired_at, held_since, lease));
        Held {
            lock_id: claim.lock_id,
            agent: claim.agent,
            priority: claim.priority,
            acquired_at,
            expires_at: expiry.map(|(at, _)| at),
            context_id: claim.context_id,
            stage: ExecutionStage::Acquired,
            held_since,
            lease_deadline: expiry.map(|(_, deadline)| deadline),
            grant_seq,
            inversions: Vec::new(),
        }
    }
}

fn grant_for(resource: &str, held: &Held, waited: Duration) -> LockGrant {
    LockGrant {
        lock_id: held.lock_id,
        agent: held.agent.clone(),
        resource: resource.to_string(),
        priority: held.priority,
        acquired_at: held.acquired_at,
        waited,
    }
}

fn view(resource: &str, slot: &Slot) -> ActiveLock {
    ActiveLock {
        resource: resource.to_string(),
        lock_id: slot.holder.lock_id,
        holder: slot.holder.agent.clone(),
        acquired_at: slot.holder.acquired_at,
        expires_at: slot.holder.expires_at,
        priority: slot.holder.priority,
        context_id: slot.holder.context_id.clone(),
        waiting_queue: slot.queue.iter().map(|q| q.request.clone()).collect(),
        stage: slot.holder.stage,
    }
}
