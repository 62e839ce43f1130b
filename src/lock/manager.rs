// ABOUTME: LockManager - acquire, release, and override over the shared lock table.
// ABOUTME: Every mutation runs under one mutex and emits its events before unlocking.

use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::table::{Claim, HoldSnapshot, LockTable, Queued};
use super::types::{
    AcquireRequest, ActiveLock, ExecutionStage, LockGrant, LockId, LockRequest, Priority,
    expiry_after,
};
use crate::config::ManagerConfig;
use crate::error::LockError;
use crate::events::pipeline::{ConflictResolution, PipelineHandle, Record};
use crate::events::{
    ConflictEvent, ConflictType, LockEvent, LockEventDetails, OverrideCause, ReleaseNotice,
};

type GrantReceiver = oneshot::Receiver<Result<LockGrant, LockError>>;

/// Outcome of a non-blocking acquire.
#[derive(Debug)]
pub enum Acquisition {
    /// The resource was free (or already held by the requester).
    Granted(LockGrant),
    /// The request is waiting in the resource's queue.
    Queued(PendingLock),
}

/// What a sweep removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Queued requests dropped because their timeout elapsed.
    pub timed_out: Vec<LockId>,
    /// Held locks force-released because their lease ran out.
    pub leases_expired: Vec<LockId>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.timed_out.is_empty() && self.leases_expired.is_empty()
    }
}

enum ReleaseCause {
    Voluntary,
    Forced { reason: String, cause: OverrideCause },
}

struct Inner {
    table: Mutex<LockTable>,
    config: Arc<ManagerConfig>,
    pipeline: PipelineHandle,
}

/// Exclusive-access manager for named resources (tools).
///
/// # Lock Semantics
///
/// - **One holder per resource:** a request for a held resource waits in
///   that resource's queue.
/// - **Queue order:** priority ascending (1 first), then arrival order.
///   A steady stream of urgent requests can starve a low-priority waiter.
/// - **Atomic hand-off:** releasing a lock grants it to the queue head in
///   the same critical section.
/// - **Re-entrant acquire:** an agent asking for a resource it already
///   holds gets its existing grant back.
/// - **Cancellation:** dropping a [`PendingLock`] withdraws the request
///   without disturbing other waiters.
#[derive(Clone)]
pub struct LockManager {
    inner: Arc<Inner>,
}

impl LockManager {
    pub(crate) fn new(config: Arc<ManagerConfig>, pipeline: PipelineHandle) -> Self {
        Self {
            inner: Arc::new(Inner {
                table: Mutex::new(LockTable::new()),
                config,
                pipeline,
            }),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    /// Acquire a resource, waiting in its queue if necessary.
    ///
    /// Returns `Err(LockError::Timeout)` if the request is still queued when
    /// its timeout elapses.
    pub async fn acquire(&self, request: AcquireRequest) -> Result<LockGrant, LockError> {
        match self.request(request)? {
            Acquisition::Granted(grant) => Ok(grant),
            Acquisition::Queued(pending) => pending.wait().await,
        }
    }

    /// Acquire a resource with cancellation support.
    ///
    /// Returns `Err(LockError::Cancelled)` if the cancel future completes
    /// first; a queued request is withdrawn from the queue.
    pub async fn acquire_with_cancel<F>(
        &self,
        request: AcquireRequest,
        cancel: F,
    ) -> Result<LockGrant, LockError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(cancel);

        tokio::select! {
            biased;
            () = &mut cancel => Err(LockError::Cancelled),
            result = self.acquire(request) => result,
        }
    }

    /// Request a resource without waiting.
    ///
    /// A free resource is granted immediately. A held one queues the request
    /// and returns a [`PendingLock`] that resolves on grant or timeout.
    pub fn request(&self, request: AcquireRequest) -> Result<Acquisition, LockError> {
        let priority = Priority::new(request.priority)?;
        let timeout = request
            .timeout
            .unwrap_or_else(|| self.inner.config.default_timeout());
        let lease = request.lease.or_else(|| self.inner.config.default_lease());
        let now = Instant::now();
        let deadline = now.checked_add(timeout).ok_or(LockError::OutOfRange {
            what: "timeout",
            duration: timeout,
        })?;
        if let Some(lease) = lease {
            if expiry_after(Utc::now(), now, lease).is_none() {
                return Err(LockError::OutOfRange {
                    what: "lease",
                    duration: lease,
                });
            }
        }
        let AcquireRequest {
            agent,
            resource,
            retry_count,
            context_id,
            ..
        } = request;

        let mut table = self.inner.table.lock();
        if table.closed {
            return Err(LockError::Closed);
        }

        let Some(slot) = table.slot(&resource) else {
            let grant = table.grant(
                &resource,
                Claim {
                    lock_id: LockId::new(),
                    agent,
                    priority,
                    context_id,
                    lease,
                },
            );
            debug!(agent = %grant.agent, resource = %grant.resource, lock_id = %grant.lock_id, "lock granted");
            self.emit(Record::Lock(LockEvent::new(
                &grant.agent,
                &grant.resource,
                grant.lock_id,
                LockEventDetails::Acquired {
                    priority,
                    waited_ms: None,
                    previous_lock_id: None,
                },
            )));
            return Ok(Acquisition::Granted(grant));
        };

        if slot.holder.agent == agent {
            return Ok(Acquisition::Granted(LockGrant {
                lock_id: slot.holder.lock_id,
                agent,
                resource,
                priority: slot.holder.priority,
                acquired_at: slot.holder.acquired_at,
                waited: std::time::Duration::ZERO,
            }));
        }

        let holder_agent = slot.holder.agent.clone();
        let holder_priority = slot.holder.priority;
        let holder_lock = slot.holder.lock_id;
        let depth = slot.queue.len();

        if let Some(max) = self.inner.config.max_queue_depth {
            if depth >= max {
                warn!(agent = %agent, resource = %resource, depth, "waiting queue full, request rejected");
                self.emit(Record::Conflict(ConflictEvent::new(
                    ConflictType::ResourceExhaustion,
                    vec![agent.clone(), holder_agent],
                    format!("'{agent}' rejected: queue for '{resource}' already holds {depth} waiters"),
                )));
                return Err(LockError::QueueFull { resource, depth });
            }
        }

        let lock_id = LockId::new();
        let lock_request = LockRequest {
            request_id: lock_id,
            agent,
            resource,
            priority,
            requested_at: Utc::now(),
            timeout_ms: timeout.as_millis() as u64,
            retry_count,
        };
        let (tx, rx) = oneshot::channel();

        let Some(position) =
            table.enqueue(lock_request.clone(), context_id, lease, deadline, Some(tx))
        else {
            error!(resource = %lock_request.resource, "holder vanished while enqueueing");
            return Err(LockError::NotFound(holder_lock));
        };

        debug!(
            agent = %lock_request.agent,
            resource = %lock_request.resource,
            holder = %holder_agent,
            position,
            "lock request queued"
        );
        self.emit(Record::Lock(LockEvent::new(
            &lock_request.agent,
            &lock_request.resource,
            lock_id,
            LockEventDetails::Queued {
                priority,
                queue_position: position,
                holder: holder_agent.clone(),
            },
        )));

        if priority.outranks(holder_priority) {
            let conflict = ConflictEvent::new(
                ConflictType::PriorityInversion,
                vec![lock_request.agent.clone(), holder_agent.clone()],
                format!(
                    "'{}' (priority {}) waits on '{}' held by '{}' (priority {})",
                    lock_request.agent,
                    priority,
                    lock_request.resource,
                    holder_agent,
                    holder_priority
                ),
            );
            if let Some(held) = table.holder_mut(holder_lock) {
                held.inversions.push(conflict.conflict_id);
            }
            self.emit(Record::Conflict(conflict));
        }

        Ok(Acquisition::Queued(PendingLock {
            manager: self.clone(),
            request: lock_request,
            deadline,
            rx: Some(rx),
            settled: false,
        }))
    }

    /// Release a held lock and hand the resource to the next waiter.
    pub fn release(&self, lock_id: LockId) -> Result<(), LockError> {
        let mut table = self.inner.table.lock();
        self.release_locked(&mut table, lock_id, ReleaseCause::Voluntary)
    }

    /// Forcibly release a lock regardless of who holds it.
    ///
    /// Returns `Err(LockError::NotFound)` if the lock is not held; nothing
    /// is emitted in that case, so repeating an override is harmless.
    pub fn override_lock(&self, lock_id: LockId, reason: &str) -> Result<(), LockError> {
        self.force_release(lock_id, reason.to_string(), OverrideCause::Administrator)
    }

    pub(crate) fn force_release(
        &self,
        lock_id: LockId,
        reason: String,
        cause: OverrideCause,
    ) -> Result<(), LockError> {
        let mut table = self.inner.table.lock();
        info!(lock_id = %lock_id, reason = %reason, ?cause, "forcing lock release");
        self.release_locked(&mut table, lock_id, ReleaseCause::Forced { reason, cause })
    }

    /// Release every lock held by `agent`. Returns how many were released.
    pub fn release_all(&self, agent: &str) -> usize {
        let mut table = self.inner.table.lock();
        let mut released = 0;
        for lock_id in table.held_by(agent) {
            if self
                .release_locked(&mut table, lock_id, ReleaseCause::Voluntary)
                .is_ok()
            {
                released += 1;
            }
        }
        released
    }

    /// Record that the holder has started running the tool.
    pub fn mark_executing(&self, lock_id: LockId) -> Result<(), LockError> {
        let mut table = self.inner.table.lock();
        let held = table
            .holder_mut(lock_id)
            .ok_or(LockError::NotFound(lock_id))?;
        held.stage = ExecutionStage::Executing;
        debug!(lock_id = %lock_id, agent = %held.agent, "lock holder executing");
        Ok(())
    }

    /// Acquire, run `work` while holding the resource, then release.
    ///
    /// If the lock was overridden while `work` ran, the output is still
    /// returned; the lost lock is only logged. Dropping the returned future
    /// mid-run releases the lock.
    pub async fn run_exclusive<F, T>(&self, request: AcquireRequest, work: F) -> Result<T, LockError>
    where
        F: Future<Output = T>,
    {
        let grant = self.acquire(request).await?;
        let _guard = ExecutionGuard {
            manager: self,
            lock_id: grant.lock_id,
        };
        self.mark_executing(grant.lock_id)?;
        Ok(work.await)
    }

    /// Snapshot of every held lock, ordered by resource.
    pub fn active_locks(&self) -> Vec<ActiveLock> {
        self.inner.table.lock().views()
    }

    pub fn lock_details(&self, lock_id: LockId) -> Option<ActiveLock> {
        self.inner.table.lock().view(lock_id)
    }

    /// Current lock for a resource, if held.
    pub fn holder_of(&self, resource: &str) -> Option<ActiveLock> {
        let table = self.inner.table.lock();
        let lock_id = table.slot(resource)?.holder.lock_id;
        table.view(lock_id)
    }

    pub fn active_count(&self) -> usize {
        self.inner.table.lock().len()
    }

    pub(crate) fn snapshot(&self) -> Vec<HoldSnapshot> {
        self.inner.table.lock().snapshot()
    }

    /// Time out overdue queued requests and force-release expired leases.
    pub fn sweep_expired(&self) -> SweepReport {
        let now = Instant::now();
        let mut table = self.inner.table.lock();
        let mut report = SweepReport::default();

        for request_id in table.overdue_requests(now) {
            if let Some(queued) = table.remove_queued(request_id) {
                self.time_out_locked(&table, queued);
                report.timed_out.push(request_id);
            }
        }

        for lock_id in table.expired_leases(now) {
            warn!(lock_id = %lock_id, "lease expired, forcing release");
            let cause = ReleaseCause::Forced {
                reason: "lease expired".to_string(),
                cause: OverrideCause::LeaseExpired,
            };
            if self.release_locked(&mut table, lock_id, cause).is_ok() {
                report.leases_expired.push(lock_id);
            }
        }

        report
    }

    /// Refuse new requests and fail every queued one with `Closed`.
    pub(crate) fn close(&self) -> usize {
        let mut table = self.inner.table.lock();
        table.closed = true;
        let drained = table.drain_queues();
        let count = drained.len();
        for mut queued in drained {
            if let Some(notify) = queued.notify.take() {
                let _ = notify.send(Err(LockError::Closed));
            }
        }
        count
    }

    fn emit(&self, record: Record) {
        self.inner.pipeline.emit(record);
    }

    fn release_locked(
        &self,
        table: &mut LockTable,
        lock_id: LockId,
        cause: ReleaseCause,
    ) -> Result<(), LockError> {
        let handoff = table.release(lock_id).ok_or(LockError::NotFound(lock_id))?;
        let released = handoff.released;
        let held_ms = released.held_for(Instant::now()).as_millis() as u64;

        let details = match cause {
            ReleaseCause::Voluntary => LockEventDetails::Released { held_ms },
            ReleaseCause::Forced { reason, cause } => LockEventDetails::Overridden {
                reason,
                cause,
                held_ms,
            },
        };
        debug!(agent = %released.agent, resource = %handoff.resource, lock_id = %lock_id, "lock released");
        self.emit(Record::Lock(LockEvent::new(
            &released.agent,
            &handoff.resource,
            lock_id,
            details,
        )));

        for conflict_id in released.inversions {
            self.emit(Record::ConflictResolved(ConflictResolution::now(
                conflict_id,
                format!("'{}' gave up '{}'", released.agent, handoff.resource),
                true,
            )));
        }

        let next_holder = handoff.promoted.map(|promotion| {
            debug!(
                agent = %promotion.grant.agent,
                resource = %handoff.resource,
                waited = ?promotion.waited,
                "queued request promoted"
            );
            self.emit(Record::Lock(LockEvent::new(
                &promotion.grant.agent,
                &handoff.resource,
                promotion.grant.lock_id,
                LockEventDetails::Acquired {
                    priority: promotion.request.priority,
                    waited_ms: Some(promotion.waited.as_millis() as u64),
                    previous_lock_id: Some(lock_id),
                },
            )));
            promotion.grant.agent
        });

        self.emit(Record::Released(ReleaseNotice {
            lock_id,
            resource: handoff.resource,
            agent: released.agent,
            next_holder,
        }));
        Ok(())
    }

    fn time_out_locked(&self, table: &LockTable, mut queued: Queued) -> LockError {
        let waited = queued.enqueued.elapsed();
        let request = &queued.request;
        warn!(
            agent = %request.agent,
            resource = %request.resource,
            waited = ?waited,
            "queued lock request timed out"
        );

        self.emit(Record::Lock(LockEvent::new(
            &request.agent,
            &request.resource,
            request.request_id,
            LockEventDetails::Timeout {
                waited_ms: waited.as_millis() as u64,
                timeout_ms: request.timeout_ms,
            },
        )));

        let mut involved = vec![request.agent.clone()];
        if let Some(slot) = table.slot(&request.resource) {
            involved.push(slot.holder.agent.clone());
        }
        self.emit(Record::Conflict(ConflictEvent::new(
            ConflictType::Timeout,
            involved,
            format!(
                "'{}' gave up on '{}' after {} ms",
                request.agent, request.resource, request.timeout_ms
            ),
        )));

        let err = LockError::Timeout {
            agent: request.agent.clone(),
            resource: request.resource.clone(),
            waited,
        };
        if let Some(notify) = queued.notify.take() {
            let _ = notify.send(Err(err.clone()));
        }
        err
    }

    fn expire_request(&self, request_id: LockId, rx: Option<GrantReceiver>) -> Result<LockGrant, LockError> {
        let mut table = self.inner.table.lock();
        if let Some(queued) = table.remove_queued(request_id) {
            return Err(self.time_out_locked(&table, queued));
        }
        drop(table);

        // The grant or a sweep timeout raced the deadline.
        match rx.map(|mut rx| rx.try_recv()) {
            Some(Ok(result)) => result,
            _ => Err(LockError::Closed),
        }
    }

    fn cancel_request(&self, request_id: LockId, rx: Option<GrantReceiver>) {
        let mut table = self.inner.table.lock();
        if table.remove_queued(request_id).is_some() {
            debug!(request_id = %request_id, "queued request cancelled");
            return;
        }

        let Some(mut rx) = rx else { return };
        if let Ok(Ok(grant)) = rx.try_recv() {
            debug!(lock_id = %grant.lock_id, "grant arrived after cancellation, releasing");
            let _ = self.release_locked(&mut table, grant.lock_id, ReleaseCause::Voluntary);
        }
    }
}

/// Releases a held lock when the exclusive section ends, however it ends.
struct ExecutionGuard<'a> {
    manager: &'a LockManager,
    lock_id: LockId,
}

impl Drop for ExecutionGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.manager.release(self.lock_id) {
            warn!(lock_id = %self.lock_id, error = %err, "lock lost while executing");
        }
    }
}

/// A queued request. Await it (or call [`PendingLock::wait`]) to get the grant.
///
/// Dropping it before it resolves withdraws the request; if the grant had
/// already been handed over, the lock is released again.
#[derive(Debug)]
pub struct PendingLock {
    manager: LockManager,
    request: LockRequest,
    deadline: Instant,
    rx: Option<GrantReceiver>,
    settled: bool,
}

impl PendingLock {
    /// Lock id the request will hold once granted.
    pub fn lock_id(&self) -> LockId {
        self.request.request_id
    }

    pub fn request(&self) -> &LockRequest {
        &self.request
    }

    /// Take the outcome if it has already arrived.
    pub fn try_grant(&mut self) -> Option<Result<LockGrant, LockError>> {
        let rx = self.rx.as_mut()?;
        let outcome = match rx.try_recv() {
            Ok(result) => result,
            Err(oneshot::error::TryRecvError::Empty) => return None,
            Err(oneshot::error::TryRecvError::Closed) => Err(LockError::Closed),
        };
        self.settled = true;
        Some(outcome)
    }

    /// Wait until the request is granted or times out.
    pub async fn wait(mut self) -> Result<LockGrant, LockError> {
        let Some(rx) = self.rx.as_mut() else {
            return Err(LockError::Cancelled);
        };

        match tokio::time::timeout_at(self.deadline, rx).await {
            Ok(received) => {
                self.settled = true;
                received.unwrap_or(Err(LockError::Closed))
            }
            Err(_elapsed) => {
                self.settled = true;
                let rx = self.rx.take();
                self.manager.expire_request(self.request.request_id, rx)
            }
        }
    }
}

impl IntoFuture for PendingLock {
    type Output = Result<LockGrant, LockError>;
    type IntoFuture = Pin<Box<dyn Future<Output = Self::Output> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.wait())
    }
}

impl Drop for PendingLock {
    fn drop(&mut self) {
        if !self.settled {
            let rx = self.rx.take();
            self.manager.cancel_request(self.request.request_id, rx);
        }
    }
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager").finish_non_exhaustive()
    }
}
