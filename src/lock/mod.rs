// ABOUTME: Lock module - the lock table and the manager that owns every mutation to it.
// ABOUTME: Provides acquire/release/override with priority-ordered waiting queues.

mod manager;
pub(crate) mod table;
mod types;

pub use manager::{Acquisition, LockManager, PendingLock, SweepReport};
pub use types::*;
pub(crate) use types::expiry_after;
