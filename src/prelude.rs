// ABOUTME: Prelude module - convenient imports for common use cases.
// ABOUTME: Use `use toolmux::prelude::*;` to get started quickly.

pub use crate::config::{ManagerConfig, MonitorConfig, SeverityPolicy};
pub use crate::conflict::{AgentActivity, ConcurrencyAnalytics, ConflictHotspot, ConflictPattern};
pub use crate::deadlock::{DeadlockInfo, Resolution, ResolutionStrategy, Severity};
pub use crate::error::{ConfigError, LockError, ResolveError, ToolmuxError};
pub use crate::events::{
    ConflictEvent, ConflictType, EventSink, ForwarderHandle, LiveMessage, LockEvent,
    LockEventDetails, LockEventKind, OverrideCause, ReleaseNotice, Subscription,
};
pub use crate::lock::{
    AcquireRequest, Acquisition, ActiveLock, ExecutionStage, LockGrant, LockId, LockManager,
    LockRequest, PendingLock, Priority,
};
pub use crate::service::{Command, ConcurrencyService, MonitorReport, Response};
