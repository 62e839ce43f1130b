// ABOUTME: Transport-agnostic JSON command surface over ConcurrencyService.
// ABOUTME: One Command per operation, one Response shape per result, errors carry a stable code.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::service::ConcurrencyService;
use crate::conflict::{ConcurrencyAnalytics, ConflictPattern};
use crate::deadlock::{DeadlockInfo, Resolution, ResolutionStrategy};
use crate::error::{LockError, ResolveError, ToolmuxError};
use crate::events::{ConflictEvent, LockEvent};
use crate::lock::{AcquireRequest, ActiveLock, LockGrant, LockId, Priority};

const DEFAULT_LIMIT: usize = 50;

fn default_priority() -> u8 {
    Priority::NORMAL.value()
}

/// A request from a transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Command {
    /// Acquire and wait for the grant.
    Acquire {
        agent: String,
        resource: String,
        #[serde(default = "default_priority")]
        priority: u8,
        #[serde(default)]
        timeout_ms: Option<u64>,
        #[serde(default)]
        retry_count: u32,
        #[serde(default)]
        context_id: Option<String>,
        #[serde(default)]
        lease_ms: Option<u64>,
    },
    Release {
        lock_id: LockId,
    },
    Override {
        lock_id: LockId,
        reason: String,
    },
    ActiveLocks,
    LockDetails {
        lock_id: LockId,
    },
    History {
        #[serde(default)]
        limit: Option<usize>,
    },
    Conflicts {
        #[serde(default)]
        limit: Option<usize>,
    },
    Patterns {
        #[serde(default)]
        top_n: Option<usize>,
    },
    Analytics,
    DetectDeadlocks,
    ResolveDeadlock {
        cycle: Vec<String>,
        strategy: ResolutionStrategy,
        #[serde(default)]
        victim: Option<LockId>,
    },
}

/// The answer to a [`Command`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Response {
    Granted {
        lock_id: LockId,
        agent: String,
        resource: String,
        waited_ms: u64,
    },
    Ok,
    ActiveLocks(Vec<ActiveLock>),
    LockDetails(Option<ActiveLock>),
    History(Vec<LockEvent>),
    Conflicts(Vec<ConflictEvent>),
    Patterns(Vec<ConflictPattern>),
    Analytics(ConcurrencyAnalytics),
    Deadlocks(Vec<DeadlockInfo>),
    Resolved(Resolution),
    Error {
        code: String,
        message: String,
    },
}

impl Response {
    pub fn is_error(&self) -> bool {
        matches!(self, Response::Error { .. })
    }

    fn failure(err: impl Into<ToolmuxError>) -> Self {
        let err = err.into();
        Response::Error {
            code: error_code(&err).to_string(),
            message: err.to_string(),
        }
    }

    fn invalid(message: impl Into<String>) -> Self {
        Response::Error {
            code: "invalid_request".to_string(),
            message: message.into(),
        }
    }
}

impl From<LockGrant> for Response {
    fn from(grant: LockGrant) -> Self {
        Response::Granted {
            lock_id: grant.lock_id,
            agent: grant.agent,
            resource: grant.resource,
            waited_ms: grant.waited.as_millis() as u64,
        }
    }
}

fn error_code(err: &ToolmuxError) -> &'static str {
    match err {
        ToolmuxError::Lock(err) | ToolmuxError::Resolve(ResolveError::Lock(err)) => match err {
            LockError::InvalidPriority(_) | LockError::OutOfRange { .. } => "invalid_request",
            LockError::NotFound(_) => "not_found",
            LockError::Timeout { .. } => "timeout",
            LockError::Cancelled => "cancelled",
            LockError::QueueFull { .. } => "queue_full",
            LockError::Closed => "closed",
        },
        ToolmuxError::Resolve(_) => "invalid_request",
        ToolmuxError::Config(_) => "config",
    }
}

impl ConcurrencyService {
    /// Execute one command.
    pub async fn handle(&self, command: Command) -> Response {
        match command {
            Command::Acquire {
                agent,
                resource,
                priority,
                timeout_ms,
                retry_count,
                context_id,
                lease_ms,
            } => {
                let mut request = AcquireRequest::new(agent, resource)
                    .priority(priority)
                    .retry_count(retry_count);
                if let Some(ms) = timeout_ms {
                    request = request.timeout(Duration::from_millis(ms));
                }
                if let Some(ms) = lease_ms {
                    request = request.lease(Duration::from_millis(ms));
                }
                if let Some(context_id) = context_id {
                    request = request.context(context_id);
                }
                match self.acquire(request).await {
                    Ok(grant) => grant.into(),
                    Err(err) => Response::failure(err),
                }
            }
            Command::Release { lock_id } => match self.release(lock_id) {
                Ok(()) => Response::Ok,
                Err(err) => Response::failure(err),
            },
            Command::Override { lock_id, reason } => match self.override_lock(lock_id, &reason) {
                Ok(()) => Response::Ok,
                Err(err) => Response::failure(err),
            },
            Command::ActiveLocks => Response::ActiveLocks(self.active_locks()),
            Command::LockDetails { lock_id } => Response::LockDetails(self.lock_details(lock_id)),
            Command::History { limit } => {
                Response::History(self.history(limit.unwrap_or(DEFAULT_LIMIT)).await)
            }
            Command::Conflicts { limit } => {
                Response::Conflicts(self.conflicts(limit.unwrap_or(DEFAULT_LIMIT)).await)
            }
            Command::Patterns { top_n } => {
                let top_n = top_n.unwrap_or(self.config().top_n);
                Response::Patterns(self.conflict_patterns(top_n).await)
            }
            Command::Analytics => Response::Analytics(self.analytics().await),
            Command::DetectDeadlocks => Response::Deadlocks(self.detect_deadlocks()),
            Command::ResolveDeadlock {
                cycle,
                strategy,
                victim,
            } => match self.resolve_deadlock(&cycle, strategy, victim) {
                Ok(resolution) => Response::Resolved(resolution),
                Err(err) => Response::failure(err),
            },
        }
    }

    /// Parse a JSON command, execute it, and return the JSON response.
    pub async fn handle_json(&self, text: &str) -> String {
        let response = match serde_json::from_str::<Command>(text) {
            Ok(command) => self.handle(command).await,
            Err(err) => {
                debug!(error = %err, "rejected malformed command");
                Response::invalid(format!("malformed command: {err}"))
            }
        };
        serde_json::to_string(&response).unwrap_or_else(|err| internal_error(&err.to_string()))
    }
}

/// Error response for a result that could not be serialized.
pub(super) fn internal_error(message: &str) -> String {
    serde_json::json!({
        "type": "error",
        "data": { "code": "internal", "message": message },
    })
    .to_string()
}
