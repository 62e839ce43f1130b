// ABOUTME: Defines all error types for the toolmux library using thiserror.
// ABOUTME: Each subsystem has its own error enum, unified under ToolmuxError.

use std::time::Duration;

use crate::lock::LockId;

/// Top-level error type for the toolmux library.
#[derive(Debug, thiserror::Error)]
pub enum ToolmuxError {
    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Resolve error: {0}")]
    Resolve(#[from] ResolveError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Errors from lock table operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LockError {
    #[error("priority {0} is outside 1..=10")]
    InvalidPriority(u8),

    #[error("lock '{0}' not found")]
    NotFound(LockId),

    #[error("agent '{agent}' timed out after {waited:?} waiting for '{resource}'")]
    Timeout {
        agent: String,
        resource: String,
        waited: Duration,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("waiting queue for '{resource}' is full ({depth} waiters)")]
    QueueFull { resource: String, depth: usize },

    #[error("lock manager is shut down")]
    Closed,

    #[error("{what} of {duration:?} is out of range")]
    OutOfRange {
        what: &'static str,
        duration: Duration,
    },
}

/// Errors from deadlock resolution.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("cycle must name at least two agents")]
    EmptyCycle,

    #[error("manual resolution requires a victim lock id")]
    MissingVictim,

    #[error("lock '{victim}' is not part of the cycle")]
    VictimNotInCycle { victim: LockId },

    #[error(transparent)]
    Lock(#[from] LockError),
}

/// Errors from loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
