// ABOUTME: Root module for toolmux - exclusive tool locking for multi-agent systems.
// ABOUTME: Re-exports the service facade and the public types of each subsystem.

pub mod config;
pub mod conflict;
pub mod deadlock;
pub mod error;
pub mod events;
pub mod lock;
pub mod prelude;
pub mod service;

pub use error::ToolmuxError;
pub use service::ConcurrencyService;
