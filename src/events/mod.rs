// ABOUTME: Events module - lock/conflict records, the event log, and the live feed.
// ABOUTME: Contains the pipeline that carries mutations to every observer.

mod broadcaster;
mod log;
pub(crate) mod pipeline;
mod sink;
mod types;

pub use broadcaster::{Broadcaster, Subscription};
pub use log::EventLog;
pub use sink::{EventSink, ForwarderHandle};
pub(crate) use sink::spawn_forwarder;
pub use types::*;

#[cfg(test)]
mod broadcaster_test;
#[cfg(test)]
mod log_test;
