// ABOUTME: Service module - the ConcurrencyService facade, its monitor, and the JSON surface.
// ABOUTME: This is what applications construct; everything else hangs off it.

mod api;
mod monitor;
mod service;

pub use api::{Command, Response};
pub use monitor::{MonitorHandle, MonitorReport};
pub use service::ConcurrencyService;

#[cfg(test)]
mod api_test;
