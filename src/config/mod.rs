// ABOUTME: Config module - tunables for the lock manager, monitor, and severity policy.
// ABOUTME: Loadable from TOML or built programmatically with chained setters.

mod config;

pub use config::*;
