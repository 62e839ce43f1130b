// ABOUTME: Deadlock module - wait-for graph analysis, detection, and resolution.
// ABOUTME: Detection reads a table snapshot; resolution force-releases a victim lock.

mod detector;
pub(crate) mod graph;
mod resolver;

pub use detector::{DeadlockDetector, DeadlockInfo, Severity};
pub use resolver::{DeadlockResolver, Resolution, ResolutionStrategy};

#[cfg(test)]
mod detector_test;
#[cfg(test)]
mod resolver_test;
