// ABOUTME: Conflict module - conflict history, pair patterns, and analytics.
// ABOUTME: Fed by the event pipeline, read by the query surface.

mod analytics;
mod tracker;

pub use analytics::{AgentActivity, AnalyticsAggregator, ConcurrencyAnalytics, ConflictHotspot};
pub use tracker::{ConflictPattern, ConflictTracker};
