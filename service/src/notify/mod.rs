//! Event → user-visible message pipeline.
//!
//! `event → findFirstMatchingRule → resolveSeverity → dedupeCheck →
//! stormBatch → renderTemplate → adapter.send`. Send failures are counted
//! and logged, never thrown; the engine keeps running with a broken sink.

mod dedupe;
mod policy;
mod rules;
mod storm;
mod template;

pub use dedupe::DedupeCache;
pub use policy::{NotificationPolicy, TracingAdapter};
pub use rules::{NotificationRule, RuleMatch, RuleSet, Severity};
pub use storm::{OutboundMessage, StormBatcher};
pub use template::render_template;
