//! The AOF scheduling and dispatch core.
//!
//! One [`Scheduler::poll`] cycle scans the store once, plans a set of
//! actions (promote, assign, expire, requeue, deadletter, escalate), and
//! executes them under a concurrency cap with adaptive backoff. The other
//! modules are the poll's collaborators:
//!
//! - [`lease`] - exclusive TTL-bounded task ownership
//! - [`retry`] - spawn failure classification and the blocked-retry guard
//! - [`cascade`] - dependency promotion/blocking and cycle detection
//! - [`gates`] - workflow gate progression, timeouts, escalation
//! - [`expr`] - the safe conditional-gate expression evaluator

pub mod cascade;
pub mod expr;
pub mod gates;
pub mod lease;
pub mod retry;
pub mod scheduler;

pub use cascade::{CascadeOutcome, DependencyCascader};
pub use expr::{evaluate_gate_condition, ConditionContext};
pub use gates::{GateAdvance, GateEngine, GateTimeout};
pub use lease::LeaseManager;
pub use retry::{classify_spawn_error, BackoffPolicy, Jitter, RetryDecision, SpawnErrorClass};
pub use scheduler::{
    ActionKind, ActionOutcome, ActionResult, PlannedAction, PollResult, PollStats, Scheduler,
    SchedulerConfig,
};
