//! Service layer of the AOF orchestration engine: configuration loading,
//! telemetry, the notification policy pipeline, and the orchestration
//! service that drives the scheduler on a periodic tick plus
//! message-arrival events.

pub mod config;
pub mod notify;
pub mod service;
pub mod telemetry;

pub use config::{LogFormat, LoggingConfig, OrchestratorConfig, StormConfig};
pub use notify::{
    NotificationPolicy, NotificationRule, RuleMatch, RuleSet, Severity, TracingAdapter,
};
pub use service::{OrchestrationService, ServiceMetricsSnapshot};
