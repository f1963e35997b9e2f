use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::task::{Priority, Routing};

/// Everything an executor needs to reach the agent for one dispatch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskContext {
    /// Task identifier
    pub task_id: String,
    /// Canonical task file path
    pub task_path: PathBuf,
    /// Resolved agent id
    pub agent: String,
    /// Dispatch priority
    pub priority: Priority,
    /// Routing snapshot at dispatch time
    pub routing: Routing,
    /// Project scope identifier
    pub project_id: String,
    /// Project root directory
    pub project_root: PathBuf,
    /// Task path relative to the project root
    pub task_relpath: String,
    /// Optional reasoning-budget hint forwarded verbatim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    /// Workflow gate context, present when the task is workflow-bound
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate_context: Option<crate::workflow::GateContext>,
}

/// Result of one spawn attempt. The scheduler classifies failures from the
/// error text and the optional platform limit hint; it never inspects how
/// the spawn reached the agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ExecutorResult {
    /// The agent accepted the work
    pub success: bool,
    /// Opaque session handle, when the transport has one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Failure description, absent on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Numeric concurrency cap parsed from the platform's refusal, when the
    /// transport surfaced one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform_limit: Option<u32>,
}

impl ExecutorResult {
    /// A successful spawn with no session handle
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    /// A successful spawn carrying a session handle
    pub fn ok_with_session(session_id: impl Into<String>) -> Self {
        Self {
            success: true,
            session_id: Some(session_id.into()),
            ..Self::default()
        }
    }

    /// A failed spawn with an error description
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

/// Outbound dispatch seam. The scheduler depends only on this trait;
/// transports (process spawn, HTTP, queues) live behind it. Dispatch is
/// fire-and-forget: agents report back via protocol messages or their
/// leases expire.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Attempt to hand the task to its agent. Implementations should apply
    /// their own spawn timeout and report failures through
    /// [`ExecutorResult`], not through panics.
    async fn spawn(&self, ctx: TaskContext) -> ExecutorResult;
}

/// Notification sink seam. Sends must be idempotent from the caller's
/// perspective; errors are counted and logged by the policy, never retried
/// and never propagated.
#[async_trait]
pub trait NotificationAdapter: Send + Sync {
    async fn send(&self, channel: &str, message: &str) -> std::io::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_executor_result_constructors() {
        let ok = ExecutorResult::ok();
        assert!(ok.success && ok.error.is_none());

        let with_session = ExecutorResult::ok_with_session("sess-1");
        assert_eq!(with_session.session_id.as_deref(), Some("sess-1"));

        let failed = ExecutorResult::failed("rate limit exceeded");
        assert!(!failed.success);
        assert_eq!(failed.error.as_deref(), Some("rate limit exceeded"));
        assert!(failed.platform_limit.is_none());
    }

    #[test]
    fn test_task_context_serialization() {
        let ctx = TaskContext {
            task_id: "TASK-2025-06-01-001".to_string(),
            task_path: PathBuf::from("/data/tasks/ready/TASK-2025-06-01-001.md"),
            agent: "swe-backend".to_string(),
            priority: Priority::High,
            routing: Routing::default(),
            project_id: "demo".to_string(),
            project_root: PathBuf::from("/data"),
            task_relpath: "tasks/ready/TASK-2025-06-01-001.md".to_string(),
            thinking: None,
            gate_context: None,
        };
        let json = serde_json::to_value(&ctx).unwrap();
        assert_eq!(json["taskId"], "TASK-2025-06-01-001");
        assert_eq!(json["priority"], "high");
    }
}
