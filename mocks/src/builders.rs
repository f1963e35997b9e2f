//! Builder pattern implementations for easy test data construction
//!
//! Provides fluent builders for:
//! - Task construction with sensible defaults
//! - Workflow and gate construction

use aof_core::{
    Gate, GateState, Lease, Priority, RejectionStrategy, Routing, Sla, Task, TaskStatus, Workflow,
    SCHEMA_VERSION,
};
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;

/// Builder for constructing Task instances in tests
pub struct TaskBuilder {
    task: Task,
}

impl Default for TaskBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskBuilder {
    /// Create new builder with default values
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            task: Task {
                id: "TASK-2025-06-01-001".to_string(),
                schema_version: SCHEMA_VERSION,
                project: "demo".to_string(),
                title: "Test Task".to_string(),
                body: "A test task.\n".to_string(),
                status: TaskStatus::Backlog,
                priority: Priority::Normal,
                routing: Routing::default(),
                sla: None,
                lease: None,
                depends_on: vec![],
                parent_id: None,
                gate: None,
                gate_history: vec![],
                review_context: None,
                tests: vec![],
                resource: None,
                required_runbook: None,
                metadata: BTreeMap::new(),
                created_at: now,
                updated_at: now,
                last_transition_at: now,
                created_by: "test".to_string(),
                content_hash: None,
            },
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.task.id = id.into();
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.task.title = title.into();
        self
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.task.status = status;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.task.priority = priority;
        self
    }

    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.task.routing.agent = Some(agent.into());
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.task.routing.role = Some(role.into());
        self
    }

    pub fn with_tags(mut self, tags: &[&str]) -> Self {
        self.task.routing.tags = tags.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn with_workflow(mut self, workflow: impl Into<String>) -> Self {
        self.task.routing.workflow = Some(workflow.into());
        self
    }

    pub fn with_deps(mut self, deps: &[&str]) -> Self {
        self.task.depends_on = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.task.resource = Some(resource.into());
        self
    }

    pub fn with_sla(mut self, sla: Sla) -> Self {
        self.task.sla = Some(sla);
        self
    }

    /// Attach an active lease expiring `ttl` from now
    pub fn with_lease(mut self, agent: impl Into<String>, ttl: Duration) -> Self {
        let now = Utc::now();
        self.task.lease = Some(Lease {
            agent: agent.into(),
            acquired_at: now,
            expires_at: now + ttl,
            renew_count: 0,
        });
        self
    }

    /// Put the task at a gate, entered at the given instant
    pub fn at_gate(mut self, gate: impl Into<String>, entered: DateTime<Utc>) -> Self {
        self.task.gate = Some(GateState {
            current: gate.into(),
            entered,
        });
        self
    }

    pub fn with_metadata(mut self, key: &str, value: serde_json::Value) -> Self {
        self.task.metadata.insert(key.to_string(), value);
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.task.created_at = created_at;
        self.task.last_transition_at = created_at;
        self
    }

    pub fn build(self) -> Task {
        self.task
    }
}

/// Builder for constructing Workflow instances in tests
pub struct WorkflowBuilder {
    workflow: Workflow,
}

impl WorkflowBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            workflow: Workflow {
                name: name.into(),
                rejection_strategy: RejectionStrategy::Origin,
                gates: vec![],
                outcomes: None,
            },
        }
    }

    /// Append a plain gate
    pub fn gate(mut self, id: &str, role: &str) -> Self {
        self.workflow.gates.push(Gate {
            id: id.to_string(),
            role: role.to_string(),
            can_reject: false,
            when: None,
            description: None,
            require_human: false,
            timeout: None,
            escalate_to: None,
        });
        self
    }

    /// Append a gate and customize it
    pub fn gate_with(mut self, id: &str, role: &str, customize: impl FnOnce(&mut Gate)) -> Self {
        let mut gate = Gate {
            id: id.to_string(),
            role: role.to_string(),
            can_reject: false,
            when: None,
            description: None,
            require_human: false,
            timeout: None,
            escalate_to: None,
        };
        customize(&mut gate);
        self.workflow.gates.push(gate);
        self
    }

    pub fn build(self) -> Workflow {
        self.workflow
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_builder_defaults() {
        let task = TaskBuilder::new().build();
        assert_eq!(task.status, TaskStatus::Backlog);
        assert_eq!(task.priority, Priority::Normal);
        assert!(task.lease.is_none());
    }

    #[test]
    fn test_workflow_builder() {
        let wf = WorkflowBuilder::new("feature")
            .gate("design", "architect")
            .gate_with("review", "qa", |g| {
                g.can_reject = true;
                g.timeout = Some("1h".to_string());
                g.escalate_to = Some("pm".to_string());
            })
            .build();
        assert_eq!(wf.gates.len(), 2);
        assert!(wf.gate("review").unwrap().can_reject);
        assert!(wf.validate().is_ok());
    }
}
