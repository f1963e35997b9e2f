use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One record in the append-only event journal.
///
/// `event_id` is assigned by the logger at write time and strictly increases
/// within a process run. Events are never mutated after append.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Monotonic id, unique within a logger lifetime
    pub event_id: u64,
    /// Event type name, one of the [`events`] constants
    #[serde(rename = "type")]
    pub event_type: String,
    /// When the event was written
    pub timestamp: DateTime<Utc>,
    /// Who caused it (agent id, "scheduler", "system", ...)
    pub actor: String,
    /// Related task, when applicable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    /// Structured event details
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub payload: serde_json::Value,
}

/// Event type names emitted by the engine. Notification rules select on
/// these, so they are part of the public surface.
pub mod events {
    // Task lifecycle
    pub const TASK_CREATED: &str = "task.created";
    pub const TASK_UPDATED: &str = "task.updated";
    pub const TASK_DELETED: &str = "task.deleted";
    pub const TASK_TRANSITIONED: &str = "task.transitioned";
    pub const TASK_ASSIGNED: &str = "task.assigned";
    pub const TASK_STUCK: &str = "task.stuck";

    // Leases
    pub const LEASE_ACQUIRED: &str = "lease.acquired";
    pub const LEASE_RENEWED: &str = "lease.renewed";
    pub const LEASE_RELEASED: &str = "lease.released";
    pub const LEASE_EXPIRED: &str = "lease.expired";

    // Scheduler
    pub const SCHEDULER_POLL: &str = "scheduler.poll";
    pub const ACTION_STARTED: &str = "action.started";
    pub const ACTION_COMPLETED: &str = "action.completed";
    pub const SCHEDULER_ACTION_FAILED: &str = "scheduler_action_failed";
    pub const DISPATCH_MATCHED: &str = "dispatch.matched";
    pub const CONCURRENCY_PLATFORM_LIMIT: &str = "concurrency.platformLimit";
    pub const SLA_VIOLATION: &str = "sla.violation";

    // Dependencies
    pub const DEPENDENCY_CASCADED: &str = "dependency.cascaded";

    // Gates
    pub const GATE_ADVANCED: &str = "gate.advanced";
    pub const GATE_REJECTED: &str = "gate.rejected";
    pub const GATE_TIMEOUT: &str = "gate_timeout";
    pub const GATE_TIMEOUT_ESCALATION: &str = "gate_timeout_escalation";

    // Protocol
    pub const PROTOCOL_MESSAGE_RECEIVED: &str = "protocol.message.received";
    pub const PROTOCOL_MESSAGE_REJECTED: &str = "protocol.message.rejected";
    pub const PROTOCOL_MESSAGE_UNKNOWN: &str = "protocol.message.unknown";
    pub const DELEGATION_REQUESTED: &str = "delegation.requested";
    pub const DELEGATION_ACCEPTED: &str = "delegation.accepted";
    pub const DELEGATION_REJECTED: &str = "delegation.rejected";

    // Service lifecycle
    pub const SYSTEM_STARTUP: &str = "system.startup";
    pub const SYSTEM_SHUTDOWN: &str = "system.shutdown";
    pub const POLL_FAILED: &str = "scheduler.poll.failed";
}

impl Event {
    /// Resolve a dotted path (`payload.reason`, `taskId`, `type`, ...)
    /// against this event. Top-level names address the envelope fields;
    /// anything under `payload.` descends into the payload value.
    pub fn field(&self, path: &str) -> Option<serde_json::Value> {
        let mut parts = path.split('.');
        let head = parts.next()?;
        match head {
            "eventId" => Some(serde_json::json!(self.event_id)),
            "type" => Some(serde_json::Value::String(self.event_type.clone())),
            "timestamp" => Some(serde_json::Value::String(self.timestamp.to_rfc3339())),
            "actor" => Some(serde_json::Value::String(self.actor.clone())),
            "taskId" => self
                .task_id
                .as_ref()
                .map(|id| serde_json::Value::String(id.clone())),
            "payload" => {
                let mut current = &self.payload;
                for part in parts {
                    current = current.get(part)?;
                }
                Some(current.clone())
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event() -> Event {
        Event {
            event_id: 42,
            event_type: events::TASK_TRANSITIONED.to_string(),
            timestamp: Utc::now(),
            actor: "scheduler".to_string(),
            task_id: Some("TASK-2025-06-01-001".to_string()),
            payload: serde_json::json!({"from": "ready", "to": "in-progress", "detail": {"reason": "dispatch"}}),
        }
    }

    #[test]
    fn test_serialized_field_names() {
        let json = serde_json::to_value(event()).unwrap();
        assert!(json.get("eventId").is_some());
        assert!(json.get("type").is_some());
        assert!(json.get("taskId").is_some());
        assert!(json.get("event_id").is_none());
    }

    #[test]
    fn test_field_resolution() {
        let e = event();
        assert_eq!(e.field("type").unwrap(), serde_json::json!("task.transitioned"));
        assert_eq!(e.field("taskId").unwrap(), serde_json::json!("TASK-2025-06-01-001"));
        assert_eq!(e.field("payload.from").unwrap(), serde_json::json!("ready"));
        assert_eq!(
            e.field("payload.detail.reason").unwrap(),
            serde_json::json!("dispatch")
        );
        assert!(e.field("payload.missing").is_none());
        assert!(e.field("nope").is_none());
    }
}
