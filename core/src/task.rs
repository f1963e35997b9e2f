use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::OnceLock;

/// Task lifecycle states defining the progression of work.
///
/// Tasks move through a defined status machine with validated transitions.
/// The typical flow is: backlog → ready → in-progress → review → done, with
/// blocked as a recoverable detour and deadletter as the terminal parking
/// state for irrecoverable dispatch failures (resurrectable back to ready).
///
/// # Status Transitions
///
/// - `backlog` → `ready`, `blocked`, `cancelled`
/// - `ready` → `in-progress`, `blocked`, `deadletter`, `cancelled`
/// - `in-progress` → `review`, `ready`, `blocked`, `deadletter`, `cancelled`
/// - `blocked` → `ready`, `deadletter`, `cancelled`
/// - `review` → `done`, `in-progress`, `blocked`, `cancelled`
/// - `done` → (none)
/// - `cancelled` → (none)
/// - `deadletter` → `ready` (resurrection)
#[derive(Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    /// Newly created, not yet eligible for dispatch
    Backlog,
    /// Eligible for dispatch
    Ready,
    /// Leased to an agent and being worked
    InProgress,
    /// Held back; reason recorded in metadata
    Blocked,
    /// Work submitted, awaiting acceptance
    Review,
    /// Completed
    Done,
    /// Withdrawn
    Cancelled,
    /// Failed dispatch irrecoverably
    Deadletter,
}

impl TaskStatus {
    /// All statuses, in directory-creation order
    pub fn all() -> [TaskStatus; 8] {
        use TaskStatus::*;
        [
            Backlog, Ready, InProgress, Blocked, Review, Done, Cancelled, Deadletter,
        ]
    }

    /// The `tasks/<status>/` directory name for this status
    pub fn dir_name(&self) -> &'static str {
        match self {
            TaskStatus::Backlog => "backlog",
            TaskStatus::Ready => "ready",
            TaskStatus::InProgress => "in-progress",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Review => "review",
            TaskStatus::Done => "done",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Deadletter => "deadletter",
        }
    }

    /// Parse a status from its directory name
    pub fn from_dir_name(name: &str) -> Option<TaskStatus> {
        TaskStatus::all().into_iter().find(|s| s.dir_name() == name)
    }

    /// Check whether the `(self → new_status)` edge is in the transition table
    pub fn can_transition_to(&self, new_status: TaskStatus) -> bool {
        use TaskStatus::*;

        match (*self, new_status) {
            // Same-status transitions are handled as no-ops by the store,
            // not as edges of the machine
            (current, new) if current == new => false,

            (Backlog, Ready | Blocked | Cancelled) => true,
            (Ready, InProgress | Blocked | Deadletter | Cancelled) => true,
            (InProgress, Review | Ready | Blocked | Deadletter | Cancelled) => true,
            (Blocked, Ready | Deadletter | Cancelled) => true,
            (Review, Done | InProgress | Blocked | Cancelled) => true,
            (Deadletter, Ready) => true,

            // done and cancelled have no outgoing edges
            _ => false,
        }
    }

    /// Statuses with no outgoing transitions at all
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Cancelled)
    }

    /// A lease must be present in this status
    pub fn requires_lease(&self) -> bool {
        matches!(self, TaskStatus::InProgress)
    }

    /// A lease may be carried in this status (in-progress, or blocked while held)
    pub fn may_hold_lease(&self) -> bool {
        matches!(self, TaskStatus::InProgress | TaskStatus::Blocked)
    }

    /// Entering this status clears agent ownership. Everything except the
    /// two lease-holding statuses clears; a task submitted for review is no
    /// longer owned by the submitting agent.
    pub fn clears_lease(&self) -> bool {
        !self.may_hold_lease()
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.dir_name())
    }
}

/// Dispatch priority. Variant order is urgency order, so an ascending sort
/// puts critical tasks first.
#[derive(
    Debug, Clone, Copy, Hash, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        };
        write!(f, "{name}")
    }
}

/// Exclusive, TTL-bounded grant of a task to one agent.
///
/// Stored inline in the task file; created together with the transition to
/// `in-progress` in a single write, removed on expiry reclamation or on any
/// transition that clears ownership.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
    /// Holding agent identifier
    pub agent: String,
    /// Grant timestamp
    pub acquired_at: DateTime<Utc>,
    /// Expiry; a lease with `expires_at == now` is already expired
    pub expires_at: DateTime<Utc>,
    /// Number of renewals since acquisition
    #[serde(default)]
    pub renew_count: u32,
}

impl Lease {
    /// A lease is active strictly before its expiry instant
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    /// Wall-clock time has reached or passed `expires_at`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        !self.is_active(now)
    }
}

/// Routing target description consulted by the scheduler's resolver.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Routing {
    /// Explicit agent assignment; takes precedence over role and team
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    /// Role resolved through the org chart
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Team whose lead receives the work
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team: Option<String>,
    /// Capability tags for fallback matching
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Workflow name binding the task to a gate pipeline
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow: Option<String>,
}

impl Routing {
    /// True when no routing information is present at all
    pub fn is_empty(&self) -> bool {
        self.agent.is_none()
            && self.role.is_none()
            && self.team.is_none()
            && self.tags.is_empty()
    }
}

/// What the scheduler does when a task exceeds its in-progress SLA.
/// Phase 1 supports `alert` only; `block` and `deadletter` are reserved and
/// rejected by validation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SlaViolationPolicy {
    Alert,
    Block,
    Deadletter,
}

/// Per-task service level agreement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Sla {
    /// Maximum wall-clock time a task may stay in-progress
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_in_progress_ms: Option<u64>,
    /// Action on violation (Phase 1: alert only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_violation: Option<SlaViolationPolicy>,
}

/// Position of a workflow-bound task in its gate pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GateState {
    /// Current gate id
    pub current: String,
    /// When the task entered this gate
    pub entered: DateTime<Utc>,
}

/// Outcome a gate concluded with.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GateOutcome {
    Complete,
    NeedsReview,
    Blocked,
}

/// One entry in the ordered audit trail of past gate visits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GateHistoryEntry {
    /// Gate id
    pub gate: String,
    /// Role that worked the gate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// How the visit concluded
    pub outcome: GateOutcome,
    /// When the visit concluded
    pub at: DateTime<Utc>,
    /// Free-form summary (completion notes, rejection feedback, timeout)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

/// Feedback carried when a later gate sends work back to an earlier one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReviewContext {
    /// Gate that rejected the work
    pub from_gate: String,
    /// Reviewer feedback
    pub feedback: String,
    /// When the rejection happened
    pub at: DateTime<Utc>,
}

/// Metadata keys the engine reads and writes. Kept as plain map entries so
/// operators and external producers can extend the map freely.
pub mod metadata_keys {
    pub const BLOCK_REASON: &str = "blockReason";
    pub const RETRY_COUNT: &str = "retryCount";
    pub const LAST_BLOCKED_AT: &str = "lastBlockedAt";
    pub const ERROR_CLASS: &str = "errorClass";
}

/// The fundamental work unit, persisted as one frontmatter+markdown file
/// under `tasks/<status>/<id>.md`. The file on disk is the source of truth;
/// everything else is derived.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Stable identifier, `TASK-YYYY-MM-DD-NNN` with optional `-NN` subtask
    /// suffix. Immutable.
    pub id: String,
    /// Frontmatter schema version for migration
    pub schema_version: u32,
    /// Project scope identifier. Required.
    pub project: String,
    /// Human description
    pub title: String,
    /// Markdown body; stored after the frontmatter block, not inside it
    #[serde(skip)]
    pub body: String,
    /// Current lifecycle status; must match the directory the file lives in
    pub status: TaskStatus,
    /// Dispatch priority
    #[serde(default)]
    pub priority: Priority,
    /// Routing target description
    #[serde(default)]
    pub routing: Routing,
    /// Optional service level agreement
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sla: Option<Sla>,
    /// Exclusive agent ownership; present iff the status holds it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease: Option<Lease>,
    /// Task ids that must be done before promotion
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// Parent id for subtask hierarchies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Current gate position for workflow-bound tasks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate: Option<GateState>,
    /// Ordered audit trail of past gate visits
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gate_history: Vec<GateHistoryEntry>,
    /// Feedback from a rejecting gate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_context: Option<ReviewContext>,
    /// BDD-style test specifications
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tests: Vec<String>,
    /// Serialization key; at most one in-progress task per unique value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    /// Runbook reference; `required_runbook` accepted as a read alias
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        alias = "required_runbook"
    )]
    pub required_runbook: Option<String>,
    /// Open key-value map (blockReason, retryCount, lastBlockedAt, ...)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last write timestamp
    pub updated_at: DateTime<Utc>,
    /// Last status change timestamp
    pub last_transition_at: DateTime<Utc>,
    /// Actor that created the task
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub created_by: String,
    /// Body digest for idempotency
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
}

impl Task {
    /// Check if the task can transition to the given status
    pub fn can_transition_to(&self, new_status: TaskStatus) -> bool {
        self.status.can_transition_to(new_status)
    }

    /// The task carries a lease that has not yet expired
    pub fn has_active_lease(&self, now: DateTime<Utc>) -> bool {
        self.lease.as_ref().is_some_and(|l| l.is_active(now))
    }

    /// The task carries a lease whose TTL has run out
    pub fn has_expired_lease(&self, now: DateTime<Utc>) -> bool {
        self.lease.as_ref().is_some_and(|l| l.is_expired(now))
    }

    /// Recorded block reason, if any
    pub fn block_reason(&self) -> Option<&str> {
        self.metadata
            .get(metadata_keys::BLOCK_REASON)
            .and_then(|v| v.as_str())
    }

    /// Record or clear the block reason
    pub fn set_block_reason(&mut self, reason: Option<&str>) {
        match reason {
            Some(r) => {
                self.metadata.insert(
                    metadata_keys::BLOCK_REASON.to_string(),
                    serde_json::Value::String(r.to_string()),
                );
            }
            None => {
                self.metadata.remove(metadata_keys::BLOCK_REASON);
            }
        }
    }

    /// Spawn retry counter, zero when absent
    pub fn retry_count(&self) -> u32 {
        self.metadata
            .get(metadata_keys::RETRY_COUNT)
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as u32
    }

    /// Set the spawn retry counter
    pub fn set_retry_count(&mut self, count: u32) {
        self.metadata.insert(
            metadata_keys::RETRY_COUNT.to_string(),
            serde_json::Value::from(count),
        );
    }

    /// When the task last entered blocked, if recorded
    pub fn last_blocked_at(&self) -> Option<DateTime<Utc>> {
        self.metadata
            .get(metadata_keys::LAST_BLOCKED_AT)
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<DateTime<Utc>>().ok())
    }

    /// Record when the task entered blocked
    pub fn set_last_blocked_at(&mut self, at: DateTime<Utc>) {
        self.metadata.insert(
            metadata_keys::LAST_BLOCKED_AT.to_string(),
            serde_json::Value::String(at.to_rfc3339()),
        );
    }

    /// Spawn error classification, if recorded
    pub fn error_class(&self) -> Option<&str> {
        self.metadata
            .get(metadata_keys::ERROR_CLASS)
            .and_then(|v| v.as_str())
    }

    /// Record the spawn error classification
    pub fn set_error_class(&mut self, class: &str) {
        self.metadata.insert(
            metadata_keys::ERROR_CLASS.to_string(),
            serde_json::Value::String(class.to_string()),
        );
    }

    /// Apply a partial update. Identity, status, and lease are never patched
    /// this way; those go through transitions and the lease manager.
    pub fn apply_patch(&mut self, patch: TaskPatch) {
        if let Some(title) = patch.title {
            self.title = title;
        }
        if let Some(priority) = patch.priority {
            self.priority = priority;
        }
        if let Some(routing) = patch.routing {
            self.routing = routing;
        }
        if let Some(sla) = patch.sla {
            self.sla = sla;
        }
        if let Some(resource) = patch.resource {
            self.resource = resource;
        }
        if let Some(tests) = patch.tests {
            self.tests = tests;
        }
        if let Some(review_context) = patch.review_context {
            self.review_context = review_context;
        }
        for (key, value) in patch.metadata {
            if value.is_null() {
                self.metadata.remove(&key);
            } else {
                self.metadata.insert(key, value);
            }
        }
    }
}

/// Data transfer object for creating new tasks
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct NewTask {
    /// Explicit id; generated from today's date and a sequence when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Project scope identifier. Required.
    pub project: String,
    /// Human description
    pub title: String,
    /// Markdown body
    #[serde(default)]
    pub body: String,
    /// Dispatch priority
    #[serde(default)]
    pub priority: Priority,
    /// Routing target description
    #[serde(default)]
    pub routing: Routing,
    /// Optional service level agreement
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sla: Option<Sla>,
    /// Task ids that must be done before promotion
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// Parent id for subtask hierarchies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// BDD-style test specifications
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tests: Vec<String>,
    /// Serialization key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    /// Initial metadata entries
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// Actor creating the task
    #[serde(default)]
    pub created_by: String,
}

/// Data transfer object for partial task updates. `Option<Option<T>>` fields
/// distinguish "leave unchanged" from "clear".
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskPatch {
    pub title: Option<String>,
    pub priority: Option<Priority>,
    pub routing: Option<Routing>,
    pub sla: Option<Option<Sla>>,
    pub resource: Option<Option<String>>,
    pub tests: Option<Vec<String>>,
    pub review_context: Option<Option<ReviewContext>>,
    /// Metadata entries to merge; a null value removes the key
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

fn task_id_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^TASK-\d{4}-\d{2}-\d{2}-\d{3}(-\d{2})?$").expect("task id regex")
    })
}

/// Check an id against the `TASK-YYYY-MM-DD-NNN[-NN]` scheme
pub fn is_valid_task_id(id: &str) -> bool {
    task_id_regex().is_match(id)
}

/// Build a task id from a date and a per-day sequence number
pub fn new_task_id(date: NaiveDate, seq: u32) -> String {
    format!("TASK-{}-{seq:03}", date.format("%Y-%m-%d"))
}

/// Build a subtask id from its parent id and a per-parent sequence number
pub fn subtask_id(parent: &str, seq: u32) -> String {
    format!("{parent}-{seq:02}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SCHEMA_VERSION;
    use chrono::Duration;

    fn task_with_status(status: TaskStatus) -> Task {
        Task {
            id: "TASK-2025-06-01-001".to_string(),
            schema_version: SCHEMA_VERSION,
            project: "demo".to_string(),
            title: "Test Task".to_string(),
            body: String::new(),
            status,
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
            created_at: Utc::now(),
            updated_at: Utc::now(),
            last_transition_at: Utc::now(),
            created_by: "test".to_string(),
            content_hash: None,
        }
    }

    #[test]
    fn test_transition_table() {
        use TaskStatus::*;

        let allowed: &[(TaskStatus, &[TaskStatus])] = &[
            (Backlog, &[Ready, Blocked, Cancelled]),
            (Ready, &[InProgress, Blocked, Deadletter, Cancelled]),
            (InProgress, &[Review, Ready, Blocked, Deadletter, Cancelled]),
            (Blocked, &[Ready, Deadletter, Cancelled]),
            (Review, &[Done, InProgress, Blocked, Cancelled]),
            (Done, &[]),
            (Cancelled, &[]),
            (Deadletter, &[Ready]),
        ];

        for (from, targets) in allowed {
            for to in TaskStatus::all() {
                let expected = targets.contains(&to);
                assert_eq!(
                    from.can_transition_to(to),
                    expected,
                    "{from} -> {to} should be {expected}"
                );
            }
        }
    }

    #[test]
    fn test_no_same_status_transition() {
        for status in TaskStatus::all() {
            assert!(!status.can_transition_to(status));
        }
    }

    #[test]
    fn test_lease_invariant_helpers() {
        assert!(TaskStatus::InProgress.requires_lease());
        assert!(TaskStatus::Blocked.may_hold_lease());
        assert!(!TaskStatus::Ready.may_hold_lease());

        for status in [
            TaskStatus::Ready,
            TaskStatus::Review,
            TaskStatus::Done,
            TaskStatus::Cancelled,
            TaskStatus::Deadletter,
        ] {
            assert!(status.clears_lease(), "{status} should clear the lease");
        }
        assert!(!TaskStatus::Blocked.clears_lease());
        assert!(!TaskStatus::InProgress.clears_lease());
    }

    #[test]
    fn test_lease_expiry_boundary() {
        let now = Utc::now();
        let lease = Lease {
            agent: "swe-backend".to_string(),
            acquired_at: now - Duration::minutes(10),
            expires_at: now,
            renew_count: 0,
        };

        // expires_at == now is already expired
        assert!(lease.is_expired(now));
        assert!(lease.is_active(now - Duration::milliseconds(1)));
    }

    #[test]
    fn test_priority_ordering() {
        let mut priorities = vec![Priority::Low, Priority::Critical, Priority::Normal, Priority::High];
        priorities.sort();
        assert_eq!(
            priorities,
            vec![Priority::Critical, Priority::High, Priority::Normal, Priority::Low]
        );
    }

    #[test]
    fn test_metadata_accessors() {
        let mut task = task_with_status(TaskStatus::Blocked);
        assert_eq!(task.retry_count(), 0);
        assert!(task.block_reason().is_none());

        task.set_block_reason(Some("spawn_failed: connection refused"));
        task.set_retry_count(2);
        let blocked_at = Utc::now();
        task.set_last_blocked_at(blocked_at);
        task.set_error_class("transient");

        assert_eq!(task.block_reason(), Some("spawn_failed: connection refused"));
        assert_eq!(task.retry_count(), 2);
        assert_eq!(
            task.last_blocked_at().map(|t| t.timestamp()),
            Some(blocked_at.timestamp())
        );
        assert_eq!(task.error_class(), Some("transient"));

        task.set_block_reason(None);
        assert!(task.block_reason().is_none());
    }

    #[test]
    fn test_apply_patch() {
        let mut task = task_with_status(TaskStatus::Backlog);
        let mut metadata = BTreeMap::new();
        metadata.insert("owner".to_string(), serde_json::json!("ops"));

        task.apply_patch(TaskPatch {
            title: Some("Renamed".to_string()),
            priority: Some(Priority::Critical),
            resource: Some(Some("db-migrations".to_string())),
            metadata,
            ..TaskPatch::default()
        });

        assert_eq!(task.title, "Renamed");
        assert_eq!(task.priority, Priority::Critical);
        assert_eq!(task.resource.as_deref(), Some("db-migrations"));
        assert_eq!(task.metadata["owner"], serde_json::json!("ops"));

        // Null metadata value removes the key
        let mut removal = BTreeMap::new();
        removal.insert("owner".to_string(), serde_json::Value::Null);
        task.apply_patch(TaskPatch {
            metadata: removal,
            ..TaskPatch::default()
        });
        assert!(!task.metadata.contains_key("owner"));
    }

    #[test]
    fn test_task_id_scheme() {
        assert!(is_valid_task_id("TASK-2025-06-01-001"));
        assert!(is_valid_task_id("TASK-2025-06-01-001-02"));
        assert!(!is_valid_task_id("TASK-2025-6-1-1"));
        assert!(!is_valid_task_id("task-2025-06-01-001"));
        assert!(!is_valid_task_id("TASK-2025-06-01"));

        let date = NaiveDate::from_ymd_opt(2025, 6, 1).unwrap();
        assert_eq!(new_task_id(date, 7), "TASK-2025-06-01-007");
        assert_eq!(subtask_id("TASK-2025-06-01-007", 1), "TASK-2025-06-01-007-01");
    }
}
