use crate::task::TaskStatus;
use thiserror::Error;

/// Result type alias for orchestration operations
pub type Result<T> = std::result::Result<T, AofError>;

/// Error types for the AOF orchestration engine.
///
/// These errors cover all failure modes of the scheduling and dispatch core,
/// from status machine violations to storage errors. Domain operations return
/// them to their caller; background loops (scheduler poll, service tick)
/// catch and classify instead of propagating.
///
/// # Examples
///
/// ```rust
/// use aof_core::{AofError, TaskStatus};
///
/// let not_found = AofError::not_found("TASK-2025-06-01-001");
/// let illegal = AofError::invalid_transition(TaskStatus::Done, TaskStatus::Ready);
///
/// assert!(not_found.is_not_found());
/// assert!(illegal.is_invalid_transition());
/// ```
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AofError {
    /// Task, gate, or agent not found by the given identifier
    #[error("Not found: {0}")]
    NotFound(String),

    /// Attempted edge not in the status transition table
    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    /// Schema or invariant violation on input or stored state
    #[error("Validation error: {0}")]
    Validation(String),

    /// Lease acquire on a held task, or renew/release by a non-holder
    #[error("Lease conflict on task {task_id}: held by {holder}")]
    LeaseConflict { task_id: String, holder: String },

    /// Lease operation on a task that carries no lease
    #[error("No lease on task {0}")]
    NoLease(String),

    /// Workflow or gate configuration problem
    #[error("Workflow error: {0}")]
    Workflow(String),

    /// Protocol envelope could not be parsed
    #[error("Parse error: {0}")]
    Parse(String),

    /// Frontmatter or event (de)serialization failure
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Storage I/O failure; callers may retry
    #[error("I/O error: {0}")]
    Io(String),

    /// Configuration error; fatal at service startup
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Internal system error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AofError {
    /// Create a not found error for a task id
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound(id.into())
    }

    /// Create a status transition error
    pub fn invalid_transition(from: TaskStatus, to: TaskStatus) -> Self {
        Self::InvalidTransition { from, to }
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a validation error for an empty field
    pub fn empty_field(field: &str) -> Self {
        Self::Validation(format!("Field '{field}' cannot be empty"))
    }

    /// Create a lease conflict error
    pub fn lease_conflict(task_id: impl Into<String>, holder: impl Into<String>) -> Self {
        Self::LeaseConflict {
            task_id: task_id.into(),
            holder: holder.into(),
        }
    }

    /// Check if this error indicates a not found condition
    pub fn is_not_found(&self) -> bool {
        matches!(self, AofError::NotFound(_))
    }

    /// Check if this error indicates a validation problem
    pub fn is_validation(&self) -> bool {
        matches!(self, AofError::Validation(_))
    }

    /// Check if this error is a rejected status machine edge
    pub fn is_invalid_transition(&self) -> bool {
        matches!(self, AofError::InvalidTransition { .. })
    }

    /// Check if this error is a lease ownership conflict
    pub fn is_lease_conflict(&self) -> bool {
        matches!(self, AofError::LeaseConflict { .. } | AofError::NoLease(_))
    }

    /// Check if this error came from storage I/O (retryable)
    pub fn is_io(&self) -> bool {
        matches!(self, AofError::Io(_))
    }
}

impl From<std::io::Error> for AofError {
    fn from(err: std::io::Error) -> Self {
        AofError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for AofError {
    fn from(err: serde_json::Error) -> Self {
        AofError::Serialization(err.to_string())
    }
}
