use crate::{
    error::{AofError, Result},
    task::{is_valid_task_id, NewTask, Sla, SlaViolationPolicy},
};

/// Validation utilities for orchestration inputs
pub struct TaskValidator;

impl TaskValidator {
    /// Validate a task id against the `TASK-YYYY-MM-DD-NNN[-NN]` scheme
    pub fn validate_task_id(id: &str) -> Result<()> {
        if id.is_empty() {
            return Err(AofError::empty_field("id"));
        }
        if !is_valid_task_id(id) {
            return Err(AofError::Validation(format!(
                "Invalid task id format: '{id}'"
            )));
        }
        Ok(())
    }

    /// Validate an agent name
    ///
    /// Agent names must:
    /// - Be 1-50 characters long
    /// - Contain only letters, numbers, hyphens, and underscores
    /// - Start and end with an alphanumeric character
    pub fn validate_agent_name(name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(AofError::empty_field("agent"));
        }

        if name.len() > 50 {
            return Err(AofError::Validation(
                "Agent name must be at most 50 characters long".to_string(),
            ));
        }

        let first_char = name.chars().next().unwrap();
        let last_char = name.chars().last().unwrap();

        if !first_char.is_alphanumeric() || !last_char.is_alphanumeric() {
            return Err(AofError::Validation(
                "Agent name must start and end with a letter or number".to_string(),
            ));
        }

        let valid_chars = name
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_');
        if !valid_chars {
            return Err(AofError::Validation(
                "Agent name can only contain letters, numbers, hyphens, and underscores"
                    .to_string(),
            ));
        }

        Ok(())
    }

    /// Validate an SLA. Phase 1 mandates alert-only violations; `block` and
    /// `deadletter` are reserved and rejected until a later phase.
    pub fn validate_sla(sla: &Sla) -> Result<()> {
        if let Some(ms) = sla.max_in_progress_ms {
            if ms == 0 {
                return Err(AofError::Validation(
                    "sla.maxInProgressMs must be greater than zero".to_string(),
                ));
            }
        }
        match sla.on_violation {
            None | Some(SlaViolationPolicy::Alert) => Ok(()),
            Some(SlaViolationPolicy::Block) | Some(SlaViolationPolicy::Deadletter) => {
                Err(AofError::Validation(
                    "sla.onViolation supports only 'alert' in this phase".to_string(),
                ))
            }
        }
    }

    /// Validate a new task before it reaches the store
    pub fn validate_new_task(new_task: &NewTask) -> Result<()> {
        if let Some(id) = new_task.id.as_deref() {
            Self::validate_task_id(id)?;
            if new_task
                .depends_on
                .iter()
                .any(|dep| dep == id)
            {
                return Err(AofError::Validation(format!(
                    "Task '{id}' cannot depend on itself"
                )));
            }
        }

        if new_task.project.trim().is_empty() {
            return Err(AofError::empty_field("project"));
        }
        if new_task.title.trim().is_empty() {
            return Err(AofError::empty_field("title"));
        }

        for dep in &new_task.depends_on {
            Self::validate_task_id(dep)?;
        }
        if let Some(parent) = new_task.parent_id.as_deref() {
            Self::validate_task_id(parent)?;
        }
        if let Some(agent) = new_task.routing.agent.as_deref() {
            Self::validate_agent_name(agent)?;
        }
        if let Some(sla) = &new_task.sla {
            Self::validate_sla(sla)?;
        }

        Ok(())
    }
}
