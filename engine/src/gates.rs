//! Workflow gate progression, timeouts, and escalation.
//!
//! A workflow-bound task carries `gate = { current, entered }`. Completion
//! reports advance it through the pipeline (skipping gates whose `when`
//! condition is false), rejection at a `canReject` gate routes the work
//! back to the gate that produced it, and the scheduler escalates gates
//! that sit past their configured timeout.

use aof_core::{
    events, AofError, Gate, GateContext, GateHistoryEntry, GateOutcome, GateOutcomeGuide,
    GateState, RejectionStrategy, Result, ReviewContext, Task, TaskStatus, Workflow,
};
use aof_store::{EventLogger, TaskStore};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

use crate::expr::{evaluate_gate_condition, ConditionContext};

/// Result of applying a completion at the current gate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateAdvance {
    /// Moved to a later gate; the task stays in-progress under a new role
    Advanced {
        from: String,
        to: String,
        role: String,
    },
    /// The pipeline is complete; the caller drives the task to done
    Finished { last_gate: String },
    /// The task carries no gate state
    NotWorkflowBound,
}

/// A gate found sitting past its timeout at plan time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateTimeout {
    pub task_id: String,
    pub gate_id: String,
    pub from_role: String,
    /// Escalation target, when the gate configures one
    pub escalate_to: Option<String>,
    pub elapsed: Duration,
}

/// Drives tasks through their workflow pipelines.
pub struct GateEngine {
    store: Arc<TaskStore>,
    logger: Arc<EventLogger>,
}

impl GateEngine {
    pub fn new(store: Arc<TaskStore>, logger: Arc<EventLogger>) -> Self {
        Self { store, logger }
    }

    /// The gate a task enters when first dispatched under a workflow: the
    /// earliest gate whose condition holds.
    pub fn entry_gate<'a>(workflow: &'a Workflow, task: &Task) -> Option<&'a Gate> {
        workflow
            .gates
            .iter()
            .find(|gate| gate_active(gate, task))
    }

    /// Build the plain-language context injected alongside a dispatch.
    pub fn gate_context(gate: &Gate, task: &Task) -> GateContext {
        let mut expectations = Vec::new();
        if let Some(description) = gate.description.as_deref() {
            expectations.push(description.to_string());
        }
        if gate.require_human {
            expectations.push("A human decision is required at this gate".to_string());
        }
        for test in &task.tests {
            expectations.push(format!("Must satisfy: {test}"));
        }

        let needs_review = if gate.can_reject {
            "Report 'needs_review' to send the work back to the gate that produced it".to_string()
        } else {
            "Not available at this gate".to_string()
        };

        let tips = task.review_context.as_ref().map(|rc| {
            format!(
                "This work was sent back from gate '{}': {}",
                rc.from_gate, rc.feedback
            )
        });

        GateContext {
            role: gate.role.clone(),
            gate: gate.id.clone(),
            expectations,
            outcomes: GateOutcomeGuide {
                complete: "Report 'complete' when this gate's work is done".to_string(),
                needs_review,
                blocked: "Report 'blocked' with your blockers when you cannot proceed".to_string(),
            },
            tips,
        }
    }

    /// Apply a `complete` outcome at the task's current gate: append the
    /// audit entry and either move to the next active gate (new role, new
    /// clock) or report the pipeline finished.
    pub async fn advance(
        &self,
        task_id: &str,
        workflow: &Workflow,
        actor: &str,
        summary: Option<&str>,
    ) -> Result<GateAdvance> {
        let task = self.store.get(task_id).await?;
        let Some(gate_state) = task.gate.clone() else {
            return Ok(GateAdvance::NotWorkflowBound);
        };
        let current = workflow
            .gate(&gate_state.current)
            .ok_or_else(|| AofError::not_found(format!("gate '{}'", gate_state.current)))?;

        // Evaluate downstream conditions as if the history entry were
        // already appended, so `gateHistory` conditions see this gate
        let mut preview = task.clone();
        preview.gate_history.push(history_entry(
            current,
            GateOutcome::Complete,
            summary.map(str::to_string),
        ));
        let next = next_active_gate(workflow, &gate_state.current, &preview);

        let now = Utc::now();
        let entry = history_entry(current, GateOutcome::Complete, summary.map(str::to_string));
        let advance = match next {
            Some(next_gate) => {
                let next_id = next_gate.id.clone();
                let next_role = next_gate.role.clone();
                let to = next_id.clone();
                let role = next_role.clone();
                self.store
                    .update_with(task_id, move |t| {
                        t.gate_history.push(entry);
                        t.gate = Some(GateState {
                            current: next_id,
                            entered: now,
                        });
                        t.routing.role = Some(next_role);
                        t.routing.agent = None;
                        t.review_context = None;
                    })
                    .await?;
                GateAdvance::Advanced {
                    from: gate_state.current.clone(),
                    to,
                    role,
                }
            }
            None => {
                self.store
                    .update_with(task_id, move |t| {
                        t.gate_history.push(entry);
                        t.gate = None;
                    })
                    .await?;
                GateAdvance::Finished {
                    last_gate: gate_state.current.clone(),
                }
            }
        };

        let advance_detail = match &advance {
            GateAdvance::Advanced { to, .. } => serde_json::json!({"to": to}),
            GateAdvance::Finished { .. } => serde_json::json!("finished"),
            GateAdvance::NotWorkflowBound => serde_json::json!("unbound"),
        };
        self.logger.log(
            events::GATE_ADVANCED,
            actor,
            Some(task_id),
            serde_json::json!({
                "from": gate_state.current,
                "advance": advance_detail,
            }),
        );
        Ok(advance)
    }

    /// Apply a `needs_review` outcome: only valid at a `canReject` gate;
    /// routes the work to the earliest prior gate that produced it, carrying
    /// the reviewer feedback.
    pub async fn reject_to_origin(
        &self,
        task_id: &str,
        workflow: &Workflow,
        actor: &str,
        feedback: &str,
    ) -> Result<Task> {
        let task = self.store.get(task_id).await?;
        let gate_state = task
            .gate
            .clone()
            .ok_or_else(|| AofError::Workflow(format!("task '{task_id}' is not gate-bound")))?;
        let current = workflow
            .gate(&gate_state.current)
            .ok_or_else(|| AofError::not_found(format!("gate '{}'", gate_state.current)))?;

        if !current.can_reject {
            return Err(AofError::Workflow(format!(
                "gate '{}' cannot reject work",
                current.id
            )));
        }

        let origin = match workflow.rejection_strategy {
            RejectionStrategy::Origin => origin_gate(workflow, &task, &gate_state.current),
        };
        let origin = origin.ok_or_else(|| {
            AofError::Workflow(format!(
                "no origin gate before '{}' in workflow '{}'",
                gate_state.current, workflow.name
            ))
        })?;

        let now = Utc::now();
        let entry = history_entry(
            current,
            GateOutcome::NeedsReview,
            Some(feedback.to_string()),
        );
        let origin_id = origin.id.clone();
        let origin_role = origin.role.clone();
        let from_gate = gate_state.current.clone();
        let feedback_owned = feedback.to_string();
        let updated = self
            .store
            .update_with(task_id, move |t| {
                t.gate_history.push(entry);
                t.gate = Some(GateState {
                    current: origin_id,
                    entered: now,
                });
                t.routing.role = Some(origin_role);
                t.routing.agent = None;
                t.review_context = Some(ReviewContext {
                    from_gate,
                    feedback: feedback_owned,
                    at: now,
                });
            })
            .await?;

        self.logger.log(
            events::GATE_REJECTED,
            actor,
            Some(task_id),
            serde_json::json!({
                "from": gate_state.current,
                "to": origin.id,
                "feedback": feedback,
            }),
        );
        Ok(updated)
    }

    /// Read-only timeout check used by the scheduler's planner.
    pub fn check_timeout(
        task: &Task,
        workflow: &Workflow,
        now: DateTime<Utc>,
    ) -> Option<GateTimeout> {
        if task.status != TaskStatus::InProgress {
            return None;
        }
        let gate_state = task.gate.as_ref()?;
        let gate = workflow.gate(&gate_state.current)?;
        let timeout = gate.timeout_duration()?;
        let elapsed = now - gate_state.entered;
        if elapsed <= timeout {
            return None;
        }
        Some(GateTimeout {
            task_id: task.id.clone(),
            gate_id: gate.id.clone(),
            from_role: gate.role.clone(),
            escalate_to: gate.escalate_to.clone().filter(|r| !r.is_empty()),
            elapsed,
        })
    }

    /// Execute an escalation: reroute to the escalation role, append the
    /// audit entry, restart the gate clock, and emit the escalation event.
    pub async fn escalate(&self, timeout: &GateTimeout) -> Result<Task> {
        let to_role = timeout.escalate_to.clone().ok_or_else(|| {
            AofError::Workflow(format!("gate '{}' has no escalation target", timeout.gate_id))
        })?;

        let now = Utc::now();
        let summary = format!("Timeout exceeded after {}", format_elapsed(timeout.elapsed));
        let gate_id = timeout.gate_id.clone();
        let from_role = timeout.from_role.clone();
        let role = to_role.clone();
        let updated = self
            .store
            .update_with(&timeout.task_id, move |t| {
                t.gate_history.push(GateHistoryEntry {
                    gate: gate_id,
                    role: Some(from_role),
                    outcome: GateOutcome::Blocked,
                    at: now,
                    summary: Some(summary),
                });
                t.routing.role = Some(role);
                t.routing.agent = None;
                if let Some(gate) = t.gate.as_mut() {
                    gate.entered = now;
                }
            })
            .await?;

        self.logger.log(
            events::GATE_TIMEOUT_ESCALATION,
            "scheduler",
            Some(&timeout.task_id),
            serde_json::json!({
                "gate": timeout.gate_id,
                "fromRole": timeout.from_role,
                "toRole": to_role,
                "elapsed": format_elapsed(timeout.elapsed),
            }),
        );
        Ok(updated)
    }
}

/// The gate's `when` condition, evaluated against the task
fn gate_active(gate: &Gate, task: &Task) -> bool {
    evaluate_gate_condition(
        gate.when.as_deref(),
        &ConditionContext {
            tags: &task.routing.tags,
            metadata: &task.metadata,
            gate_history: &task.gate_history,
        },
    )
}

/// Next pipeline gate after `current` whose condition holds
fn next_active_gate<'a>(workflow: &'a Workflow, current: &str, task: &Task) -> Option<&'a Gate> {
    let start = workflow.gate_index(current)? + 1;
    workflow.gates[start..]
        .iter()
        .find(|gate| gate_active(gate, task))
}

/// The earliest prior gate that produced the work: the first pipeline gate
/// before `current` with a completed history entry, falling back to the
/// first gate of the pipeline.
fn origin_gate<'a>(workflow: &'a Workflow, task: &Task, current: &str) -> Option<&'a Gate> {
    let current_idx = workflow.gate_index(current)?;
    task.gate_history
        .iter()
        .filter(|e| e.outcome == GateOutcome::Complete)
        .filter_map(|e| workflow.gate_index(&e.gate))
        .filter(|idx| *idx < current_idx)
        .min()
        .and_then(|idx| workflow.gates.get(idx))
        .or_else(|| {
            if current_idx > 0 {
                workflow.first_gate()
            } else {
                None
            }
        })
}

fn history_entry(gate: &Gate, outcome: GateOutcome, summary: Option<String>) -> GateHistoryEntry {
    GateHistoryEntry {
        gate: gate.id.clone(),
        role: Some(gate.role.clone()),
        outcome,
        at: Utc::now(),
        summary,
    }
}

fn format_elapsed(elapsed: Duration) -> String {
    let minutes = elapsed.num_minutes().max(0);
    format!("{}h {}m", minutes / 60, minutes % 60)
}
