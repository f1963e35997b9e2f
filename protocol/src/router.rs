//! Parse → validate → authorize → apply.
//!
//! The authorized sender for a task is its lease holder when a lease
//! exists, else its routed agent. Everything else is rejected with an
//! event and zero state change. Applied outcomes run through the status
//! machine and the gate engine, and completions/blocks cascade through the
//! dependency graph.

use aof_core::{events, NewTask, Result, Routing, Task, TaskStatus, Workflow};
use aof_engine::{DependencyCascader, GateAdvance, GateEngine};
use aof_store::{body, EventLogger, TaskStore, TransitionCtx};
use chrono::Utc;
use std::sync::Arc;

use crate::envelope::{
    CompletionOutcome, CompletionReport, Envelope, HandoffAccepted, HandoffRejected,
    HandoffRequest, MessagePayload, StatusUpdate,
};
use crate::parse::extract_envelope;

/// What routing one message produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// The message was valid and applied
    Applied { task_id: String, detail: String },
    /// The message was rejected; the reason matches the emitted event
    Rejected { reason: String },
    /// Valid envelope, unrecognized message type
    Unknown { message_type: String },
}

/// Routes structured agent messages into state transitions.
pub struct ProtocolRouter {
    store: Arc<TaskStore>,
    logger: Arc<EventLogger>,
    cascader: DependencyCascader,
    gates: GateEngine,
    workflow: Option<Workflow>,
}

impl ProtocolRouter {
    pub fn new(
        store: Arc<TaskStore>,
        logger: Arc<EventLogger>,
        workflow: Option<Workflow>,
    ) -> Self {
        let cascader = DependencyCascader::new(store.clone(), logger.clone());
        let gates = GateEngine::new(store.clone(), logger.clone());
        Self {
            store,
            logger,
            cascader,
            gates,
            workflow,
        }
    }

    /// Route from any inbound event shape (see [`extract_envelope`]).
    /// Parse failures emit `protocol.message.rejected` and mutate nothing.
    pub async fn route_value(&self, input: &serde_json::Value) -> Result<RouteOutcome> {
        match extract_envelope(input) {
            Ok(envelope) => self.route(envelope).await,
            Err(e) => {
                self.logger.log(
                    events::PROTOCOL_MESSAGE_REJECTED,
                    "router",
                    None,
                    serde_json::json!({"reason": "invalid_envelope", "detail": e.to_string()}),
                );
                Ok(RouteOutcome::Rejected {
                    reason: "invalid_envelope".to_string(),
                })
            }
        }
    }

    /// Route a parsed envelope.
    pub async fn route(&self, envelope: Envelope) -> Result<RouteOutcome> {
        if let Err(e) = envelope.validate() {
            return Ok(self.reject(&envelope, "invalid_envelope", Some(e.to_string())));
        }

        let task = match self.store.get(&envelope.task_id).await {
            Ok(task) => task,
            Err(e) if e.is_not_found() => {
                return Ok(self.reject(&envelope, "unknown_task", None));
            }
            Err(e) => return Err(e),
        };

        // Authorization: lease holder when held, else the routed agent
        let authorized = task
            .lease
            .as_ref()
            .map(|l| l.agent.as_str())
            .or(task.routing.agent.as_deref());
        match authorized {
            None => return Ok(self.reject(&envelope, "unassigned_task", None)),
            Some(expected) if expected != envelope.from_agent => {
                self.logger.log(
                    events::PROTOCOL_MESSAGE_REJECTED,
                    &envelope.from_agent,
                    Some(&envelope.task_id),
                    serde_json::json!({
                        "reason": "unauthorized_agent",
                        "expected": expected,
                        "received": envelope.from_agent,
                    }),
                );
                return Ok(RouteOutcome::Rejected {
                    reason: "unauthorized_agent".to_string(),
                });
            }
            Some(_) => {}
        }

        let payload = match envelope.parse_payload() {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                self.logger.log(
                    events::PROTOCOL_MESSAGE_UNKNOWN,
                    &envelope.from_agent,
                    Some(&envelope.task_id),
                    serde_json::json!({"type": envelope.message_type}),
                );
                return Ok(RouteOutcome::Unknown {
                    message_type: envelope.message_type.clone(),
                });
            }
            Err(e) => {
                return Ok(self.reject(&envelope, "invalid_payload", Some(e.to_string())));
            }
        };

        self.logger.log(
            events::PROTOCOL_MESSAGE_RECEIVED,
            &envelope.from_agent,
            Some(&envelope.task_id),
            serde_json::json!({"type": envelope.message_type, "fromAgent": envelope.from_agent}),
        );

        let detail = match payload {
            MessagePayload::StatusUpdate(update) => {
                self.apply_status_update(&envelope, &task, update).await?
            }
            MessagePayload::CompletionReport(report) => {
                self.apply_completion(&envelope, &task, report).await?
            }
            MessagePayload::HandoffRequest(request) => {
                self.apply_handoff_request(&envelope, &task, request).await?
            }
            MessagePayload::HandoffAccepted(accepted) => {
                self.apply_handoff_accepted(&envelope, accepted).await?
            }
            MessagePayload::HandoffRejected(rejected) => {
                self.apply_handoff_rejected(&envelope, rejected).await?
            }
        };

        Ok(RouteOutcome::Applied {
            task_id: envelope.task_id.clone(),
            detail,
        })
    }

    fn reject(
        &self,
        envelope: &Envelope,
        reason: &str,
        detail: Option<String>,
    ) -> RouteOutcome {
        self.logger.log(
            events::PROTOCOL_MESSAGE_REJECTED,
            &envelope.from_agent,
            Some(&envelope.task_id),
            serde_json::json!({"reason": reason, "detail": detail}),
        );
        RouteOutcome::Rejected {
            reason: reason.to_string(),
        }
    }

    async fn apply_status_update(
        &self,
        envelope: &Envelope,
        task: &Task,
        update: StatusUpdate,
    ) -> Result<String> {
        let mut applied = Vec::new();
        let mut became_blocked = false;

        if let Some(new_status) = update.status {
            if task.status == new_status || task.status.can_transition_to(new_status) {
                let updated = self
                    .store
                    .transition(
                        &task.id,
                        new_status,
                        TransitionCtx {
                            reason: update.blockers.first().cloned(),
                            agent: Some(envelope.from_agent.clone()),
                        },
                    )
                    .await?;
                if updated.status == new_status && task.status != new_status {
                    self.log_transition(envelope, task.status, new_status);
                    applied.push(format!("status -> {new_status}"));
                    became_blocked = new_status == TaskStatus::Blocked;
                }
            } else {
                // Illegal requested transitions are dropped, not errors
                tracing::debug!(
                    task_id = %task.id,
                    from = %task.status,
                    to = %new_status,
                    "Dropping illegal status transition from status.update"
                );
                applied.push("status change dropped".to_string());
            }
        }

        let now = Utc::now();
        let mut new_body = None;
        {
            let mut current = task.body.clone();
            if let Some(progress) = update.progress.as_deref() {
                current = body::append_work_log(&current, now, "Progress", progress);
            }
            if let Some(notes) = update.notes.as_deref() {
                current = body::append_work_log(&current, now, "Notes", notes);
            }
            if !update.blockers.is_empty() {
                current =
                    body::append_work_log(&current, now, "Blockers", &update.blockers.join("; "));
            }
            if current != task.body {
                new_body = Some(current);
            }
        }
        if let Some(new_body) = new_body {
            self.store.update_body(&task.id, &new_body).await?;
            applied.push("work log appended".to_string());
        }

        if became_blocked {
            self.cascader.on_blocked(&task.id).await?;
        }

        Ok(applied.join(", "))
    }

    async fn apply_completion(
        &self,
        envelope: &Envelope,
        task: &Task,
        report: CompletionReport,
    ) -> Result<String> {
        // Record the report into the body first so it survives whatever
        // transition follows
        let mut current = task.body.clone();
        if let Some(summary) = report.summary_ref.as_deref() {
            current = body::set_section(&current, body::SUMMARY_HEADING, summary);
        }
        if !report.deliverables.is_empty() {
            let list = report
                .deliverables
                .iter()
                .map(|d| format!("- {d}"))
                .collect::<Vec<_>>()
                .join("\n");
            current = body::set_section(&current, body::DELIVERABLES_HEADING, &list);
        }
        if let Some(tests) = &report.test_report {
            let text = format!(
                "{} total, {} passed, {} failed, {} skipped",
                tests.total, tests.passed, tests.failed, tests.skipped
            );
            current = body::set_section(&current, body::TEST_REPORT_HEADING, &text);
        }
        if let Some(notes) = report.notes.as_deref() {
            current = body::append_work_log(&current, Utc::now(), "Notes", notes);
        }
        if current != task.body {
            self.store.update_body(&task.id, &current).await?;
        }

        let workflow_bound = self.workflow.as_ref().filter(|_| task.gate.is_some());

        match report.outcome {
            CompletionOutcome::Done => match workflow_bound {
                Some(workflow) => {
                    let advance = self
                        .gates
                        .advance(&task.id, workflow, &envelope.from_agent, report.summary_ref.as_deref())
                        .await?;
                    match advance {
                        GateAdvance::Advanced { to, role, .. } => {
                            Ok(format!("advanced to gate '{to}' ({role})"))
                        }
                        GateAdvance::Finished { .. } | GateAdvance::NotWorkflowBound => {
                            self.finish_to_done(envelope, task).await?;
                            Ok("workflow finished, task done".to_string())
                        }
                    }
                }
                None => {
                    self.finish_to_done(envelope, task).await?;
                    Ok("task done".to_string())
                }
            },
            CompletionOutcome::NeedsReview => {
                let can_reject = workflow_bound
                    .and_then(|wf| {
                        let gate_id = task.gate.as_ref().map(|g| g.current.as_str())?;
                        wf.gate(gate_id).map(|g| g.can_reject)
                    })
                    .unwrap_or(false);

                if let (Some(workflow), true) = (workflow_bound, can_reject) {
                    let feedback = report
                        .notes
                        .as_deref()
                        .or(report.summary_ref.as_deref())
                        .unwrap_or("sent back for rework");
                    self.gates
                        .reject_to_origin(&task.id, workflow, &envelope.from_agent, feedback)
                        .await?;
                    // Back through ready so the origin role is re-dispatched
                    self.store
                        .transition(
                            &task.id,
                            TaskStatus::Ready,
                            TransitionCtx::with_reason("rejected to origin gate"),
                        )
                        .await?;
                    self.log_transition(envelope, task.status, TaskStatus::Ready);
                    Ok("rejected to origin gate".to_string())
                } else {
                    self.store
                        .transition(
                            &task.id,
                            TaskStatus::Review,
                            TransitionCtx {
                                reason: None,
                                agent: Some(envelope.from_agent.clone()),
                            },
                        )
                        .await?;
                    self.log_transition(envelope, task.status, TaskStatus::Review);
                    Ok("moved to review".to_string())
                }
            }
            CompletionOutcome::Blocked => {
                let reason = report.blockers.join("; ");
                self.store
                    .transition(
                        &task.id,
                        TaskStatus::Blocked,
                        TransitionCtx {
                            reason: Some(reason.clone()),
                            agent: Some(envelope.from_agent.clone()),
                        },
                    )
                    .await?;
                self.log_transition(envelope, task.status, TaskStatus::Blocked);
                self.cascader.on_blocked(&task.id).await?;
                Ok(format!("blocked: {reason}"))
            }
            CompletionOutcome::Partial => Ok("partial progress recorded".to_string()),
        }
    }

    /// `in-progress → review → done`, then cascade
    async fn finish_to_done(&self, envelope: &Envelope, task: &Task) -> Result<()> {
        let ctx = TransitionCtx {
            reason: None,
            agent: Some(envelope.from_agent.clone()),
        };
        if task.status == TaskStatus::InProgress {
            self.store
                .transition(&task.id, TaskStatus::Review, ctx.clone())
                .await?;
            self.log_transition(envelope, TaskStatus::InProgress, TaskStatus::Review);
        }
        self.store
            .transition(&task.id, TaskStatus::Done, ctx)
            .await?;
        self.log_transition(envelope, TaskStatus::Review, TaskStatus::Done);
        self.cascader.on_completed(&task.id).await?;
        Ok(())
    }

    async fn apply_handoff_request(
        &self,
        envelope: &Envelope,
        task: &Task,
        request: HandoffRequest,
    ) -> Result<String> {
        let mut body_text = String::new();
        if let Some(reason) = request.reason.as_deref() {
            body_text.push_str(reason);
            body_text.push('\n');
        }
        for (heading, items) in [
            ("## Acceptance", &request.acceptance),
            ("## Constraints", &request.constraints),
            ("## Context", &request.context_refs),
            ("## Deliverables", &request.deliverables),
        ] {
            if !items.is_empty() {
                body_text.push('\n');
                body_text.push_str(heading);
                body_text.push('\n');
                for item in items {
                    body_text.push_str(&format!("- {item}\n"));
                }
            }
        }

        let subtask = self
            .store
            .create(NewTask {
                id: None,
                project: task.project.clone(),
                title: request.title.clone(),
                body: body_text,
                priority: task.priority,
                routing: Routing {
                    agent: Some(envelope.to_agent.clone()),
                    ..Routing::default()
                },
                sla: None,
                depends_on: vec![],
                parent_id: Some(task.id.clone()),
                tests: request.acceptance.clone(),
                resource: None,
                metadata: Default::default(),
                created_by: envelope.from_agent.clone(),
            })
            .await?;

        self.logger.log(
            events::DELEGATION_REQUESTED,
            &envelope.from_agent,
            Some(&task.id),
            serde_json::json!({
                "subtaskId": subtask.id,
                "toAgent": envelope.to_agent,
                "title": request.title,
            }),
        );
        Ok(format!("subtask {} created", subtask.id))
    }

    async fn apply_handoff_accepted(
        &self,
        envelope: &Envelope,
        _accepted: HandoffAccepted,
    ) -> Result<String> {
        self.store
            .update_with(&envelope.task_id, |t| {
                t.routing.agent = Some(envelope.from_agent.clone());
            })
            .await?;
        self.logger.log(
            events::DELEGATION_ACCEPTED,
            &envelope.from_agent,
            Some(&envelope.task_id),
            serde_json::json!({"agent": envelope.from_agent}),
        );
        Ok("handoff accepted".to_string())
    }

    async fn apply_handoff_rejected(
        &self,
        envelope: &Envelope,
        rejected: HandoffRejected,
    ) -> Result<String> {
        let reason = rejected.reason.clone();
        let task = self.store.get(&envelope.task_id).await?;
        let new_body = body::append_work_log(
            &task.body,
            Utc::now(),
            "Notes",
            &format!("handoff rejected: {reason}"),
        );
        self.store.update_body(&envelope.task_id, &new_body).await?;
        self.store
            .update_with(&envelope.task_id, |t| {
                t.routing.agent = None;
            })
            .await?;
        self.logger.log(
            events::DELEGATION_REJECTED,
            &envelope.from_agent,
            Some(&envelope.task_id),
            serde_json::json!({"reason": rejected.reason}),
        );
        Ok("handoff rejected".to_string())
    }

    fn log_transition(&self, envelope: &Envelope, from: TaskStatus, to: TaskStatus) {
        self.logger.log(
            events::TASK_TRANSITIONED,
            &envelope.from_agent,
            Some(&envelope.task_id),
            serde_json::json!({"from": from, "to": to}),
        );
    }
}
