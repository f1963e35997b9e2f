//! The scheduler's plan-then-execute poll cycle.
//!
//! A poll scans the store once, plans actions from that single snapshot,
//! and executes them in plan order. Failures during one action never stop
//! the others; every action re-checks its precondition against the live
//! task before mutating, because the snapshot may be stale by then.
//!
//! Dispatch runs under an effective concurrency cap: the configured
//! ceiling, lowered to the last platform limit observed from the executor.
//! The lowered cap is process-local state and decays naturally at restart.

use aof_core::{
    events, AofError, Executor, ExecutorResult, OrgChart, Result, Task, TaskContext, TaskStatus,
    Workflow,
};
use aof_store::{EventLogger, TaskStore, TransitionCtx};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::cascade::{deps_all_done, detect_cycles, CIRCULAR_DEPENDENCY};
use crate::gates::{GateEngine, GateTimeout};
use crate::lease::{LeaseManager, DEFAULT_LEASE_TTL_MS};
use crate::retry::{
    classify_spawn_error, spawn_retry_guard, BackoffPolicy, Jitter, RetryDecision, SpawnErrorClass,
    ThreadRngJitter,
};

/// Scheduler tuning knobs. `Default` matches the documented defaults.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Project scope identifier forwarded to executors
    pub project_id: String,
    /// Plan only: no store writes, no executor calls, one synthetic
    /// `scheduler.poll` event
    pub dry_run: bool,
    /// Lease TTL applied at assignment
    pub default_lease_ttl_ms: u64,
    /// Hard ceiling on concurrently leased tasks
    pub max_concurrent_dispatches: u32,
    /// Upper bound on assignments in one cycle
    pub max_dispatches_per_poll: Option<u32>,
    /// Global throttle between dispatches, across polls
    pub min_dispatch_interval_ms: Option<u64>,
    /// Age after which a ready task is reported stuck
    pub stuck_task_threshold_ms: Option<u64>,
    /// Also block stuck tasks instead of only reporting them
    pub auto_block_stuck_tasks: bool,
    /// Executor spawn timeout
    pub spawn_timeout_ms: u64,
    /// Spawn-failed retry backoff
    pub backoff: BackoffPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            project_id: "default".to_string(),
            dry_run: false,
            default_lease_ttl_ms: DEFAULT_LEASE_TTL_MS,
            max_concurrent_dispatches: 4,
            max_dispatches_per_poll: None,
            min_dispatch_interval_ms: None,
            stuck_task_threshold_ms: None,
            auto_block_stuck_tasks: false,
            spawn_timeout_ms: 60_000,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// What a planned action will do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Promote,
    Assign,
    ExpireLease,
    Requeue,
    Deadletter,
    Alert,
    Block,
    Unblock,
    SlaViolation,
}

/// One planned, executable decision of a poll
#[derive(Debug, Clone, Serialize)]
pub struct PlannedAction {
    pub kind: ActionKind,
    pub task_id: String,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    /// Status the task had in the planning snapshot; re-checked at execute
    #[serde(skip)]
    pub expected_status: TaskStatus,
    #[serde(skip)]
    pub gate_timeout: Option<GateTimeout>,
}

/// How executing one action went
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    /// The action ran (including handled spawn failures)
    Executed,
    /// Skipped: precondition changed, dry-run, or capacity exhausted
    Skipped { reason: String },
    /// The action itself errored; others still ran
    Failed { error: String },
}

/// A planned action with its execution outcome
#[derive(Debug, Clone)]
pub struct ActionResult {
    pub action: PlannedAction,
    pub outcome: ActionOutcome,
}

/// Snapshot statistics reported by every poll
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PollStats {
    pub total: usize,
    pub backlog: usize,
    pub ready: usize,
    pub in_progress: usize,
    pub blocked: usize,
    pub review: usize,
    pub done: usize,
}

impl PollStats {
    fn from_snapshot(snapshot: &[Task]) -> Self {
        let mut stats = PollStats {
            total: snapshot.len(),
            ..PollStats::default()
        };
        for task in snapshot {
            match task.status {
                TaskStatus::Backlog => stats.backlog += 1,
                TaskStatus::Ready => stats.ready += 1,
                TaskStatus::InProgress => stats.in_progress += 1,
                TaskStatus::Blocked => stats.blocked += 1,
                TaskStatus::Review => stats.review += 1,
                TaskStatus::Done => stats.done += 1,
                TaskStatus::Cancelled | TaskStatus::Deadletter => {}
            }
        }
        stats
    }
}

/// Result of one poll cycle
#[derive(Debug)]
pub struct PollResult {
    pub scanned_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub dry_run: bool,
    pub actions: Vec<ActionResult>,
    pub stats: PollStats,
}

/// Process-local throttle state; a warm cache, not persisted
#[derive(Debug, Default)]
struct ThrottleState {
    /// Last platform limit observed from the executor
    platform_limit: Option<u32>,
    last_dispatch_at: Option<tokio::time::Instant>,
}

/// Plans and executes one poll cycle at a time.
pub struct Scheduler {
    store: Arc<TaskStore>,
    logger: Arc<EventLogger>,
    executor: Arc<dyn Executor>,
    org: OrgChart,
    workflow: Option<Workflow>,
    config: SchedulerConfig,
    leases: LeaseManager,
    gates: GateEngine,
    jitter: Box<dyn Jitter>,
    throttle: Mutex<ThrottleState>,
}

impl Scheduler {
    pub fn new(
        store: Arc<TaskStore>,
        logger: Arc<EventLogger>,
        executor: Arc<dyn Executor>,
        org: OrgChart,
        workflow: Option<Workflow>,
        config: SchedulerConfig,
    ) -> Self {
        let leases = LeaseManager::new(store.clone(), config.default_lease_ttl_ms);
        let gates = GateEngine::new(store.clone(), logger.clone());
        Self {
            store,
            logger,
            executor,
            org,
            workflow,
            config,
            leases,
            gates,
            jitter: Box::new(ThreadRngJitter),
            throttle: Mutex::new(ThrottleState::default()),
        }
    }

    /// Replace the jitter source (deterministic backoff in tests)
    pub fn with_jitter(mut self, jitter: Box<dyn Jitter>) -> Self {
        self.jitter = jitter;
        self
    }

    /// min(configured cap, last observed platform limit)
    async fn effective_cap(&self) -> u32 {
        let throttle = self.throttle.lock().await;
        match throttle.platform_limit {
            Some(limit) => limit.min(self.config.max_concurrent_dispatches),
            None => self.config.max_concurrent_dispatches,
        }
    }

    /// Run one poll: snapshot, plan, execute (or report, in dry-run).
    pub async fn poll(&self) -> Result<PollResult> {
        let started = std::time::Instant::now();
        let scanned_at = Utc::now();
        let snapshot = self.store.list().await?;
        let stats = PollStats::from_snapshot(&snapshot);
        let effective_cap = self.effective_cap().await;

        let plan = self.plan(&snapshot, scanned_at, effective_cap);

        let actions = if self.config.dry_run {
            self.logger.log(
                events::SCHEDULER_POLL,
                "scheduler",
                None,
                serde_json::json!({
                    "dryRun": true,
                    "plannedActions": plan.len(),
                    "actions": &plan,
                    "stats": stats,
                }),
            );
            plan.into_iter()
                .map(|action| ActionResult {
                    action,
                    outcome: ActionOutcome::Skipped {
                        reason: "dry-run".to_string(),
                    },
                })
                .collect()
        } else {
            let results = self.execute(plan, &stats).await;
            self.logger.log(
                events::SCHEDULER_POLL,
                "scheduler",
                None,
                serde_json::json!({
                    "dryRun": false,
                    "actions": results.len(),
                    "stats": stats,
                }),
            );
            results
        };

        Ok(PollResult {
            scanned_at,
            duration_ms: started.elapsed().as_millis() as u64,
            dry_run: self.config.dry_run,
            actions,
            stats,
        })
    }

    // ── Plan phase (read-only, deterministic on the snapshot) ─────────

    fn plan(
        &self,
        snapshot: &[Task],
        now: DateTime<Utc>,
        effective_cap: u32,
    ) -> Vec<PlannedAction> {
        let by_id: BTreeMap<&str, &Task> =
            snapshot.iter().map(|t| (t.id.as_str(), t)).collect();
        let mut children: BTreeMap<&str, Vec<&Task>> = BTreeMap::new();
        for task in snapshot {
            if let Some(parent) = task.parent_id.as_deref() {
                children.entry(parent).or_default().push(task);
            }
        }
        let resources_in_use: BTreeSet<&str> = snapshot
            .iter()
            .filter(|t| t.status == TaskStatus::InProgress)
            .filter_map(|t| t.resource.as_deref())
            .collect();
        let cycles = detect_cycles(snapshot);

        let mut actions = Vec::new();

        // 1. Expired leases
        for task in snapshot {
            if matches!(task.status, TaskStatus::InProgress | TaskStatus::Blocked)
                && task.has_expired_lease(now)
            {
                actions.push(PlannedAction {
                    kind: ActionKind::ExpireLease,
                    task_id: task.id.clone(),
                    reason: "lease expired".to_string(),
                    agent: task.lease.as_ref().map(|l| l.agent.clone()),
                    expected_status: task.status,
                    gate_timeout: None,
                });
            }
        }

        // Cycle members in backlog/ready get parked before any promotion
        for task in snapshot {
            if matches!(task.status, TaskStatus::Backlog | TaskStatus::Ready)
                && cycles.contains(&task.id)
            {
                actions.push(PlannedAction {
                    kind: ActionKind::Block,
                    task_id: task.id.clone(),
                    reason: CIRCULAR_DEPENDENCY.to_string(),
                    agent: None,
                    expected_status: task.status,
                    gate_timeout: None,
                });
            }
        }

        // 2. Promotion of backlog tasks
        for task in snapshot {
            if task.status != TaskStatus::Backlog || cycles.contains(&task.id) {
                continue;
            }
            let subtasks_done = children
                .get(task.id.as_str())
                .map(|kids| kids.iter().all(|k| k.status == TaskStatus::Done))
                .unwrap_or(true);
            let routable = self.org.resolve_routing(&task.routing).is_some();
            if deps_all_done(task, &by_id)
                && subtasks_done
                && routable
                && !task.has_active_lease(now)
            {
                actions.push(PlannedAction {
                    kind: ActionKind::Promote,
                    task_id: task.id.clone(),
                    reason: "dependencies satisfied".to_string(),
                    agent: None,
                    expected_status: TaskStatus::Backlog,
                    gate_timeout: None,
                });
            }
        }

        // 3. Blocked recovery
        for task in snapshot {
            if task.status != TaskStatus::Blocked || cycles.contains(&task.id) {
                continue;
            }
            let reason = task.block_reason().unwrap_or("");
            if reason.contains("spawn_failed") {
                match spawn_retry_guard(task, &self.config.backoff, self.jitter.as_ref(), now) {
                    RetryDecision::Requeue => actions.push(PlannedAction {
                        kind: ActionKind::Requeue,
                        task_id: task.id.clone(),
                        reason: "spawn retry backoff elapsed".to_string(),
                        agent: None,
                        expected_status: TaskStatus::Blocked,
                        gate_timeout: None,
                    }),
                    RetryDecision::Deadletter { reason } => actions.push(PlannedAction {
                        kind: ActionKind::Deadletter,
                        task_id: task.id.clone(),
                        reason,
                        agent: None,
                        expected_status: TaskStatus::Blocked,
                        gate_timeout: None,
                    }),
                    RetryDecision::Hold => {}
                }
            } else {
                let subtasks_done = children
                    .get(task.id.as_str())
                    .map(|kids| kids.iter().all(|k| k.status == TaskStatus::Done))
                    .unwrap_or(true);
                if deps_all_done(task, &by_id) && subtasks_done {
                    actions.push(PlannedAction {
                        kind: ActionKind::Requeue,
                        task_id: task.id.clone(),
                        reason: "dependencies resolved".to_string(),
                        agent: None,
                        expected_status: TaskStatus::Blocked,
                        gate_timeout: None,
                    });
                }
            }
        }

        // 4. Stuck ready tasks
        let mut stuck_blocked: BTreeSet<&str> = BTreeSet::new();
        if let Some(threshold_ms) = self.config.stuck_task_threshold_ms {
            let threshold = chrono::Duration::milliseconds(threshold_ms as i64);
            for task in snapshot {
                if task.status == TaskStatus::Ready
                    && now - task.last_transition_at > threshold
                    && !cycles.contains(&task.id)
                {
                    actions.push(PlannedAction {
                        kind: ActionKind::Alert,
                        task_id: task.id.clone(),
                        reason: "task_stuck".to_string(),
                        agent: None,
                        expected_status: TaskStatus::Ready,
                        gate_timeout: None,
                    });
                    if self.config.auto_block_stuck_tasks {
                        stuck_blocked.insert(task.id.as_str());
                        actions.push(PlannedAction {
                            kind: ActionKind::Block,
                            task_id: task.id.clone(),
                            reason: "stuck_in_ready".to_string(),
                            agent: None,
                            expected_status: TaskStatus::Ready,
                            gate_timeout: None,
                        });
                    }
                }
            }
        }

        // 5. Gate timeouts
        if let Some(workflow) = &self.workflow {
            for task in snapshot {
                if let Some(timeout) = GateEngine::check_timeout(task, workflow, now) {
                    let reason = if timeout.escalate_to.is_some() {
                        "gate_timeout_escalation"
                    } else {
                        "gate_timeout"
                    };
                    actions.push(PlannedAction {
                        kind: ActionKind::Alert,
                        task_id: task.id.clone(),
                        reason: reason.to_string(),
                        agent: None,
                        expected_status: TaskStatus::InProgress,
                        gate_timeout: Some(timeout),
                    });
                }
            }
        }

        // 6. SLA (Phase 1: notification only)
        for task in snapshot {
            if task.status != TaskStatus::InProgress {
                continue;
            }
            let Some(max_ms) = task.sla.as_ref().and_then(|s| s.max_in_progress_ms) else {
                continue;
            };
            let elapsed = now - task.last_transition_at;
            if elapsed > chrono::Duration::milliseconds(max_ms as i64) {
                actions.push(PlannedAction {
                    kind: ActionKind::SlaViolation,
                    task_id: task.id.clone(),
                    reason: format!("in-progress for {}ms, sla {}ms", elapsed.num_milliseconds(), max_ms),
                    agent: None,
                    expected_status: TaskStatus::InProgress,
                    gate_timeout: None,
                });
            }
        }

        // 7. Dispatch plan, priority then age, bounded by the caps
        let in_progress_count = snapshot
            .iter()
            .filter(|t| t.status == TaskStatus::InProgress)
            .count();
        let mut budget = (effective_cap as usize).saturating_sub(in_progress_count);
        if let Some(per_poll) = self.config.max_dispatches_per_poll {
            budget = budget.min(per_poll as usize);
        }

        let mut candidates: Vec<&Task> = snapshot
            .iter()
            .filter(|t| t.status == TaskStatus::Ready)
            .filter(|t| !cycles.contains(&t.id))
            .filter(|t| !stuck_blocked.contains(t.id.as_str()))
            .filter(|t| deps_all_done(t, &by_id))
            .collect();
        candidates.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.created_at.cmp(&b.created_at))
        });

        let mut claimed_resources: BTreeSet<String> = resources_in_use
            .iter()
            .map(|r| r.to_string())
            .collect();
        for task in candidates {
            if budget == 0 {
                break;
            }
            let Some(agent) = self.org.resolve_routing(&task.routing) else {
                continue;
            };
            if let Some(resource) = task.resource.as_deref() {
                if claimed_resources.contains(resource) {
                    continue;
                }
                claimed_resources.insert(resource.to_string());
            }
            actions.push(PlannedAction {
                kind: ActionKind::Assign,
                task_id: task.id.clone(),
                reason: "ready and routable".to_string(),
                agent: Some(agent),
                expected_status: TaskStatus::Ready,
                gate_timeout: None,
            });
            budget -= 1;
        }

        actions
    }

    // ── Execute phase ─────────────────────────────────────────────────

    async fn execute(&self, plan: Vec<PlannedAction>, stats: &PollStats) -> Vec<ActionResult> {
        let mut results = Vec::with_capacity(plan.len());
        let mut exec = ExecCycle {
            dispatched: 0,
            in_progress: stats.in_progress,
            consecutive_platform_hits: 0,
            dispatch_stopped: false,
        };

        for action in plan {
            self.logger.log(
                events::ACTION_STARTED,
                "scheduler",
                Some(&action.task_id),
                serde_json::json!({"kind": action.kind, "reason": action.reason}),
            );

            let outcome = match self.execute_action(&action, &mut exec).await {
                Ok(outcome) => {
                    self.logger.log(
                        events::ACTION_COMPLETED,
                        "scheduler",
                        Some(&action.task_id),
                        serde_json::json!({"kind": action.kind}),
                    );
                    outcome
                }
                Err(e) => {
                    tracing::warn!(
                        task_id = %action.task_id,
                        kind = ?action.kind,
                        error = %e,
                        "Scheduler action failed"
                    );
                    self.logger.log(
                        events::SCHEDULER_ACTION_FAILED,
                        "scheduler",
                        Some(&action.task_id),
                        serde_json::json!({"kind": action.kind, "error": e.to_string()}),
                    );
                    ActionOutcome::Failed {
                        error: e.to_string(),
                    }
                }
            };

            results.push(ActionResult { action, outcome });
        }
        results
    }

    async fn execute_action(
        &self,
        action: &PlannedAction,
        exec: &mut ExecCycle,
    ) -> Result<ActionOutcome> {
        // Re-read and re-check: the snapshot may be stale
        let task = match self.store.get(&action.task_id).await {
            Ok(task) => task,
            Err(e) if e.is_not_found() => {
                return Ok(ActionOutcome::Skipped {
                    reason: "task disappeared".to_string(),
                })
            }
            Err(e) => return Err(e),
        };
        if task.status != action.expected_status {
            return Ok(ActionOutcome::Skipped {
                reason: format!(
                    "status changed from {} to {}",
                    action.expected_status, task.status
                ),
            });
        }

        match action.kind {
            ActionKind::Promote => {
                self.transition_and_log(
                    &action.task_id,
                    task.status,
                    TaskStatus::Ready,
                    &action.reason,
                )
                .await?;
                Ok(ActionOutcome::Executed)
            }
            ActionKind::Requeue | ActionKind::Unblock => {
                self.transition_and_log(
                    &action.task_id,
                    task.status,
                    TaskStatus::Ready,
                    &action.reason,
                )
                .await?;
                Ok(ActionOutcome::Executed)
            }
            ActionKind::Block => {
                self.transition_and_log(
                    &action.task_id,
                    task.status,
                    TaskStatus::Blocked,
                    &action.reason,
                )
                .await?;
                Ok(ActionOutcome::Executed)
            }
            ActionKind::Deadletter => {
                self.transition_and_log(
                    &action.task_id,
                    task.status,
                    TaskStatus::Deadletter,
                    &action.reason,
                )
                .await?;
                Ok(ActionOutcome::Executed)
            }
            ActionKind::ExpireLease => self.execute_expire(&task).await,
            ActionKind::Alert => self.execute_alert(action, &task).await,
            ActionKind::SlaViolation => {
                let sla_ms = task.sla.as_ref().and_then(|s| s.max_in_progress_ms);
                self.logger.log(
                    events::SLA_VIOLATION,
                    "scheduler",
                    Some(&task.id),
                    serde_json::json!({
                        "maxInProgressMs": sla_ms,
                        "detail": action.reason,
                        "onViolation": "alert",
                    }),
                );
                Ok(ActionOutcome::Executed)
            }
            ActionKind::Assign => self.execute_assign(action, &task, exec).await,
        }
    }

    async fn execute_expire(&self, task: &Task) -> Result<ActionOutcome> {
        let now = Utc::now();
        if !task.has_expired_lease(now) {
            return Ok(ActionOutcome::Skipped {
                reason: "lease no longer expired".to_string(),
            });
        }
        let agent = task.lease.as_ref().map(|l| l.agent.clone());

        self.logger.log(
            events::LEASE_EXPIRED,
            "scheduler",
            Some(&task.id),
            serde_json::json!({
                "agent": agent,
                "expiredAt": task.lease.as_ref().map(|l| l.expires_at.to_rfc3339()),
            }),
        );

        if task.status == TaskStatus::InProgress {
            // The ready transition clears the lease
            self.transition_and_log(&task.id, task.status, TaskStatus::Ready, "lease expired")
                .await?;
        } else {
            // Blocked keeps its status; only ownership is reclaimed
            self.store
                .update_with(&task.id, |t| {
                    t.lease = None;
                })
                .await?;
        }
        Ok(ActionOutcome::Executed)
    }

    async fn execute_alert(&self, action: &PlannedAction, task: &Task) -> Result<ActionOutcome> {
        match action.reason.as_str() {
            "gate_timeout_escalation" => {
                let timeout = action
                    .gate_timeout
                    .as_ref()
                    .ok_or_else(|| AofError::Internal("escalation without timeout".to_string()))?;
                self.gates.escalate(timeout).await?;
                Ok(ActionOutcome::Executed)
            }
            "gate_timeout" => {
                let timeout = action
                    .gate_timeout
                    .as_ref()
                    .ok_or_else(|| AofError::Internal("alert without timeout".to_string()))?;
                self.logger.log(
                    events::GATE_TIMEOUT,
                    "scheduler",
                    Some(&task.id),
                    serde_json::json!({
                        "gate": timeout.gate_id,
                        "role": timeout.from_role,
                        "elapsedMs": timeout.elapsed.num_milliseconds(),
                    }),
                );
                Ok(ActionOutcome::Executed)
            }
            _ => {
                self.logger.log(
                    events::TASK_STUCK,
                    "scheduler",
                    Some(&task.id),
                    serde_json::json!({
                        "status": task.status,
                        "ageMs": (Utc::now() - task.last_transition_at).num_milliseconds(),
                    }),
                );
                Ok(ActionOutcome::Executed)
            }
        }
    }

    async fn execute_assign(
        &self,
        action: &PlannedAction,
        task: &Task,
        exec: &mut ExecCycle,
    ) -> Result<ActionOutcome> {
        if exec.dispatch_stopped {
            return Ok(ActionOutcome::Skipped {
                reason: "dispatch stopped for this cycle (platform limit)".to_string(),
            });
        }
        let effective_cap = self.effective_cap().await as usize;
        if exec.in_progress + exec.dispatched >= effective_cap {
            return Ok(ActionOutcome::Skipped {
                reason: "concurrency cap reached".to_string(),
            });
        }

        let agent = action
            .agent
            .clone()
            .or_else(|| self.org.resolve_routing(&task.routing))
            .ok_or_else(|| AofError::Validation(format!("task '{}' has no routing target", task.id)))?;

        self.throttle_dispatch().await;

        // Resolve the gate this dispatch runs under (entry gate on first
        // dispatch of a workflow-bound task, current gate afterwards)
        let entering_gate = match (&self.workflow, &task.gate) {
            (Some(workflow), None) if task.routing.workflow.as_deref() == Some(workflow.name.as_str()) => {
                GateEngine::entry_gate(workflow, task).cloned()
            }
            _ => None,
        };
        let current_gate = match (&self.workflow, &task.gate) {
            (Some(workflow), Some(state)) => workflow.gate(&state.current).cloned(),
            _ => entering_gate.clone(),
        };
        let gate_context = current_gate
            .as_ref()
            .map(|gate| GateEngine::gate_context(gate, task));

        self.logger.log(
            events::DISPATCH_MATCHED,
            "scheduler",
            Some(&task.id),
            serde_json::json!({"agent": agent, "priority": task.priority}),
        );

        let ctx = TaskContext {
            task_id: task.id.clone(),
            task_path: self.store.task_path(task.status, &task.id),
            agent: agent.clone(),
            priority: task.priority,
            routing: task.routing.clone(),
            project_id: self.config.project_id.clone(),
            project_root: self.store.root().to_path_buf(),
            task_relpath: self.store.task_relpath(task),
            thinking: task
                .metadata
                .get("thinking")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            gate_context,
        };

        let spawn = tokio::time::timeout(
            std::time::Duration::from_millis(self.config.spawn_timeout_ms),
            self.executor.spawn(ctx),
        )
        .await
        .unwrap_or_else(|_| ExecutorResult::failed("spawn timed out"));

        if spawn.success {
            let entry = entering_gate.clone();
            self.leases
                .acquire_with(
                    &task.id,
                    &agent,
                    Some(self.config.default_lease_ttl_ms),
                    move |t| {
                        if let Some(gate) = entry {
                            t.gate = Some(aof_core::GateState {
                                current: gate.id.clone(),
                                entered: Utc::now(),
                            });
                            t.routing.role = Some(gate.role);
                        }
                    },
                )
                .await?;
            self.logger.log(
                events::TASK_ASSIGNED,
                "scheduler",
                Some(&task.id),
                serde_json::json!({"agent": agent, "sessionId": spawn.session_id}),
            );
            self.log_transition(&task.id, TaskStatus::Ready, TaskStatus::InProgress, "assigned");

            exec.dispatched += 1;
            exec.consecutive_platform_hits = 0;
            self.throttle.lock().await.last_dispatch_at = Some(tokio::time::Instant::now());
            return Ok(ActionOutcome::Executed);
        }

        self.handle_spawn_failure(task, &agent, &spawn, exec).await
    }

    async fn handle_spawn_failure(
        &self,
        task: &Task,
        agent: &str,
        spawn: &ExecutorResult,
        exec: &mut ExecCycle,
    ) -> Result<ActionOutcome> {
        let error = spawn.error.as_deref().unwrap_or("unknown spawn error");
        let class = classify_spawn_error(spawn);
        tracing::warn!(
            task_id = %task.id,
            agent,
            class = class.as_str(),
            error,
            "Spawn failed"
        );

        match class {
            SpawnErrorClass::Permanent => {
                let reason = format!("permanent spawn failure: {error}");
                self.store
                    .transition_with(
                        &task.id,
                        TaskStatus::Deadletter,
                        TransitionCtx::with_reason(&reason),
                        |t| t.set_error_class("permanent"),
                    )
                    .await?;
                self.log_transition(&task.id, TaskStatus::Ready, TaskStatus::Deadletter, &reason);
                Ok(ActionOutcome::Executed)
            }
            SpawnErrorClass::RateLimited => {
                let reason = format!("spawn_failed: {error}");
                self.store
                    .transition_with(
                        &task.id,
                        TaskStatus::Blocked,
                        TransitionCtx::with_reason(&reason),
                        |t| t.set_error_class("rate_limited"),
                    )
                    .await?;
                self.log_transition(&task.id, TaskStatus::Ready, TaskStatus::Blocked, &reason);
                Ok(ActionOutcome::Executed)
            }
            SpawnErrorClass::PlatformLimit(detected) => {
                // The task stays ready and pays no retry penalty; the cap
                // decays instead
                let mut throttle = self.throttle.lock().await;
                let previous_cap = throttle
                    .platform_limit
                    .map(|l| l.min(self.config.max_concurrent_dispatches))
                    .unwrap_or(self.config.max_concurrent_dispatches);
                let new_cap = detected.min(self.config.max_concurrent_dispatches);
                if new_cap < previous_cap {
                    throttle.platform_limit = Some(detected);
                    self.logger.log(
                        events::CONCURRENCY_PLATFORM_LIMIT,
                        "scheduler",
                        Some(&task.id),
                        serde_json::json!({
                            "detectedLimit": detected,
                            "effectiveCap": new_cap,
                            "previousCap": previous_cap,
                        }),
                    );
                }
                drop(throttle);

                exec.consecutive_platform_hits += 1;
                if exec.consecutive_platform_hits >= 2 {
                    exec.dispatch_stopped = true;
                }
                Ok(ActionOutcome::Executed)
            }
            SpawnErrorClass::Transient => {
                let reason = format!("spawn_failed: {error}");
                let retry_count = task.retry_count() + 1;
                self.store
                    .transition_with(
                        &task.id,
                        TaskStatus::Blocked,
                        TransitionCtx::with_reason(&reason),
                        move |t| {
                            t.set_retry_count(retry_count);
                            t.set_error_class("transient");
                        },
                    )
                    .await?;
                self.log_transition(&task.id, TaskStatus::Ready, TaskStatus::Blocked, &reason);
                Ok(ActionOutcome::Executed)
            }
        }
    }

    /// Honor the optional global minimum interval between dispatches
    async fn throttle_dispatch(&self) {
        let Some(interval_ms) = self.config.min_dispatch_interval_ms else {
            return;
        };
        let interval = std::time::Duration::from_millis(interval_ms);
        let wait = {
            let throttle = self.throttle.lock().await;
            throttle
                .last_dispatch_at
                .and_then(|at| interval.checked_sub(at.elapsed()))
        };
        if let Some(wait) = wait {
            tokio::time::sleep(wait).await;
        }
    }

    async fn transition_and_log(
        &self,
        task_id: &str,
        from: TaskStatus,
        to: TaskStatus,
        reason: &str,
    ) -> Result<Task> {
        let updated = self
            .store
            .transition(task_id, to, TransitionCtx::with_reason(reason))
            .await?;
        self.log_transition(task_id, from, to, reason);
        Ok(updated)
    }

    fn log_transition(&self, task_id: &str, from: TaskStatus, to: TaskStatus, reason: &str) {
        self.logger.log(
            events::TASK_TRANSITIONED,
            "scheduler",
            Some(task_id),
            serde_json::json!({
                "from": from,
                "to": to,
                "reason": reason,
            }),
        );
    }
}

/// Per-cycle dispatch bookkeeping
struct ExecCycle {
    dispatched: usize,
    in_progress: usize,
    consecutive_platform_hits: u32,
    dispatch_stopped: bool,
}
