//! Propagation of completion and blocking across the dependsOn graph.
//!
//! References between tasks are by id, never by pointer; cycles are a data
//! condition detected with a tri-color DFS over a snapshot list.

use aof_core::{events, Result, Task, TaskStatus};
use aof_store::{EventLogger, TaskStore, TransitionCtx};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Block reason set on members of a dependency cycle
pub const CIRCULAR_DEPENDENCY: &str = "circular_dependency";
/// Transition reason for dependency-satisfied promotions
pub const DEPENDENCY_SATISFIED: &str = "dependency_satisfied";

/// Result of one cascade invocation
#[derive(Debug, Clone, Default)]
pub struct CascadeOutcome {
    /// Dependents promoted to ready
    pub promoted: Vec<String>,
    /// Dependents considered but not eligible yet
    pub skipped: Vec<String>,
    /// Dependents pushed to blocked
    pub blocked: Vec<String>,
}

/// Promotes and blocks dependents when an ancestor changes state.
pub struct DependencyCascader {
    store: Arc<TaskStore>,
    logger: Arc<EventLogger>,
}

impl DependencyCascader {
    pub fn new(store: Arc<TaskStore>, logger: Arc<EventLogger>) -> Self {
        Self { store, logger }
    }

    /// Cascade after `trigger` completed: every backlog/blocked task that
    /// depends on it and whose dependencies now all resolve to `done` is
    /// promoted to `ready`. One summary event is emitted per invocation.
    pub async fn on_completed(&self, trigger: &str) -> Result<CascadeOutcome> {
        let snapshot = self.store.list().await?;
        let by_id: BTreeMap<&str, &Task> =
            snapshot.iter().map(|t| (t.id.as_str(), t)).collect();

        let mut outcome = CascadeOutcome::default();
        for task in &snapshot {
            if !matches!(task.status, TaskStatus::Backlog | TaskStatus::Blocked) {
                continue;
            }
            if !task.depends_on.iter().any(|d| d == trigger) {
                continue;
            }

            if deps_all_done(task, &by_id) {
                match self
                    .store
                    .transition(
                        &task.id,
                        TaskStatus::Ready,
                        TransitionCtx::with_reason(DEPENDENCY_SATISFIED),
                    )
                    .await
                {
                    Ok(_) => outcome.promoted.push(task.id.clone()),
                    Err(e) => {
                        tracing::warn!(task_id = %task.id, error = %e, "Cascade promotion failed");
                        outcome.skipped.push(task.id.clone());
                    }
                }
            } else {
                outcome.skipped.push(task.id.clone());
            }
        }

        self.logger.log(
            events::DEPENDENCY_CASCADED,
            "scheduler",
            Some(trigger),
            serde_json::json!({
                "action": "promote",
                "trigger": trigger,
                "count": outcome.promoted.len(),
                "promoted": outcome.promoted,
                "skipped": outcome.skipped,
            }),
        );
        Ok(outcome)
    }

    /// Cascade after `trigger` blocked: every backlog/ready dependent is
    /// blocked with an upstream reason.
    pub async fn on_blocked(&self, trigger: &str) -> Result<CascadeOutcome> {
        let snapshot = self.store.list().await?;

        let mut outcome = CascadeOutcome::default();
        for task in &snapshot {
            if !matches!(task.status, TaskStatus::Backlog | TaskStatus::Ready) {
                continue;
            }
            if !task.depends_on.iter().any(|d| d == trigger) {
                continue;
            }

            match self
                .store
                .block(&task.id, &format!("upstream blocked: {trigger}"))
                .await
            {
                Ok(_) => outcome.blocked.push(task.id.clone()),
                Err(e) => {
                    tracing::warn!(task_id = %task.id, error = %e, "Cascade block failed");
                    outcome.skipped.push(task.id.clone());
                }
            }
        }

        self.logger.log(
            events::DEPENDENCY_CASCADED,
            "scheduler",
            Some(trigger),
            serde_json::json!({
                "action": "block",
                "trigger": trigger,
                "count": outcome.blocked.len(),
                "blocked": outcome.blocked,
            }),
        );
        Ok(outcome)
    }

    /// Check whether the task's dependencies all resolve to done tasks on a
    /// fresh snapshot. Missing ids never satisfy.
    pub async fn dependencies_satisfied(&self, task: &Task) -> Result<bool> {
        let snapshot = self.store.list().await?;
        let by_id: BTreeMap<&str, &Task> =
            snapshot.iter().map(|t| (t.id.as_str(), t)).collect();
        Ok(deps_all_done(task, &by_id))
    }
}

/// Every id in `depends_on` resolves to a task with status done. An id that
/// does not resolve is treated as unresolved: it never matches done.
pub fn deps_all_done(task: &Task, by_id: &BTreeMap<&str, &Task>) -> bool {
    task.depends_on.iter().all(|dep| match by_id.get(dep.as_str()) {
        Some(dep_task) => dep_task.status == TaskStatus::Done,
        None => {
            tracing::warn!(task_id = %task.id, dep = %dep, "Unresolved dependency id");
            false
        }
    })
}

/// Detect dependency cycles with a white/gray/black DFS over the snapshot.
/// Returns the set of task ids sitting on at least one cycle.
pub fn detect_cycles(tasks: &[Task]) -> BTreeSet<String> {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Gray,
        Black,
    }

    let by_id: BTreeMap<&str, &Task> = tasks.iter().map(|t| (t.id.as_str(), t)).collect();
    let mut colors: BTreeMap<&str, Color> =
        tasks.iter().map(|t| (t.id.as_str(), Color::White)).collect();
    let mut on_cycle: BTreeSet<String> = BTreeSet::new();

    fn visit<'a>(
        id: &'a str,
        by_id: &BTreeMap<&'a str, &'a Task>,
        colors: &mut BTreeMap<&'a str, Color>,
        stack: &mut Vec<&'a str>,
        on_cycle: &mut BTreeSet<String>,
    ) {
        colors.insert(id, Color::Gray);
        stack.push(id);

        if let Some(task) = by_id.get(id) {
            for dep in &task.depends_on {
                let dep = dep.as_str();
                match colors.get(dep) {
                    Some(Color::White) => visit(dep, by_id, colors, stack, on_cycle),
                    Some(Color::Gray) => {
                        // Every node from the back-edge target onward is on the cycle
                        if let Some(pos) = stack.iter().position(|s| *s == dep) {
                            for member in &stack[pos..] {
                                on_cycle.insert((*member).to_string());
                            }
                        }
                    }
                    _ => {}
                }
            }
        }

        stack.pop();
        colors.insert(id, Color::Black);
    }

    let ids: Vec<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
    for id in ids {
        if colors.get(id) == Some(&Color::White) {
            let mut stack = Vec::new();
            visit(id, &by_id, &mut colors, &mut stack, &mut on_cycle);
        }
    }
    on_cycle
}
