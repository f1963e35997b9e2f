//! End-to-end scheduler poll scenarios against a real on-disk store.

use aof_core::{events, ExecutorResult, GateState, Lease, NewTask, Priority, Routing, Sla};
use aof_core::{SlaViolationPolicy, TaskStatus};
use aof_engine::{DependencyCascader, LeaseManager, Scheduler, SchedulerConfig};
use aof_store::{EventLogger, EventQuery, TaskStore, TransitionCtx};
use chrono::{Duration, Utc};
use mocks::{review_workflow, standard_org_chart, MockExecutor};
use std::sync::Arc;
use tempfile::TempDir;

struct Harness {
    _dir: TempDir,
    store: Arc<TaskStore>,
    logger: Arc<EventLogger>,
    executor: Arc<MockExecutor>,
    scheduler: Scheduler,
}

async fn harness(configure: impl FnOnce(&mut SchedulerConfig)) -> Harness {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(TaskStore::open(dir.path()).await.unwrap());
    let logger = Arc::new(EventLogger::new(dir.path().join("events")).unwrap());
    let executor = Arc::new(MockExecutor::succeeding());

    let mut config = SchedulerConfig {
        project_id: "demo".to_string(),
        ..SchedulerConfig::default()
    };
    configure(&mut config);

    let scheduler = Scheduler::new(
        store.clone(),
        logger.clone(),
        executor.clone(),
        standard_org_chart(),
        Some(review_workflow()),
        config,
    );

    Harness {
        _dir: dir,
        store,
        logger,
        executor,
        scheduler,
    }
}

async fn create_ready(h: &Harness, title: &str, agent: &str) -> String {
    let task = h
        .store
        .create(NewTask {
            project: "demo".to_string(),
            title: title.to_string(),
            routing: Routing {
                agent: Some(agent.to_string()),
                ..Routing::default()
            },
            ..NewTask::default()
        })
        .await
        .unwrap();
    h.store
        .transition(&task.id, TaskStatus::Ready, TransitionCtx::default())
        .await
        .unwrap();
    task.id
}

fn event_types_for(h: &Harness, task_id: &str) -> Vec<String> {
    h.logger
        .query(&EventQuery {
            task_id: Some(task_id.to_string()),
            ..EventQuery::default()
        })
        .unwrap()
        .into_iter()
        .map(|e| e.event_type)
        .collect()
}

#[tokio::test]
async fn dispatch_happy_path() {
    let h = harness(|_| {}).await;
    let id = create_ready(&h, "T1", "swe-backend").await;

    let result = h.scheduler.poll().await.unwrap();
    assert!(!result.dry_run);

    let task = h.store.get(&id).await.unwrap();
    assert_eq!(task.status, TaskStatus::InProgress);
    let lease = task.lease.expect("lease present");
    assert_eq!(lease.agent, "swe-backend");

    let types = event_types_for(&h, &id);
    assert_eq!(
        types,
        vec![
            events::ACTION_STARTED,
            events::DISPATCH_MATCHED,
            events::TASK_ASSIGNED,
            events::TASK_TRANSITIONED,
            events::ACTION_COMPLETED,
        ]
    );

    let transition = h
        .logger
        .query(&EventQuery {
            event_type: Some(events::TASK_TRANSITIONED.to_string()),
            task_id: Some(id.clone()),
            ..EventQuery::default()
        })
        .unwrap();
    assert_eq!(transition[0].payload["from"], "ready");
    assert_eq!(transition[0].payload["to"], "in-progress");

    // Executor saw the canonical file path and project scope
    let calls = h.executor.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].agent, "swe-backend");
    assert_eq!(calls[0].project_id, "demo");
    assert!(calls[0].task_relpath.contains(&id));
}

#[tokio::test]
async fn lease_expiry_recovery() {
    let h = harness(|_| {}).await;
    let id = create_ready(&h, "T2", "swe-backend").await;

    let leases = LeaseManager::new(h.store.clone(), 1);
    leases.acquire(&id, "swe-backend", Some(1)).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    let result = h.scheduler.poll().await.unwrap();
    let expired: Vec<_> = result
        .actions
        .iter()
        .filter(|a| a.action.kind == aof_engine::ActionKind::ExpireLease)
        .collect();
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].action.task_id, id);

    let task = h.store.get(&id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Ready);
    assert!(task.lease.is_none());

    let types = event_types_for(&h, &id);
    assert!(types.contains(&events::LEASE_EXPIRED.to_string()));
}

#[tokio::test]
async fn dependency_cascade_promotes_then_assigns() {
    let h = harness(|_| {}).await;

    let a = h
        .store
        .create(NewTask {
            project: "demo".to_string(),
            title: "T_A".to_string(),
            routing: Routing {
                agent: Some("swe-backend".to_string()),
                ..Routing::default()
            },
            ..NewTask::default()
        })
        .await
        .unwrap();
    let b = h
        .store
        .create(NewTask {
            project: "demo".to_string(),
            title: "T_B".to_string(),
            routing: Routing {
                agent: Some("swe-frontend".to_string()),
                ..Routing::default()
            },
            depends_on: vec![a.id.clone()],
            ..NewTask::default()
        })
        .await
        .unwrap();

    // First poll: only T_A is promoted (and then assigned on the next poll)
    h.scheduler.poll().await.unwrap();
    assert_eq!(h.store.get(&a.id).await.unwrap().status, TaskStatus::Ready);
    assert_eq!(h.store.get(&b.id).await.unwrap().status, TaskStatus::Backlog);

    // Drive T_A to done through the status machine
    h.store
        .transition_with(&a.id, TaskStatus::InProgress, TransitionCtx::default(), |t| {
            t.lease = Some(Lease {
                agent: "swe-backend".to_string(),
                acquired_at: Utc::now(),
                expires_at: Utc::now() + Duration::minutes(10),
                renew_count: 0,
            });
        })
        .await
        .unwrap();
    h.store
        .transition(&a.id, TaskStatus::Review, TransitionCtx::default())
        .await
        .unwrap();
    h.store
        .transition(&a.id, TaskStatus::Done, TransitionCtx::default())
        .await
        .unwrap();

    let cascader = DependencyCascader::new(h.store.clone(), h.logger.clone());
    let outcome = cascader.on_completed(&a.id).await.unwrap();
    assert_eq!(outcome.promoted, vec![b.id.clone()]);

    let cascaded = h
        .logger
        .query(&EventQuery {
            event_type: Some(events::DEPENDENCY_CASCADED.to_string()),
            ..EventQuery::default()
        })
        .unwrap();
    assert_eq!(cascaded.len(), 1);
    assert_eq!(cascaded[0].payload["action"], "promote");
    assert_eq!(cascaded[0].payload["trigger"], a.id);
    assert_eq!(cascaded[0].payload["count"], 1);

    // Next poll assigns the promoted dependent
    h.scheduler.poll().await.unwrap();
    let task_b = h.store.get(&b.id).await.unwrap();
    assert_eq!(task_b.status, TaskStatus::InProgress);
    assert_eq!(task_b.lease.unwrap().agent, "swe-frontend");
}

#[tokio::test]
async fn platform_limit_throttles_without_penalty() {
    let h = harness(|c| c.max_concurrent_dispatches = 3).await;
    let first = create_ready(&h, "one", "swe-backend").await;
    let second = create_ready(&h, "two", "swe-frontend").await;

    let limit_result = ExecutorResult {
        success: false,
        session_id: None,
        error: Some("max active children for this session (1/1)".to_string()),
        platform_limit: Some(1),
    };
    h.executor.push_result(limit_result.clone());
    h.executor.push_result(limit_result);

    h.scheduler.poll().await.unwrap();

    // Both tasks remain ready with no retry penalty
    for id in [&first, &second] {
        let task = h.store.get(id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Ready);
        assert_eq!(task.retry_count(), 0);
    }

    // Exactly one cap-decay event, and at most one further attempt after
    // the first hit
    let limit_events = h
        .logger
        .query(&EventQuery {
            event_type: Some(events::CONCURRENCY_PLATFORM_LIMIT.to_string()),
            ..EventQuery::default()
        })
        .unwrap();
    assert_eq!(limit_events.len(), 1);
    assert_eq!(limit_events[0].payload["detectedLimit"], 1);
    assert_eq!(limit_events[0].payload["effectiveCap"], 1);
    assert_eq!(limit_events[0].payload["previousCap"], 3);
    assert!(h.executor.call_count() <= 2);

    // The lowered cap persists into the next poll
    h.scheduler.poll().await.unwrap();
    let assigned = h
        .store
        .list()
        .await
        .unwrap()
        .into_iter()
        .filter(|t| t.status == TaskStatus::InProgress)
        .count();
    assert!(assigned <= 1);
}

#[tokio::test]
async fn gate_timeout_escalates_to_configured_role() {
    let h = harness(|_| {}).await;
    let id = create_ready(&h, "gated", "qa-agent").await;

    // Sitting at the review gate for two hours with a live lease
    h.store
        .transition_with(&id, TaskStatus::InProgress, TransitionCtx::default(), |t| {
            t.lease = Some(Lease {
                agent: "qa-agent".to_string(),
                acquired_at: Utc::now(),
                expires_at: Utc::now() + Duration::hours(8),
                renew_count: 0,
            });
            t.gate = Some(GateState {
                current: "review".to_string(),
                entered: Utc::now() - Duration::hours(2),
            });
            t.routing.role = Some("qa".to_string());
        })
        .await
        .unwrap();

    h.scheduler.poll().await.unwrap();

    let task = h.store.get(&id).await.unwrap();
    assert_eq!(task.routing.role.as_deref(), Some("pm"));
    let last = task.gate_history.last().unwrap();
    assert_eq!(last.outcome, aof_core::GateOutcome::Blocked);
    assert!(last.summary.as_deref().unwrap().contains("Timeout exceeded"));

    let escalations = h
        .logger
        .query(&EventQuery {
            event_type: Some(events::GATE_TIMEOUT_ESCALATION.to_string()),
            ..EventQuery::default()
        })
        .unwrap();
    assert_eq!(escalations.len(), 1);
    assert_eq!(escalations[0].payload["fromRole"], "qa");
    assert_eq!(escalations[0].payload["toRole"], "pm");
}

#[tokio::test]
async fn dry_run_plans_without_mutating() {
    let h = harness(|c| c.dry_run = true).await;
    let id = create_ready(&h, "dry", "swe-backend").await;

    let result = h.scheduler.poll().await.unwrap();
    assert!(result.dry_run);
    assert!(result
        .actions
        .iter()
        .any(|a| a.action.kind == aof_engine::ActionKind::Assign));
    assert!(result
        .actions
        .iter()
        .all(|a| matches!(a.outcome, aof_engine::ActionOutcome::Skipped { .. })));

    // No executor calls, no mutations, one synthetic poll marker
    assert_eq!(h.executor.call_count(), 0);
    assert_eq!(h.store.get(&id).await.unwrap().status, TaskStatus::Ready);
    let all_events = h.logger.query(&EventQuery::default()).unwrap();
    assert_eq!(all_events.len(), 1);
    assert_eq!(all_events[0].event_type, events::SCHEDULER_POLL);
    assert_eq!(all_events[0].payload["dryRun"], true);
}

#[tokio::test]
async fn permanent_spawn_failure_deadletters_immediately() {
    let h = harness(|_| {}).await;
    let id = create_ready(&h, "doomed", "swe-backend").await;
    h.executor
        .push_result(ExecutorResult::failed("no such agent: swe-backend"));

    h.scheduler.poll().await.unwrap();

    let task = h.store.get(&id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Deadletter);
    assert_eq!(task.error_class(), Some("permanent"));
    assert_eq!(task.retry_count(), 0);
}

#[tokio::test]
async fn transient_spawn_failure_blocks_with_retry_budget() {
    let h = harness(|_| {}).await;
    let id = create_ready(&h, "flaky", "swe-backend").await;
    h.executor
        .push_result(ExecutorResult::failed("connection reset by peer"));

    h.scheduler.poll().await.unwrap();

    let task = h.store.get(&id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Blocked);
    assert_eq!(task.retry_count(), 1);
    assert_eq!(task.error_class(), Some("transient"));
    assert!(task.block_reason().unwrap().contains("spawn_failed"));

    // Backoff has not elapsed: the next poll holds the task
    h.scheduler.poll().await.unwrap();
    assert_eq!(h.store.get(&id).await.unwrap().status, TaskStatus::Blocked);
}

#[tokio::test]
async fn shared_resource_serializes_dispatch() {
    let h = harness(|_| {}).await;
    for title in ["first", "second"] {
        let task = h
            .store
            .create(NewTask {
                project: "demo".to_string(),
                title: title.to_string(),
                routing: Routing {
                    agent: Some("swe-backend".to_string()),
                    ..Routing::default()
                },
                resource: Some("db-migrations".to_string()),
                ..NewTask::default()
            })
            .await
            .unwrap();
        h.store
            .transition(&task.id, TaskStatus::Ready, TransitionCtx::default())
            .await
            .unwrap();
    }

    h.scheduler.poll().await.unwrap();

    let tasks = h.store.list().await.unwrap();
    let in_progress = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::InProgress)
        .count();
    let ready = tasks.iter().filter(|t| t.status == TaskStatus::Ready).count();
    assert_eq!(in_progress, 1);
    assert_eq!(ready, 1);
}

#[tokio::test]
async fn priority_orders_dispatch() {
    let h = harness(|c| c.max_dispatches_per_poll = Some(1)).await;

    let low = h
        .store
        .create(NewTask {
            project: "demo".to_string(),
            title: "low".to_string(),
            priority: Priority::Low,
            routing: Routing {
                agent: Some("swe-backend".to_string()),
                ..Routing::default()
            },
            ..NewTask::default()
        })
        .await
        .unwrap();
    h.store
        .transition(&low.id, TaskStatus::Ready, TransitionCtx::default())
        .await
        .unwrap();

    let critical = h
        .store
        .create(NewTask {
            project: "demo".to_string(),
            title: "critical".to_string(),
            priority: Priority::Critical,
            routing: Routing {
                agent: Some("swe-frontend".to_string()),
                ..Routing::default()
            },
            ..NewTask::default()
        })
        .await
        .unwrap();
    h.store
        .transition(&critical.id, TaskStatus::Ready, TransitionCtx::default())
        .await
        .unwrap();

    h.scheduler.poll().await.unwrap();

    assert_eq!(
        h.store.get(&critical.id).await.unwrap().status,
        TaskStatus::InProgress
    );
    assert_eq!(h.store.get(&low.id).await.unwrap().status, TaskStatus::Ready);
}

#[tokio::test]
async fn sla_violation_alerts_only() {
    let h = harness(|_| {}).await;
    let task = h
        .store
        .create(NewTask {
            project: "demo".to_string(),
            title: "slow".to_string(),
            routing: Routing {
                agent: Some("swe-backend".to_string()),
                ..Routing::default()
            },
            sla: Some(Sla {
                max_in_progress_ms: Some(1),
                on_violation: Some(SlaViolationPolicy::Alert),
            }),
            ..NewTask::default()
        })
        .await
        .unwrap();
    h.store
        .transition(&task.id, TaskStatus::Ready, TransitionCtx::default())
        .await
        .unwrap();
    h.store
        .transition_with(&task.id, TaskStatus::InProgress, TransitionCtx::default(), |t| {
            t.lease = Some(Lease {
                agent: "swe-backend".to_string(),
                acquired_at: Utc::now(),
                expires_at: Utc::now() + Duration::hours(1),
                renew_count: 0,
            });
            t.last_transition_at = Utc::now() - Duration::minutes(5);
        })
        .await
        .unwrap();

    h.scheduler.poll().await.unwrap();

    // Notification only: still in progress, violation event emitted
    assert_eq!(
        h.store.get(&task.id).await.unwrap().status,
        TaskStatus::InProgress
    );
    let violations = h
        .logger
        .query(&EventQuery {
            event_type: Some(events::SLA_VIOLATION.to_string()),
            ..EventQuery::default()
        })
        .unwrap();
    assert_eq!(violations.len(), 1);
    assert_eq!(violations[0].payload["onViolation"], "alert");
}

#[tokio::test]
async fn stuck_ready_task_alerts_and_optionally_blocks() {
    let h = harness(|c| {
        c.stuck_task_threshold_ms = Some(1);
        c.auto_block_stuck_tasks = true;
    })
    .await;
    // Unroutable on purpose so dispatch cannot pick it up first
    let task = h
        .store
        .create(NewTask {
            project: "demo".to_string(),
            title: "stuck".to_string(),
            routing: Routing {
                role: Some("nonexistent-role".to_string()),
                ..Routing::default()
            },
            ..NewTask::default()
        })
        .await
        .unwrap();
    h.store
        .transition(&task.id, TaskStatus::Ready, TransitionCtx::default())
        .await
        .unwrap();
    h.store
        .update_with(&task.id, |t| {
            t.last_transition_at = Utc::now() - Duration::minutes(10);
        })
        .await
        .unwrap();

    h.scheduler.poll().await.unwrap();

    let stuck = h.store.get(&task.id).await.unwrap();
    assert_eq!(stuck.status, TaskStatus::Blocked);
    assert_eq!(stuck.block_reason(), Some("stuck_in_ready"));
    let alerts = h
        .logger
        .query(&EventQuery {
            event_type: Some(events::TASK_STUCK.to_string()),
            ..EventQuery::default()
        })
        .unwrap();
    assert_eq!(alerts.len(), 1);
}

#[tokio::test]
async fn circular_dependencies_block_the_cycle() {
    let h = harness(|_| {}).await;
    let a = h
        .store
        .create(NewTask {
            project: "demo".to_string(),
            title: "a".to_string(),
            routing: Routing {
                agent: Some("swe-backend".to_string()),
                ..Routing::default()
            },
            ..NewTask::default()
        })
        .await
        .unwrap();
    let b = h
        .store
        .create(NewTask {
            project: "demo".to_string(),
            title: "b".to_string(),
            routing: Routing {
                agent: Some("swe-backend".to_string()),
                ..Routing::default()
            },
            depends_on: vec![a.id.clone()],
            ..NewTask::default()
        })
        .await
        .unwrap();
    h.store.add_dep(&a.id, &b.id).await.unwrap();

    h.scheduler.poll().await.unwrap();

    for id in [&a.id, &b.id] {
        let task = h.store.get(id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Blocked);
        assert_eq!(task.block_reason(), Some("circular_dependency"));
    }

    // Breaking the cycle lets the members recover on a later poll
    h.store.remove_dep(&a.id, &b.id).await.unwrap();
    h.scheduler.poll().await.unwrap();
    assert_eq!(h.store.get(&a.id).await.unwrap().status, TaskStatus::Ready);
}
