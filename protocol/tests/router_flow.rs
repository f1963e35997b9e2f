//! Router end-to-end flows against a real on-disk store.

use aof_core::{events, NewTask, Routing, TaskStatus};
use aof_engine::LeaseManager;
use aof_protocol::{
    CompletionOutcome, Envelope, ProtocolRouter, RouteOutcome, PROTOCOL_NAME, PROTOCOL_VERSION,
};
use aof_store::{EventLogger, EventQuery, TaskStore, TransitionCtx};
use chrono::{Duration, Utc};
use mocks::review_workflow;
use std::sync::Arc;
use tempfile::TempDir;

struct Harness {
    _dir: TempDir,
    store: Arc<TaskStore>,
    logger: Arc<EventLogger>,
    router: ProtocolRouter,
}

async fn harness() -> Harness {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(TaskStore::open(dir.path()).await.unwrap());
    let logger = Arc::new(EventLogger::new(dir.path().join("events")).unwrap());
    let router = ProtocolRouter::new(store.clone(), logger.clone(), Some(review_workflow()));
    Harness {
        _dir: dir,
        store,
        logger,
        router,
    }
}

/// Create a task leased to `agent`, in progress
async fn leased_task(h: &Harness, agent: &str) -> String {
    let task = h
        .store
        .create(NewTask {
            project: "demo".to_string(),
            title: "assigned work".to_string(),
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
    LeaseManager::new(h.store.clone(), 600_000)
        .acquire(&task.id, agent, None)
        .await
        .unwrap();
    task.id
}

fn envelope(task_id: &str, from: &str, message_type: &str, payload: serde_json::Value) -> Envelope {
    Envelope {
        protocol: PROTOCOL_NAME.to_string(),
        version: PROTOCOL_VERSION,
        project_id: "demo".to_string(),
        task_relpath: None,
        task_id: task_id.to_string(),
        from_agent: from.to_string(),
        to_agent: "orchestrator".to_string(),
        sent_at: Utc::now(),
        message_type: message_type.to_string(),
        payload,
    }
}

#[tokio::test]
async fn unauthorized_agent_changes_nothing() {
    let h = harness().await;
    let id = leased_task(&h, "agent-a").await;

    let report = envelope(
        &id,
        "agent-b",
        "completion.report",
        serde_json::json!({"outcome": "done", "summaryRef": "all finished"}),
    );
    let outcome = h.router.route(report).await.unwrap();
    assert_eq!(
        outcome,
        RouteOutcome::Rejected {
            reason: "unauthorized_agent".to_string()
        }
    );

    // No status change
    let task = h.store.get(&id).await.unwrap();
    assert_eq!(task.status, TaskStatus::InProgress);

    let rejections = h
        .logger
        .query(&EventQuery {
            event_type: Some(events::PROTOCOL_MESSAGE_REJECTED.to_string()),
            ..EventQuery::default()
        })
        .unwrap();
    assert_eq!(rejections.len(), 1);
    assert_eq!(rejections[0].payload["reason"], "unauthorized_agent");
    assert_eq!(rejections[0].payload["expected"], "agent-a");
    assert_eq!(rejections[0].payload["received"], "agent-b");

    // No received event for a rejected message
    let received = h
        .logger
        .query(&EventQuery {
            event_type: Some(events::PROTOCOL_MESSAGE_RECEIVED.to_string()),
            ..EventQuery::default()
        })
        .unwrap();
    assert!(received.is_empty());
}

#[tokio::test]
async fn unassigned_task_rejects() {
    let h = harness().await;
    let task = h
        .store
        .create(NewTask {
            project: "demo".to_string(),
            title: "unrouted".to_string(),
            ..NewTask::default()
        })
        .await
        .unwrap();

    let outcome = h
        .router
        .route(envelope(
            &task.id,
            "anyone",
            "status.update",
            serde_json::json!({"progress": "hello"}),
        ))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        RouteOutcome::Rejected {
            reason: "unassigned_task".to_string()
        }
    );
}

#[tokio::test]
async fn completion_done_without_gate_walks_review_to_done() {
    let h = harness().await;
    let id = leased_task(&h, "agent-a").await;

    let outcome = h
        .router
        .route(envelope(
            &id,
            "agent-a",
            "completion.report",
            serde_json::json!({
                "outcome": "done",
                "summaryRef": "implemented and verified",
                "deliverables": ["src/lib.rs", "tests/smoke.rs"],
                "testReport": {"total": 10, "passed": 10, "failed": 0}
            }),
        ))
        .await
        .unwrap();
    assert!(matches!(outcome, RouteOutcome::Applied { .. }));

    let task = h.store.get(&id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Done);
    assert!(task.lease.is_none());
    assert!(task.body.contains("## Summary"));
    assert!(task.body.contains("implemented and verified"));
    assert!(task.body.contains("## Deliverables"));
    assert!(task.body.contains("- src/lib.rs"));
    assert!(task.body.contains("## Test Report"));
    assert!(task.body.contains("10 total, 10 passed"));
}

#[tokio::test]
async fn completion_done_cascades_to_dependents() {
    let h = harness().await;
    let id = leased_task(&h, "agent-a").await;
    let dependent = h
        .store
        .create(NewTask {
            project: "demo".to_string(),
            title: "downstream".to_string(),
            depends_on: vec![id.clone()],
            ..NewTask::default()
        })
        .await
        .unwrap();

    h.router
        .route(envelope(
            &id,
            "agent-a",
            "completion.report",
            serde_json::json!({"outcome": "done"}),
        ))
        .await
        .unwrap();

    assert_eq!(
        h.store.get(&dependent.id).await.unwrap().status,
        TaskStatus::Ready
    );
}

#[tokio::test]
async fn completion_blocked_joins_blockers_and_cascades() {
    let h = harness().await;
    let id = leased_task(&h, "agent-a").await;
    let dependent = h
        .store
        .create(NewTask {
            project: "demo".to_string(),
            title: "downstream".to_string(),
            depends_on: vec![id.clone()],
            ..NewTask::default()
        })
        .await
        .unwrap();
    h.store
        .transition(&dependent.id, TaskStatus::Ready, TransitionCtx::default())
        .await
        .unwrap();

    h.router
        .route(envelope(
            &id,
            "agent-a",
            "completion.report",
            serde_json::json!({
                "outcome": "blocked",
                "blockers": ["missing credentials", "api quota"]
            }),
        ))
        .await
        .unwrap();

    let task = h.store.get(&id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Blocked);
    assert_eq!(
        task.block_reason(),
        Some("missing credentials; api quota")
    );

    let downstream = h.store.get(&dependent.id).await.unwrap();
    assert_eq!(downstream.status, TaskStatus::Blocked);
    assert!(downstream.block_reason().unwrap().contains("upstream blocked"));
}

#[tokio::test]
async fn completion_partial_keeps_in_progress() {
    let h = harness().await;
    let id = leased_task(&h, "agent-a").await;

    h.router
        .route(envelope(
            &id,
            "agent-a",
            "completion.report",
            serde_json::json!({"outcome": "partial", "notes": "halfway through"}),
        ))
        .await
        .unwrap();

    let task = h.store.get(&id).await.unwrap();
    assert_eq!(task.status, TaskStatus::InProgress);
    assert!(task.lease.is_some());
    assert!(task.body.contains("halfway through"));
}

#[tokio::test]
async fn status_update_appends_work_log_and_drops_illegal_transition() {
    let h = harness().await;
    let id = leased_task(&h, "agent-a").await;

    let outcome = h
        .router
        .route(envelope(
            &id,
            "agent-a",
            "status.update",
            serde_json::json!({
                // in-progress -> done is not an edge; dropped, not an error
                "status": "done",
                "progress": "80% complete",
                "notes": "tricky corner in the parser",
            }),
        ))
        .await
        .unwrap();
    assert!(matches!(outcome, RouteOutcome::Applied { .. }));

    let task = h.store.get(&id).await.unwrap();
    assert_eq!(task.status, TaskStatus::InProgress);
    assert!(task.body.contains("## Work Log"));
    assert!(task.body.contains("Progress: 80% complete"));
    assert!(task.body.contains("Notes: tricky corner in the parser"));
}

#[tokio::test]
async fn workflow_completion_advances_gate_and_stays_in_progress() {
    let h = harness().await;
    let id = leased_task(&h, "agent-a").await;
    h.store
        .update_with(&id, |t| {
            t.gate = Some(aof_core::GateState {
                current: "design".to_string(),
                entered: Utc::now(),
            });
            t.routing.workflow = Some("feature".to_string());
        })
        .await
        .unwrap();

    let outcome = h
        .router
        .route(envelope(
            &id,
            "agent-a",
            "completion.report",
            serde_json::json!({"outcome": "done", "summaryRef": "design ready"}),
        ))
        .await
        .unwrap();
    match outcome {
        RouteOutcome::Applied { detail, .. } => assert!(detail.contains("build"), "{detail}"),
        other => panic!("unexpected outcome {other:?}"),
    }

    let task = h.store.get(&id).await.unwrap();
    assert_eq!(task.status, TaskStatus::InProgress);
    assert_eq!(task.gate.as_ref().unwrap().current, "build");
    assert_eq!(task.routing.role.as_deref(), Some("swe"));
    assert_eq!(task.gate_history.len(), 1);
}

#[tokio::test]
async fn workflow_needs_review_rejects_to_origin_and_requeues() {
    let h = harness().await;
    let id = leased_task(&h, "qa-agent").await;
    h.store
        .update_with(&id, |t| {
            t.gate = Some(aof_core::GateState {
                current: "review".to_string(),
                entered: Utc::now(),
            });
            t.gate_history.push(aof_core::GateHistoryEntry {
                gate: "design".to_string(),
                role: Some("architect".to_string()),
                outcome: aof_core::GateOutcome::Complete,
                at: Utc::now(),
                summary: None,
            });
            t.routing.workflow = Some("feature".to_string());
        })
        .await
        .unwrap();

    h.router
        .route(envelope(
            &id,
            "qa-agent",
            "completion.report",
            serde_json::json!({"outcome": "needs_review", "notes": "tests missing"}),
        ))
        .await
        .unwrap();

    let task = h.store.get(&id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Ready);
    assert!(task.lease.is_none());
    assert_eq!(task.gate.as_ref().unwrap().current, "design");
    assert_eq!(task.routing.role.as_deref(), Some("architect"));
    assert_eq!(
        task.review_context.as_ref().unwrap().feedback,
        "tests missing"
    );
}

#[tokio::test]
async fn handoff_request_creates_routed_subtask() {
    let h = harness().await;
    let id = leased_task(&h, "agent-a").await;

    let mut request = envelope(
        &id,
        "agent-a",
        "handoff.request",
        serde_json::json!({
            "title": "Write the migration",
            "reason": "needs SQL expertise",
            "acceptance": ["migration applies cleanly"],
            "deliverables": ["migrations/0007.sql"]
        }),
    );
    request.to_agent = "swe-backend".to_string();

    let outcome = h.router.route(request).await.unwrap();
    assert!(matches!(outcome, RouteOutcome::Applied { .. }));

    let tasks = h.store.list().await.unwrap();
    let subtask = tasks
        .iter()
        .find(|t| t.parent_id.as_deref() == Some(id.as_str()))
        .expect("subtask created");
    assert_eq!(subtask.id, format!("{id}-01"));
    assert_eq!(subtask.routing.agent.as_deref(), Some("swe-backend"));
    assert_eq!(subtask.status, TaskStatus::Backlog);
    assert!(subtask.body.contains("needs SQL expertise"));

    let delegation = h
        .logger
        .query(&EventQuery {
            event_type: Some(events::DELEGATION_REQUESTED.to_string()),
            ..EventQuery::default()
        })
        .unwrap();
    assert_eq!(delegation.len(), 1);
    assert_eq!(delegation[0].payload["toAgent"], "swe-backend");
}

#[tokio::test]
async fn handoff_rejected_unroutes_task() {
    let h = harness().await;
    let task = h
        .store
        .create(NewTask {
            project: "demo".to_string(),
            title: "delegated".to_string(),
            routing: Routing {
                agent: Some("swe-backend".to_string()),
                ..Routing::default()
            },
            ..NewTask::default()
        })
        .await
        .unwrap();

    h.router
        .route(envelope(
            &task.id,
            "swe-backend",
            "handoff.rejected",
            serde_json::json!({"reason": "out of my depth"}),
        ))
        .await
        .unwrap();

    let updated = h.store.get(&task.id).await.unwrap();
    assert!(updated.routing.agent.is_none());
    assert!(updated.body.contains("handoff rejected: out of my depth"));
}

#[tokio::test]
async fn unknown_type_and_invalid_payload() {
    let h = harness().await;
    let id = leased_task(&h, "agent-a").await;

    let outcome = h
        .router
        .route(envelope(&id, "agent-a", "telemetry.ping", serde_json::json!({})))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        RouteOutcome::Unknown {
            message_type: "telemetry.ping".to_string()
        }
    );

    let unknown = h
        .logger
        .query(&EventQuery {
            event_type: Some(events::PROTOCOL_MESSAGE_UNKNOWN.to_string()),
            ..EventQuery::default()
        })
        .unwrap();
    assert_eq!(unknown.len(), 1);

    // Oversized payload is rejected, not applied
    let outcome = h
        .router
        .route(envelope(
            &id,
            "agent-a",
            "completion.report",
            serde_json::json!({"outcome": "done", "notes": "n".repeat(10_001)}),
        ))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        RouteOutcome::Rejected {
            reason: "invalid_payload".to_string()
        }
    );
    assert_eq!(h.store.get(&id).await.unwrap().status, TaskStatus::InProgress);
}

#[tokio::test]
async fn route_value_accepts_wire_and_wrapped_shapes() {
    let h = harness().await;
    let id = leased_task(&h, "agent-a").await;

    let e = envelope(
        &id,
        "agent-a",
        "status.update",
        serde_json::json!({"progress": "kicking off"}),
    );
    let wire = e.to_wire().unwrap();

    let outcome = h
        .router
        .route_value(&serde_json::json!({"message": wire}))
        .await
        .unwrap();
    assert!(matches!(outcome, RouteOutcome::Applied { .. }));

    // Garbage input rejects with an event, no error
    let outcome = h
        .router
        .route_value(&serde_json::json!({"payload": "AOF/1 {not json"}))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        RouteOutcome::Rejected {
            reason: "invalid_envelope".to_string()
        }
    );
}

#[tokio::test]
async fn status_update_with_legal_transition_applies() {
    let h = harness().await;
    let id = leased_task(&h, "agent-a").await;

    h.router
        .route(envelope(
            &id,
            "agent-a",
            "status.update",
            serde_json::json!({"status": "review", "notes": "ready for eyes"}),
        ))
        .await
        .unwrap();

    let task = h.store.get(&id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Review);
}

#[tokio::test]
async fn expired_lease_still_authorizes_holder() {
    // The lease names the authorized sender even after expiry, until the
    // scheduler reclaims it
    let h = harness().await;
    let id = leased_task(&h, "agent-a").await;
    h.store
        .update_with(&id, |t| {
            if let Some(lease) = t.lease.as_mut() {
                lease.expires_at = Utc::now() - Duration::minutes(1);
            }
        })
        .await
        .unwrap();

    let outcome = h
        .router
        .route(envelope(
            &id,
            "agent-a",
            "completion.report",
            serde_json::json!({"outcome": "done"}),
        ))
        .await
        .unwrap();
    assert!(matches!(outcome, RouteOutcome::Applied { .. }));
    assert_eq!(h.store.get(&id).await.unwrap().status, TaskStatus::Done);
}
