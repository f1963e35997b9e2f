//! The orchestration service: periodic scheduler ticks, event-driven
//! polls, startup/shutdown ceremony, and observer wiring.

use aof_core::{events, Event};
use aof_engine::{ActionOutcome, Scheduler};
use aof_protocol::ProtocolRouter;
use aof_store::{DirLock, EventLogger};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;

use crate::config::OrchestratorConfig;
use crate::notify::NotificationPolicy;

/// Counters exposed by [`OrchestrationService::metrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServiceMetricsSnapshot {
    pub polls_run: u64,
    pub polls_failed: u64,
    pub actions_executed: u64,
    pub notifications_sent: u64,
    pub notification_failures: u64,
}

#[derive(Default)]
struct ServiceMetrics {
    polls_run: AtomicU64,
    polls_failed: AtomicU64,
    actions_executed: AtomicU64,
}

/// Drives the scheduler on a periodic tick plus message-arrival events.
/// Poll failures are observed and counted; they never crash the tick loop.
pub struct OrchestrationService {
    scheduler: Arc<Scheduler>,
    router: Option<Arc<ProtocolRouter>>,
    logger: Arc<EventLogger>,
    policy: Arc<NotificationPolicy>,
    poll_interval_ms: u64,
    lock_dir: Option<PathBuf>,
    poll_notify: Notify,
    shutdown: watch::Sender<bool>,
    runner: Mutex<Option<JoinHandle<()>>>,
    metrics: ServiceMetrics,
}

impl OrchestrationService {
    pub fn new(
        scheduler: Arc<Scheduler>,
        router: Option<Arc<ProtocolRouter>>,
        logger: Arc<EventLogger>,
        policy: Arc<NotificationPolicy>,
        config: &OrchestratorConfig,
    ) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            scheduler,
            router,
            logger,
            policy,
            poll_interval_ms: config.poll_interval_ms,
            lock_dir: config.lock_dir.clone(),
            poll_notify: Notify::new(),
            shutdown,
            runner: Mutex::new(None),
            metrics: ServiceMetrics::default(),
        })
    }

    /// Start the service: wire the notification observer, append
    /// `system.startup`, run one immediate poll, then tick every
    /// `poll_interval_ms` (coalescing message-driven wakeups).
    pub async fn start(self: &Arc<Self>) {
        self.attach_notification_observer();

        self.logger.log(
            events::SYSTEM_STARTUP,
            "system",
            None,
            serde_json::json!({"pollIntervalMs": self.poll_interval_ms}),
        );

        self.run_poll().await;

        let service = self.clone();
        let mut shutdown_rx = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            let interval = std::time::Duration::from_millis(service.poll_interval_ms);
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = service.poll_notify.notified() => {}
                    result = shutdown_rx.changed() => {
                        if result.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
                service.run_poll().await;
                service.policy.flush_due().await;
            }
        });
        *self.runner.lock().await = Some(handle);

        tracing::info!(poll_interval_ms = self.poll_interval_ms, "Orchestration service started");
    }

    /// Stop the tick loop, flush pending notifications, and append
    /// `system.shutdown`.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.runner.lock().await.take() {
            let _ = handle.await;
        }
        self.policy.flush_all().await;
        self.logger.log(
            events::SYSTEM_SHUTDOWN,
            "system",
            None,
            serde_json::json!({"metrics": format!("{:?}", self.metrics_snapshot())}),
        );
        tracing::info!("Orchestration service stopped");
    }

    /// Route an inbound agent message, then request an immediate poll.
    /// Wakeups coalesce: a poll already in flight absorbs the request.
    pub async fn handle_message_received(&self, input: &serde_json::Value) {
        if let Some(router) = &self.router {
            match router.route_value(input).await {
                Ok(outcome) => {
                    tracing::debug!(outcome = ?outcome, "Routed inbound message");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Routing inbound message failed");
                }
            }
        }
        self.poll_notify.notify_one();
    }

    /// Current counter values
    pub fn metrics_snapshot(&self) -> ServiceMetricsSnapshot {
        ServiceMetricsSnapshot {
            polls_run: self.metrics.polls_run.load(Ordering::Relaxed),
            polls_failed: self.metrics.polls_failed.load(Ordering::Relaxed),
            actions_executed: self.metrics.actions_executed.load(Ordering::Relaxed),
            notifications_sent: self.policy.sent_count(),
            notification_failures: self.policy.send_error_count(),
        }
    }

    /// One poll under the cross-process lock (when configured), isolated
    /// so neither errors nor panics escape into the tick loop.
    async fn run_poll(&self) {
        let _lock = match &self.lock_dir {
            Some(lock_dir) => {
                let timeout = std::time::Duration::from_millis(self.poll_interval_ms);
                match DirLock::acquire(lock_dir, "scheduler", timeout).await {
                    Ok(lock) => Some(lock),
                    Err(e) => {
                        tracing::warn!(error = %e, "Skipping poll: scheduler lock unavailable");
                        self.metrics.polls_failed.fetch_add(1, Ordering::Relaxed);
                        return;
                    }
                }
            }
            None => None,
        };

        let scheduler = self.scheduler.clone();
        let joined = tokio::spawn(async move { scheduler.poll().await }).await;

        match joined {
            Ok(Ok(result)) => {
                self.metrics.polls_run.fetch_add(1, Ordering::Relaxed);
                let executed = result
                    .actions
                    .iter()
                    .filter(|a| a.outcome == ActionOutcome::Executed)
                    .count() as u64;
                self.metrics
                    .actions_executed
                    .fetch_add(executed, Ordering::Relaxed);
                tracing::debug!(
                    actions = result.actions.len(),
                    executed,
                    duration_ms = result.duration_ms,
                    "Poll completed"
                );
            }
            Ok(Err(e)) => {
                self.metrics.polls_failed.fetch_add(1, Ordering::Relaxed);
                tracing::error!(error = %e, "Poll failed");
                self.logger.log(
                    events::POLL_FAILED,
                    "system",
                    None,
                    serde_json::json!({"error": e.to_string()}),
                );
            }
            Err(join_error) => {
                self.metrics.polls_failed.fetch_add(1, Ordering::Relaxed);
                tracing::error!(error = %join_error, "Poll panicked");
                self.logger.log(
                    events::POLL_FAILED,
                    "system",
                    None,
                    serde_json::json!({"error": format!("panic: {join_error}")}),
                );
            }
        }
    }

    /// Forward appended events into the notification pipeline without
    /// blocking the (synchronous) logger fan-out.
    fn attach_notification_observer(self: &Arc<Self>) {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Event>();
        self.logger.subscribe(Box::new(move |event| {
            let _ = tx.send(event.clone());
        }));

        let policy = self.policy.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                policy.handle(&event).await;
            }
        });
    }
}
