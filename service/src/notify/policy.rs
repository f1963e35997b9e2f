//! The notification policy: rules in, adapter sends out.

use aof_core::{Event, NotificationAdapter};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::dedupe::DedupeCache;
use super::rules::{RuleSet, Severity};
use super::storm::{OutboundMessage, StormBatcher};
use super::template::render_template;

/// Window for the ambient severity escalation counter
const ESCALATION_WINDOW: Duration = Duration::minutes(10);
/// Repeated failure-ish events for one task past this count escalate
const ESCALATION_THRESHOLD: u32 = 3;

/// A sink that writes notifications to the process log; the default
/// adapter when no external transport is wired in.
#[derive(Default)]
pub struct TracingAdapter;

#[async_trait]
impl NotificationAdapter for TracingAdapter {
    async fn send(&self, channel: &str, message: &str) -> std::io::Result<()> {
        tracing::info!(channel, message, "notification");
        Ok(())
    }
}

struct FailureWindow {
    since: DateTime<Utc>,
    count: u32,
}

/// Transforms events into user-visible messages with deduplication,
/// severity resolution, and storm batching.
pub struct NotificationPolicy {
    rules: RuleSet,
    dedupe: Mutex<DedupeCache>,
    batcher: Mutex<StormBatcher>,
    failures: Mutex<HashMap<String, FailureWindow>>,
    adapter: Arc<dyn NotificationAdapter>,
    send_errors: AtomicU64,
    sent_count: AtomicU64,
}

impl NotificationPolicy {
    pub fn new(
        rules: RuleSet,
        adapter: Arc<dyn NotificationAdapter>,
        dedupe_window_ms: u64,
        storm_window_ms: u64,
        storm_threshold: usize,
    ) -> Self {
        Self {
            rules,
            dedupe: Mutex::new(DedupeCache::new(dedupe_window_ms)),
            batcher: Mutex::new(StormBatcher::new(storm_window_ms, storm_threshold)),
            failures: Mutex::new(HashMap::new()),
            adapter,
            send_errors: AtomicU64::new(0),
            sent_count: AtomicU64::new(0),
        }
    }

    /// Run one event through the pipeline.
    pub async fn handle(&self, event: &Event) {
        let Some(matched) = self.rules.first_match(event) else {
            return;
        };
        let rule = &matched.rule;

        let now = Utc::now();
        let severity = self.resolve_severity(event, rule.severity, now);

        let allowed = self.dedupe.lock().check_and_record(
            event.task_id.as_deref(),
            &event.event_type,
            rule.dedupe_window_ms,
            rule.never_suppress,
            now,
        );
        if !allowed {
            tracing::debug!(
                event_type = %event.event_type,
                task_id = event.task_id.as_deref().unwrap_or(""),
                "Notification suppressed by dedupe window"
            );
            return;
        }

        let message = render_template(&rule.template, event);

        if severity == Severity::Critical {
            // Critical messages bypass batching entirely
            self.send(&rule.channel, &message).await;
        } else {
            let due = self
                .batcher
                .lock()
                .push(&event.event_type, &rule.channel, message, now);
            self.send_all(due).await;
        }
    }

    /// Flush storm windows whose batching interval has elapsed
    pub async fn flush_due(&self) {
        let due = self.batcher.lock().flush_due(Utc::now());
        self.send_all(due).await;
    }

    /// Drain everything (service shutdown)
    pub async fn flush_all(&self) {
        let due = self.batcher.lock().flush_all();
        self.send_all(due).await;
    }

    /// Messages successfully handed to the adapter
    pub fn sent_count(&self) -> u64 {
        self.sent_count.load(Ordering::Relaxed)
    }

    /// Adapter failures observed (never retried, never propagated)
    pub fn send_error_count(&self) -> u64 {
        self.send_errors.load(Ordering::Relaxed)
    }

    /// Base severity, escalated to critical when one task keeps failing
    fn resolve_severity(
        &self,
        event: &Event,
        base: Severity,
        now: DateTime<Utc>,
    ) -> Severity {
        let Some(task_id) = event.task_id.as_deref() else {
            return base;
        };
        let failure_like = event.event_type.contains("failed")
            || event.event_type.contains("expired")
            || event.event_type.contains("rejected")
            || event.event_type.ends_with("deadletter");
        if !failure_like {
            return base;
        }

        let mut failures = self.failures.lock();
        let window = failures
            .entry(task_id.to_string())
            .or_insert(FailureWindow { since: now, count: 0 });
        if now - window.since > ESCALATION_WINDOW {
            window.since = now;
            window.count = 0;
        }
        window.count += 1;

        if window.count >= ESCALATION_THRESHOLD {
            Severity::Critical
        } else {
            base
        }
    }

    async fn send_all(&self, messages: Vec<OutboundMessage>) {
        for m in messages {
            self.send(&m.channel, &m.message).await;
        }
    }

    async fn send(&self, channel: &str, message: &str) {
        match self.adapter.send(channel, message).await {
            Ok(()) => {
                self.sent_count.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.send_errors.fetch_add(1, Ordering::Relaxed);
                tracing::error!(channel, error = %e, "Notification send failed");
            }
        }
    }
}
