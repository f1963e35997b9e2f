//! Exclusive, TTL-bounded assignment of a task to one agent.
//!
//! The lease lives inline in the task file: acquisition sets the lease and
//! performs the `ready → in-progress` transition in one durable write, so a
//! crash can never leave an in-progress task without an owner. Expiry
//! reclamation is the scheduler's job, not this module's.

use aof_core::{AofError, Lease, Result, Task, TaskStatus};
use aof_store::{TaskStore, TransitionCtx};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

/// Default lease TTL: ten minutes
pub const DEFAULT_LEASE_TTL_MS: u64 = 10 * 60 * 1000;

/// Grants, renews, releases, and inspects leases through the task store.
pub struct LeaseManager {
    store: Arc<TaskStore>,
    default_ttl_ms: u64,
}

impl LeaseManager {
    pub fn new(store: Arc<TaskStore>, default_ttl_ms: u64) -> Self {
        Self {
            store,
            default_ttl_ms,
        }
    }

    /// Grant a lease and move the task to `in-progress` in a single write.
    ///
    /// The task must be `ready`; a live lease on it is a conflict. The
    /// `mutate` hook runs inside the same write so callers can record
    /// dispatch context (gate entry, routing snapshot) atomically with the
    /// grant.
    pub async fn acquire_with(
        &self,
        task_id: &str,
        agent: &str,
        ttl_ms: Option<u64>,
        mutate: impl FnOnce(&mut Task),
    ) -> Result<Task> {
        let current = self.store.get(task_id).await?;
        if current.status != TaskStatus::Ready {
            return Err(AofError::invalid_transition(
                current.status,
                TaskStatus::InProgress,
            ));
        }
        if let Some(lease) = &current.lease {
            if lease.is_active(Utc::now()) {
                return Err(AofError::lease_conflict(task_id, lease.agent.clone()));
            }
        }

        let ttl = Duration::milliseconds(ttl_ms.unwrap_or(self.default_ttl_ms) as i64);
        let agent = agent.to_string();
        self.store
            .transition_with(
                task_id,
                TaskStatus::InProgress,
                TransitionCtx {
                    reason: None,
                    agent: Some(agent.clone()),
                },
                move |task| {
                    let now = Utc::now();
                    task.lease = Some(Lease {
                        agent,
                        acquired_at: now,
                        expires_at: now + ttl,
                        renew_count: 0,
                    });
                    mutate(task);
                },
            )
            .await
    }

    /// Grant a lease with no extra dispatch context
    pub async fn acquire(
        &self,
        task_id: &str,
        agent: &str,
        ttl_ms: Option<u64>,
    ) -> Result<Task> {
        self.acquire_with(task_id, agent, ttl_ms, |_| {}).await
    }

    /// Extend the holder's lease by the TTL. Fails when the caller is not
    /// the current holder.
    pub async fn renew(&self, task_id: &str, agent: &str, ttl_ms: Option<u64>) -> Result<Task> {
        let current = self.store.get(task_id).await?;
        self.check_holder(&current, agent)?;

        let ttl = Duration::milliseconds(ttl_ms.unwrap_or(self.default_ttl_ms) as i64);
        self.store
            .update_with(task_id, move |task| {
                if let Some(lease) = task.lease.as_mut() {
                    lease.expires_at = Utc::now() + ttl;
                    lease.renew_count += 1;
                }
            })
            .await
    }

    /// Release the holder's lease; an in-progress task goes back to `ready`.
    pub async fn release(&self, task_id: &str, agent: &str) -> Result<Task> {
        let current = self.store.get(task_id).await?;
        self.check_holder(&current, agent)?;

        if current.status == TaskStatus::InProgress {
            // The ready transition clears the lease
            self.store
                .transition(
                    task_id,
                    TaskStatus::Ready,
                    TransitionCtx {
                        reason: Some("lease released".to_string()),
                        agent: Some(agent.to_string()),
                    },
                )
                .await
        } else {
            self.store
                .update_with(task_id, |task| {
                    task.lease = None;
                })
                .await
        }
    }

    /// `lease != null ∧ now < lease.expiresAt`
    pub fn is_lease_active(lease: Option<&Lease>, now: DateTime<Utc>) -> bool {
        lease.is_some_and(|l| l.is_active(now))
    }

    fn check_holder(&self, task: &Task, agent: &str) -> Result<()> {
        match &task.lease {
            None => Err(AofError::NoLease(task.id.clone())),
            Some(lease) if lease.agent != agent => {
                Err(AofError::lease_conflict(task.id.clone(), lease.agent.clone()))
            }
            Some(_) => Ok(()),
        }
    }
}
