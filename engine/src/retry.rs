//! Spawn failure classification and the blocked-retry guard.
//!
//! Executor failures fall into four classes with very different handling:
//! permanent ones deadletter immediately, rate limits and transient faults
//! go through jittered exponential backoff, and platform concurrency limits
//! decay the scheduler's effective cap without penalizing the task.

use aof_core::{ExecutorResult, Task};
use chrono::{DateTime, Duration, Utc};
use rand::Rng;

/// Substrings identifying errors that will never succeed on retry
const PERMANENT_MARKERS: &[&str] = &[
    "agent not found",
    "permission denied",
    "forbidden",
    "unauthorized",
    "no such agent",
    "agent deregistered",
];

/// Substrings identifying rate limiting by the dispatch platform
const RATE_LIMIT_MARKERS: &[&str] = &[
    "rate limit",
    "429",
    "too many requests",
    "throttled",
    "quota exceeded",
];

/// Classification of one failed spawn attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnErrorClass {
    /// Never retry; deadletter immediately
    Permanent,
    /// Retry after backoff
    RateLimited,
    /// Platform refused for concurrency; the value is its detected cap
    PlatformLimit(u32),
    /// Anything else; retry after backoff with a retry budget
    Transient,
}

impl SpawnErrorClass {
    /// The `metadata.errorClass` value recorded for this class
    pub fn as_str(&self) -> &'static str {
        match self {
            SpawnErrorClass::Permanent => "permanent",
            SpawnErrorClass::RateLimited => "rate_limited",
            SpawnErrorClass::PlatformLimit(_) => "platform_limit",
            SpawnErrorClass::Transient => "transient",
        }
    }
}

/// Classify a failed [`ExecutorResult`]. An explicit `platform_limit` hint
/// wins; otherwise the error text is matched case-insensitively against the
/// marker tables, with a fallback parse of "max active children (N/M)"
/// style messages.
pub fn classify_spawn_error(result: &ExecutorResult) -> SpawnErrorClass {
    if let Some(limit) = result.platform_limit {
        return SpawnErrorClass::PlatformLimit(limit);
    }

    let error = result.error.as_deref().unwrap_or("").to_lowercase();

    if PERMANENT_MARKERS.iter().any(|m| error.contains(m)) {
        return SpawnErrorClass::Permanent;
    }
    if RATE_LIMIT_MARKERS.iter().any(|m| error.contains(m)) {
        return SpawnErrorClass::RateLimited;
    }
    if error.contains("max active children") {
        if let Some(limit) = parse_children_cap(&error) {
            return SpawnErrorClass::PlatformLimit(limit);
        }
    }

    SpawnErrorClass::Transient
}

/// Parse the cap out of "... (N/M)"; M is the platform's ceiling
fn parse_children_cap(error: &str) -> Option<u32> {
    let open = error.rfind('(')?;
    let close = error[open..].find(')')? + open;
    let inside = &error[open + 1..close];
    let (_, cap) = inside.split_once('/')?;
    cap.trim().parse().ok()
}

/// Uniform jitter source in `[-1, 1]`, pluggable for deterministic tests
pub trait Jitter: Send + Sync {
    fn sample(&self) -> f64;
}

/// Default jitter backed by the thread-local RNG
pub struct ThreadRngJitter;

impl Jitter for ThreadRngJitter {
    fn sample(&self) -> f64 {
        rand::thread_rng().gen_range(-1.0..=1.0)
    }
}

/// Fixed jitter for tests; `FixedJitter(0.0)` disables jitter entirely
pub struct FixedJitter(pub f64);

impl Jitter for FixedJitter {
    fn sample(&self) -> f64 {
        self.0
    }
}

/// Exponential backoff with jitter and a retry budget.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// First-retry delay
    pub base_ms: u64,
    /// Delay ceiling
    pub ceiling_ms: u64,
    /// Fraction of the delay applied as ± jitter
    pub jitter_factor: f64,
    /// Retries before a spawn-failed task deadletters
    pub max_retries: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_ms: 60_000,
            ceiling_ms: 15 * 60 * 1000,
            jitter_factor: 0.25,
            max_retries: 3,
        }
    }
}

impl BackoffPolicy {
    /// `min(base × 3^retry_count, ceiling) ± jitter_factor × delay`
    pub fn delay_ms(&self, retry_count: u32, jitter: &dyn Jitter) -> u64 {
        let exp = 3u64.saturating_pow(retry_count.min(20));
        let raw = self.base_ms.saturating_mul(exp).min(self.ceiling_ms);
        let jittered = raw as f64 * (1.0 + self.jitter_factor * jitter.sample());
        jittered.max(0.0) as u64
    }
}

/// Recommendation of the spawn-failed recovery guard
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Backoff has elapsed and retries remain
    Requeue,
    /// Permanent failure or retry budget exhausted
    Deadletter { reason: String },
    /// Backoff still running; check again next poll
    Hold,
}

/// Decide what to do with a `blocked` task carrying a `spawn_failed`
/// reason.
pub fn spawn_retry_guard(
    task: &Task,
    policy: &BackoffPolicy,
    jitter: &dyn Jitter,
    now: DateTime<Utc>,
) -> RetryDecision {
    if task.error_class() == Some("permanent") {
        return RetryDecision::Deadletter {
            reason: "permanent spawn failure".to_string(),
        };
    }

    let retry_count = task.retry_count();
    if retry_count >= policy.max_retries {
        return RetryDecision::Deadletter {
            reason: format!("retry budget exhausted after {retry_count} attempts"),
        };
    }

    let delay = Duration::milliseconds(policy.delay_ms(retry_count, jitter) as i64);
    match task.last_blocked_at() {
        // No record of when the block happened; do not hold forever
        None => RetryDecision::Requeue,
        Some(blocked_at) if now - blocked_at >= delay => RetryDecision::Requeue,
        Some(_) => RetryDecision::Hold,
    }
}
