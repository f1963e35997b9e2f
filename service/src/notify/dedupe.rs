//! Duplicate suppression keyed on `(taskId, eventType)`.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

/// Remembers when each `(taskId, eventType)` key was last routed.
pub struct DedupeCache {
    default_window_ms: u64,
    last_routed: HashMap<(String, String), DateTime<Utc>>,
}

impl DedupeCache {
    pub fn new(default_window_ms: u64) -> Self {
        Self {
            default_window_ms,
            last_routed: HashMap::new(),
        }
    }

    /// Decide whether this occurrence may be routed, recording it if so.
    /// `never_suppress` bypasses the window entirely.
    pub fn check_and_record(
        &mut self,
        task_id: Option<&str>,
        event_type: &str,
        window_ms: Option<u64>,
        never_suppress: bool,
        now: DateTime<Utc>,
    ) -> bool {
        if never_suppress {
            return true;
        }

        let key = (
            task_id.unwrap_or("").to_string(),
            event_type.to_string(),
        );
        let window = Duration::milliseconds(window_ms.unwrap_or(self.default_window_ms) as i64);

        match self.last_routed.get(&key) {
            Some(last) if now - *last < window => false,
            _ => {
                self.last_routed.insert(key, now);
                true
            }
        }
    }

    /// Drop entries older than the largest plausible window to bound memory
    pub fn prune(&mut self, now: DateTime<Utc>, max_age_ms: u64) {
        let max_age = Duration::milliseconds(max_age_ms as i64);
        self.last_routed.retain(|_, last| now - *last < max_age);
    }
}
