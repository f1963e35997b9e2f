//! Append-only JSONL event journal with synchronous subscriber fan-out.
//!
//! One file per day under `events/`; each line is one canonical JSON event.
//! Event ids are allocated from an in-memory counter seeded at startup from
//! the highest id found in the existing log, and strictly increase within a
//! logger lifetime. Logger failures degrade to stderr logging; they never
//! propagate to callers, so the scheduler and router always make forward
//! progress even when the journal is broken.

use aof_core::{Event, Result};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};

/// Hook invoked synchronously, in logical order, for every appended event
pub type Subscriber = Box<dyn Fn(&Event) + Send + Sync>;

/// Filter for [`EventLogger::query`]
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    /// Exact event type
    pub event_type: Option<String>,
    /// Events at or after this instant
    pub since: Option<DateTime<Utc>>,
    /// Exact actor
    pub actor: Option<String>,
    /// Exact task id
    pub task_id: Option<String>,
    /// Maximum number of events returned
    pub limit: Option<usize>,
}

impl EventQuery {
    fn matches(&self, event: &Event) -> bool {
        if let Some(t) = &self.event_type {
            if event.event_type != *t {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.timestamp < since {
                return false;
            }
        }
        if let Some(actor) = &self.actor {
            if event.actor != *actor {
                return false;
            }
        }
        if let Some(task_id) = &self.task_id {
            if event.task_id.as_deref() != Some(task_id.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Append-only, ordered event journal.
pub struct EventLogger {
    events_dir: PathBuf,
    next_id: Mutex<u64>,
    subscribers: RwLock<Vec<Subscriber>>,
}

impl EventLogger {
    /// Open (or start) the journal under `events_dir`, seeding the id
    /// counter from the highest event id already on disk.
    pub fn new(events_dir: impl Into<PathBuf>) -> Result<Self> {
        let events_dir = events_dir.into();
        std::fs::create_dir_all(&events_dir)?;
        let highest = highest_event_id(&events_dir)?;
        Ok(Self {
            events_dir,
            next_id: Mutex::new(highest + 1),
            subscribers: RwLock::new(Vec::new()),
        })
    }

    /// Register a hook invoked for every event after it is appended.
    /// Subscriber panics are caught and logged; they never reach the caller.
    pub fn subscribe(&self, hook: Subscriber) {
        self.subscribers.write().push(hook);
    }

    /// Construct, append, and fan out one event. Returns the event with its
    /// assigned id. Append failures are logged and swallowed; the id still
    /// advances so ordering stays strict for observers in this process.
    pub fn log(
        &self,
        event_type: &str,
        actor: &str,
        task_id: Option<&str>,
        payload: serde_json::Value,
    ) -> Event {
        let event_id = {
            let mut next = self.next_id.lock();
            let id = *next;
            *next += 1;
            id
        };

        let event = Event {
            event_id,
            event_type: event_type.to_string(),
            timestamp: Utc::now(),
            actor: actor.to_string(),
            task_id: task_id.map(str::to_string),
            payload,
        };

        if let Err(e) = self.append(&event) {
            tracing::error!(
                event_type = %event.event_type,
                event_id = event.event_id,
                error = %e,
                "Failed to append event to journal"
            );
        }

        for hook in self.subscribers.read().iter() {
            if catch_unwind(AssertUnwindSafe(|| hook(&event))).is_err() {
                tracing::error!(
                    event_type = %event.event_type,
                    event_id = event.event_id,
                    "Event subscriber panicked"
                );
            }
        }

        event
    }

    /// Scan the journal files in order and return matching events.
    /// Multi-producer directories are merged by `(timestamp, eventId)`.
    pub fn query(&self, query: &EventQuery) -> Result<Vec<Event>> {
        let mut events = Vec::new();
        for path in journal_files(&self.events_dir)? {
            let file = std::fs::File::open(&path)?;
            for line in BufReader::new(file).lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Event>(&line) {
                    Ok(event) => {
                        if query.matches(&event) {
                            events.push(event);
                        }
                    }
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "Skipping malformed event line");
                    }
                }
            }
        }
        events.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then(a.event_id.cmp(&b.event_id))
        });
        if let Some(limit) = query.limit {
            events.truncate(limit);
        }
        Ok(events)
    }

    /// Directory the journal files live in
    pub fn events_dir(&self) -> &Path {
        &self.events_dir
    }

    fn append(&self, event: &Event) -> Result<()> {
        let line = serde_json::to_string(event)?;
        let path = self.current_file(event.timestamp);
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        // One write per line keeps concurrent readers off torn records
        file.write_all(format!("{line}\n").as_bytes())?;
        Ok(())
    }

    fn current_file(&self, at: DateTime<Utc>) -> PathBuf {
        self.events_dir
            .join(format!("events.{}.jsonl", at.format("%Y-%m-%d")))
    }
}

fn journal_files(events_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(events_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with("events.") && name.ends_with(".jsonl") {
            files.push(entry.path());
        }
    }
    // Date-stamped names sort chronologically
    files.sort();
    Ok(files)
}

fn highest_event_id(events_dir: &Path) -> Result<u64> {
    let mut highest = 0;
    for path in journal_files(events_dir)? {
        let file = std::fs::File::open(&path)?;
        for line in BufReader::new(file).lines() {
            let line = line?;
            if let Ok(event) = serde_json::from_str::<Event>(&line) {
                highest = highest.max(event.event_id);
            }
        }
    }
    Ok(highest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use aof_core::events;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn test_monotonic_ids_and_append_order() {
        let dir = TempDir::new().unwrap();
        let logger = EventLogger::new(dir.path()).unwrap();

        let first = logger.log(events::TASK_CREATED, "test", Some("TASK-2025-06-01-001"), serde_json::json!({}));
        let second = logger.log(events::TASK_TRANSITIONED, "test", None, serde_json::json!({"to": "ready"}));
        assert!(first.event_id < second.event_id);

        let all = logger.query(&EventQuery::default()).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].event_id, first.event_id);
        assert_eq!(all[1].event_id, second.event_id);
    }

    #[test]
    fn test_counter_seeded_from_existing_log() {
        let dir = TempDir::new().unwrap();
        {
            let logger = EventLogger::new(dir.path()).unwrap();
            logger.log(events::TASK_CREATED, "test", None, serde_json::json!({}));
            logger.log(events::TASK_CREATED, "test", None, serde_json::json!({}));
        }

        let reopened = EventLogger::new(dir.path()).unwrap();
        let next = reopened.log(events::TASK_CREATED, "test", None, serde_json::json!({}));
        assert_eq!(next.event_id, 3);
    }

    #[test]
    fn test_query_filters() {
        let dir = TempDir::new().unwrap();
        let logger = EventLogger::new(dir.path()).unwrap();

        logger.log(events::TASK_CREATED, "alice", Some("TASK-2025-06-01-001"), serde_json::json!({}));
        logger.log(events::TASK_CREATED, "bob", Some("TASK-2025-06-01-002"), serde_json::json!({}));
        logger.log(events::LEASE_EXPIRED, "scheduler", Some("TASK-2025-06-01-001"), serde_json::json!({}));

        let by_type = logger
            .query(&EventQuery {
                event_type: Some(events::TASK_CREATED.to_string()),
                ..EventQuery::default()
            })
            .unwrap();
        assert_eq!(by_type.len(), 2);

        let by_task = logger
            .query(&EventQuery {
                task_id: Some("TASK-2025-06-01-001".to_string()),
                ..EventQuery::default()
            })
            .unwrap();
        assert_eq!(by_task.len(), 2);

        let by_actor = logger
            .query(&EventQuery {
                actor: Some("bob".to_string()),
                limit: Some(1),
                ..EventQuery::default()
            })
            .unwrap();
        assert_eq!(by_actor.len(), 1);
        assert_eq!(by_actor[0].actor, "bob");
    }

    #[test]
    fn test_subscriber_fan_out_and_panic_isolation() {
        let dir = TempDir::new().unwrap();
        let logger = EventLogger::new(dir.path()).unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        let counted = seen.clone();
        logger.subscribe(Box::new(move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
        }));
        logger.subscribe(Box::new(|_| panic!("bad subscriber")));

        let later = seen.clone();
        logger.subscribe(Box::new(move |_| {
            later.fetch_add(10, Ordering::SeqCst);
        }));

        logger.log(events::TASK_CREATED, "test", None, serde_json::json!({}));

        // The panicking subscriber did not stop the others
        assert_eq!(seen.load(Ordering::SeqCst), 11);
    }
}
