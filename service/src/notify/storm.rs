//! Storm batching: bursts of one non-critical event type collapse into a
//! single aggregate message instead of flooding the sink.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

/// A message ready for the adapter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub channel: String,
    pub message: String,
}

struct Window {
    opened_at: DateTime<Utc>,
    channel: String,
    pending: Vec<String>,
}

/// Accumulates non-critical messages per event type into fixed windows.
/// When a window closes, its content either flushes individually or — past
/// the threshold — as one `"<type> storm: N events"` aggregate.
pub struct StormBatcher {
    window_ms: u64,
    threshold: usize,
    windows: HashMap<String, Window>,
}

impl StormBatcher {
    pub fn new(window_ms: u64, threshold: usize) -> Self {
        Self {
            window_ms,
            threshold,
            windows: HashMap::new(),
        }
    }

    /// Add a message to its type's window, returning anything whose window
    /// just closed.
    pub fn push(
        &mut self,
        event_type: &str,
        channel: &str,
        message: String,
        now: DateTime<Utc>,
    ) -> Vec<OutboundMessage> {
        let mut due = self.flush_due(now);

        let window = self
            .windows
            .entry(event_type.to_string())
            .or_insert_with(|| Window {
                opened_at: now,
                channel: channel.to_string(),
                pending: Vec::new(),
            });
        window.pending.push(message);

        due.append(&mut self.flush_due(now));
        due
    }

    /// Close and drain every window older than the batching interval
    pub fn flush_due(&mut self, now: DateTime<Utc>) -> Vec<OutboundMessage> {
        let window_len = Duration::milliseconds(self.window_ms as i64);
        let expired: Vec<String> = self
            .windows
            .iter()
            .filter(|(_, w)| now - w.opened_at >= window_len)
            .map(|(k, _)| k.clone())
            .collect();

        let mut out = Vec::new();
        for event_type in expired {
            if let Some(window) = self.windows.remove(&event_type) {
                out.extend(drain_window(&event_type, window, self.threshold));
            }
        }
        out
    }

    /// Drain everything regardless of window age (service shutdown)
    pub fn flush_all(&mut self) -> Vec<OutboundMessage> {
        let mut out = Vec::new();
        let windows: Vec<(String, Window)> = self.windows.drain().collect();
        for (event_type, window) in windows {
            out.extend(drain_window(&event_type, window, self.threshold));
        }
        out
    }

    /// Number of messages currently waiting in open windows
    pub fn pending_count(&self) -> usize {
        self.windows.values().map(|w| w.pending.len()).sum()
    }
}

fn drain_window(event_type: &str, window: Window, threshold: usize) -> Vec<OutboundMessage> {
    if window.pending.len() > threshold {
        vec![OutboundMessage {
            channel: window.channel,
            message: format!("{event_type} storm: {} events", window.pending.len()),
        }]
    } else {
        window
            .pending
            .into_iter()
            .map(|message| OutboundMessage {
                channel: window.channel.clone(),
                message,
            })
            .collect()
    }
}
