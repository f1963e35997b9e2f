//! Recording notification sink for policy tests.

use aof_core::NotificationAdapter;
use async_trait::async_trait;
use parking_lot::Mutex;

/// One captured send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub channel: String,
    pub message: String,
}

/// A [`NotificationAdapter`] that records every send, optionally failing
/// them all to exercise the policy's error counting.
#[derive(Default)]
pub struct RecordingAdapter {
    sent: Mutex<Vec<SentMessage>>,
    fail_sends: bool,
}

impl RecordingAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// An adapter whose every send fails
    pub fn failing() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail_sends: true,
        }
    }

    /// All messages sent so far, in order
    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().clone()
    }

    /// Messages sent to one channel
    pub fn sent_to(&self, channel: &str) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .filter(|m| m.channel == channel)
            .map(|m| m.message.clone())
            .collect()
    }
}

#[async_trait]
impl NotificationAdapter for RecordingAdapter {
    async fn send(&self, channel: &str, message: &str) -> std::io::Result<()> {
        self.sent.lock().push(SentMessage {
            channel: channel.to_string(),
            message: message.to_string(),
        });
        if self.fail_sends {
            return Err(std::io::Error::other("sink unavailable"));
        }
        Ok(())
    }
}
