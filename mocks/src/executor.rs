//! Scripted executor for scheduler tests.

use aof_core::{Executor, ExecutorResult, TaskContext};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;

/// An [`Executor`] that replays a scripted sequence of results and records
/// every spawn call for assertions. When the script runs dry it falls back
/// to its default result (success unless configured otherwise).
pub struct MockExecutor {
    script: Mutex<VecDeque<ExecutorResult>>,
    default_result: ExecutorResult,
    calls: Mutex<Vec<TaskContext>>,
}

impl Default for MockExecutor {
    fn default() -> Self {
        Self::succeeding()
    }
}

impl MockExecutor {
    /// An executor that accepts every spawn
    pub fn succeeding() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            default_result: ExecutorResult::ok_with_session("mock-session"),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// An executor that fails every spawn with the given error
    pub fn failing(error: impl Into<String>) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            default_result: ExecutorResult::failed(error),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Queue an explicit result for the next spawn call
    pub fn push_result(&self, result: ExecutorResult) {
        self.script.lock().push_back(result);
    }

    /// All spawn calls seen so far, in order
    pub fn calls(&self) -> Vec<TaskContext> {
        self.calls.lock().clone()
    }

    /// Number of spawn calls seen so far
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl Executor for MockExecutor {
    async fn spawn(&self, ctx: TaskContext) -> ExecutorResult {
        self.calls.lock().push(ctx);
        self.script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.default_result.clone())
    }
}
