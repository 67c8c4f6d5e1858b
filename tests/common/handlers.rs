use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use uuid::Uuid;

use tasker_lanes::messaging::Task;
use tasker_lanes::routing::TaskKind;
use tasker_lanes::worker::{HandlerError, TaskHandler, TaskOutcome};

/// Handler whose first N calls fail
#[derive(Debug)]
pub struct ScriptedHandler {
    channel: String,
    remaining_failures: AtomicU32,
    /// Fail by returning an error-status outcome instead of an error
    error_status: bool,
    delay: Option<Duration>,
    calls: Mutex<Vec<Uuid>>,
}

impl ScriptedHandler {
    fn build(channel: &str, failures: u32, error_status: bool, delay: Option<Duration>) -> Arc<Self> {
        Arc::new(Self {
            channel: channel.to_string(),
            remaining_failures: AtomicU32::new(failures),
            error_status,
            delay,
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn succeeding(channel: &str) -> Arc<Self> {
        Self::build(channel, 0, false, None)
    }

    pub fn failing_first(channel: &str, failures: u32) -> Arc<Self> {
        Self::build(channel, failures, false, None)
    }

    pub fn reporting_errors_first(channel: &str, failures: u32) -> Arc<Self> {
        Self::build(channel, failures, true, None)
    }

    pub fn always_failing(channel: &str) -> Arc<Self> {
        Self::build(channel, u32::MAX, false, None)
    }

    pub fn slow(channel: &str, delay: Duration) -> Arc<Self> {
        Self::build(channel, 0, false, Some(delay))
    }

    /// Task ids in the order they were handled
    pub fn calls(&self) -> Vec<Uuid> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl TaskHandler for ScriptedHandler {
    fn channel(&self) -> &str {
        &self.channel
    }

    fn accepts(&self, _kind: TaskKind) -> bool {
        true
    }

    async fn handle(&self, task: &Task) -> Result<TaskOutcome, HandlerError> {
        self.calls.lock().push(task.id);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let fail = self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();

        match (fail, self.error_status) {
            (false, _) => Ok(TaskOutcome::completed(task.id, json!({"ok": true}), None)),
            (true, true) => Ok(TaskOutcome::error(task.id, "scripted error status")),
            (true, false) => Err(HandlerError::failed(task.id, "scripted failure")),
        }
    }
}
