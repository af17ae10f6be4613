//! Polling watcher for asynchronous control-plane jobs.

use crate::pve::client::PveClient;
use crate::pve::types::{TaskId, TaskState};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Watches one job handle until it reaches a terminal state or a deadline.
///
/// The wait is blocking from the caller's perspective: it occupies the
/// calling context for up to `timeout` and can only be cut short by the
/// deadline itself.
#[derive(Clone)]
pub struct TaskWatcher {
    client: Arc<PveClient>,
    poll_interval: Duration,
}

impl TaskWatcher {
    pub fn new(client: Arc<PveClient>, poll_interval: Duration) -> Self {
        Self {
            client,
            poll_interval,
        }
    }

    /// Wait for the job to finish.
    ///
    /// Returns `true` only when the job stops with the `OK` exit sentinel.
    /// An `error` state, any status-fetch failure, or an elapsed deadline
    /// all yield `false`.
    pub async fn wait(&self, node: &str, task: &TaskId, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;

        loop {
            match self.client.task_status(node, task).await {
                Ok(status) => match status.state {
                    TaskState::Stopped => {
                        let ok = status.succeeded();
                        tracing::debug!(%task, node, ok, exit = ?status.exit_status, "task reached terminal state");
                        return ok;
                    }
                    TaskState::Error => {
                        tracing::warn!(%task, node, "task ended in error state");
                        return false;
                    }
                    TaskState::Running => {}
                },
                Err(err) => {
                    tracing::warn!(%task, node, error = %err, "failed to fetch task status");
                    return false;
                }
            }

            if Instant::now() + self.poll_interval > deadline {
                tracing::error!(%task, node, timeout_secs = timeout.as_secs(), "timed out waiting for task");
                return false;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
