//! Container lifecycle operations on top of the control-plane client.
//!
//! Every mutating operation returns a structured [`OperationOutcome`] with a
//! success flag and a human-readable message; lower-level errors never
//! escape uncaught.

pub mod rebuild;

pub use rebuild::{RebuildOutcome, RebuildPhase};

use crate::config::PveSettings;
use crate::error::BridgeResult;
use crate::pve::types::{ConsoleTicket, ContainerStatus, ContainerSummary, CreateSpec, TaskId};
use crate::pve::{PveClient, TaskWatcher};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Result of one submitted container operation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OperationOutcome {
    pub success: bool,
    pub message: String,
    pub task: Option<TaskId>,
}

impl OperationOutcome {
    fn submitted(message: String, task: TaskId) -> Self {
        Self {
            success: true,
            message,
            task: Some(task),
        }
    }

    fn failed(message: String) -> Self {
        Self {
            success: false,
            message,
            task: None,
        }
    }
}

/// Orchestrates container operations, composing the client with the task
/// watcher for multi-step workflows.
pub struct LxcManager {
    client: Arc<PveClient>,
    watcher: TaskWatcher,
    task_timeout: Duration,
    strict_delete_wait: bool,
}

impl LxcManager {
    pub fn new(client: Arc<PveClient>, settings: &PveSettings) -> Self {
        let watcher = TaskWatcher::new(
            client.clone(),
            Duration::from_secs(settings.poll_interval_secs),
        );
        Self {
            client,
            watcher,
            task_timeout: Duration::from_secs(settings.task_timeout_secs),
            strict_delete_wait: settings.strict_delete_wait,
        }
    }

    pub fn client(&self) -> &Arc<PveClient> {
        &self.client
    }

    pub async fn list_containers(&self, node: Option<&str>) -> BridgeResult<Vec<ContainerSummary>> {
        self.client.list_containers(node).await
    }

    pub async fn status(&self, node: &str, vmid: u32) -> BridgeResult<ContainerStatus> {
        self.client.container_status(node, vmid).await
    }

    pub async fn console_ticket(&self, node: &str, vmid: u32) -> BridgeResult<ConsoleTicket> {
        self.client.console_ticket(node, vmid).await
    }

    pub async fn start(&self, node: &str, vmid: u32) -> OperationOutcome {
        match self.client.start_container(node, vmid).await {
            Ok(task) => OperationOutcome::submitted(
                format!("start command submitted for container {}", vmid),
                task,
            ),
            Err(err) => {
                tracing::error!(node, vmid, error = %err, "failed to start container");
                OperationOutcome::failed(format!("failed to start container {}: {}", vmid, err))
            }
        }
    }

    pub async fn stop(&self, node: &str, vmid: u32) -> OperationOutcome {
        match self.client.stop_container(node, vmid).await {
            Ok(task) => OperationOutcome::submitted(
                format!("stop command submitted for container {}", vmid),
                task,
            ),
            Err(err) => {
                tracing::error!(node, vmid, error = %err, "failed to stop container");
                OperationOutcome::failed(format!("failed to stop container {}: {}", vmid, err))
            }
        }
    }

    pub async fn shutdown(&self, node: &str, vmid: u32) -> OperationOutcome {
        match self.client.shutdown_container(node, vmid).await {
            Ok(task) => OperationOutcome::submitted(
                format!("shutdown command submitted for container {}", vmid),
                task,
            ),
            Err(err) => {
                tracing::error!(node, vmid, error = %err, "failed to shut down container");
                OperationOutcome::failed(format!(
                    "failed to shut down container {}: {}",
                    vmid, err
                ))
            }
        }
    }

    pub async fn reboot(&self, node: &str, vmid: u32) -> OperationOutcome {
        match self.client.reboot_container(node, vmid).await {
            Ok(task) => OperationOutcome::submitted(
                format!("reboot command submitted for container {}", vmid),
                task,
            ),
            Err(err) => {
                tracing::error!(node, vmid, error = %err, "failed to reboot container");
                OperationOutcome::failed(format!("failed to reboot container {}: {}", vmid, err))
            }
        }
    }

    pub async fn create(&self, spec: &CreateSpec) -> OperationOutcome {
        match self.client.create_container(spec).await {
            Ok(task) => OperationOutcome::submitted(
                format!("create task started for container {}", spec.vmid),
                task,
            ),
            Err(err) => {
                tracing::error!(node = %spec.node, vmid = spec.vmid, error = %err, "failed to create container");
                OperationOutcome::failed(format!(
                    "failed to create container {}: {}",
                    spec.vmid, err
                ))
            }
        }
    }

    /// Delete is destructive: the container and its volumes are removed.
    pub async fn delete(&self, node: &str, vmid: u32) -> OperationOutcome {
        match self.client.delete_container(node, vmid).await {
            Ok(task) => OperationOutcome::submitted(
                format!("delete task started for container {}", vmid),
                task,
            ),
            Err(err) => {
                tracing::error!(node, vmid, error = %err, "failed to delete container");
                OperationOutcome::failed(format!("failed to delete container {}: {}", vmid, err))
            }
        }
    }
}
