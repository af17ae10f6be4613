//! The destructive rebuild workflow: stop, delete, recreate.
//!
//! Modeled as an explicit state machine with a documented benign/fatal
//! policy per transition. The machine favors forward progress: a container
//! whose prior incarnation already vanished must not block recreation on a
//! "not found" delete failure.

use super::LxcManager;
use crate::pve::types::{RebuildSpec, TaskId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Phases of the rebuild machine, in order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RebuildPhase {
    CheckRunning,
    Stopping,
    Deleting,
    Creating,
    Done,
}

impl fmt::Display for RebuildPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RebuildPhase::CheckRunning => "check-running",
            RebuildPhase::Stopping => "stopping",
            RebuildPhase::Deleting => "deleting",
            RebuildPhase::Creating => "creating",
            RebuildPhase::Done => "done",
        };
        write!(f, "{}", name)
    }
}

/// Result of one rebuild run. `phase` is where the machine ended: `Done` on
/// success, otherwise the phase that failed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RebuildOutcome {
    pub success: bool,
    pub phase: RebuildPhase,
    pub message: String,
    pub task: Option<TaskId>,
}

impl RebuildOutcome {
    fn failed(phase: RebuildPhase, message: String) -> Self {
        Self {
            success: false,
            phase,
            message,
            task: None,
        }
    }
}

impl LxcManager {
    /// Rebuild a container: stop it if running, delete it, recreate it with
    /// the new configuration under the same (node, vmid) identity.
    pub async fn rebuild(&self, node: &str, vmid: u32, spec: RebuildSpec) -> RebuildOutcome {
        tracing::info!(node, vmid, "starting container rebuild");

        // CheckRunning: an unreachable or absent container is a soft success,
        // there is simply nothing to stop.
        match self.client.container_status(node, vmid).await {
            Ok(status) if status.is_running() => {
                tracing::info!(node, vmid, "container is running, stopping it first");
                let task = match self.client.stop_container(node, vmid).await {
                    Ok(task) => task,
                    Err(err) => {
                        return RebuildOutcome::failed(
                            RebuildPhase::Stopping,
                            format!("rebuild failed: could not stop container: {}", err),
                        );
                    }
                };
                if !self.watcher.wait(node, &task, self.task_timeout).await {
                    return RebuildOutcome::failed(
                        RebuildPhase::Stopping,
                        "rebuild failed: stop task failed or timed out".to_string(),
                    );
                }
                tracing::info!(node, vmid, "container stopped");
            }
            Ok(_) => {}
            Err(err) => {
                tracing::info!(node, vmid, error = %err, "container status unavailable, proceeding to delete");
            }
        }

        // Deleting: "not found" means the container is already gone, which
        // is exactly the state delete was meant to reach.
        match self.client.delete_container(node, vmid).await {
            Ok(task) => {
                if !self.watcher.wait(node, &task, self.task_timeout).await {
                    if self.strict_delete_wait {
                        return RebuildOutcome::failed(
                            RebuildPhase::Deleting,
                            "rebuild failed: delete task failed or timed out".to_string(),
                        );
                    }
                    // Forward-progress policy: a stale delete task must not
                    // block recreation.
                    tracing::warn!(node, vmid, "delete task did not finish cleanly, proceeding to create");
                } else {
                    tracing::info!(node, vmid, "container deleted");
                }
            }
            Err(err) => {
                let message = err.to_string();
                let lowered = message.to_lowercase();
                if lowered.contains("not found") || lowered.contains("does not exist") {
                    tracing::warn!(node, vmid, "container already absent, proceeding to create");
                } else {
                    return RebuildOutcome::failed(
                        RebuildPhase::Deleting,
                        format!("rebuild failed: could not delete container: {}", message),
                    );
                }
            }
        }

        // Creating: failure here is reported distinctly so operators can
        // tell which phase broke.
        match self
            .client
            .create_container(&spec.into_create_spec(node, vmid))
            .await
        {
            Ok(task) => {
                tracing::info!(node, vmid, %task, "rebuild creation task submitted");
                RebuildOutcome {
                    success: true,
                    phase: RebuildPhase::Done,
                    message: format!("rebuild of container {} submitted", vmid),
                    task: Some(task),
                }
            }
            Err(err) => RebuildOutcome::failed(
                RebuildPhase::Creating,
                format!("rebuild failed at creation: {}", err),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PveSettings;
    use crate::error::{BridgeError, BridgeResult};
    use crate::pve::transport::{ApiTransport, Method, Session};
    use crate::pve::types::NetworkSpec;
    use crate::pve::PveClient;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::Arc;

    type Handler = Box<dyn Fn(Method, &str) -> BridgeResult<Value> + Send + Sync>;

    struct Router {
        handler: Handler,
    }

    #[async_trait]
    impl ApiTransport for Router {
        async fn login(&self) -> BridgeResult<Session> {
            Ok(Session {
                ticket: "t".into(),
                csrf_token: "c".into(),
            })
        }

        async fn request(
            &self,
            method: Method,
            path: &str,
            _params: &[(String, String)],
            _session: &Session,
        ) -> BridgeResult<Value> {
            (self.handler)(method, path)
        }
    }

    fn manager(handler: Handler, strict_delete_wait: bool) -> LxcManager {
        let settings = PveSettings {
            poll_interval_secs: 0,
            task_timeout_secs: 1,
            strict_delete_wait,
            ..PveSettings::default()
        };
        let client = Arc::new(PveClient::new(Arc::new(Router { handler })));
        LxcManager::new(client, &settings)
    }

    fn spec() -> RebuildSpec {
        RebuildSpec {
            ostemplate: "local:vztmpl/debian-12.tar.zst".into(),
            hostname: "rebuilt".into(),
            password: "hunter2".into(),
            cores: 2,
            cpulimit: None,
            memory: 1024,
            swap: 512,
            rootfs: "local-lvm:8".into(),
            network: NetworkSpec {
                name: "eth0".into(),
                bridge: "vmbr0".into(),
                ip: "dhcp".into(),
                gateway: None,
                vlan: None,
            },
            unprivileged: true,
            features: None,
            start: true,
        }
    }

    fn task_ok() -> BridgeResult<Value> {
        Ok(json!({"data": {"status": "stopped", "exitstatus": "OK"}}))
    }

    #[tokio::test]
    async fn full_rebuild_of_running_container() {
        let manager = manager(
            Box::new(|method, path| match (method, path) {
                (Method::Get, "/nodes/pve/lxc/105/status/current") => {
                    Ok(json!({"data": {"status": "running"}}))
                }
                (Method::Get, "/nodes/pve/lxc/105/config") => {
                    Ok(json!({"data": {"hostname": "old"}}))
                }
                (Method::Post, "/nodes/pve/lxc/105/status/stop") => Ok(json!({"data": "UPIDstop"})),
                (Method::Delete, "/nodes/pve/lxc/105") => Ok(json!({"data": "UPIDdel"})),
                (Method::Get, p) if p.starts_with("/nodes/pve/tasks/") => task_ok(),
                (Method::Post, "/nodes/pve/lxc") => Ok(json!({"data": "UPIDcreate"})),
                other => panic!("unexpected call: {other:?}"),
            }),
            false,
        );

        let outcome = manager.rebuild("pve", 105, spec()).await;
        assert!(outcome.success, "{}", outcome.message);
        assert_eq!(outcome.phase, RebuildPhase::Done);
        assert_eq!(outcome.task, Some(crate::pve::types::TaskId("UPIDcreate".into())));
    }

    #[tokio::test]
    async fn absent_container_with_not_found_delete_still_rebuilds() {
        let manager = manager(
            Box::new(|method, path| match (method, path) {
                (Method::Get, "/nodes/pve/lxc/105/status/current") => {
                    Err(BridgeError::NotFound("ct 105".into()))
                }
                (Method::Get, "/nodes/pve/lxc/105/config") => {
                    Err(BridgeError::NotFound("ct 105".into()))
                }
                (Method::Delete, "/nodes/pve/lxc/105") => Err(BridgeError::Api(
                    "CT 105 does not exist on node 'pve'".into(),
                )),
                (Method::Post, "/nodes/pve/lxc") => Ok(json!({"data": "UPIDcreate"})),
                other => panic!("unexpected call: {other:?}"),
            }),
            false,
        );

        let outcome = manager.rebuild("pve", 105, spec()).await;
        assert!(outcome.success, "{}", outcome.message);
        assert!(outcome.task.is_some());
    }

    #[tokio::test]
    async fn unrelated_delete_failure_is_fatal() {
        let manager = manager(
            Box::new(|method, path| match (method, path) {
                (Method::Get, "/nodes/pve/lxc/105/status/current") => {
                    Ok(json!({"data": {"status": "stopped"}}))
                }
                (Method::Get, "/nodes/pve/lxc/105/config") => {
                    Ok(json!({"data": {"hostname": "old"}}))
                }
                (Method::Delete, "/nodes/pve/lxc/105") => {
                    Err(BridgeError::Api("storage 'local-lvm' is locked".into()))
                }
                other => panic!("unexpected call: {other:?}"),
            }),
            false,
        );

        let outcome = manager.rebuild("pve", 105, spec()).await;
        assert!(!outcome.success);
        assert_eq!(outcome.phase, RebuildPhase::Deleting);
        assert!(outcome.message.contains("could not delete"));
    }

    #[tokio::test]
    async fn failed_delete_wait_proceeds_by_default() {
        let manager = manager(
            Box::new(|method, path| match (method, path) {
                (Method::Get, "/nodes/pve/lxc/105/status/current") => {
                    Ok(json!({"data": {"status": "stopped"}}))
                }
                (Method::Get, "/nodes/pve/lxc/105/config") => {
                    Ok(json!({"data": {"hostname": "old"}}))
                }
                (Method::Delete, "/nodes/pve/lxc/105") => Ok(json!({"data": "UPIDdel"})),
                (Method::Get, p) if p.starts_with("/nodes/pve/tasks/") => {
                    Ok(json!({"data": {"status": "stopped", "exitstatus": "unexpected failure"}}))
                }
                (Method::Post, "/nodes/pve/lxc") => Ok(json!({"data": "UPIDcreate"})),
                other => panic!("unexpected call: {other:?}"),
            }),
            false,
        );

        let outcome = manager.rebuild("pve", 105, spec()).await;
        assert!(outcome.success, "{}", outcome.message);
    }

    #[tokio::test]
    async fn failed_delete_wait_is_fatal_when_strict() {
        let manager = manager(
            Box::new(|method, path| match (method, path) {
                (Method::Get, "/nodes/pve/lxc/105/status/current") => {
                    Ok(json!({"data": {"status": "stopped"}}))
                }
                (Method::Get, "/nodes/pve/lxc/105/config") => {
                    Ok(json!({"data": {"hostname": "old"}}))
                }
                (Method::Delete, "/nodes/pve/lxc/105") => Ok(json!({"data": "UPIDdel"})),
                (Method::Get, p) if p.starts_with("/nodes/pve/tasks/") => {
                    Ok(json!({"data": {"status": "stopped", "exitstatus": "unexpected failure"}}))
                }
                other => panic!("unexpected call: {other:?}"),
            }),
            true,
        );

        let outcome = manager.rebuild("pve", 105, spec()).await;
        assert!(!outcome.success);
        assert_eq!(outcome.phase, RebuildPhase::Deleting);
    }

    #[tokio::test]
    async fn stop_wait_failure_is_fatal() {
        let manager = manager(
            Box::new(|method, path| match (method, path) {
                (Method::Get, "/nodes/pve/lxc/105/status/current") => {
                    Ok(json!({"data": {"status": "running"}}))
                }
                (Method::Get, "/nodes/pve/lxc/105/config") => {
                    Ok(json!({"data": {"hostname": "old"}}))
                }
                (Method::Post, "/nodes/pve/lxc/105/status/stop") => Ok(json!({"data": "UPIDstop"})),
                (Method::Get, p) if p.starts_with("/nodes/pve/tasks/") => {
                    Ok(json!({"data": {"status": "error"}}))
                }
                other => panic!("unexpected call: {other:?}"),
            }),
            false,
        );

        let outcome = manager.rebuild("pve", 105, spec()).await;
        assert!(!outcome.success);
        assert_eq!(outcome.phase, RebuildPhase::Stopping);
    }

    #[tokio::test]
    async fn creation_failure_names_the_phase() {
        let manager = manager(
            Box::new(|method, path| match (method, path) {
                (Method::Get, "/nodes/pve/lxc/105/status/current") => {
                    Ok(json!({"data": {"status": "stopped"}}))
                }
                (Method::Get, "/nodes/pve/lxc/105/config") => {
                    Ok(json!({"data": {"hostname": "old"}}))
                }
                (Method::Delete, "/nodes/pve/lxc/105") => Ok(json!({"data": "UPIDdel"})),
                (Method::Get, p) if p.starts_with("/nodes/pve/tasks/") => task_ok(),
                (Method::Post, "/nodes/pve/lxc") => {
                    Err(BridgeError::Api("template not available".into()))
                }
                other => panic!("unexpected call: {other:?}"),
            }),
            false,
        );

        let outcome = manager.rebuild("pve", 105, spec()).await;
        assert!(!outcome.success);
        assert_eq!(outcome.phase, RebuildPhase::Creating);
        assert!(outcome.message.contains("creation"));
    }
}
