//! Typed views of the control-plane surface we consume.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque handle for an asynchronous job (a UPID string on one node).
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskId({})", self.0)
    }
}

/// Terminal-or-not state of an asynchronous job.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Running,
    Stopped,
    Error,
}

impl TaskState {
    pub fn parse(s: &str) -> Self {
        match s {
            "stopped" => TaskState::Stopped,
            "error" => TaskState::Error,
            _ => TaskState::Running,
        }
    }

    /// No further progress will occur in this state.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskState::Running)
    }
}

/// Status snapshot of one asynchronous job.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskStatus {
    pub state: TaskState,
    pub exit_status: Option<String>,
    pub kind: Option<String>,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
}

impl TaskStatus {
    /// Success sentinel emitted by the control plane for a clean finish.
    pub const EXIT_OK: &'static str = "OK";

    pub fn succeeded(&self) -> bool {
        self.state == TaskState::Stopped && self.exit_status.as_deref() == Some(Self::EXIT_OK)
    }
}

/// One cluster node.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node: String,
    pub online: bool,
}

/// One container as listed per node.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContainerSummary {
    pub vmid: u32,
    pub node: String,
    pub name: Option<String>,
    pub status: String,
    pub uptime: u64,
    pub cpu: f64,
    pub mem: u64,
    pub maxmem: u64,
}

/// Merged status + config view of one container.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContainerStatus {
    pub vmid: u32,
    pub node: String,
    pub status: String,
    pub name: String,
    pub uptime: u64,
    pub cpu: f64,
    pub mem: u64,
    pub maxmem: u64,
    pub template: bool,
}

impl ContainerStatus {
    pub fn is_running(&self) -> bool {
        self.status == "running"
    }
}

/// Network interface specification for container creation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NetworkSpec {
    /// Interface name inside the container, e.g. `eth0`.
    pub name: String,
    /// Host bridge to attach to, e.g. `vmbr0`.
    pub bridge: String,
    /// `dhcp` or a CIDR literal such as `10.0.0.5/24`.
    pub ip: String,
    pub gateway: Option<String>,
    pub vlan: Option<u16>,
}

impl NetworkSpec {
    /// Render the `net0` config value consumed by the control plane.
    pub fn to_conf_value(&self) -> String {
        let mut conf = format!("name={},bridge={},ip={}", self.name, self.bridge, self.ip);
        if let Some(gw) = &self.gateway {
            conf.push_str(&format!(",gw={}", gw));
        }
        if let Some(vlan) = self.vlan {
            conf.push_str(&format!(",tag={}", vlan));
        }
        conf
    }
}

/// Full specification for creating a container.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreateSpec {
    pub node: String,
    pub vmid: u32,
    /// OS template volume id, e.g. `local:vztmpl/debian-12-standard_12.2-1_amd64.tar.zst`.
    pub ostemplate: String,
    pub hostname: String,
    pub password: String,
    pub cores: u16,
    /// CPU limit in cores; 0 means unlimited.
    pub cpulimit: Option<f64>,
    /// Memory in MiB.
    pub memory: u64,
    /// Swap in MiB.
    pub swap: u64,
    /// Root filesystem spec, e.g. `local-lvm:8`.
    pub rootfs: String,
    pub network: NetworkSpec,
    pub unprivileged: bool,
    /// Feature flags string, e.g. `nesting=1`.
    pub features: Option<String>,
    /// Start the container once creation finishes.
    pub start: bool,
}

/// New configuration for a rebuild; the (node, vmid) identity is preserved.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RebuildSpec {
    pub ostemplate: String,
    pub hostname: String,
    pub password: String,
    pub cores: u16,
    pub cpulimit: Option<f64>,
    pub memory: u64,
    pub swap: u64,
    pub rootfs: String,
    pub network: NetworkSpec,
    pub unprivileged: bool,
    pub features: Option<String>,
    pub start: bool,
}

impl RebuildSpec {
    /// Bind this rebuild configuration to an existing container identity.
    pub fn into_create_spec(self, node: &str, vmid: u32) -> CreateSpec {
        CreateSpec {
            node: node.to_string(),
            vmid,
            ostemplate: self.ostemplate,
            hostname: self.hostname,
            password: self.password,
            cores: self.cores,
            cpulimit: self.cpulimit,
            memory: self.memory,
            swap: self.swap,
            rootfs: self.rootfs,
            network: self.network,
            unprivileged: self.unprivileged,
            features: self.features,
            start: self.start,
        }
    }
}

/// Console access ticket for one container.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConsoleTicket {
    pub ticket: String,
    pub port: u16,
    pub user: String,
}

/// One OS template available on a node storage.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TemplateInfo {
    pub volid: String,
    pub size: u64,
}

/// One storage pool on a node.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageInfo {
    pub storage: String,
    pub kind: String,
    pub active: bool,
    pub avail: u64,
    pub total: u64,
}

/// One bridge-type network interface on a node.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BridgeInfo {
    pub iface: String,
    pub active: bool,
    pub cidr: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_state_parse() {
        assert_eq!(TaskState::parse("running"), TaskState::Running);
        assert_eq!(TaskState::parse("stopped"), TaskState::Stopped);
        assert_eq!(TaskState::parse("error"), TaskState::Error);
        // Unknown states are treated as still in flight.
        assert_eq!(TaskState::parse("queued"), TaskState::Running);
    }

    #[test]
    fn task_success_requires_ok_sentinel() {
        let mut status = TaskStatus {
            state: TaskState::Stopped,
            exit_status: Some("OK".into()),
            kind: None,
            start_time: None,
            end_time: None,
        };
        assert!(status.succeeded());

        status.exit_status = Some("command failed".into());
        assert!(!status.succeeded());

        status.state = TaskState::Running;
        status.exit_status = Some("OK".into());
        assert!(!status.succeeded());
    }

    #[test]
    fn network_conf_value() {
        let mut net = NetworkSpec {
            name: "eth0".into(),
            bridge: "vmbr0".into(),
            ip: "10.0.0.5/24".into(),
            gateway: None,
            vlan: None,
        };
        assert_eq!(net.to_conf_value(), "name=eth0,bridge=vmbr0,ip=10.0.0.5/24");

        net.gateway = Some("10.0.0.1".into());
        net.vlan = Some(30);
        assert_eq!(
            net.to_conf_value(),
            "name=eth0,bridge=vmbr0,ip=10.0.0.5/24,gw=10.0.0.1,tag=30"
        );
    }
}
