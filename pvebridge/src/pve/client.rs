//! Resilient client for the virtualization control plane.
//!
//! Every call goes through [`PveClient::execute`], which owns the retry
//! protocol: attempt the call, and on a transient (auth/connection) failure
//! re-establish the session exactly once and retry the same call once. The
//! second failure propagates with its kind unchanged. Callers that need a
//! broader retry cadence (such as the task watcher poll loop) build it on
//! top of this.

use crate::error::{BridgeError, BridgeResult};
use crate::pve::transport::{ApiTransport, Method, Session};
use crate::pve::types::{
    BridgeInfo, ConsoleTicket, ContainerStatus, ContainerSummary, CreateSpec, NodeInfo,
    StorageInfo, TaskId, TaskState, TaskStatus, TemplateInfo,
};
use serde_json::Value;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::RwLock;

pub struct PveClient {
    transport: Arc<dyn ApiTransport>,
    session: RwLock<Option<Session>>,
}

impl PveClient {
    pub fn new(transport: Arc<dyn ApiTransport>) -> Self {
        Self {
            transport,
            session: RwLock::new(None),
        }
    }

    /// Current session, logging in on first use.
    async fn session(&self) -> BridgeResult<Session> {
        if let Some(session) = self.session.read().await.clone() {
            return Ok(session);
        }
        self.relogin().await
    }

    /// Establish a fresh session. A failure here is always an auth failure;
    /// there are no nested retries.
    async fn relogin(&self) -> BridgeResult<Session> {
        let session = self
            .transport
            .login()
            .await
            .map_err(|e| BridgeError::Auth(format!("session establishment failed: {}", e)))?;
        *self.session.write().await = Some(session.clone());
        Ok(session)
    }

    /// Issue one API call with the single re-authentication retry.
    pub async fn execute(
        &self,
        method: Method,
        path: &str,
        params: &[(String, String)],
    ) -> BridgeResult<Value> {
        let session = self.session().await?;
        match self.transport.request(method, path, params, &session).await {
            Ok(value) => Ok(value),
            Err(err) if err.is_transient() => {
                tracing::warn!(path, error = %err, "transient control-plane failure, re-establishing session");
                let fresh = self.relogin().await?;
                self.transport.request(method, path, params, &fresh).await
            }
            Err(err) => Err(err),
        }
    }

    async fn get(&self, path: &str) -> BridgeResult<Value> {
        self.execute(Method::Get, path, &[]).await
    }

    // ------------------------------------------------------------------
    // Nodes and containers
    // ------------------------------------------------------------------

    pub async fn list_nodes(&self) -> BridgeResult<Vec<NodeInfo>> {
        let envelope = self.get("/nodes").await?;
        let nodes = envelope["data"]
            .as_array()
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter_map(|entry| {
                let node = entry["node"].as_str()?.to_string();
                let online = entry["status"].as_str() == Some("online");
                Some(NodeInfo { node, online })
            })
            .collect();
        Ok(nodes)
    }

    /// Containers on one node, or across all online nodes.
    pub async fn list_containers(&self, node: Option<&str>) -> BridgeResult<Vec<ContainerSummary>> {
        let nodes: Vec<String> = match node {
            Some(node) => vec![node.to_string()],
            None => self
                .list_nodes()
                .await?
                .into_iter()
                .filter(|n| n.online)
                .map(|n| n.node)
                .collect(),
        };

        let mut containers = Vec::new();
        for node in nodes {
            let path = format!("/nodes/{}/lxc", urlencoding::encode(&node));
            let envelope = self.get(&path).await?;
            for entry in envelope["data"].as_array().cloned().unwrap_or_default() {
                let Some(vmid) = as_u64(&entry["vmid"]) else {
                    continue;
                };
                containers.push(ContainerSummary {
                    vmid: vmid as u32,
                    node: node.clone(),
                    name: entry["name"].as_str().map(str::to_string),
                    status: entry["status"].as_str().unwrap_or("unknown").to_string(),
                    uptime: as_u64(&entry["uptime"]).unwrap_or(0),
                    cpu: entry["cpu"].as_f64().unwrap_or(0.0),
                    mem: as_u64(&entry["mem"]).unwrap_or(0),
                    maxmem: as_u64(&entry["maxmem"]).unwrap_or(0),
                });
            }
        }
        Ok(containers)
    }

    /// Merged current-status and config view of one container.
    pub async fn container_status(&self, node: &str, vmid: u32) -> BridgeResult<ContainerStatus> {
        let base = self.ct_path(node, vmid);
        let status = self.get(&format!("{}/status/current", base)).await?;
        let config = self.get(&format!("{}/config", base)).await?;

        let status = &status["data"];
        let config = &config["data"];
        Ok(ContainerStatus {
            vmid,
            node: node.to_string(),
            status: status["status"].as_str().unwrap_or("unknown").to_string(),
            name: config["hostname"]
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| format!("CT-{}", vmid)),
            uptime: as_u64(&status["uptime"]).unwrap_or(0),
            cpu: status["cpu"].as_f64().unwrap_or(0.0),
            mem: as_u64(&status["mem"]).unwrap_or(0),
            maxmem: as_u64(&status["maxmem"]).unwrap_or(0),
            template: as_u64(&config["template"]).unwrap_or(0) == 1,
        })
    }

    // ------------------------------------------------------------------
    // Power operations
    // ------------------------------------------------------------------

    pub async fn start_container(&self, node: &str, vmid: u32) -> BridgeResult<TaskId> {
        self.power_op(node, vmid, "start").await
    }

    pub async fn stop_container(&self, node: &str, vmid: u32) -> BridgeResult<TaskId> {
        self.power_op(node, vmid, "stop").await
    }

    pub async fn shutdown_container(&self, node: &str, vmid: u32) -> BridgeResult<TaskId> {
        self.power_op(node, vmid, "shutdown").await
    }

    pub async fn reboot_container(&self, node: &str, vmid: u32) -> BridgeResult<TaskId> {
        self.power_op(node, vmid, "reboot").await
    }

    async fn power_op(&self, node: &str, vmid: u32, op: &str) -> BridgeResult<TaskId> {
        let path = format!("{}/status/{}", self.ct_path(node, vmid), op);
        let envelope = self.execute(Method::Post, &path, &[]).await?;
        task_from_envelope(&envelope, op)
    }

    // ------------------------------------------------------------------
    // Create / delete
    // ------------------------------------------------------------------

    pub async fn create_container(&self, spec: &CreateSpec) -> BridgeResult<TaskId> {
        let path = format!("/nodes/{}/lxc", urlencoding::encode(&spec.node));
        let mut params = vec![
            ("vmid".to_string(), spec.vmid.to_string()),
            ("ostemplate".to_string(), spec.ostemplate.clone()),
            ("hostname".to_string(), spec.hostname.clone()),
            ("password".to_string(), spec.password.clone()),
            ("cores".to_string(), spec.cores.to_string()),
            ("memory".to_string(), spec.memory.to_string()),
            ("swap".to_string(), spec.swap.to_string()),
            ("rootfs".to_string(), spec.rootfs.clone()),
            ("net0".to_string(), spec.network.to_conf_value()),
            (
                "unprivileged".to_string(),
                if spec.unprivileged { "1" } else { "0" }.to_string(),
            ),
            (
                "start".to_string(),
                if spec.start { "1" } else { "0" }.to_string(),
            ),
        ];
        if let Some(cpulimit) = spec.cpulimit {
            params.push(("cpulimit".to_string(), cpulimit.to_string()));
        }
        if let Some(features) = &spec.features {
            params.push(("features".to_string(), features.clone()));
        }

        let envelope = self.execute(Method::Post, &path, &params).await?;
        task_from_envelope(&envelope, "create")
    }

    pub async fn delete_container(&self, node: &str, vmid: u32) -> BridgeResult<TaskId> {
        let path = self.ct_path(node, vmid);
        let envelope = self.execute(Method::Delete, &path, &[]).await?;
        task_from_envelope(&envelope, "delete")
    }

    // ------------------------------------------------------------------
    // Tasks
    // ------------------------------------------------------------------

    pub async fn task_status(&self, node: &str, task: &TaskId) -> BridgeResult<TaskStatus> {
        let path = format!(
            "/nodes/{}/tasks/{}/status",
            urlencoding::encode(node),
            urlencoding::encode(task.as_str())
        );
        let envelope = self.get(&path).await?;
        let data = &envelope["data"];
        Ok(TaskStatus {
            state: TaskState::parse(data["status"].as_str().unwrap_or("running")),
            exit_status: data["exitstatus"].as_str().map(str::to_string),
            kind: data["type"].as_str().map(str::to_string),
            start_time: data["starttime"].as_i64(),
            end_time: data["endtime"].as_i64(),
        })
    }

    // ------------------------------------------------------------------
    // Console / node resources
    // ------------------------------------------------------------------

    pub async fn console_ticket(&self, node: &str, vmid: u32) -> BridgeResult<ConsoleTicket> {
        let path = format!("{}/vncproxy", self.ct_path(node, vmid));
        let envelope = self.execute(Method::Post, &path, &[]).await?;
        let data = &envelope["data"];

        let ticket = data["ticket"]
            .as_str()
            .ok_or_else(|| BridgeError::Api("vncproxy response missing ticket".to_string()))?
            .to_string();
        let port = as_u64(&data["port"])
            .ok_or_else(|| BridgeError::Api("vncproxy response missing port".to_string()))?;
        Ok(ConsoleTicket {
            ticket,
            port: port as u16,
            user: data["user"].as_str().unwrap_or_default().to_string(),
        })
    }

    pub async fn list_storages(&self, node: &str) -> BridgeResult<Vec<StorageInfo>> {
        let path = format!("/nodes/{}/storage", urlencoding::encode(node));
        let envelope = self.get(&path).await?;
        let storages = envelope["data"]
            .as_array()
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter_map(|entry| {
                Some(StorageInfo {
                    storage: entry["storage"].as_str()?.to_string(),
                    kind: entry["type"].as_str().unwrap_or("unknown").to_string(),
                    active: as_u64(&entry["active"]).unwrap_or(0) == 1,
                    avail: as_u64(&entry["avail"]).unwrap_or(0),
                    total: as_u64(&entry["total"]).unwrap_or(0),
                })
            })
            .collect();
        Ok(storages)
    }

    /// OS templates available on any storage of the node that carries
    /// container template content.
    pub async fn list_templates(&self, node: &str) -> BridgeResult<Vec<TemplateInfo>> {
        let path = format!("/nodes/{}/storage", urlencoding::encode(node));
        let envelope = self.get(&path).await?;

        let mut templates = Vec::new();
        for entry in envelope["data"].as_array().cloned().unwrap_or_default() {
            let content = entry["content"].as_str().unwrap_or_default();
            if !content.split(',').any(|c| c == "vztmpl") {
                continue;
            }
            let Some(storage) = entry["storage"].as_str() else {
                continue;
            };
            let path = format!(
                "/nodes/{}/storage/{}/content",
                urlencoding::encode(node),
                urlencoding::encode(storage)
            );
            let params = [("content".to_string(), "vztmpl".to_string())];
            let envelope = self.execute(Method::Get, &path, &params).await?;
            for item in envelope["data"].as_array().cloned().unwrap_or_default() {
                if let Some(volid) = item["volid"].as_str() {
                    templates.push(TemplateInfo {
                        volid: volid.to_string(),
                        size: as_u64(&item["size"]).unwrap_or(0),
                    });
                }
            }
        }
        Ok(templates)
    }

    pub async fn list_bridges(&self, node: &str) -> BridgeResult<Vec<BridgeInfo>> {
        let path = format!("/nodes/{}/network", urlencoding::encode(node));
        let params = [("type".to_string(), "bridge".to_string())];
        let envelope = self.execute(Method::Get, &path, &params).await?;
        let bridges = envelope["data"]
            .as_array()
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter_map(|entry| {
                Some(BridgeInfo {
                    iface: entry["iface"].as_str()?.to_string(),
                    active: as_u64(&entry["active"]).unwrap_or(0) == 1,
                    cidr: entry["cidr"].as_str().map(str::to_string),
                })
            })
            .collect();
        Ok(bridges)
    }

    // ------------------------------------------------------------------
    // Address resolution
    // ------------------------------------------------------------------

    /// Current address of a running container.
    ///
    /// Prefers the guest-reported interface list, falling back to a static
    /// address in the `net0` config. Fails with `Unresolvable` when the
    /// container is not running or carries no usable address.
    pub async fn container_ip(&self, node: &str, vmid: u32) -> BridgeResult<IpAddr> {
        let status = self.container_status(node, vmid).await.map_err(|e| {
            BridgeError::Unresolvable(format!("cannot fetch status of {}/{}: {}", node, vmid, e))
        })?;
        if !status.is_running() {
            return Err(BridgeError::Unresolvable(format!(
                "container {}/{} is not running (status: {})",
                node, vmid, status.status
            )));
        }

        let path = format!("{}/interfaces", self.ct_path(node, vmid));
        match self.get(&path).await {
            Ok(envelope) => {
                for iface in envelope["data"].as_array().cloned().unwrap_or_default() {
                    if iface["name"].as_str() == Some("lo") {
                        continue;
                    }
                    if let Some(ip) = iface["inet"].as_str().and_then(parse_cidr_address) {
                        return Ok(ip);
                    }
                    if let Some(ip) = iface["inet6"].as_str().and_then(parse_cidr_address) {
                        if !ip.is_loopback() {
                            return Ok(ip);
                        }
                    }
                }
            }
            Err(err) => {
                tracing::debug!(node, vmid, error = %err, "interface listing unavailable, trying static config");
            }
        }

        // Fallback: a statically configured address on net0.
        let config = self.get(&format!("{}/config", self.ct_path(node, vmid))).await?;
        if let Some(net0) = config["data"]["net0"].as_str() {
            for part in net0.split(',') {
                if let Some(value) = part.strip_prefix("ip=") {
                    if value != "dhcp" {
                        if let Some(ip) = parse_cidr_address(value) {
                            return Ok(ip);
                        }
                    }
                }
            }
        }

        Err(BridgeError::Unresolvable(format!(
            "container {}/{} has no discoverable address",
            node, vmid
        )))
    }

    fn ct_path(&self, node: &str, vmid: u32) -> String {
        format!("/nodes/{}/lxc/{}", urlencoding::encode(node), vmid)
    }
}

/// Extract the task handle from a job-submitting response.
fn task_from_envelope(envelope: &Value, op: &str) -> BridgeResult<TaskId> {
    envelope["data"]
        .as_str()
        .map(|upid| TaskId(upid.to_string()))
        .ok_or_else(|| BridgeError::Api(format!("{} did not return a task handle", op)))
}

/// Numbers in API responses arrive as integers, floats or strings.
fn as_u64(value: &Value) -> Option<u64> {
    value
        .as_u64()
        .or_else(|| value.as_f64().map(|f| f as u64))
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
}

/// Parse `10.0.0.5/24` or a bare literal into an address.
fn parse_cidr_address(s: &str) -> Option<IpAddr> {
    let addr = s.split('/').next()?;
    addr.parse().ok()
}
