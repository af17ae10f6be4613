//! Proxmox VE control-plane access: transport, resilient client, task watcher.

pub mod client;
pub mod task;
pub mod transport;
pub mod types;

pub use client::PveClient;
pub use task::TaskWatcher;
pub use transport::{ApiTransport, HttpTransport, Method, Session};
pub use types::{
    BridgeInfo, ConsoleTicket, ContainerStatus, ContainerSummary, CreateSpec, NetworkSpec,
    NodeInfo, RebuildSpec, StorageInfo, TaskId, TaskState, TaskStatus, TemplateInfo,
};
