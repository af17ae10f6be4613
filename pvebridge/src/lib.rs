//! pvebridge - LXC lifecycle control and NAT port forwarding for Proxmox VE
//!
//! This crate talks to a Proxmox VE node over its JSON API to manage LXC
//! containers (status, power operations, create/delete, full rebuild) and
//! keeps a declarative set of DNAT port-forwarding rules reconciled against
//! the host's iptables PREROUTING chain.

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod nat;
pub mod pve;

pub use config::{NatSettings, PveSettings, Settings};
pub use error::{BridgeError, BridgeResult, CommandError};
pub use lifecycle::{LxcManager, OperationOutcome, RebuildOutcome, RebuildPhase};
pub use nat::{
    FirewallReconciler, IptablesFilter, NatRule, NewRule, Protocol, RuleStore, RuleUpdate,
};
pub use pve::{HttpTransport, PveClient, TaskWatcher};
