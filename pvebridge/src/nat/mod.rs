//! Declarative NAT port forwarding: persisted rules, packet-filter control,
//! and the reconciler that keeps the two in step.

pub mod filter;
pub mod reconciler;
pub mod rule;
pub mod store;

pub use filter::{IptablesFilter, LiveRule, PacketFilter};
pub use reconciler::{
    AddressResolver, CreateOutcome, DeleteOutcome, FirewallReconciler, ResyncReport, UpdateOutcome,
};
pub use rule::{NatRule, NewRule, Protocol, RuleUpdate};
pub use store::RuleStore;
