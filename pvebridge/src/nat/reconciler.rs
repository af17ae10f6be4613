//! Reconciliation between the desired rule set and the live packet filter.
//!
//! Every mutating entry point takes the reconciler lock, so rule changes and
//! resync passes never interleave. The store is written before the filter is
//! touched for creation, and a rule that cannot be enforced is disabled
//! rather than left silently broken.

use crate::error::{BridgeError, BridgeResult};
use crate::nat::filter::PacketFilter;
use crate::nat::rule::{NatRule, NewRule, RuleUpdate};
use crate::nat::store::RuleStore;
use crate::pve::PveClient;
use async_trait::async_trait;
use serde::Serialize;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Resolves the current address of a container's primary interface.
#[async_trait]
pub trait AddressResolver: Send + Sync {
    async fn resolve(&self, node: &str, vmid: u32) -> BridgeResult<IpAddr>;
}

#[async_trait]
impl AddressResolver for PveClient {
    async fn resolve(&self, node: &str, vmid: u32) -> BridgeResult<IpAddr> {
        self.container_ip(node, vmid).await
    }
}

/// Result of creating a rule. `applied` is false when the rule was persisted
/// but enforcement failed; the rule is then stored disabled.
#[derive(Clone, Debug, Serialize)]
pub struct CreateOutcome {
    pub rule: NatRule,
    pub applied: bool,
    pub message: String,
}

/// Result of updating a rule. Enforcement failures are reported, not raised:
/// the persisted state always reflects what the caller asked for, except
/// that a rule whose redirect could not be installed ends up disabled.
#[derive(Clone, Debug, Serialize)]
pub struct UpdateOutcome {
    pub rule: NatRule,
    pub retract_error: Option<String>,
    pub apply_error: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct DeleteOutcome {
    pub retract_error: Option<String>,
}

/// Summary of one resync pass.
#[derive(Clone, Debug, Default, Serialize)]
pub struct ResyncReport {
    /// Owned live rules removed before reinstallation.
    pub cleared: usize,
    /// Owned live rules that could not be removed.
    pub failed_to_clear: usize,
    /// Enabled rules successfully reinstalled.
    pub applied: usize,
    /// Enabled rules whose installation failed.
    pub failed_to_apply: usize,
    /// Rules disabled during the pass (unresolvable address or failed apply).
    pub disabled_rule_ids: Vec<i64>,
}

/// Serializes rule mutations and resync passes over one store/filter pair.
pub struct FirewallReconciler {
    store: Arc<RuleStore>,
    filter: Arc<dyn PacketFilter>,
    resolver: Arc<dyn AddressResolver>,
    lock: Mutex<()>,
}

impl FirewallReconciler {
    pub fn new(
        store: Arc<RuleStore>,
        filter: Arc<dyn PacketFilter>,
        resolver: Arc<dyn AddressResolver>,
    ) -> Self {
        Self {
            store,
            filter,
            resolver,
            lock: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<RuleStore> {
        &self.store
    }

    /// Create and enforce a new rule.
    ///
    /// A conflicting enabled rule or an unresolvable container address fails
    /// the whole operation; nothing is persisted and the filter is never
    /// touched. A failure to install the redirect after persisting leaves
    /// the rule stored but disabled.
    pub async fn create(&self, new: NewRule) -> BridgeResult<CreateOutcome> {
        let _guard = self.lock.lock().await;

        if self.store.has_conflict(new.host_port, new.protocol, None)? {
            return Err(BridgeError::Conflict(format!(
                "host port {}/{} is already forwarded by an enabled rule",
                new.host_port, new.protocol
            )));
        }

        let ip = self.resolver.resolve(&new.node, new.vmid).await?;
        let rule = self.store.insert(&new, ip, true)?;

        match self.filter.apply(&rule).await {
            Ok(()) => Ok(CreateOutcome {
                message: format!("rule {} applied", rule.id),
                rule,
                applied: true,
            }),
            Err(err) => {
                tracing::warn!(rule_id = rule.id, error = %err, "rule stored but not applied, disabling");
                self.store.set_enabled(rule.id, false)?;
                let rule = self.stored(rule.id)?;
                Ok(CreateOutcome {
                    message: format!("rule {} stored but not applied: {}", rule.id, err),
                    rule,
                    applied: false,
                })
            }
        }
    }

    /// Apply a partial update, retracting and reinstalling the redirect as
    /// needed. The old redirect is matched with the pre-update snapshot of
    /// the rule, since that is what was installed.
    pub async fn update(&self, id: i64, update: RuleUpdate) -> BridgeResult<UpdateOutcome> {
        let _guard = self.lock.lock().await;

        let current = self.stored(id)?;

        let next_host_port = update.host_port.unwrap_or(current.host_port);
        let next_container_port = update.container_port.unwrap_or(current.container_port);
        let next_protocol = update.protocol.unwrap_or(current.protocol);
        let next_enabled = update.enabled.unwrap_or(current.enabled);

        let networking_changed = next_host_port != current.host_port
            || next_container_port != current.container_port
            || next_protocol != current.protocol;
        let newly_enabled = next_enabled && !current.enabled;
        let disabling = !next_enabled && current.enabled;

        if next_enabled
            && self
                .store
                .has_conflict(next_host_port, next_protocol, Some(id))?
        {
            return Err(BridgeError::Conflict(format!(
                "host port {}/{} is already forwarded by an enabled rule",
                next_host_port, next_protocol
            )));
        }

        let mut retract_error = None;
        if current.enabled && (networking_changed || disabling) {
            if let Err(err) = self.filter.retract(&current).await {
                tracing::warn!(rule_id = id, error = %err, "failed to retract old redirect");
                retract_error = Some(err.to_string());
            }
        }

        let mut rule = self.store.update(id, &update)?;

        let mut apply_error = None;
        if next_enabled && (networking_changed || newly_enabled) {
            match self.resolver.resolve(&rule.node, rule.vmid).await {
                Ok(ip) => {
                    if ip != rule.container_ip {
                        self.store.set_container_ip(id, ip)?;
                        rule.container_ip = ip;
                    }
                    if let Err(err) = self.filter.apply(&rule).await {
                        tracing::warn!(rule_id = id, error = %err, "failed to apply updated redirect, disabling");
                        self.store.set_enabled(id, false)?;
                        rule = self.stored(id)?;
                        apply_error = Some(err.to_string());
                    }
                }
                Err(err) => {
                    tracing::warn!(rule_id = id, error = %err, "container address unresolvable, disabling");
                    self.store.set_enabled(id, false)?;
                    rule = self.stored(id)?;
                    apply_error = Some(err.to_string());
                }
            }
        }

        Ok(UpdateOutcome {
            rule,
            retract_error,
            apply_error,
        })
    }

    /// Remove a rule. The redirect is retracted first when the rule is
    /// enabled; a retraction failure is reported but does not keep the row.
    pub async fn delete(&self, id: i64) -> BridgeResult<DeleteOutcome> {
        let _guard = self.lock.lock().await;

        let rule = self.stored(id)?;

        let mut retract_error = None;
        if rule.enabled {
            if let Err(err) = self.filter.retract(&rule).await {
                tracing::warn!(rule_id = id, error = %err, "failed to retract redirect during delete");
                retract_error = Some(err.to_string());
            }
        }

        self.store.delete(id)?;
        Ok(DeleteOutcome { retract_error })
    }

    /// Rebuild the live filter state from the store.
    ///
    /// Every owned live rule is removed individually, then every enabled
    /// stored rule is re-resolved and reinstalled. Rules whose address can
    /// no longer be resolved, or whose installation fails, are disabled.
    /// Store mutations from the pass are committed in one transaction.
    pub async fn resync(&self) -> BridgeResult<ResyncReport> {
        let _guard = self.lock.lock().await;

        let live = self.filter.list().await?;
        let mut report = ResyncReport::default();

        for rule in &live {
            match self.filter.retract_live(rule).await {
                Ok(()) => report.cleared += 1,
                Err(err) => {
                    tracing::warn!(rule_id = ?rule.rule_id(), error = %err, "failed to clear live rule");
                    report.failed_to_clear += 1;
                }
            }
        }

        let mut ip_updates = Vec::new();
        let mut disable_ids = Vec::new();

        for mut rule in self.store.list_enabled()? {
            let ip = match self.resolver.resolve(&rule.node, rule.vmid).await {
                Ok(ip) => ip,
                Err(err) => {
                    tracing::warn!(rule_id = rule.id, error = %err, "container address unresolvable during resync, disabling");
                    disable_ids.push(rule.id);
                    continue;
                }
            };

            if ip != rule.container_ip {
                tracing::info!(rule_id = rule.id, old = %rule.container_ip, new = %ip, "container address drifted");
                ip_updates.push((rule.id, ip));
                rule.container_ip = ip;
            }

            match self.filter.apply(&rule).await {
                Ok(()) => report.applied += 1,
                Err(err) => {
                    tracing::warn!(rule_id = rule.id, error = %err, "failed to reapply rule during resync, disabling");
                    report.failed_to_apply += 1;
                    disable_ids.push(rule.id);
                }
            }
        }

        report.disabled_rule_ids = disable_ids.clone();
        self.store.commit_resync(&ip_updates, &disable_ids)?;

        tracing::info!(
            cleared = report.cleared,
            applied = report.applied,
            disabled = report.disabled_rule_ids.len(),
            "resync pass finished"
        );
        Ok(report)
    }

    fn stored(&self, id: i64) -> BridgeResult<NatRule> {
        self.store
            .get(id)?
            .ok_or_else(|| BridgeError::NotFound(format!("NAT rule {}", id)))
    }
}
