use clap::{Parser, Subcommand};
use pvebridge::{
    FirewallReconciler, HttpTransport, IptablesFilter, LxcManager, PveClient, RuleStore, Settings,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::commands;

#[derive(Parser, Debug)]
#[command(name = "pvebridge", version, about = "LXC lifecycle and NAT port forwarding for Proxmox VE")]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalFlags,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(clap::Args, Debug)]
pub struct GlobalFlags {
    /// Path to the JSON configuration file
    #[arg(long, global = true, env = "PVEBRIDGE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Emit JSON instead of tables
    #[arg(long, global = true)]
    pub json: bool,
}

impl GlobalFlags {
    pub fn settings(&self) -> anyhow::Result<Settings> {
        let settings = match &self.config {
            Some(path) => Settings::load(path)?,
            None => Settings::from_env(),
        };
        tracing::debug!(host = %settings.pve.host, port = settings.pve.port, "loaded settings");
        Ok(settings)
    }

    fn client(&self, settings: &Settings) -> anyhow::Result<Arc<PveClient>> {
        let transport = HttpTransport::new(&settings.pve)?;
        Ok(Arc::new(PveClient::new(Arc::new(transport))))
    }

    pub fn manager(&self) -> anyhow::Result<LxcManager> {
        let settings = self.settings()?;
        let client = self.client(&settings)?;
        Ok(LxcManager::new(client, &settings.pve))
    }

    pub fn reconciler(&self) -> anyhow::Result<FirewallReconciler> {
        let settings = self.settings()?;
        let client = self.client(&settings)?;
        let store = Arc::new(RuleStore::open(&settings.database_path)?);
        let filter = Arc::new(IptablesFilter::new(
            settings.nat.iptables_binary.clone(),
            Duration::from_secs(settings.nat.command_timeout_secs),
            settings.nat.owner_tag.clone(),
        ));
        Ok(FirewallReconciler::new(store, filter, client))
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List cluster nodes
    Nodes(commands::nodes::NodesArgs),

    /// Container lifecycle operations
    #[command(subcommand)]
    Ct(commands::ct::CtCommand),

    /// NAT port-forwarding rules
    #[command(subcommand)]
    Nat(commands::nat::NatCommand),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::ct::CtCommand;
    use crate::commands::nat::NatCommand;

    #[test]
    fn parses_ct_rebuild() {
        let cli = Cli::try_parse_from([
            "pvebridge",
            "ct",
            "rebuild",
            "pve1",
            "105",
            "--ostemplate",
            "local:vztmpl/debian-12-standard_12.2-1_amd64.tar.zst",
            "--hostname",
            "web1",
            "--password",
            "hunter2",
            "--rootfs",
            "local-lvm:8",
        ])
        .unwrap();

        match cli.command {
            Command::Ct(CtCommand::Rebuild(args)) => {
                assert_eq!(args.node, "pve1");
                assert_eq!(args.vmid, 105);
                assert_eq!(args.hostname, "web1");
                // Defaults hold.
                assert_eq!(args.cores, 2);
                assert_eq!(args.bridge, "vmbr0");
                assert_eq!(args.ip, "dhcp");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn parses_nat_add() {
        let cli = Cli::try_parse_from([
            "pvebridge",
            "nat",
            "add",
            "pve1",
            "105",
            "--host-port",
            "8080",
            "--container-port",
            "80",
            "--protocol",
            "udp",
        ])
        .unwrap();

        match cli.command {
            Command::Nat(NatCommand::Add(args)) => {
                assert_eq!(args.host_port, 8080);
                assert_eq!(args.protocol, pvebridge::Protocol::Udp);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_protocol() {
        let result = Cli::try_parse_from([
            "pvebridge",
            "nat",
            "add",
            "pve1",
            "105",
            "--host-port",
            "8080",
            "--container-port",
            "80",
            "--protocol",
            "icmp",
        ]);
        assert!(result.is_err());
    }
}
