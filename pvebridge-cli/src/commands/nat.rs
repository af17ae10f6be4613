use clap::{Args, Subcommand};
use comfy_table::Table;
use pvebridge::{NatRule, NewRule, Protocol, RuleUpdate};

#[derive(Subcommand, Debug)]
pub enum NatCommand {
    /// List port-forwarding rules
    List(ListArgs),
    /// Create a rule and install its redirect
    Add(AddArgs),
    /// Modify an existing rule
    Update(UpdateArgs),
    /// Remove a rule and retract its redirect
    Rm(IdArgs),
    /// Rebuild the live filter state from the stored rules
    Resync,
}

#[derive(Args, Debug)]
pub struct ListArgs {
    #[arg(long, default_value_t = 0)]
    pub offset: u32,

    #[arg(long, default_value_t = 50)]
    pub limit: u32,

    /// Only rules for this container (requires --node)
    #[arg(long, requires = "node")]
    pub vmid: Option<u32>,

    /// Only rules on this node (requires --vmid)
    #[arg(long, requires = "vmid")]
    pub node: Option<String>,
}

#[derive(Args, Debug)]
pub struct AddArgs {
    /// Node hosting the container
    pub node: String,
    /// Numeric container id
    pub vmid: u32,

    /// Port on the host to forward
    #[arg(long)]
    pub host_port: u16,

    /// Destination port inside the container
    #[arg(long)]
    pub container_port: u16,

    #[arg(long, default_value = "tcp")]
    pub protocol: Protocol,

    #[arg(long)]
    pub description: Option<String>,
}

#[derive(Args, Debug)]
pub struct UpdateArgs {
    /// Rule id
    pub id: i64,

    #[arg(long)]
    pub host_port: Option<u16>,

    #[arg(long)]
    pub container_port: Option<u16>,

    #[arg(long)]
    pub protocol: Option<Protocol>,

    #[arg(long)]
    pub description: Option<String>,

    /// Enable or disable the rule
    #[arg(long)]
    pub enabled: Option<bool>,
}

#[derive(Args, Debug)]
pub struct IdArgs {
    pub id: i64,
}

pub async fn execute(command: NatCommand, global: &crate::cli::GlobalFlags) -> anyhow::Result<()> {
    let reconciler = global.reconciler()?;

    match command {
        NatCommand::List(args) => {
            let (rules, total) = match (&args.node, args.vmid) {
                (Some(node), Some(vmid)) => {
                    let rules = reconciler.store().list_for_container(node, vmid)?;
                    let total = rules.len() as u64;
                    (rules, total)
                }
                _ => reconciler.store().list(args.offset, args.limit)?,
            };
            if global.json {
                println!("{}", serde_json::to_string_pretty(&rules)?);
                return Ok(());
            }
            print_rules(&rules);
            println!("{} of {} rule(s)", rules.len(), total);
            Ok(())
        }
        NatCommand::Add(args) => {
            let outcome = reconciler
                .create(NewRule {
                    node: args.node,
                    vmid: args.vmid,
                    host_port: args.host_port,
                    container_port: args.container_port,
                    protocol: args.protocol,
                    description: args.description,
                })
                .await?;

            if global.json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            } else {
                println!("{}", outcome.message);
            }
            if !outcome.applied {
                anyhow::bail!("rule {} was stored but not applied", outcome.rule.id);
            }
            Ok(())
        }
        NatCommand::Update(args) => {
            let outcome = reconciler
                .update(
                    args.id,
                    RuleUpdate {
                        host_port: args.host_port,
                        container_port: args.container_port,
                        protocol: args.protocol,
                        description: args.description,
                        enabled: args.enabled,
                    },
                )
                .await?;

            if global.json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            } else {
                println!("rule {} updated", outcome.rule.id);
                if let Some(err) = &outcome.retract_error {
                    eprintln!("warning: old redirect not retracted: {}", err);
                }
                if let Some(err) = &outcome.apply_error {
                    eprintln!("warning: redirect not applied, rule disabled: {}", err);
                }
            }
            if outcome.apply_error.is_some() {
                anyhow::bail!("rule {} is stored but not enforced", outcome.rule.id);
            }
            Ok(())
        }
        NatCommand::Rm(args) => {
            let outcome = reconciler.delete(args.id).await?;
            if global.json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            } else {
                println!("rule {} removed", args.id);
                if let Some(err) = &outcome.retract_error {
                    eprintln!("warning: redirect not retracted: {}", err);
                }
            }
            Ok(())
        }
        NatCommand::Resync => {
            let report = reconciler.resync().await?;
            if global.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!(
                    "cleared {} rule(s) ({} failed), applied {} ({} failed)",
                    report.cleared, report.failed_to_clear, report.applied, report.failed_to_apply
                );
                if !report.disabled_rule_ids.is_empty() {
                    println!("disabled rules: {:?}", report.disabled_rule_ids);
                }
            }
            Ok(())
        }
    }
}

fn print_rules(rules: &[NatRule]) {
    let mut table = Table::new();
    table.set_header(vec![
        "ID", "NODE", "VMID", "HOST", "DEST", "PROTO", "ENABLED", "UPDATED",
    ]);
    for rule in rules {
        table.add_row(vec![
            rule.id.to_string(),
            rule.node.clone(),
            rule.vmid.to_string(),
            rule.host_port.to_string(),
            rule.destination(),
            rule.protocol.to_string(),
            rule.enabled.to_string(),
            rule.updated_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        ]);
    }
    println!("{table}");
}
