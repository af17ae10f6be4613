use clap::{Args, Subcommand};
use comfy_table::Table;
use pvebridge::pve::types::{NetworkSpec, RebuildSpec};
use pvebridge::{LxcManager, OperationOutcome};

#[derive(Subcommand, Debug)]
pub enum CtCommand {
    /// List containers, optionally restricted to one node
    List(ListArgs),
    /// Show status of one container
    Status(TargetArgs),
    /// Start a container
    Start(TargetArgs),
    /// Force-stop a container
    Stop(TargetArgs),
    /// Gracefully shut down a container
    Shutdown(TargetArgs),
    /// Reboot a container
    Reboot(TargetArgs),
    /// Delete a container and its volumes
    Rm(TargetArgs),
    /// Destroy a container and recreate it from a template
    Rebuild(RebuildArgs),
    /// Request a VNC console ticket
    Console(TargetArgs),
    /// List OS templates available on a node
    Templates(NodeArgs),
    /// List storage pools on a node
    Storages(NodeArgs),
    /// List network bridges on a node
    Bridges(NodeArgs),
}

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Restrict the listing to one node
    #[arg(long)]
    pub node: Option<String>,
}

#[derive(Args, Debug)]
pub struct TargetArgs {
    /// Node hosting the container
    pub node: String,
    /// Numeric container id
    pub vmid: u32,
}

#[derive(Args, Debug)]
pub struct NodeArgs {
    pub node: String,
}

#[derive(Args, Debug)]
pub struct RebuildArgs {
    /// Node hosting the container
    pub node: String,
    /// Numeric container id
    pub vmid: u32,

    /// OS template volume id, e.g. local:vztmpl/debian-12-standard_12.2-1_amd64.tar.zst
    #[arg(long)]
    pub ostemplate: String,

    /// Hostname of the recreated container
    #[arg(long)]
    pub hostname: String,

    /// Root password of the recreated container
    #[arg(long, env = "PVEBRIDGE_CT_PASSWORD")]
    pub password: String,

    #[arg(long, default_value_t = 2)]
    pub cores: u16,

    /// CPU limit in cores; unset means unlimited
    #[arg(long)]
    pub cpulimit: Option<f64>,

    /// Memory in MiB
    #[arg(long, default_value_t = 1024)]
    pub memory: u64,

    /// Swap in MiB
    #[arg(long, default_value_t = 512)]
    pub swap: u64,

    /// Root filesystem spec, e.g. local-lvm:8
    #[arg(long)]
    pub rootfs: String,

    /// Host bridge for the first interface
    #[arg(long, default_value = "vmbr0")]
    pub bridge: String,

    /// `dhcp` or a CIDR literal for the first interface
    #[arg(long, default_value = "dhcp")]
    pub ip: String,

    /// Gateway address for a static configuration
    #[arg(long)]
    pub gw: Option<String>,

    /// VLAN tag for the first interface
    #[arg(long)]
    pub vlan: Option<u16>,

    /// Create a privileged container
    #[arg(long)]
    pub privileged: bool,

    /// Feature flags string, e.g. nesting=1
    #[arg(long)]
    pub features: Option<String>,

    /// Leave the container stopped after creation
    #[arg(long)]
    pub no_start: bool,
}

impl RebuildArgs {
    fn into_spec(self) -> RebuildSpec {
        RebuildSpec {
            ostemplate: self.ostemplate,
            hostname: self.hostname,
            password: self.password,
            cores: self.cores,
            cpulimit: self.cpulimit,
            memory: self.memory,
            swap: self.swap,
            rootfs: self.rootfs,
            network: NetworkSpec {
                name: "eth0".into(),
                bridge: self.bridge,
                ip: self.ip,
                gateway: self.gw,
                vlan: self.vlan,
            },
            unprivileged: !self.privileged,
            features: self.features,
            start: !self.no_start,
        }
    }
}

pub async fn execute(command: CtCommand, global: &crate::cli::GlobalFlags) -> anyhow::Result<()> {
    let manager = global.manager()?;

    match command {
        CtCommand::List(args) => list(&manager, args, global).await,
        CtCommand::Status(args) => status(&manager, args, global).await,
        CtCommand::Start(args) => {
            report(manager.start(&args.node, args.vmid).await, global)
        }
        CtCommand::Stop(args) => report(manager.stop(&args.node, args.vmid).await, global),
        CtCommand::Shutdown(args) => {
            report(manager.shutdown(&args.node, args.vmid).await, global)
        }
        CtCommand::Reboot(args) => {
            report(manager.reboot(&args.node, args.vmid).await, global)
        }
        CtCommand::Rm(args) => report(manager.delete(&args.node, args.vmid).await, global),
        CtCommand::Rebuild(args) => rebuild(&manager, args, global).await,
        CtCommand::Console(args) => console(&manager, args, global).await,
        CtCommand::Templates(args) => templates(&manager, args, global).await,
        CtCommand::Storages(args) => storages(&manager, args, global).await,
        CtCommand::Bridges(args) => bridges(&manager, args, global).await,
    }
}

fn report(outcome: OperationOutcome, global: &crate::cli::GlobalFlags) -> anyhow::Result<()> {
    if global.json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        println!("{}", outcome.message);
        if let Some(task) = &outcome.task {
            println!("task: {}", task);
        }
    }
    if !outcome.success {
        anyhow::bail!("operation failed");
    }
    Ok(())
}

async fn list(
    manager: &LxcManager,
    args: ListArgs,
    global: &crate::cli::GlobalFlags,
) -> anyhow::Result<()> {
    let containers = manager.list_containers(args.node.as_deref()).await?;

    if global.json {
        println!("{}", serde_json::to_string_pretty(&containers)?);
        return Ok(());
    }

    let mut table = Table::new();
    table.set_header(vec!["VMID", "NODE", "NAME", "STATUS", "MEM", "MAXMEM"]);
    for ct in &containers {
        table.add_row(vec![
            ct.vmid.to_string(),
            ct.node.clone(),
            ct.name.clone().unwrap_or_default(),
            ct.status.clone(),
            format_bytes(ct.mem),
            format_bytes(ct.maxmem),
        ]);
    }
    println!("{table}");
    Ok(())
}

async fn status(
    manager: &LxcManager,
    args: TargetArgs,
    global: &crate::cli::GlobalFlags,
) -> anyhow::Result<()> {
    let status = manager.status(&args.node, args.vmid).await?;

    if global.json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!("vmid:     {}", status.vmid);
    println!("node:     {}", status.node);
    println!("name:     {}", status.name);
    println!("status:   {}", status.status);
    println!("uptime:   {}s", status.uptime);
    println!("cpu:      {:.1}%", status.cpu * 100.0);
    println!(
        "memory:   {} / {}",
        format_bytes(status.mem),
        format_bytes(status.maxmem)
    );
    Ok(())
}

async fn rebuild(
    manager: &LxcManager,
    args: RebuildArgs,
    global: &crate::cli::GlobalFlags,
) -> anyhow::Result<()> {
    let node = args.node.clone();
    let vmid = args.vmid;
    let outcome = manager.rebuild(&node, vmid, args.into_spec()).await;

    if global.json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
    } else {
        println!("{}", outcome.message);
        if let Some(task) = &outcome.task {
            println!("task: {}", task);
        }
    }
    if !outcome.success {
        anyhow::bail!("rebuild failed at {}", outcome.phase);
    }
    Ok(())
}

async fn console(
    manager: &LxcManager,
    args: TargetArgs,
    global: &crate::cli::GlobalFlags,
) -> anyhow::Result<()> {
    let ticket = manager.console_ticket(&args.node, args.vmid).await?;

    if global.json {
        println!("{}", serde_json::to_string_pretty(&ticket)?);
    } else {
        println!("port:   {}", ticket.port);
        println!("user:   {}", ticket.user);
        println!("ticket: {}", ticket.ticket);
    }
    Ok(())
}

async fn templates(
    manager: &LxcManager,
    args: NodeArgs,
    global: &crate::cli::GlobalFlags,
) -> anyhow::Result<()> {
    let templates = manager.client().list_templates(&args.node).await?;

    if global.json {
        println!("{}", serde_json::to_string_pretty(&templates)?);
        return Ok(());
    }

    let mut table = Table::new();
    table.set_header(vec!["VOLID", "SIZE"]);
    for tpl in &templates {
        table.add_row(vec![tpl.volid.clone(), format_bytes(tpl.size)]);
    }
    println!("{table}");
    Ok(())
}

async fn storages(
    manager: &LxcManager,
    args: NodeArgs,
    global: &crate::cli::GlobalFlags,
) -> anyhow::Result<()> {
    let storages = manager.client().list_storages(&args.node).await?;

    if global.json {
        println!("{}", serde_json::to_string_pretty(&storages)?);
        return Ok(());
    }

    let mut table = Table::new();
    table.set_header(vec!["STORAGE", "TYPE", "ACTIVE", "AVAIL", "TOTAL"]);
    for st in &storages {
        table.add_row(vec![
            st.storage.clone(),
            st.kind.clone(),
            st.active.to_string(),
            format_bytes(st.avail),
            format_bytes(st.total),
        ]);
    }
    println!("{table}");
    Ok(())
}

async fn bridges(
    manager: &LxcManager,
    args: NodeArgs,
    global: &crate::cli::GlobalFlags,
) -> anyhow::Result<()> {
    let bridges = manager.client().list_bridges(&args.node).await?;

    if global.json {
        println!("{}", serde_json::to_string_pretty(&bridges)?);
        return Ok(());
    }

    let mut table = Table::new();
    table.set_header(vec!["IFACE", "ACTIVE", "CIDR"]);
    for br in &bridges {
        table.add_row(vec![
            br.iface.clone(),
            br.active.to_string(),
            br.cidr.clone().unwrap_or_default(),
        ]);
    }
    println!("{table}");
    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_are_humanized() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KiB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.0 GiB");
    }

    #[test]
    fn rebuild_args_map_onto_spec() {
        let args = RebuildArgs {
            node: "pve1".into(),
            vmid: 105,
            ostemplate: "local:vztmpl/debian-12.tar.zst".into(),
            hostname: "web1".into(),
            password: "hunter2".into(),
            cores: 4,
            cpulimit: None,
            memory: 2048,
            swap: 512,
            rootfs: "local-lvm:8".into(),
            bridge: "vmbr1".into(),
            ip: "10.0.0.5/24".into(),
            gw: Some("10.0.0.1".into()),
            vlan: None,
            privileged: false,
            features: Some("nesting=1".into()),
            no_start: false,
        };

        let spec = args.into_spec();
        assert!(spec.unprivileged);
        assert!(spec.start);
        assert_eq!(spec.network.bridge, "vmbr1");
        assert_eq!(spec.network.gateway.as_deref(), Some("10.0.0.1"));
    }
}
