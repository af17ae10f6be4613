use clap::Args;
use comfy_table::Table;

#[derive(Args, Debug)]
pub struct NodesArgs {}

pub async fn execute(_args: NodesArgs, global: &crate::cli::GlobalFlags) -> anyhow::Result<()> {
    let manager = global.manager()?;
    let nodes = manager.client().list_nodes().await?;

    if global.json {
        println!("{}", serde_json::to_string_pretty(&nodes)?);
        return Ok(());
    }

    let mut table = Table::new();
    table.set_header(vec!["NODE", "STATUS"]);
    for node in &nodes {
        table.add_row(vec![
            node.node.clone(),
            if node.online { "online" } else { "offline" }.to_string(),
        ]);
    }
    println!("{table}");
    Ok(())
}
