mod cli;
mod commands;

use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = cli::Cli::parse();
    match cli.command {
        cli::Command::Nodes(args) => commands::nodes::execute(args, &cli.global).await,
        cli::Command::Ct(cmd) => commands::ct::execute(cmd, &cli.global).await,
        cli::Command::Nat(cmd) => commands::nat::execute(cmd, &cli.global).await,
    }
}
