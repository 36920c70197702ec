use clap::Parser;

mod core;

/// One-shot warehouse sync run.
#[derive(Debug, Parser)]
#[command(name = "syncd", about = "Sync tracker and planner data into the warehouse")]
struct Cli {
    /// Discard all existing target rows before loading, for every entity.
    #[arg(long)]
    full_reload: bool,

    /// Restrict the run to these entities; repeatable or comma-separated.
    #[arg(long)]
    only: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing("syncd");

    let cli = Cli::parse();
    core::start_sync(cli.full_reload, cli.only).await
}
