use std::process::ExitCode;

use clap::Parser;
use eyre::{Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use cortexd::cli::{Cli, Command};
use cortexd::config::Config;
use cortexd::planner::Planner;
use cortexd::runtime::Runtime;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load(cli.config.as_ref())?;

    match cli.command {
        Command::Run => {
            let runtime = Runtime::build(config)?;
            runtime.start().await;
            info!("cortexd running; press ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("Failed waiting for ctrl-c")?;
            runtime.shutdown().await;
        }
        Command::Check { file } => {
            let dsl = std::fs::read_to_string(&file)
                .context(format!("Failed to read {}", file.display()))?;
            let planner = Planner::new(config.planner.clone());
            let plan = planner.plan_from_dsl(&dsl, None)?;
            let nodes = plan.cfg.as_ref().map(|c| c.nodes.len()).unwrap_or(0);
            println!("ok: {} nodes, hash {}", nodes, plan.canonical_hash().unwrap_or_default());
        }
        Command::Hash { file } => {
            let dsl = std::fs::read_to_string(&file)
                .context(format!("Failed to read {}", file.display()))?;
            let planner = Planner::new(config.planner.clone());
            let plan = planner.plan_from_dsl(&dsl, None)?;
            println!("{}", plan.canonical_hash().unwrap_or_default());
        }
    }
    Ok(())
}
