use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod cli;
mod config;
mod discovery;
mod error;
mod exec;
mod mask;
mod namelist;
mod paths;
mod pipeline;
mod settings;
mod stage;
mod util;

use config::RunConfig;
use exec::ProcessExecutor;
use pipeline::Pipeline;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = cli::RootArgs::parse();
    let config = RunConfig::load(&args.settings)
        .with_context(|| format!("load settings {}", args.settings.display()))?;
    tracing::info!(
        region = %config.name,
        forcing = %config.forcing,
        stamp = %config.stamp,
        compute_weights = config.compute_weights,
        "starting run"
    );

    let plan: Vec<String> = Pipeline::<ProcessExecutor>::plan(&config)
        .iter()
        .map(ToString::to_string)
        .collect();
    tracing::info!("planned stages: {}", plan.join(", "));

    let work_dir = std::env::current_dir().context("resolve working directory")?;
    let executor = ProcessExecutor::new(config.env_overlays.clone());
    let mut pipeline = Pipeline::new(&config, executor, &work_dir);
    let report = pipeline.run()?;

    tracing::info!(state = ?pipeline.state(), stages = report.stages.len(), "run complete");
    for product in report.surfdata.values().flatten() {
        println!("{}", product.display());
    }
    Ok(())
}
