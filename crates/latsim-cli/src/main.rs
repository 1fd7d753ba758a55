//! latsim command line.
//!
//! Runs one simulation scenario from a scenario document and prints the
//! per-chain summary:
//!
//! ```bash
//! latsim --config scenario.json --scenario-id sim1
//! latsim --config scenario.json --scenario-id sim1 --save-all
//! ```
//!
//! Exits 0 on success, non-zero on a config error or an unknown scenario.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use latsim_config::ScenarioManager;
use latsim_core::ResultsStore;
use tracing_subscriber::EnvFilter;

/// Discrete-event latency simulator for microservice chains.
#[derive(Parser)]
#[command(name = "latsim")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the scenario document (JSON).
    #[arg(long)]
    config: PathBuf,

    /// Name of the simulation scenario to run.
    #[arg(long)]
    scenario_id: String,

    /// Persist the full results document through the configured storage
    /// driver.
    #[arg(long)]
    save_all: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let manager = ScenarioManager::from_file(&cli.config)
        .with_context(|| format!("loading scenario document {}", cli.config.display()))?;
    let mut simulation = manager
        .build_simulation(&cli.scenario_id)
        .with_context(|| format!("building scenario {}", cli.scenario_id))?;

    tracing::info!(scenario = %cli.scenario_id, "starting simulation");
    simulation.run();
    let results = simulation.results();

    println!("scenario {}:", cli.scenario_id);
    for (chain, result) in &results.service_chains {
        println!(
            "  {chain}: {} requests, avg latency {:.3} ms",
            result.total_requests,
            result.avg_latency / 1e6
        );
    }

    if cli.save_all {
        let store = manager
            .results_store()?
            .context("scenario document declares no storage driver")?;
        let dir = store
            .save_all(
                &simulation.name,
                &results,
                &simulation.cpu_timelines(),
            )
            .context("writing results")?;
        println!("results written to {}", dir.display());
    }

    Ok(())
}
