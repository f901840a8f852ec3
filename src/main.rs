//! drlfoam: train a flow-control policy on an OpenFOAM case.
//!
//! ```text
//! drlfoam -o training_run -e slurm -r 10 -b 10 -i 50 -s rotatingCylinder2D
//! ```
//!
//! Every episode runs `--buffer` simulation trials (at most `--runners` at a
//! time), updates the agent and writes `checkpoint_<e>.json` and
//! `policy_trace_<e>.json` into the output directory. `--checkpoint` resumes
//! an interrupted run.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use drlfoam::config::{FileConfig, TrainingOptions, DEFAULT_TIMEOUT_SECS};
use drlfoam::training::TrainingSetup;

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

/// Episode-level DRL training for flow-control simulations.
#[derive(Parser)]
#[command(name = "drlfoam", version, about)]
struct Cli {
    /// Training directory (created if missing).
    #[arg(short, long, default_value = "test_training")]
    output: PathBuf,

    /// Execution backend: `local` or `slurm`.
    #[arg(short = 'e', long = "environment", default_value = "local")]
    backend: String,

    /// Number of episodes.
    #[arg(short = 'i', long = "iter", default_value_t = 20)]
    episodes: usize,

    /// Number of trials running at the same time.
    #[arg(short, long, default_value_t = 4)]
    runners: usize,

    /// Successful trials collected per episode.
    #[arg(short, long, default_value_t = 8)]
    buffer: usize,

    /// End time of every training simulation.
    #[arg(short, long, default_value_t = 8.0)]
    finish: f64,

    /// Wall-clock limit of one trial in seconds.
    #[arg(short, long, default_value_t = DEFAULT_TIMEOUT_SECS)]
    timeout: u64,

    /// Checkpoint to resume from; relative to the output directory.
    #[arg(short, long)]
    checkpoint: Option<PathBuf>,

    /// Simulation case.
    #[arg(short, long, default_value = "rotatingCylinder2D")]
    simulation: String,

    /// Minimum successful trials for an episode to count.
    #[arg(long = "min-success", default_value_t = 1)]
    min_success: usize,

    /// JSON file overriding agent and Slurm settings.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Root of the case library and cluster setup scripts.
    #[arg(long, env = "DRL_BASE", default_value = "")]
    drl_base: PathBuf,
}

// ---------------------------------------------------------------------------
// Entrypoint
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise tracing (reads RUST_LOG env var, defaults to info).
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let file = match &cli.config {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };

    let config = TrainingOptions {
        output: cli.output,
        backend: cli.backend,
        episodes: cli.episodes,
        n_runners: cli.runners,
        buffer_size: cli.buffer,
        end_time: cli.finish,
        timeout_secs: cli.timeout,
        checkpoint: cli.checkpoint,
        simulation: cli.simulation,
        min_successful_trials: cli.min_success,
        drl_base: cli.drl_base,
        file,
    }
    .resolve()?;

    let mut training = TrainingSetup::new(config).start().await?;
    let summary = training.run().await?;

    tracing::info!(
        first_episode = summary.first_episode,
        episodes_run = summary.episodes_run,
        "Done"
    );
    Ok(())
}
