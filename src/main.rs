//! `daqmx-tmux`: run measurement cycles against the simulated backend.
//!
//! ```text
//! daqmx-tmux --config config/daqmx-tmux.toml --measurements 5 --nshots 200
//! RUST_LOG=daqmx_tmux=debug daqmx-tmux --json
//! ```

use anyhow::Context;
use clap::Parser;
use serde_json::json;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use daqmx_tmux::config::{DaemonConfig, DEFAULT_CONFIG_PATH};
use daqmx_tmux::{Orchestrator, SimulatedBackend};

#[derive(Parser, Debug)]
#[command(name = "daqmx-tmux", version, about = "Time-multiplexed analog acquisition daemon")]
struct Cli {
    /// Configuration file; DAQMX_TMUX_* variables override it.
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Number of measurement cycles to run.
    #[arg(short, long, default_value_t = 1)]
    measurements: u64,

    /// Override the configured shot count.
    #[arg(long)]
    nshots: Option<usize>,

    /// Emit logs as JSON.
    #[arg(long)]
    json: bool,

    /// Print the effective configuration and exit.
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = DaemonConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    if cli.print_config {
        print!("{}", config.to_toml_string()?);
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));
    if cli.json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let orchestrator = Orchestrator::from_config(&config, Box::new(SimulatedBackend::new()))
        .context("starting orchestrator")?;
    if let Some(nshots) = cli.nshots {
        orchestrator.set_nshots(nshots)?;
    }
    info!(
        table = %orchestrator.ownership_table(),
        outputs = ?orchestrator.channel_names(),
        "Starting {} measurement(s)",
        cli.measurements
    );

    for _ in 0..cli.measurements {
        let measurement = orchestrator.measure().await?;
        let outputs: serde_json::Map<String, serde_json::Value> = measurement
            .outputs
            .iter()
            .map(|o| (o.name.clone(), json!(o.value)))
            .collect();
        let report = json!({
            "id": measurement.id,
            "nshots": measurement.raw.nshots(),
            "outputs": outputs,
            "seconds_for_acquisition": measurement.timing.acquisition.as_secs_f64(),
            "seconds_for_shots_processing": measurement.timing.processing.as_secs_f64(),
            "seconds_since_last_task": measurement.timing.since_last.map(|d| d.as_secs_f64()),
        });
        println!("{report}");
    }

    orchestrator.shutdown().await;
    Ok(())
}
