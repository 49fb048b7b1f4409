//! kernscope sensor
//!
//! Loads configuration, attaches the probe set against a simulated kernel
//! memory image and replays recorded hook invocations, writing every
//! emitted record as JSONL.

mod export;
mod scenario;

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use kernscope_core::config::{ConfigLoader, SensorConfig};
use kernscope_core::SENSOR_VERSION;
use kernscope_probes::ProbeManager;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use crate::export::JsonlWriter;
use crate::scenario::Scenario;

#[derive(Parser)]
#[command(name = "kernscope")]
#[command(version)]
#[command(about = "Kernel activity probes replayed against simulated memory", long_about = None)]
struct Cli {
    /// Increase verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Log format (json, text)
    #[arg(short, long, default_value = "text")]
    format: String,

    /// Path to configuration file
    #[arg(short, long, global = true, env = "KERNSCOPE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a scenario file through the probe handlers
    Replay {
        /// Scenario JSON
        scenario: PathBuf,

        /// Output file for JSONL records (stdout if unset)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Write final counters in Prometheus text format to this file
        #[arg(long)]
        metrics: Option<PathBuf>,
    },

    /// Load and validate the configuration, then exit
    CheckConfig,

    /// Print the effective configuration as TOML
    PrintConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let loader = ConfigLoader::new().with_cli_path(cli.config.clone());
    if let Commands::CheckConfig = cli.command {
        // Errors go straight to the caller instead of falling back to defaults
        loader.load().context("configuration is invalid")?;
        println!("Configuration OK");
        return Ok(());
    }

    let config = load_config(&loader);
    init_logging(&cli, &config)?;

    match cli.command {
        Commands::Replay {
            scenario,
            output,
            metrics,
        } => replay_command(config, &scenario, output, metrics).await,
        Commands::PrintConfig => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::CheckConfig => Ok(()),
    }
}

/// Load configuration from file/env, with fallback to defaults
fn load_config(loader: &ConfigLoader) -> SensorConfig {
    match loader.load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}, using defaults", e);
            SensorConfig::default()
        }
    }
}

/// CLI verbosity wins over the configured level. Logs go to stderr so
/// stdout stays clean for records.
fn init_logging(cli: &Cli, config: &SensorConfig) -> anyhow::Result<()> {
    let log_level = if cli.verbose > 0 {
        match cli.verbose {
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        }
    } else {
        match config.sensor.log_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::WARN,
        }
    };

    let builder = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .with_target(false);

    if cli.format == "json" {
        tracing::subscriber::set_global_default(builder.json().finish())?;
    } else {
        tracing::subscriber::set_global_default(builder.finish())?;
    }
    Ok(())
}

async fn replay_command(
    config: SensorConfig,
    scenario_path: &Path,
    output: Option<PathBuf>,
    metrics: Option<PathBuf>,
) -> anyhow::Result<()> {
    info!("kernscope v{}", SENSOR_VERSION);

    let scenario = Scenario::load(scenario_path)
        .with_context(|| format!("loading scenario {}", scenario_path.display()))?;
    let memory = scenario.memory_image()?;

    let capacity = config.probes.output.capacity;
    let (manager, channels) = ProbeManager::attach(config.probes.clone(), memory)?;
    scenario.install_rules(&manager)?;

    let output = output.or_else(|| config.export.path.as_ref().map(PathBuf::from));
    let writer = JsonlWriter::open(output.as_deref(), config.export.pretty)?;
    let (records, forwarders) = export::merge(channels, capacity);
    let drain = tokio::spawn(export::drain(records, writer));

    // Handlers are synchronous; keep them off the runtime threads
    let (manager, summary) = tokio::task::spawn_blocking(move || {
        let summary = scenario.replay(&manager);
        (manager, summary)
    })
    .await?;

    let prometheus = manager.stats().to_prometheus();
    let stats = manager.detach();
    for forwarder in forwarders {
        forwarder.await?;
    }
    let written = drain.await??;

    info!(
        steps = summary.steps,
        emitted = summary.emitted,
        pending = summary.pending,
        skipped = summary.skipped,
        passed = summary.passed,
        dropped = summary.dropped,
        written,
        "Replay finished"
    );
    if stats.dropped > 0 {
        warn!(dropped = stats.dropped, "Records lost to full output channels");
    }
    info!(?stats, "Probe statistics");

    if let Some(path) = metrics {
        std::fs::write(&path, prometheus).with_context(|| format!("writing metrics to {}", path.display()))?;
    }

    Ok(())
}
