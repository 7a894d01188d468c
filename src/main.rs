//! CLI Entry Point for second-harmonic
//!
//! Provides command-line interface for:
//! - Running a queue of rotation sweeps over a magnet current range
//! - Checking a configuration file
//! - Reading back the magnet supply state
//!
//! # Usage
//!
//! Dry run against simulated instruments:
//! ```bash
//! second-harmonic sweep --mock --max-angle 18 --delay 0 --output /tmp/run
//! ```
//!
//! Current range on the real rig:
//! ```bash
//! second-harmonic sweep --config config/second_harmonic.toml \
//!     --min-current 0.5 --max-current 2.0 --current-step 0.5 --sample NiFe
//! ```
//!
//! Ctrl-C requests a stop: the running sweep finishes its current point,
//! ramps the magnet down, homes the stage and the remaining jobs are skipped.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use second_harmonic::config::{SourceKind, SweepConfig, DEFAULT_CONFIG_PATH};
use second_harmonic::data::StopFlag;
use second_harmonic::hardware::capabilities::RigConnector;
use second_harmonic::hardware::mock::{MockRig, SignalModel};
use second_harmonic::hardware::GpibRig;
use second_harmonic::logging;
use second_harmonic::procedures::SweepTiming;
use second_harmonic::queue::{JobQueue, SweepPlan};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "second-harmonic")]
#[command(about = "Second harmonic versus rotation angle sweeps", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one sweep per magnet current
    Sweep(SweepArgs),

    /// Load and validate the configuration, then print it as TOML
    CheckConfig,

    /// Print what the configured magnet supply reports
    MagnetStatus,
}

#[derive(Args)]
struct SweepArgs {
    /// Use simulated instruments
    #[arg(long)]
    mock: bool,

    /// First magnet current (A); defaults to the configured current
    #[arg(long)]
    min_current: Option<f64>,

    /// Last magnet current (A), inclusive; defaults to the first
    #[arg(long)]
    max_current: Option<f64>,

    /// Current increment (A)
    #[arg(long, default_value_t = 1.0)]
    current_step: f64,

    /// Rotation in each direction (deg)
    #[arg(long)]
    max_angle: Option<f64>,

    /// Settle time after each step (s)
    #[arg(long)]
    delay: Option<f64>,

    /// Magnet ramping rate (A/s)
    #[arg(long)]
    ramp_rate: Option<f64>,

    /// Output directory for results files
    #[arg(long)]
    output: Option<PathBuf>,

    /// Sample name, used as the file name prefix
    #[arg(long)]
    sample: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = SweepConfig::load_from(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;

    match cli.command {
        Commands::Sweep(args) => run_sweeps(config, args).await,
        Commands::CheckConfig => check_config(config),
        Commands::MagnetStatus => magnet_status(config).await,
    }
}

async fn run_sweeps(mut config: SweepConfig, args: SweepArgs) -> Result<()> {
    if let Some(max_angle) = args.max_angle {
        config.sweep.max_angle = max_angle;
    }
    if let Some(delay) = args.delay {
        config.sweep.delay_seconds = delay;
    }
    if let Some(rate) = args.ramp_rate {
        config.sweep.ramp_rate = rate;
    }
    if let Some(output) = args.output {
        config.storage.output_dir = output;
    }
    if let Some(sample) = args.sample {
        config.storage.sample = sample;
    }
    config.validate()?;
    logging::init_from_config(&config)?;

    let mut plan = SweepPlan::from_config(&config);
    plan.min_current = args.min_current.unwrap_or(config.sweep.target_current);
    plan.max_current = args.max_current.unwrap_or(plan.min_current);
    plan.current_step = args.current_step;

    let connector: Arc<dyn RigConnector> = if args.mock {
        info!("Using simulated instruments");
        config.timing = SweepTiming::immediate();
        let signal = SignalModel {
            degrees_per_step: config.sweep.degrees_per_step,
            ..SignalModel::default()
        };
        Arc::new(MockRig::with_signal(config.motor, signal))
    } else {
        Arc::new(GpibRig::new(config.instruments.clone()))
    };

    let stop = StopFlag::new();
    let handler = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received, finishing the current point");
            handler.request_stop();
        }
    });

    let mut queue = JobQueue::from_config(&config, connector, stop);
    queue.enqueue_plan(&plan)?;
    tokio::spawn(log_progress(queue.subscribe_progress()));
    let report = queue.run().await;

    for file in &report.files {
        println!("{}", file.display());
    }
    if report.failed > 0 {
        bail!(
            "{} of {} jobs failed",
            report.failed,
            report.finished + report.aborted + report.failed + report.skipped
        );
    }
    Ok(())
}

/// Log the running sweep's progress every ten percent.
async fn log_progress(mut progress: watch::Receiver<f64>) {
    let mut last = None;
    while progress.changed().await.is_ok() {
        let percent = *progress.borrow_and_update();
        let decile = (percent / 10.0).floor() as i64;
        if last != Some(decile) {
            info!(percent, "Sweep progress");
            last = Some(decile);
        }
    }
}

fn check_config(config: SweepConfig) -> Result<()> {
    config.validate()?;
    print!("{}", config.to_toml()?);
    Ok(())
}

#[cfg(feature = "instrument_serial")]
async fn magnet_status(config: SweepConfig) -> Result<()> {
    config.validate()?;
    logging::init_from_config(&config)?;

    let rig = GpibRig::new(config.instruments.clone());
    let bus = rig.open_bus()?;
    bus.initialize().await?;

    match config.instruments.source.kind {
        SourceKind::Sm7045d => {
            let supply = rig.supply(bus);
            println!("Setpoint:         {} A", supply.current_setpoint().await?);
            println!("Output current:   {} A", supply.measured_current().await?);
            println!("Output voltage:   {} V", supply.measured_voltage().await?);
        }
        SourceKind::Ami430 => {
            let magnet = rig.magnet(bus);
            println!("State:            {}", magnet.status().await?);
            println!("Magnet current:   {} A", magnet.magnet_current().await?);
            println!("Supply current:   {} A", magnet.supply_current().await?);
            println!("Field:            {} kG", magnet.field().await?);
            println!("Target current:   {} A", magnet.target_current().await?);
            println!("Target field:     {} kG", magnet.target_field().await?);
            println!("Ramp rate:        {} A/s", magnet.ramp_rate_current().await?);
            println!("Ramp rate field:  {} kG/s", magnet.ramp_rate_field().await?);
            println!("Coil constant:    {} kG/A", magnet.coil_constant().await?);
            println!("Voltage limit:    {} V", magnet.voltage_limit().await?);
            let switch = magnet.persistent_switch_enabled().await?;
            println!("Persistent switch: {}", if switch { "heated" } else { "off" });
        }
    }
    Ok(())
}

#[cfg(not(feature = "instrument_serial"))]
async fn magnet_status(_config: SweepConfig) -> Result<()> {
    bail!("magnet-status needs the instrument_serial feature")
}
