//! Command line front-end for the seqFISH fluidics engine.
//!
//! # Usage
//!
//! Check an experiment without hardware:
//! ```bash
//! fish analyze --experiment config/experiment.yaml
//! ```
//!
//! Run every round, zeroing the stage where it stands, with TTL-synced imaging:
//! ```bash
//! fish --system config/system.toml --experiment config/experiment.yaml \
//!     run-all --save-dir /data/run1 --zero-here --sync ttl --sync-target /dev/ttyACM0
//! ```
//!
//! Ctrl-C requests a stop; the running round ends at the next step boundary.

// Global allocator (Microsoft Rust Guidelines: M-MIMALLOC-APPS)
#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

mod console;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use fish_core::capabilities::{Axis, ImageAcquirer};
use fish_core::operator::OperatorPort;
use fish_experiment::{
    analyze, load_experiment_config, Robot, RunCoordinator, ScriptedOperator, Severity,
    StopHandle,
};
use fish_hardware::imaging::{build_acquirer, SyncConfig};
use fish_hardware::ports::list_ports;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::console::ConsoleOperator;

#[derive(Parser)]
#[command(name = "fish")]
#[command(about = "Automated fluidics and imaging for sequential FISH", long_about = None)]
struct Cli {
    /// System (hardware) configuration, TOML or JSON
    #[arg(long, global = true, default_value = "config/system.toml")]
    system: PathBuf,

    /// Experiment configuration, YAML
    #[arg(long, global = true, default_value = "config/experiment.yaml")]
    experiment: PathBuf,

    /// Confirm every prompt automatically (unattended runs)
    #[arg(long, global = true)]
    assume_yes: bool,

    /// Log as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Analyze the experiment: rounds, durations and configuration problems
    Analyze,

    /// List serial ports
    Ports,

    /// Run every available round, acquiring images in between
    RunAll {
        #[command(flatten)]
        stage: StageArgs,
        #[command(flatten)]
        imaging: ImagingArgs,
    },

    /// Run a single round
    RunRound {
        /// Round id
        round: String,
        #[command(flatten)]
        stage: StageArgs,
        #[command(flatten)]
        imaging: ImagingArgs,
    },

    /// Move inlet valve and stage to a buffer
    SelectBuffer {
        /// Buffer name
        name: String,
        #[command(flatten)]
        stage: StageArgs,
    },

    /// Select a buffer and pump it for a number of seconds
    Pump {
        /// Buffer name
        buffer: String,
        /// Duration in seconds
        seconds: f64,
        #[command(flatten)]
        stage: StageArgs,
    },

    /// Move the outlet valve
    ValveOut {
        /// Outlet position (1-based)
        position: u32,
    },

    /// Move the stage relative to its current position
    Jog {
        /// Axis (X, Y or Z)
        axis: Axis,
        /// Distance in mm
        #[arg(allow_hyphen_values = true)]
        distance: f64,
    },

    /// Move the stage to its origin, Z first
    Zero,
}

#[derive(Args)]
struct StageArgs {
    /// Declare the current stage position as origin before starting
    #[arg(long)]
    zero_here: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum SyncMethod {
    /// Serial TTL box
    Ttl,
    /// Sync file toggled between 1 and 0
    FileWrite,
    /// Sync file created, deleted by the microscope
    FileCreate,
}

#[derive(Args)]
struct ImagingArgs {
    /// Directory the microscope saves images into
    #[arg(long, default_value = ".")]
    save_dir: PathBuf,

    /// Synchronization with the microscope; no imaging if absent
    #[arg(long, value_enum)]
    sync: Option<SyncMethod>,

    /// Serial port (ttl) or sync file path (file-write, file-create)
    #[arg(long, requires = "sync")]
    sync_target: Option<String>,

    /// Baud rate of the TTL box
    #[arg(long, default_value_t = 115200)]
    sync_baudrate: u32,
}

impl ImagingArgs {
    fn sync_config(&self) -> Result<Option<SyncConfig>> {
        let Some(method) = self.sync else {
            return Ok(None);
        };
        let target = self
            .sync_target
            .clone()
            .context("--sync needs --sync-target")?;
        Ok(Some(match method {
            SyncMethod::Ttl => SyncConfig::Ttl {
                port: target,
                baudrate: self.sync_baudrate,
            },
            SyncMethod::FileWrite => SyncConfig::FileWrite {
                path: target.into(),
            },
            SyncMethod::FileCreate => SyncConfig::FileCreate {
                path: target.into(),
            },
        }))
    }
}

fn init_logging(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_json);

    let operator: Arc<dyn OperatorPort> = if cli.assume_yes {
        Arc::new(ScriptedOperator::new())
    } else {
        Arc::new(ConsoleOperator::new())
    };

    match &cli.command {
        Commands::Analyze => analyze_experiment(&cli.experiment),
        Commands::Ports => {
            for port in list_ports()? {
                println!("{}", port);
            }
            Ok(())
        }
        Commands::RunAll { stage, imaging } => {
            let robot = prepare(&cli, operator.clone(), stage).await?;
            let acquirer = acquirer(imaging).await?;
            let coordinator = RunCoordinator::new(robot, acquirer, operator);
            stop_on_ctrl_c(coordinator.stop_handle());
            let summary = coordinator.run_all_rounds(&imaging.save_dir).await?;
            println!(
                "Completed rounds: {:?} (imaged: {:?})",
                summary.completed, summary.imaged
            );
            if summary.stopped {
                println!("Run stopped on request");
            }
            Ok(())
        }
        Commands::RunRound {
            round,
            stage,
            imaging,
        } => {
            let robot = prepare(&cli, operator.clone(), stage).await?;
            let acquirer = acquirer(imaging).await?;
            let coordinator = RunCoordinator::new(robot, acquirer, operator);
            stop_on_ctrl_c(coordinator.stop_handle());
            let outcome =
                fish_experiment::spawn_round(coordinator.robot(), round.clone()).await??;
            if outcome.acquire {
                coordinator
                    .acquire_with_retry(&imaging.save_dir, round)
                    .await?;
            }
            Ok(())
        }
        Commands::SelectBuffer { name, stage } => {
            let mut robot = prepare(&cli, operator, stage).await?;
            robot.select_buffer(name).await?;
            robot.close_all();
            Ok(())
        }
        Commands::Pump {
            buffer,
            seconds,
            stage,
        } => {
            let mut robot = prepare(&cli, operator, stage).await?;
            robot.select_buffer(buffer).await?;
            robot.run_pump(*seconds).await?;
            robot.close_all();
            Ok(())
        }
        Commands::ValveOut { position } => {
            let mut robot = initiate(&cli, operator).await?;
            robot.move_valve_out(*position).await?;
            robot.close_all();
            Ok(())
        }
        Commands::Jog { axis, distance } => {
            let mut robot = initiate(&cli, operator).await?;
            robot.jog_stage(*axis, *distance).await?;
            robot.close_all();
            Ok(())
        }
        Commands::Zero => {
            let mut robot = initiate(&cli, operator).await?;
            robot.move_zero().await?;
            robot.close_all();
            Ok(())
        }
    }
}

fn analyze_experiment(path: &Path) -> Result<()> {
    let config = load_experiment_config(path)?;
    let analysis = analyze(&config);

    println!("Rounds ({}):", analysis.registry.round_ids().len());
    for id in analysis.registry.round_ids() {
        let buffers = analysis
            .registry
            .round(id)
            .map(|r| r.cycling_buffers.join(", "))
            .unwrap_or_default();
        println!(
            "  {:>6}  {:>7.2} min  {}",
            id,
            analysis.registry.estimated_minutes(id),
            buffers
        );
    }
    println!("Fixed buffers: {}", analysis.fixed_buffers.join(", "));
    for finding in &analysis.findings {
        println!("{}", finding);
    }

    let errors = analysis
        .findings
        .iter()
        .filter(|f| f.severity == Severity::Error)
        .count();
    if errors > 0 {
        anyhow::bail!("{} configuration problem(s) found", errors);
    }
    Ok(())
}

async fn initiate(cli: &Cli, operator: Arc<dyn OperatorPort>) -> Result<Robot> {
    let mut robot = Robot::from_file(&cli.system, operator)?;
    robot.initiate_hardware().await;
    Ok(robot)
}

async fn prepare(
    cli: &Cli,
    operator: Arc<dyn OperatorPort>,
    stage: &StageArgs,
) -> Result<Robot> {
    let mut robot = initiate(cli, operator).await?;
    robot.load_experiment(&cli.experiment)?;
    if stage.zero_here {
        robot.zero_stage().await?;
    } else if !robot.status().demo {
        warn!("Stage not zeroed; pass --zero-here once the stage is at its origin");
    }
    info!(rounds = ?robot.available_rounds(), "Robot ready");
    Ok(robot)
}

async fn acquirer(imaging: &ImagingArgs) -> Result<Option<Arc<dyn ImageAcquirer>>> {
    match imaging.sync_config()? {
        Some(config) => Ok(Some(build_acquirer(&config).await?)),
        None => {
            info!("No imaging synchronization selected, rounds run without acquisition");
            Ok(None)
        }
    }
}

fn stop_on_ctrl_c(stop: StopHandle) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("Stop requested, finishing the current step...");
            stop.request_stop();
        }
    });
}
