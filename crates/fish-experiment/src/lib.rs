//! Protocol engine for automated sequential FISH.
//!
//! - [`config`]: experiment configuration (buffers, well plate, sequence).
//! - [`analyzer`]: static analysis of the sequence into a round registry.
//! - [`wells`]: well coordinates for a possibly rotated plate.
//! - [`resolver`]: buffer name to valve position and stage target.
//! - [`executor`]: runs the steps of one round.
//! - [`flow`]: pumped-volume verification and the volume log.
//! - [`robot`]: session state and the process-boundary operations.
//! - [`coordinator`]: runs all rounds with image acquisition in between.
//! - [`operator`]: scripted operator port for unattended runs and tests.
//!
//! # Example
//!
//! ```rust,ignore
//! use fish_experiment::{Robot, RunCoordinator, ScriptedOperator};
//! use std::sync::Arc;
//!
//! let operator = Arc::new(ScriptedOperator::new());
//! let mut robot = Robot::from_file("config/system.toml".as_ref(), operator.clone())?;
//! robot.initiate_hardware().await;
//! robot.load_experiment("config/experiment.yaml".as_ref())?;
//! robot.zero_stage().await?;
//!
//! let coordinator = RunCoordinator::new(robot, None, operator);
//! let summary = coordinator.run_all_rounds("images".as_ref()).await?;
//! ```

pub mod analyzer;
pub mod config;
pub mod coordinator;
pub mod executor;
pub mod flow;
pub mod operator;
pub mod resolver;
pub mod robot;
pub mod wells;

pub use analyzer::{analyze, Analysis, Finding, RoundRegistry, Severity};
pub use config::{load_experiment_config, ExperimentConfig};
pub use coordinator::{RunCoordinator, RunSummary};
pub use executor::{ExecutorState, RoundOutcome, StepExecutor};
pub use flow::{FlowVerification, FlowVerifier};
pub use operator::ScriptedOperator;
pub use robot::{spawn_round, Robot, RobotStatus, StopHandle};
