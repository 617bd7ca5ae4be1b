//! The fluidics robot: assigned drivers, loaded experiment and session state.
//!
//! Every process-boundary operation is a method here. Status flags gate which
//! operations are legal:
//!
//! | Operation                      | Needs                                        |
//! |--------------------------------|----------------------------------------------|
//! | `zero_stage`, `jog_stage`      | ports assigned (jog: stage not zeroed yet)   |
//! | `select_buffer`, rounds        | ports assigned, experiment loaded, zeroed*   |
//! | `run_pump`                     | a buffer selected since the last manual pump |
//! | `move_valve_out`               | an outlet valve                              |
//!
//! \* In demo mode the stage does not need to be zeroed.
//!
//! A round runs on its own tokio task ([`spawn_round`]) holding the robot
//! lock, so the caller stays free to request a stop through the
//! [`StopHandle`]. Manual pumping and single rounds clear an earlier stop
//! request before they start. Rounds inside a multi-round run do not, so a
//! stop requested between two rounds still ends the run.

use fish_core::capabilities::Axis;
use fish_core::error::{AppResult, FluidicsError};
use fish_core::operator::OperatorPort;
use fish_hardware::config::{load_system_config, SystemConfig};
use fish_hardware::drivers::demo::DeviceRecorder;
use fish_hardware::factory::{assign_all, DeviceComponents};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::analyzer::{analyze, Analysis};
use crate::config::{load_experiment_config, ExperimentConfig, Step};
use crate::executor::{RoundContext, RoundOutcome, StepExecutor};
use crate::flow::{FlowVerification, FlowVerifier};
use crate::resolver::{move_to_origin, BufferResolver};

/// Round id used for volume log rows of manual pump runs.
pub const MANUAL_ROUND: &str = "manual";

/// Session flags.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RobotStatus {
    /// Simulated drivers, shortened waits.
    pub demo: bool,
    /// Hardware initiated.
    pub ports_assigned: bool,
    /// Stage origin set by the operator.
    pub stage_zeroed: bool,
    /// Experiment configuration loaded and analyzed.
    pub experiment_config_loaded: bool,
    /// A buffer was selected since the last manual pump run.
    pub buffer_selected: bool,
    /// An outlet valve is assigned.
    pub outlet_valve_present: bool,
    /// The last completed round asked for image acquisition.
    pub acquire_after_round: bool,
}

/// Stop request shared between the caller and the round worker.
///
/// The token is swapped for a fresh one on [`StopHandle::reset`], so a stop
/// only affects the run it was issued for.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<Mutex<CancellationToken>>);

impl StopHandle {
    /// Ask the running round to stop at the next step boundary.
    pub fn request_stop(&self) {
        info!("Stop requested");
        self.0.lock().cancel();
    }

    /// True if a stop was requested since the last reset.
    pub fn is_stop_requested(&self) -> bool {
        self.0.lock().is_cancelled()
    }

    /// Clear a previous stop request.
    pub fn reset(&self) {
        let mut token = self.0.lock();
        if token.is_cancelled() {
            *token = CancellationToken::new();
        }
    }

    /// Token for the next round.
    pub fn token(&self) -> CancellationToken {
        self.0.lock().clone()
    }
}

/// Loaded experiment with its analysis.
struct LoadedExperiment {
    config: Arc<ExperimentConfig>,
    analysis: Analysis,
    resolver: BufferResolver,
}

/// The fluidics robot.
pub struct Robot {
    system: SystemConfig,
    operator: Arc<dyn OperatorPort>,
    devices: DeviceComponents,
    recorder: Option<DeviceRecorder>,
    experiment: Option<LoadedExperiment>,
    flow: FlowVerifier,
    status: RobotStatus,
    stop: StopHandle,
    time_scale: f64,
}

impl Robot {
    /// Robot for `system`; no hardware is touched until
    /// [`Robot::initiate_hardware`].
    pub fn new(system: SystemConfig, operator: Arc<dyn OperatorPort>) -> Self {
        let verification = system
            .flow_sensor
            .as_ref()
            .map(|sensor| FlowVerification::from(sensor.verification))
            .unwrap_or_default();
        let status = RobotStatus {
            demo: system.demo,
            ..RobotStatus::default()
        };
        Self {
            system,
            operator,
            devices: DeviceComponents::default(),
            recorder: None,
            experiment: None,
            flow: FlowVerifier::new(verification, "."),
            status,
            stop: StopHandle::default(),
            time_scale: 1.0,
        }
    }

    /// Robot for the system configuration in `path`.
    pub fn from_file(path: &Path, operator: Arc<dyn OperatorPort>) -> AppResult<Self> {
        let system = load_system_config(path)
            .map_err(|e| FluidicsError::Configuration(format!("{:#}", e)))?;
        Ok(Self::new(system, operator))
    }

    /// Robot with drivers already assigned.
    pub fn with_components(
        system: SystemConfig,
        devices: DeviceComponents,
        operator: Arc<dyn OperatorPort>,
    ) -> Self {
        let mut robot = Self::new(system, operator);
        robot.install(devices);
        robot
    }

    fn install(&mut self, devices: DeviceComponents) {
        for failure in &devices.failures {
            self.operator.notify(failure);
        }
        self.status.outlet_valve_present = devices.valve_out.is_some();
        self.status.ports_assigned = true;
        self.time_scale = if self.status.demo {
            self.system.demo_time_scale
        } else {
            1.0
        };
        self.devices = devices;
    }

    /// Assign drivers for every configured role.
    ///
    /// Roles that fail are reported and stay unassigned; operations that
    /// need them fail later with a "not ready" error.
    pub async fn initiate_hardware(&mut self) {
        let devices = if self.status.demo {
            let recorder = DeviceRecorder::new();
            let devices = DeviceComponents::demo(&self.system, &recorder);
            self.recorder = Some(recorder);
            devices
        } else {
            assign_all(&self.system).await
        };
        info!(?devices, "Hardware initiated");
        self.install(devices);
    }

    /// Load and analyze the experiment configuration in `path`.
    ///
    /// The volume log is written next to it.
    pub fn load_experiment(&mut self, path: &Path) -> AppResult<&Analysis> {
        let config = load_experiment_config(path)?;
        let log_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        self.set_experiment(config, log_dir)
    }

    /// Install an already parsed experiment configuration.
    pub fn set_experiment(
        &mut self,
        config: ExperimentConfig,
        log_dir: impl Into<PathBuf>,
    ) -> AppResult<&Analysis> {
        let config = Arc::new(config);
        let analysis = analyze(&config);
        let errors = analysis
            .findings
            .iter()
            .filter(|f| f.severity == crate::analyzer::Severity::Error)
            .count();
        if errors > 0 {
            self.operator.notify(&format!(
                "{} configuration problem(s) in the experiment, see log",
                errors
            ));
        }
        let resolver = BufferResolver::new(Arc::clone(&config))?;

        self.flow = FlowVerifier::new(self.flow.settings(), log_dir);
        self.status.experiment_config_loaded = true;
        self.status.buffer_selected = false;
        let loaded = self.experiment.insert(LoadedExperiment {
            config,
            analysis,
            resolver,
        });
        Ok(&loaded.analysis)
    }

    /// Session flags.
    pub fn status(&self) -> &RobotStatus {
        &self.status
    }

    /// Assigned drivers.
    pub fn devices(&self) -> &DeviceComponents {
        &self.devices
    }

    /// Call recorder of the simulated drivers, in demo mode.
    pub fn recorder(&self) -> Option<&DeviceRecorder> {
        self.recorder.as_ref()
    }

    /// Analysis of the loaded experiment.
    pub fn analysis(&self) -> Option<&Analysis> {
        self.experiment.as_ref().map(|e| &e.analysis)
    }

    /// Rounds not run yet, in run order.
    pub fn available_rounds(&self) -> Vec<String> {
        self.analysis()
            .map(|a| a.registry.available().to_vec())
            .unwrap_or_default()
    }

    /// Flow verification and volume log.
    pub fn flow(&self) -> &FlowVerifier {
        &self.flow
    }

    /// Change flow verification settings for the rest of the session.
    pub fn set_flow_verification(&mut self, settings: FlowVerification) {
        self.flow.set_settings(settings);
    }

    /// Handle for stop requests.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    fn require_ports(&self) -> AppResult<()> {
        if self.status.ports_assigned {
            Ok(())
        } else {
            Err(FluidicsError::NotReady("hardware not initiated".into()))
        }
    }

    fn require_fluidics(&self) -> AppResult<()> {
        self.require_ports()?;
        if !self.status.experiment_config_loaded {
            return Err(FluidicsError::NotReady(
                "experiment configuration not loaded".into(),
            ));
        }
        if !self.status.stage_zeroed && !self.status.demo {
            return Err(FluidicsError::NotReady("stage not zeroed".into()));
        }
        Ok(())
    }

    fn plate(&self) -> AppResult<&dyn fish_core::capabilities::Stage> {
        self.devices
            .plate
            .as_deref()
            .ok_or_else(|| FluidicsError::NotReady("no plate stage assigned".into()))
    }

    fn report<T>(&self, result: AppResult<T>) -> AppResult<T> {
        if let Err(e) = &result {
            error!(error = %e, "Operation failed");
            self.operator.notify(&e.operator_message());
        }
        result
    }

    /// Declare the current stage position as origin.
    #[instrument(skip(self), err)]
    pub async fn zero_stage(&mut self) -> AppResult<()> {
        let result = async {
            self.require_ports()?;
            self.plate()?.zero().await?;
            Ok::<_, FluidicsError>(())
        }
        .await;
        if result.is_ok() {
            info!("Stage zeroed");
            self.status.stage_zeroed = true;
            if let Some(experiment) = &mut self.experiment {
                experiment.resolver.reset();
            }
        }
        self.report(result)
    }

    /// Move the stage relative to its position. Refused once zeroed.
    #[instrument(skip(self), err)]
    pub async fn jog_stage(&mut self, axis: Axis, distance: f64) -> AppResult<()> {
        let result = async {
            self.require_ports()?;
            if self.status.stage_zeroed {
                return Err(FluidicsError::NotReady(
                    "stage already zeroed, jogging would move the origin".into(),
                ));
            }
            self.plate()?.jog(axis, distance).await?;
            Ok::<_, FluidicsError>(())
        }
        .await;
        self.report(result)
    }

    /// Move the stage to its origin, Z first.
    #[instrument(skip(self), err)]
    pub async fn move_zero(&mut self) -> AppResult<()> {
        let result = async {
            self.require_ports()?;
            move_to_origin(self.plate()?).await
        }
        .await;
        if result.is_ok() {
            if let Some(experiment) = &mut self.experiment {
                experiment.resolver.reset();
            }
        }
        self.report(result)
    }

    /// Move inlet valve and stage to `name`.
    #[instrument(skip(self), err)]
    pub async fn select_buffer(&mut self, name: &str) -> AppResult<()> {
        let result = self.select_buffer_inner(name).await;
        if result.is_ok() {
            self.status.buffer_selected = true;
        }
        self.report(result)
    }

    async fn select_buffer_inner(&mut self, name: &str) -> AppResult<()> {
        self.require_fluidics()?;
        let experiment = self
            .experiment
            .as_mut()
            .ok_or_else(|| FluidicsError::NotReady("experiment configuration not loaded".into()))?;
        let devices = &self.devices;
        experiment
            .resolver
            .select_buffer(name, devices.valve_in.as_deref(), devices.plate.as_deref())
            .await?;
        Ok(())
    }

    /// Run the pump for `seconds` through the selected buffer.
    ///
    /// The flow is measured and verified like a protocol pump step. A new
    /// buffer has to be selected before the next manual run.
    #[instrument(skip(self), err)]
    pub async fn run_pump(&mut self, seconds: f64) -> AppResult<()> {
        self.stop.reset();
        let result = self.run_pump_inner(seconds).await;
        self.report(result)
    }

    async fn run_pump_inner(&mut self, seconds: f64) -> AppResult<()> {
        self.require_ports()?;
        if !self.status.buffer_selected {
            return Err(FluidicsError::NotReady("select a buffer first".into()));
        }
        let Some(experiment) = self.experiment.as_mut() else {
            return Err(FluidicsError::NotReady(
                "experiment configuration not loaded".into(),
            ));
        };
        let token = self.stop.token();
        let mut executor = StepExecutor::new(
            MANUAL_ROUND,
            RoundContext {
                devices: &self.devices,
                resolver: &mut experiment.resolver,
                flow: &mut self.flow,
                operator: self.operator.as_ref(),
                cancel: token,
                outlet_positions: &experiment.config.valve_out_positions,
                time_scale: self.time_scale,
            },
        );
        executor.run_step(&Step::Pump(seconds), 0.0).await?;
        self.status.buffer_selected = false;
        if self.devices.flow_sensor.is_some() {
            self.flow.log_mut().flush()?;
        }
        Ok(())
    }

    /// Move the outlet valve to `position`.
    #[instrument(skip(self), err)]
    pub async fn move_valve_out(&mut self, position: u32) -> AppResult<()> {
        let result = async {
            self.require_ports()?;
            let valve = self
                .devices
                .valve_out
                .as_deref()
                .ok_or(FluidicsError::NoOutletValve)?;
            valve.move_to(position).await?;
            Ok::<_, FluidicsError>(())
        }
        .await;
        self.report(result)
    }

    /// Run every step of round `round_id` and retire it.
    ///
    /// The round leaves the available list only when it completes. On a
    /// failure or a stop request it stays available.
    pub async fn run_single_round(&mut self, round_id: &str) -> AppResult<RoundOutcome> {
        self.stop.reset();
        self.run_round(round_id).await
    }

    /// Run round `round_id` under the current stop token.
    #[instrument(skip(self), err)]
    pub(crate) async fn run_round(&mut self, round_id: &str) -> AppResult<RoundOutcome> {
        let result = self.run_single_round_inner(round_id).await;
        if let Ok(outcome) = &result {
            self.status.acquire_after_round = outcome.acquire;
        }
        self.report(result)
    }

    async fn run_single_round_inner(&mut self, round_id: &str) -> AppResult<RoundOutcome> {
        self.require_fluidics()?;
        let token = self.stop.token();
        let Some(experiment) = self.experiment.as_mut() else {
            return Err(FluidicsError::NotReady(
                "experiment configuration not loaded".into(),
            ));
        };
        let registry = &experiment.analysis.registry;
        if !registry.is_available(round_id) {
            return Err(FluidicsError::RoundUnavailable(round_id.to_string()));
        }
        let estimated = registry.estimated_minutes(round_id);

        let mut executor = StepExecutor::new(
            round_id,
            RoundContext {
                devices: &self.devices,
                resolver: &mut experiment.resolver,
                flow: &mut self.flow,
                operator: self.operator.as_ref(),
                cancel: token,
                outlet_positions: &experiment.config.valve_out_positions,
                time_scale: self.time_scale,
            },
        );
        let outcome = executor.run(&experiment.config.sequence, estimated).await?;

        experiment.analysis.registry.complete(round_id)?;
        if self.devices.flow_sensor.is_some() {
            if let Err(e) = self.flow.log_mut().flush() {
                warn!(error = %e, "Volume log could not be saved");
                self.operator.notify("Volume log could not be saved, see log");
            }
        }
        Ok(outcome)
    }

    /// Release every driver; serial channels close when dropped.
    pub fn close_all(&mut self) {
        info!("Closing all hardware channels");
        self.devices = DeviceComponents::default();
        self.status.ports_assigned = false;
        self.status.stage_zeroed = false;
        self.status.outlet_valve_present = false;
        self.status.buffer_selected = false;
    }
}

/// Run round `round_id` on a worker task holding the robot lock.
pub fn spawn_round(
    robot: Arc<tokio::sync::Mutex<Robot>>,
    round_id: String,
) -> JoinHandle<AppResult<RoundOutcome>> {
    tokio::spawn(async move {
        let mut robot = robot.lock().await;
        robot.run_single_round(&round_id).await
    })
}

/// Like [`spawn_round`], keeping a stop requested earlier in the run.
pub(crate) fn spawn_round_in_run(
    robot: Arc<tokio::sync::Mutex<Robot>>,
    round_id: String,
) -> JoinHandle<AppResult<RoundOutcome>> {
    tokio::spawn(async move {
        let mut robot = robot.lock().await;
        robot.run_round(&round_id).await
    })
}
