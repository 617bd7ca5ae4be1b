//! Step execution for one round.
//!
//! # State Machine
//!
//! ```text
//! Idle -> Running -> Done
//!             \----> Aborted   (error or stop request)
//! ```
//!
//! The stop token is checked before every step. A step already talking to a
//! device is allowed to finish. A `pause` is the exception: its sleep is raced
//! against the token, so a stop request ends it early and aborts the round
//! right there, even when it is the last step.
//!
//! Every `ii` in a buffer name is replaced with the round id before the
//! buffer is selected.
//!
//! The remaining-minutes estimate is threaded through every step and returned,
//! so conditional blocks keep counting down from where the plain steps left off.

use fish_core::capabilities::{FlowSensor, Pump, Valve};
use fish_core::error::{AppResult, FluidicsError};
use fish_core::operator::OperatorPort;
use fish_hardware::factory::DeviceComponents;
use std::fmt;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::analyzer::substitute_round;
use crate::config::{Entry, Step};
use crate::flow::FlowVerifier;
use crate::resolver::{move_to_origin, BufferResolver};

/// Pause after the pump stops, before the flow sensor window closes.
pub const PUMP_SETTLE: Duration = Duration::from_secs(1);

/// Executor lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorState {
    /// Not started.
    Idle,
    /// Executing steps.
    Running,
    /// Every step completed.
    Done,
    /// Stopped by an error or a stop request.
    Aborted,
}

impl fmt::Display for ExecutorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutorState::Idle => write!(f, "Idle"),
            ExecutorState::Running => write!(f, "Running"),
            ExecutorState::Done => write!(f, "Done"),
            ExecutorState::Aborted => write!(f, "Aborted"),
        }
    }
}

/// Result of a completed round.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RoundOutcome {
    /// Whether images should be acquired after this round.
    pub acquire: bool,
    /// Estimate left over after the last step, in minutes.
    pub remaining_minutes: f64,
}

/// Everything a round needs, borrowed from the robot.
pub struct RoundContext<'a> {
    /// Assigned drivers.
    pub devices: &'a DeviceComponents,
    /// Buffer selection state.
    pub resolver: &'a mut BufferResolver,
    /// Flow verification and volume log.
    pub flow: &'a mut FlowVerifier,
    /// Operator prompts.
    pub operator: &'a dyn OperatorPort,
    /// Stop request.
    pub cancel: CancellationToken,
    /// Outlet valve positions for `pump_valve_out`.
    pub outlet_positions: &'a [u32],
    /// Factor applied to every wait.
    pub time_scale: f64,
}

/// Runs the steps of one round.
pub struct StepExecutor<'a> {
    round_id: String,
    ctx: RoundContext<'a>,
    acquire: bool,
    state: ExecutorState,
}

impl<'a> StepExecutor<'a> {
    /// Executor for `round_id`.
    pub fn new(round_id: impl Into<String>, ctx: RoundContext<'a>) -> Self {
        Self {
            round_id: round_id.into(),
            ctx,
            acquire: true,
            state: ExecutorState::Idle,
        }
    }

    /// Current state.
    pub fn state(&self) -> ExecutorState {
        self.state
    }

    /// Run `sequence` for this round, starting from `estimated_minutes`.
    #[instrument(skip(self, sequence), fields(round = %self.round_id), err)]
    pub async fn run(
        &mut self,
        sequence: &[Entry],
        estimated_minutes: f64,
    ) -> AppResult<RoundOutcome> {
        info!(
            estimated_minutes,
            "RUNNING ROUND: {}", self.round_id
        );
        self.state = ExecutorState::Running;
        self.acquire = true;

        match self.run_entries(sequence, estimated_minutes).await {
            Ok(remaining_minutes) => {
                self.state = ExecutorState::Done;
                Ok(RoundOutcome {
                    acquire: self.acquire,
                    remaining_minutes,
                })
            }
            Err(e) => {
                self.state = ExecutorState::Aborted;
                Err(e)
            }
        }
    }

    async fn run_entries(&mut self, sequence: &[Entry], mut remaining: f64) -> AppResult<f64> {
        for entry in sequence {
            match entry {
                Entry::Step(step) => remaining = self.run_step(step, remaining).await?,
                Entry::Conditional(steps) => match entry.selector() {
                    Some(ids) if ids.contains(&self.round_id) => {
                        info!("Running conditional steps for round: {}", self.round_id);
                        for step in steps {
                            remaining = self.run_step(step, remaining).await?;
                        }
                    }
                    Some(ids) => debug!(?ids, "Conditional block not for this round"),
                    None => {
                        let action = steps.first().map(Step::action).unwrap_or("nothing");
                        error!("First action has to be \"round\" and not {}.", action);
                        self.ctx
                            .operator
                            .notify(&format!("Skipped conditional block starting with {}", action));
                    }
                },
            }
        }
        Ok(remaining)
    }

    fn check_stop(&self) -> AppResult<()> {
        if self.ctx.cancel.is_cancelled() {
            info!("Stopping robot.");
            return Err(FluidicsError::Cancelled(self.round_id.clone()));
        }
        Ok(())
    }

    fn scaled(&self, seconds: f64) -> Duration {
        Duration::from_secs_f64((seconds * self.ctx.time_scale).max(0.0))
    }

    /// Run one step and return the updated remaining-minutes estimate.
    pub async fn run_step(&mut self, step: &Step, remaining: f64) -> AppResult<f64> {
        self.check_stop()?;
        info!("STEP: {}", step);

        match step {
            Step::Buffer(template) => {
                let name = substitute_round(template, &self.round_id);
                if name != *template {
                    info!("Cycling buffer: {}", name);
                }
                let devices = self.ctx.devices;
                self.ctx
                    .resolver
                    .select_buffer(&name, devices.valve_in.as_deref(), devices.plate.as_deref())
                    .await?;
                Ok(remaining)
            }
            Step::Pump(seconds) => {
                info!("Remaining time (approx): {:.1} min", remaining);
                self.pump_for(*seconds).await?;
                Ok(remaining - seconds / 60.0)
            }
            Step::Pause(seconds) => {
                info!("Remaining time (approx): {:.1} min", remaining);
                self.pause(*seconds).await?;
                Ok(remaining - seconds / 60.0)
            }
            Step::ValveOut(position) => {
                self.outlet()?.move_to(*position).await?;
                Ok(remaining)
            }
            Step::PumpValveOut(durations) => {
                let outlet = self.outlet()?;
                let positions = self.ctx.outlet_positions;
                if durations.len() != positions.len() {
                    return Err(FluidicsError::OutletCountMismatch {
                        expected: positions.len(),
                        got: durations.len(),
                    });
                }
                let mut remaining = remaining;
                for (position, seconds) in positions.iter().zip(durations) {
                    self.check_stop()?;
                    info!(position, seconds, "Pumping through outlet position");
                    outlet.move_to(*position).await?;
                    self.pump_for(*seconds).await?;
                    remaining -= seconds / 60.0;
                }
                Ok(remaining)
            }
            Step::ZeroPlate => {
                let plate = self
                    .ctx
                    .devices
                    .plate
                    .as_deref()
                    .ok_or_else(|| FluidicsError::NotReady("no plate stage assigned".into()))?;
                move_to_origin(plate).await?;
                self.ctx.resolver.reset();
                Ok(remaining)
            }
            Step::Wait => {
                info!("WAITING FOR USER INPUT");
                self.ctx
                    .operator
                    .confirm("Protocol paused. Confirm to continue.")
                    .await?;
                Ok(remaining)
            }
            Step::Image(flag) => {
                if *flag {
                    info!("Ready for imaging");
                } else {
                    info!("Will skip imaging this time");
                }
                self.acquire = *flag;
                Ok(remaining)
            }
            Step::Round(_) => Ok(remaining),
            Step::Unknown(action) => Err(FluidicsError::UnknownAction(action.clone())),
        }
    }

    fn outlet(&self) -> AppResult<&'a dyn Valve> {
        self.ctx
            .devices
            .valve_out
            .as_deref()
            .ok_or(FluidicsError::NoOutletValve)
    }

    fn pump(&self) -> AppResult<&'a dyn Pump> {
        self.ctx
            .devices
            .pump
            .as_deref()
            .ok_or_else(|| FluidicsError::NotReady("no pump assigned".into()))
    }

    fn sensor(&self) -> Option<&'a dyn FlowSensor> {
        self.ctx.devices.flow_sensor.as_deref()
    }

    /// Run the pump for `seconds`, measure and verify the volume.
    async fn pump_for(&mut self, seconds: f64) -> AppResult<()> {
        let pump = self.pump()?;
        let sensor = self.sensor();

        if let Some(sensor) = sensor {
            sensor.start().await?;
        }
        pump.start().await?;
        tokio::time::sleep(self.scaled(seconds)).await;
        pump.stop().await?;
        tokio::time::sleep(self.scaled(PUMP_SETTLE.as_secs_f64())).await;

        if let Some(sensor) = sensor {
            let measured = sensor.stop().await?;
            let buffer = self.ctx.resolver.current().unwrap_or_default().to_string();
            let flow = &mut *self.ctx.flow;
            flow.verify(seconds, measured, &self.round_id, &buffer, self.ctx.operator)
                .await?;
        }

        tokio::time::sleep(self.scaled(PUMP_SETTLE.as_secs_f64())).await;
        Ok(())
    }

    async fn pause(&self, seconds: f64) -> AppResult<()> {
        let duration = self.scaled(seconds);
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = self.ctx.cancel.cancelled() => {
                warn!("Pause interrupted by stop request");
                Err(FluidicsError::Cancelled(self.round_id.clone()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExperimentConfig;
    use crate::flow::{FlowVerification, FlowVerifier};
    use crate::operator::ScriptedOperator;
    use fish_core::capabilities::{Axis, AxisTargets, FlowSensor, Stage};
    use fish_hardware::drivers::demo::{
        DemoFlowSensor, DemoPump, DemoStage, DemoValve, DeviceEvent, DeviceRecorder, ValveRole,
    };
    use std::sync::Arc;

    const CONFIG: &str = r#"
buffers:
  wash1: [1, 0, X1_Y2_Z-3]
  wash2: [2, 0, X4_Y5_Z-6]
valve_out_positions: [1, 2]
sequence:
  - buffer: washii
  - pump: 30
  - image: 0
"#;

    struct Rig {
        recorder: DeviceRecorder,
        devices: DeviceComponents,
        resolver: BufferResolver,
        flow: FlowVerifier,
        operator: ScriptedOperator,
        config: ExperimentConfig,
        _dir: tempfile::TempDir,
    }

    fn rig(text: &str, sensor: Option<f64>) -> Rig {
        let recorder = DeviceRecorder::new();
        let config = ExperimentConfig::from_yaml_str(text).unwrap();
        let devices = DeviceComponents {
            pump: Some(Arc::new(DemoPump::new(recorder.clone())) as Arc<dyn Pump>),
            plate: Some(Arc::new(DemoStage::new(recorder.clone())) as Arc<dyn Stage>),
            valve_in: Some(
                Arc::new(DemoValve::new(ValveRole::Inlet, recorder.clone())) as Arc<dyn Valve>
            ),
            valve_out: None,
            flow_sensor: sensor.map(|reading| {
                Arc::new(DemoFlowSensor::new(Some(reading), recorder.clone()))
                    as Arc<dyn FlowSensor>
            }),
            failures: Vec::new(),
        };
        let dir = tempfile::tempdir().unwrap();
        Rig {
            recorder,
            devices,
            resolver: BufferResolver::new(Arc::new(config.clone())).unwrap(),
            flow: FlowVerifier::new(
                FlowVerification {
                    verify: true,
                    expected_flow: Some(0.9),
                    tolerance: 0.15,
                },
                dir.path(),
            ),
            operator: ScriptedOperator::new(),
            config,
            _dir: dir,
        }
    }

    impl Rig {
        fn executor(&mut self, round: &str, cancel: CancellationToken) -> StepExecutor<'_> {
            self.scaled_executor(round, cancel, 0.0)
        }

        fn scaled_executor(
            &mut self,
            round: &str,
            cancel: CancellationToken,
            time_scale: f64,
        ) -> StepExecutor<'_> {
            StepExecutor::new(
                round,
                RoundContext {
                    devices: &self.devices,
                    resolver: &mut self.resolver,
                    flow: &mut self.flow,
                    operator: &self.operator,
                    cancel,
                    outlet_positions: &self.config.valve_out_positions,
                    time_scale,
                },
            )
        }
    }

    #[tokio::test]
    async fn runs_cycling_buffer_then_pump_with_measurement() {
        let mut rig = rig(CONFIG, Some(0.44));
        let sequence = rig.config.sequence.clone();
        let mut executor = rig.executor("2", CancellationToken::new());
        assert_eq!(executor.state(), ExecutorState::Idle);

        let outcome = executor.run(&sequence, 0.5).await.unwrap();
        assert_eq!(executor.state(), ExecutorState::Done);
        assert!(!outcome.acquire);
        assert!(outcome.remaining_minutes.abs() < 1e-12);

        assert_eq!(
            rig.recorder.events(),
            vec![
                DeviceEvent::ValveMove(ValveRole::Inlet, 2),
                DeviceEvent::StageMove(AxisTargets::from([(Axis::X, 4.0), (Axis::Y, 5.0)])),
                DeviceEvent::StageMove(AxisTargets::from([(Axis::Z, -6.0)])),
                DeviceEvent::SensorStart,
                DeviceEvent::PumpStart,
                DeviceEvent::PumpStop,
                DeviceEvent::SensorStop,
            ]
        );
        assert_eq!(rig.flow.log().rows().len(), 1);
        assert_eq!(rig.flow.log().rows()[0].buffer, "wash2");
        assert!(rig.operator.prompts().is_empty());
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_the_first_step() {
        let mut rig = rig(CONFIG, None);
        let sequence = rig.config.sequence.clone();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut executor = rig.executor("1", cancel);

        let err = executor.run(&sequence, 0.5).await.unwrap_err();
        assert!(matches!(err, FluidicsError::Cancelled(round) if round == "1"));
        assert_eq!(executor.state(), ExecutorState::Aborted);
        assert!(rig.recorder.events().is_empty());
    }

    #[tokio::test]
    async fn stop_during_final_pause_aborts_the_round() {
        let text = CONFIG.replace("  - pump: 30\n  - image: 0\n", "  - pause: 10\n");
        let mut rig = rig(&text, None);
        let sequence = rig.config.sequence.clone();
        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stopper.cancel();
        });

        let mut executor = rig.scaled_executor("1", cancel, 1.0);
        let started = std::time::Instant::now();
        let err = executor.run(&sequence, 1.0).await.unwrap_err();
        assert!(matches!(err, FluidicsError::Cancelled(round) if round == "1"));
        assert_eq!(executor.state(), ExecutorState::Aborted);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn outlet_steps_need_an_outlet_valve() {
        let text = CONFIG.replace("  - image: 0\n", "  - valve_out: 2\n");
        let mut rig = rig(&text, None);
        let sequence = rig.config.sequence.clone();
        let err = rig
            .executor("1", CancellationToken::new())
            .run(&sequence, 0.5)
            .await
            .unwrap_err();
        assert!(matches!(err, FluidicsError::NoOutletValve));
    }

    #[tokio::test]
    async fn pump_valve_out_pairs_positions_and_durations() {
        let text = CONFIG.replace("  - image: 0\n", "  - pump_valve_out: [10, 20]\n");
        let mut rig = rig(&text, None);
        rig.devices.valve_out = Some(Arc::new(DemoValve::new(
            ValveRole::Outlet,
            rig.recorder.clone(),
        )));
        let sequence = rig.config.sequence.clone();
        let outcome = rig
            .executor("1", CancellationToken::new())
            .run(&sequence, 1.0)
            .await
            .unwrap();
        assert!(outcome.acquire);
        assert!(outcome.remaining_minutes.abs() < 1e-12);

        let outlet_moves: Vec<DeviceEvent> = rig
            .recorder
            .events()
            .into_iter()
            .filter(|e| matches!(e, DeviceEvent::ValveMove(ValveRole::Outlet, _)))
            .collect();
        assert_eq!(
            outlet_moves,
            vec![
                DeviceEvent::ValveMove(ValveRole::Outlet, 1),
                DeviceEvent::ValveMove(ValveRole::Outlet, 2),
            ]
        );

        let text = CONFIG.replace("  - image: 0\n", "  - pump_valve_out: [10]\n");
        let mut rig2 = rig_with_outlet(&text);
        let sequence = rig2.config.sequence.clone();
        let err = rig2
            .executor("1", CancellationToken::new())
            .run(&sequence, 1.0)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            FluidicsError::OutletCountMismatch { expected: 2, got: 1 }
        ));
    }

    fn rig_with_outlet(text: &str) -> Rig {
        let mut rig = rig(text, None);
        rig.devices.valve_out = Some(Arc::new(DemoValve::new(
            ValveRole::Outlet,
            rig.recorder.clone(),
        )));
        rig
    }

    #[tokio::test]
    async fn unknown_action_is_fatal() {
        let text = CONFIG.replace("  - image: 0\n", "  - shake: 3\n");
        let mut rig = rig(&text, None);
        let sequence = rig.config.sequence.clone();
        let err = rig
            .executor("1", CancellationToken::new())
            .run(&sequence, 1.0)
            .await
            .unwrap_err();
        assert!(matches!(err, FluidicsError::UnknownAction(action) if action == "shake"));
    }

    #[tokio::test]
    async fn conditional_blocks_run_only_for_listed_rounds() {
        let text = r#"
buffers:
  wash1: [1, 0, null]
  wash2: [2, 0, null]
  strip: [3, 0, null]
sequence:
  - buffer: washii
  - - round: "2"
    - buffer: strip
    - pause: 60
  - - pause: 5
  - wait
"#;
        let mut rig = rig(text, None);
        let sequence = rig.config.sequence.clone();

        let outcome = rig
            .executor("1", CancellationToken::new())
            .run(&sequence, 0.0)
            .await
            .unwrap();
        assert_eq!(outcome.remaining_minutes, 0.0);
        assert_eq!(
            rig.recorder.events(),
            vec![DeviceEvent::ValveMove(ValveRole::Inlet, 1)]
        );

        rig.recorder.clear();
        let outcome = rig
            .executor("2", CancellationToken::new())
            .run(&sequence, 1.0)
            .await
            .unwrap();
        assert!(outcome.remaining_minutes.abs() < 1e-12);
        assert_eq!(
            rig.recorder.events(),
            vec![
                DeviceEvent::ValveMove(ValveRole::Inlet, 2),
                DeviceEvent::ValveMove(ValveRole::Inlet, 3),
            ]
        );

        // The malformed block is reported, the wait step goes to the operator.
        assert_eq!(rig.operator.notices().len(), 2);
        assert_eq!(rig.operator.prompts().len(), 2);
    }

    #[tokio::test]
    async fn zero_plate_retracts_and_forgets_the_buffer() {
        let text = CONFIG.replace("  - image: 0\n", "  - zero_plate\n  - buffer: washii\n");
        let mut rig = rig(&text, None);
        let sequence = rig.config.sequence.clone();
        rig.executor("1", CancellationToken::new())
            .run(&sequence, 1.0)
            .await
            .unwrap();

        let moves: Vec<DeviceEvent> = rig
            .recorder
            .events()
            .into_iter()
            .filter(|e| matches!(e, DeviceEvent::StageMove(_)))
            .collect();
        // Buffer, origin (Z then XY), buffer again.
        assert_eq!(moves.len(), 6);
        assert_eq!(
            moves[2],
            DeviceEvent::StageMove(AxisTargets::from([(Axis::Z, 0.0)]))
        );
    }
}
