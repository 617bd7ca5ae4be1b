mod common;

use common::demo_robot;
use fish_core::capabilities::{Pump, Stage, Valve};
use fish_experiment::executor::{ExecutorState, RoundContext, StepExecutor};
use fish_experiment::resolver::BufferResolver;
use fish_experiment::{spawn_round, ExperimentConfig, FlowVerification, FlowVerifier, ScriptedOperator};
use fish_hardware::drivers::demo::{DemoPump, DemoStage, DemoValve, DeviceRecorder, ValveRole};
use fish_hardware::factory::DeviceComponents;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

const PAUSING: &str = r#"
buffers:
  wash1: [1, 0, X1_Y1_Z-1]
  wash2: [2, 0, X2_Y2_Z-2]
sequence:
  - pause: 10
  - buffer: washii
  - pump: 5
"#;

#[tokio::test]
async fn stop_during_pause_aborts_before_the_next_step() {
    let recorder = DeviceRecorder::new();
    let devices = DeviceComponents {
        pump: Some(Arc::new(DemoPump::new(recorder.clone())) as Arc<dyn Pump>),
        plate: Some(Arc::new(DemoStage::new(recorder.clone())) as Arc<dyn Stage>),
        valve_in: Some(
            Arc::new(DemoValve::new(ValveRole::Inlet, recorder.clone())) as Arc<dyn Valve>
        ),
        ..DeviceComponents::default()
    };
    let config = ExperimentConfig::from_yaml_str(PAUSING).unwrap();
    let mut resolver = BufferResolver::new(Arc::new(config.clone())).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let mut flow = FlowVerifier::new(FlowVerification::default(), dir.path());
    let operator = ScriptedOperator::new();
    let cancel = CancellationToken::new();

    let stopper = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        })
    };

    let mut executor = StepExecutor::new(
        "1",
        RoundContext {
            devices: &devices,
            resolver: &mut resolver,
            flow: &mut flow,
            operator: &operator,
            cancel,
            outlet_positions: &config.valve_out_positions,
            time_scale: 1.0,
        },
    );

    let started = Instant::now();
    let result = executor.run(&config.sequence, 0.25).await;
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(result.unwrap_err().is_cancelled());
    assert_eq!(executor.state(), ExecutorState::Aborted);
    assert!(recorder.events().is_empty());
    stopper.await.unwrap();
}

#[tokio::test]
async fn stopped_round_stays_available_on_the_worker() {
    let operator = Arc::new(ScriptedOperator::new());
    let robot = demo_robot(PAUSING, 1.0, operator).await;
    let stop = robot.stop_handle();
    let robot = Arc::new(tokio::sync::Mutex::new(robot));

    let worker = spawn_round(Arc::clone(&robot), "1".to_string());
    tokio::time::sleep(Duration::from_millis(50)).await;
    stop.request_stop();

    let result = tokio::time::timeout(Duration::from_secs(5), worker)
        .await
        .unwrap()
        .unwrap();
    assert!(result.unwrap_err().is_cancelled());

    let robot = robot.lock().await;
    assert_eq!(robot.available_rounds(), vec!["1", "2"]);
    assert!(robot.recorder().unwrap().events().is_empty());
}

const PAUSE_LAST: &str = r#"
buffers:
  wash1: [1, 0, X1_Y1_Z-1]
  wash2: [2, 0, X2_Y2_Z-2]
sequence:
  - buffer: washii
  - pause: 1
"#;

#[tokio::test]
async fn round_stopped_in_its_last_pause_can_run_again() {
    let operator = Arc::new(ScriptedOperator::new());
    let robot = demo_robot(PAUSE_LAST, 1.0, operator).await;
    let stop = robot.stop_handle();
    let robot = Arc::new(tokio::sync::Mutex::new(robot));

    let worker = spawn_round(Arc::clone(&robot), "1".to_string());
    tokio::time::sleep(Duration::from_millis(100)).await;
    stop.request_stop();
    let result = tokio::time::timeout(Duration::from_secs(5), worker)
        .await
        .unwrap()
        .unwrap();
    assert!(result.unwrap_err().is_cancelled());
    assert_eq!(robot.lock().await.available_rounds(), vec!["1", "2"]);

    let outcome = tokio::time::timeout(
        Duration::from_secs(5),
        spawn_round(Arc::clone(&robot), "1".to_string()),
    )
    .await
    .unwrap()
    .unwrap()
    .unwrap();
    assert!(outcome.acquire);
    assert_eq!(robot.lock().await.available_rounds(), vec!["2"]);
}
