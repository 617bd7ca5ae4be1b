mod common;

use common::{demo_robot, SCENARIO};
use fish_core::capabilities::{Axis, AxisTargets};
use fish_core::error::FluidicsError;
use fish_experiment::{analyze, ExperimentConfig, RunCoordinator, ScriptedOperator};
use fish_hardware::drivers::demo::{DemoAcquirer, DeviceEvent, DeviceRecorder, ValveRole};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[test]
fn scenario_registry() {
    let config = ExperimentConfig::from_yaml_str(SCENARIO).unwrap();
    let analysis = analyze(&config);
    assert!(analysis.findings.is_empty(), "{:?}", analysis.findings);

    let registry = &analysis.registry;
    assert_eq!(registry.round_ids(), ["1", "2"]);
    assert_eq!(registry.available(), ["1", "2"]);
    assert_eq!(registry.estimated_minutes("1"), 0.5);
    assert_eq!(registry.estimated_minutes("2"), 0.5);
}

#[test]
fn rounds_follow_declaration_order() {
    let experiment = SCENARIO.replace(
        "  wash1: [1, 1, A1]\n  wash2: [2, 1, A2]\n",
        "  wash1: [1, 1, A1]\n  washii-1: [2, 1, A2]\n  washii-2: [3, 1, A3]\n",
    );
    let config = ExperimentConfig::from_yaml_str(&experiment).unwrap();
    let analysis = analyze(&config);
    assert!(analysis.findings.is_empty(), "{:?}", analysis.findings);
    assert_eq!(analysis.registry.round_ids(), ["1", "ii-1", "ii-2"]);
    assert_eq!(
        analysis.registry.round("1").unwrap().cycling_buffers,
        vec!["wash1".to_string()]
    );
}

#[test]
fn every_substituted_buffer_is_declared() {
    let config = ExperimentConfig::from_yaml_str(SCENARIO).unwrap();
    let analysis = analyze(&config);
    for id in analysis.registry.round_ids() {
        for buffer in &analysis.registry.round(id).unwrap().cycling_buffers {
            assert!(config.buffer(buffer).is_some(), "{} not declared", buffer);
        }
    }
}

#[test]
fn adding_a_family_never_adds_rounds() {
    let base = ExperimentConfig::from_yaml_str(SCENARIO).unwrap();
    let before = analyze(&base).registry.round_ids().to_vec();

    let extended = SCENARIO.replace(
        "  - pump: 30\n",
        "  - buffer: probeii\n  - pump: 30\n",
    );
    let extended = extended.replace(
        "  wash2: [2, 1, A2]\n",
        "  wash2: [2, 1, A2]\n  probe2: [3, 1, A3]\n",
    );
    let after = analyze(&ExperimentConfig::from_yaml_str(&extended).unwrap())
        .registry
        .round_ids()
        .to_vec();

    assert!(after.iter().all(|id| before.contains(id)));
    assert_eq!(after, vec!["2"]);
}

#[tokio::test]
async fn running_round_one_selects_wash1() {
    let operator = Arc::new(ScriptedOperator::new());
    let mut robot = demo_robot(SCENARIO, 0.0, operator).await;

    let outcome = robot.run_single_round("1").await.unwrap();
    assert!(outcome.acquire);
    assert_eq!(robot.available_rounds(), vec!["2"]);
    assert!(robot.status().acquire_after_round);
    // No flow sensor in demo mode, so nothing was measured.
    assert!(robot.flow().log().rows().is_empty());

    let events = robot.recorder().unwrap().events();
    assert_eq!(
        events[..3],
        [
            DeviceEvent::ValveMove(ValveRole::Inlet, 1),
            DeviceEvent::StageMove(AxisTargets::from([(Axis::X, 10.0), (Axis::Y, 10.0)])),
            DeviceEvent::StageMove(AxisTargets::from([(Axis::Z, -20.0)])),
        ]
    );
    assert_eq!(events[3..], [DeviceEvent::PumpStart, DeviceEvent::PumpStop]);
}

#[tokio::test]
async fn available_rounds_strictly_decrease() {
    let operator = Arc::new(ScriptedOperator::new());
    let mut robot = demo_robot(SCENARIO, 0.0, operator).await;

    let mut previous = robot.available_rounds().len();
    while let Some(next) = robot.available_rounds().first().cloned() {
        robot.run_single_round(&next).await.unwrap();
        let now = robot.available_rounds().len();
        assert_eq!(now, previous - 1);
        previous = now;

        assert!(matches!(
            robot.run_single_round(&next).await,
            Err(FluidicsError::RoundUnavailable(id)) if id == next
        ));
        assert_eq!(robot.available_rounds().len(), now);
    }
    assert!(matches!(
        robot.run_single_round("3").await,
        Err(FluidicsError::RoundUnavailable(_))
    ));
}

#[tokio::test]
async fn run_all_rounds_images_each_round() {
    let operator = Arc::new(ScriptedOperator::new());
    let robot = demo_robot(SCENARIO, 0.0, operator.clone()).await;
    let recorder = DeviceRecorder::new();
    let coordinator = RunCoordinator::new(
        robot,
        Some(Arc::new(DemoAcquirer::new(recorder.clone()))),
        operator.clone(),
    );

    let summary = coordinator
        .run_all_rounds(Path::new("/data/run"))
        .await
        .unwrap();
    assert_eq!(summary.completed, vec!["1", "2"]);
    assert!(!summary.stopped);
    assert_eq!(
        recorder.events(),
        vec![
            DeviceEvent::Acquire(PathBuf::from("/data/run"), "1".into()),
            DeviceEvent::Acquire(PathBuf::from("/data/run"), "2".into()),
        ]
    );
    assert!(operator.notices().is_empty());
}
