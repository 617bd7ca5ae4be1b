//! Shared setup for the engine integration tests.

#![allow(dead_code)]

use fish_experiment::{ExperimentConfig, Robot, ScriptedOperator};
use fish_hardware::config::{load_system_config_from_str, SystemConfig};
use std::sync::Arc;

/// Demo system with every role except the flow sensor.
pub fn demo_system(time_scale: f64) -> SystemConfig {
    load_system_config_from_str(&format!(
        r#"
demo = true
demo_time_scale = {time_scale}

[pump]
type = "REGLO DIGITAL"

[plate]
type = "GRBL"

[valve_in]
type = "HAMILTON MVP"
units = 2
"#
    ))
    .unwrap()
}

/// Experiment used by the end-to-end scenario.
pub const SCENARIO: &str = r#"
buffers:
  wash1: [1, 1, A1]
  wash2: [2, 1, A2]
well_plate:
  rows: 8
  columns: 12
  well_spacing: 9
  bottom_left: {x: 10, y: 10}
  top_right: {x: 109, y: 73}
  z_base: -20
sequence:
  - buffer: washii
  - pump: 30
  - image: 1
"#;

/// Initiated demo robot with `experiment` loaded.
pub async fn demo_robot(
    experiment: &str,
    time_scale: f64,
    operator: Arc<ScriptedOperator>,
) -> Robot {
    let mut robot = Robot::new(demo_system(time_scale), operator);
    robot.initiate_hardware().await;
    robot
        .set_experiment(
            ExperimentConfig::from_yaml_str(experiment).unwrap(),
            std::env::temp_dir(),
        )
        .unwrap();
    robot
}
