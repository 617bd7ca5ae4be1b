//! Driver assignment from the system configuration.
//!
//! Each role section names a device type. The type string is matched once,
//! case-insensitively, against the supported drivers, and the driver is held
//! as an `Arc<dyn Capability>` for the rest of the session.
//!
//! A role that fails to assign (unknown type, missing port, channel open
//! failure, handshake failure) is logged and left as `None`. The engine
//! then reports that capability as not ready instead of stopping.

use fish_core::capabilities::{FlowSensor, Pump, Stage, Valve};
use fish_core::error::{AppResult, FluidicsError};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::config::{
    ChannelConfig, FlowSensorConfig, PumpConfig, StageConfig, SystemConfig, ValveConfig,
};
use crate::drivers::demo::{DemoPump, DemoStage, DemoValve, DeviceRecorder, ValveRole};
use crate::drivers::{amc_rvm, ascii_pump, bt100, grbl, hamilton_mvp, reglo, sensirion};
use crate::ports::validate_serial_port;

/// Driver instances by role.
#[derive(Clone, Default)]
pub struct DeviceComponents {
    /// Pump.
    pub pump: Option<Arc<dyn Pump>>,
    /// Plate stage.
    pub plate: Option<Arc<dyn Stage>>,
    /// Inlet valve.
    pub valve_in: Option<Arc<dyn Valve>>,
    /// Outlet valve.
    pub valve_out: Option<Arc<dyn Valve>>,
    /// Flow sensor.
    pub flow_sensor: Option<Arc<dyn FlowSensor>>,
    /// Operator-facing messages for roles that failed to assign.
    pub failures: Vec<String>,
}

impl std::fmt::Debug for DeviceComponents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceComponents")
            .field("pump", &self.pump.is_some())
            .field("plate", &self.plate.is_some())
            .field("valve_in", &self.valve_in.is_some())
            .field("valve_out", &self.valve_out.is_some())
            .field("flow_sensor", &self.flow_sensor.is_some())
            .field("failures", &self.failures)
            .finish()
    }
}

impl DeviceComponents {
    /// Simulated drivers for every configured role.
    ///
    /// The flow sensor is never simulated: a demo run has no volume to verify.
    pub fn demo(config: &SystemConfig, recorder: &DeviceRecorder) -> Self {
        info!("Demo mode: assigning simulated drivers");
        Self {
            pump: config
                .pump
                .as_ref()
                .map(|_| Arc::new(DemoPump::new(recorder.clone())) as Arc<dyn Pump>),
            plate: config
                .plate
                .as_ref()
                .map(|_| Arc::new(DemoStage::new(recorder.clone())) as Arc<dyn Stage>),
            valve_in: config.valve_in.as_ref().map(|_| {
                Arc::new(DemoValve::new(ValveRole::Inlet, recorder.clone())) as Arc<dyn Valve>
            }),
            valve_out: config.valve_out.as_ref().map(|_| {
                Arc::new(DemoValve::new(ValveRole::Outlet, recorder.clone())) as Arc<dyn Valve>
            }),
            flow_sensor: None,
            failures: Vec::new(),
        }
    }
}

/// Assign every configured role, recording failures instead of returning them.
pub async fn assign_all(config: &SystemConfig) -> DeviceComponents {
    let mut components = DeviceComponents::default();

    if let Some(pump) = &config.pump {
        components.pump = settle("pump", assign_pump(pump).await, &mut components.failures);
    }
    if let Some(plate) = &config.plate {
        components.plate = settle("plate", assign_stage(plate).await, &mut components.failures);
    }
    if let Some(valve) = &config.valve_in {
        components.valve_in = settle(
            "valve_in",
            assign_valve(valve).await,
            &mut components.failures,
        );
    }
    if let Some(valve) = &config.valve_out {
        components.valve_out = settle(
            "valve_out",
            assign_valve(valve).await,
            &mut components.failures,
        );
    }
    if let Some(sensor) = &config.flow_sensor {
        components.flow_sensor = settle(
            "flow_sensor",
            assign_flow_sensor(sensor),
            &mut components.failures,
        );
    }

    if components.pump.is_none() {
        warn!("No pump assigned");
    }
    components
}

fn settle<T>(role: &str, result: AppResult<T>, failures: &mut Vec<String>) -> Option<T> {
    match result {
        Ok(driver) => Some(driver),
        Err(e) => {
            error!(role, error = %e, "Driver assignment failed");
            failures.push(format!("{}: {}", role, e.operator_message()));
            None
        }
    }
}

fn normalize(device_type: &str) -> String {
    device_type.trim().to_ascii_uppercase()
}

fn require_port<'a>(channel: &'a ChannelConfig, role: &str) -> AppResult<&'a str> {
    let port = channel.port.as_deref().ok_or_else(|| {
        FluidicsError::Configuration(format!("{} has no serial port configured", role))
    })?;
    validate_serial_port(port, role)?;
    Ok(port)
}

/// Open and configure the pump.
pub async fn assign_pump(config: &PumpConfig) -> AppResult<Arc<dyn Pump>> {
    let device_type = normalize(&config.device_type);
    let port = require_port(&config.channel, "pump")?;

    let pump: Arc<dyn Pump> = match device_type.as_str() {
        reglo::DEVICE_TYPE => {
            let settings = config.channel.settings(&reglo::default_settings());
            let pump = reglo::RegloDigital::open(port, &settings).await?;
            pump.configure(config.flow_rate, config.revolution).await?;
            Arc::new(pump)
        }
        bt100::DEVICE_TYPE => {
            let settings = config.channel.settings(&bt100::default_settings());
            let speed = config.speed.ok_or_else(|| {
                FluidicsError::Configuration("BT100 pump needs a speed (rpm)".to_string())
            })?;
            Arc::new(bt100::Bt100::open(port, &settings, speed, config.revolution).await?)
        }
        ascii_pump::DEVICE_TYPE => {
            let settings = config.channel.settings(&ascii_pump::default_settings());
            let pump =
                ascii_pump::AsciiSpeedPump::open(port, &settings, config.commands.clone()).await?;
            pump.configure(config.speed).await?;
            Arc::new(pump)
        }
        _ => return Err(unknown("pump", &config.device_type)),
    };
    Ok(pump)
}

/// Open and initialize a valve (inlet or outlet).
pub async fn assign_valve(config: &ValveConfig) -> AppResult<Arc<dyn Valve>> {
    let device_type = normalize(&config.device_type);
    let port = require_port(&config.channel, "valve")?;

    let valve: Arc<dyn Valve> = match device_type.as_str() {
        hamilton_mvp::DEVICE_TYPE => {
            let settings = config.channel.settings(&hamilton_mvp::default_settings());
            Arc::new(
                hamilton_mvp::HamiltonMvp::open(port, &settings, config.units, config.ports_per_unit)
                    .await?,
            )
        }
        amc_rvm::DEVICE_TYPE => {
            let settings = config.channel.settings(&amc_rvm::default_settings());
            Arc::new(
                amc_rvm::AmcRvm::open(
                    port,
                    &settings,
                    config.ports_per_unit,
                    Duration::from_millis(config.init_wait_ms),
                )
                .await?,
            )
        }
        _ => return Err(unknown("valve", &config.device_type)),
    };
    Ok(valve)
}

/// Open the plate stage and set its status report mask.
pub async fn assign_stage(config: &StageConfig) -> AppResult<Arc<dyn Stage>> {
    let device_type = normalize(&config.device_type);
    let is_grbl = device_type == grbl::DEVICE_TYPE
        || grbl::DEVICE_TYPE_ALIASES.contains(&device_type.as_str());
    if !is_grbl {
        return Err(unknown("plate", &config.device_type));
    }

    let port = require_port(&config.channel, "plate")?;
    let settings = config.channel.settings(&grbl::default_settings());
    let stage = grbl::GrblStage::open(port, &settings, grbl::GrblTuning::from_config(config)).await?;
    Ok(Arc::new(stage))
}

/// Attach the flow sensor to its log file.
pub fn assign_flow_sensor(config: &FlowSensorConfig) -> AppResult<Arc<dyn FlowSensor>> {
    if normalize(&config.device_type) != sensirion::DEVICE_TYPE {
        return Err(unknown("flow_sensor", &config.device_type));
    }
    let settings = sensirion::SensirionSettings::from_config(config)?;
    Ok(Arc::new(sensirion::SensirionCsv::new(settings)?))
}

fn unknown(role: &str, device_type: &str) -> FluidicsError {
    FluidicsError::UnknownDeviceType {
        role: role.to_string(),
        device_type: device_type.to_string(),
    }
}
