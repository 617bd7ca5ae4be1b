//! Simulated drivers for demo mode.
//!
//! Demo drivers never touch a serial port. Every call is logged and appended
//! to a shared [`DeviceRecorder`], so a dry run can be inspected afterwards
//! and engine tests can assert on the exact device traffic.

use anyhow::Result;
use async_trait::async_trait;
use fish_core::capabilities::{Axis, AxisTargets, FlowSensor, ImageAcquirer, Pump, Stage, Valve};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Which valve a [`DemoValve`] stands in for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValveRole {
    /// Inlet (buffer) valve.
    Inlet,
    /// Outlet valve.
    Outlet,
}

/// One simulated device call.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    /// Pump started.
    PumpStart,
    /// Pump stopped.
    PumpStop,
    /// Valve moved.
    ValveMove(ValveRole, u32),
    /// Stage moved to absolute targets.
    StageMove(AxisTargets),
    /// Stage jogged.
    StageJog(Axis, f64),
    /// Stage origin set.
    StageZero,
    /// Flow measurement started.
    SensorStart,
    /// Flow measurement stopped.
    SensorStop,
    /// Images acquired.
    Acquire(PathBuf, String),
}

/// Shared, ordered record of simulated device calls.
#[derive(Debug, Clone, Default)]
pub struct DeviceRecorder(Arc<Mutex<Vec<DeviceEvent>>>);

impl DeviceRecorder {
    /// Empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, event: DeviceEvent) {
        self.0.lock().push(event);
    }

    /// Snapshot of all events so far.
    pub fn events(&self) -> Vec<DeviceEvent> {
        self.0.lock().clone()
    }

    /// Forget recorded events.
    pub fn clear(&self) {
        self.0.lock().clear();
    }
}

/// Simulated pump.
#[derive(Debug, Clone)]
pub struct DemoPump {
    recorder: DeviceRecorder,
}

impl DemoPump {
    /// Pump writing into `recorder`.
    pub fn new(recorder: DeviceRecorder) -> Self {
        Self { recorder }
    }
}

#[async_trait]
impl Pump for DemoPump {
    async fn start(&self) -> Result<()> {
        info!("DEMO pump: start");
        self.recorder.push(DeviceEvent::PumpStart);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        info!("DEMO pump: stop");
        self.recorder.push(DeviceEvent::PumpStop);
        Ok(())
    }
}

/// Simulated valve.
#[derive(Debug, Clone)]
pub struct DemoValve {
    role: ValveRole,
    recorder: DeviceRecorder,
}

impl DemoValve {
    /// Valve for `role` writing into `recorder`.
    pub fn new(role: ValveRole, recorder: DeviceRecorder) -> Self {
        Self { role, recorder }
    }
}

#[async_trait]
impl Valve for DemoValve {
    async fn move_to(&self, position: u32) -> Result<()> {
        info!(role = ?self.role, position, "DEMO valve: move");
        self.recorder
            .push(DeviceEvent::ValveMove(self.role, position));
        Ok(())
    }
}

/// Simulated stage; always idle.
#[derive(Debug, Clone)]
pub struct DemoStage {
    recorder: DeviceRecorder,
}

impl DemoStage {
    /// Stage writing into `recorder`.
    pub fn new(recorder: DeviceRecorder) -> Self {
        Self { recorder }
    }
}

#[async_trait]
impl Stage for DemoStage {
    async fn move_to(&self, targets: &AxisTargets) -> Result<()> {
        info!(?targets, "DEMO stage: move");
        self.recorder.push(DeviceEvent::StageMove(targets.clone()));
        Ok(())
    }

    async fn jog(&self, axis: Axis, distance: f64) -> Result<()> {
        info!(%axis, distance, "DEMO stage: jog");
        self.recorder.push(DeviceEvent::StageJog(axis, distance));
        Ok(())
    }

    async fn zero(&self) -> Result<()> {
        info!("DEMO stage: zero");
        self.recorder.push(DeviceEvent::StageZero);
        Ok(())
    }

    async fn check_idle(&self) -> Result<bool> {
        Ok(true)
    }

    async fn wait_idle(&self) -> Result<()> {
        Ok(())
    }
}

/// Simulated flow sensor returning a fixed reading.
#[derive(Debug, Clone)]
pub struct DemoFlowSensor {
    reading: Option<f64>,
    recorder: DeviceRecorder,
}

impl DemoFlowSensor {
    /// Sensor answering every `stop()` with `reading` (ml).
    pub fn new(reading: Option<f64>, recorder: DeviceRecorder) -> Self {
        Self { reading, recorder }
    }
}

#[async_trait]
impl FlowSensor for DemoFlowSensor {
    async fn start(&self) -> Result<()> {
        self.recorder.push(DeviceEvent::SensorStart);
        Ok(())
    }

    async fn stop(&self) -> Result<Option<f64>> {
        self.recorder.push(DeviceEvent::SensorStop);
        info!(volume = ?self.reading, "DEMO flow sensor: stop");
        Ok(self.reading)
    }
}

/// Simulated microscope that returns immediately.
#[derive(Debug, Clone)]
pub struct DemoAcquirer {
    recorder: DeviceRecorder,
}

impl DemoAcquirer {
    /// Acquirer writing into `recorder`.
    pub fn new(recorder: DeviceRecorder) -> Self {
        Self { recorder }
    }
}

#[async_trait]
impl ImageAcquirer for DemoAcquirer {
    async fn acquire_images(&self, save_dir: &Path, name_base: &str) -> Result<()> {
        info!(save_dir = %save_dir.display(), name_base, "DEMO acquisition");
        self.recorder.push(DeviceEvent::Acquire(
            save_dir.to_path_buf(),
            name_base.to_string(),
        ));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_calls_in_order() {
        let recorder = DeviceRecorder::new();
        let pump = DemoPump::new(recorder.clone());
        let valve = DemoValve::new(ValveRole::Outlet, recorder.clone());
        let stage = DemoStage::new(recorder.clone());

        valve.move_to(3).await.unwrap();
        pump.start().await.unwrap();
        pump.stop().await.unwrap();
        stage.jog(Axis::Y, 1.5).await.unwrap();
        assert!(stage.check_idle().await.unwrap());

        assert_eq!(
            recorder.events(),
            vec![
                DeviceEvent::ValveMove(ValveRole::Outlet, 3),
                DeviceEvent::PumpStart,
                DeviceEvent::PumpStop,
                DeviceEvent::StageJog(Axis::Y, 1.5),
            ]
        );
        recorder.clear();
        assert!(recorder.events().is_empty());
    }

    #[tokio::test]
    async fn flow_sensor_returns_configured_reading() {
        let sensor = DemoFlowSensor::new(Some(0.44), DeviceRecorder::new());
        sensor.start().await.unwrap();
        assert_eq!(sensor.stop().await.unwrap(), Some(0.44));
    }
}
