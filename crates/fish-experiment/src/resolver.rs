//! Buffer selection: inlet valve position plus plate target.
//!
//! A buffer is `[valve id, plate id, plate position]`:
//!
//! - valve id `0` leaves the inlet valve alone, any other value moves it;
//! - plate id `0` takes an absolute `X{x}_Y{y}_Z{z}` position string,
//!   plate id `1` takes a well label resolved through the well table.
//!
//! The stage always completes the horizontal group and reports idle before
//! the vertical group is sent.

use fish_core::capabilities::{Axis, AxisTargets, Stage, Valve};
use fish_core::error::{AppResult, FluidicsError};
use regex::Regex;
use std::sync::{Arc, LazyLock};
use tracing::{info, instrument};

use crate::config::ExperimentConfig;
use crate::wells::WellCoordinateTable;

#[allow(clippy::expect_used)]
static ABSOLUTE_POSITION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)X(?P<X>.*)_Y(?P<Y>.*)_Z(?P<Z>.*)").expect("Invalid position regex")
});

/// Split an `X.._Y.._Z..` string into horizontal and vertical targets.
pub fn parse_absolute_position(text: &str) -> AppResult<(AxisTargets, AxisTargets)> {
    let malformed = || FluidicsError::MalformedPosition(text.to_string());
    let caps = ABSOLUTE_POSITION.captures(text).ok_or_else(malformed)?;
    let coord = |name: &str| -> AppResult<f64> {
        caps.name(name)
            .and_then(|m| m.as_str().trim().parse().ok())
            .ok_or_else(malformed)
    };
    let horizontal = AxisTargets::from([(Axis::X, coord("X")?), (Axis::Y, coord("Y")?)]);
    let vertical = AxisTargets::from([(Axis::Z, coord("Z")?)]);
    Ok((horizontal, vertical))
}

/// Resolves buffer names to device moves and tracks the current buffer.
#[derive(Debug, Clone)]
pub struct BufferResolver {
    config: Arc<ExperimentConfig>,
    wells: Option<WellCoordinateTable>,
    current: Option<String>,
}

impl BufferResolver {
    /// Resolver for `config`; computes the well table if a plate is defined.
    pub fn new(config: Arc<ExperimentConfig>) -> AppResult<Self> {
        let wells = match &config.well_plate {
            Some(plate) => {
                info!("Calculating well positions");
                Some(WellCoordinateTable::new(plate)?)
            }
            None => None,
        };
        Ok(Self {
            config,
            wells,
            current: None,
        })
    }

    /// Buffer the robot is currently at.
    pub fn current(&self) -> Option<&str> {
        self.current.as_deref()
    }

    /// Forget the current buffer, so the next selection moves again.
    pub fn reset(&mut self) {
        self.current = None;
    }

    /// Well table, if the experiment defines a plate.
    pub fn wells(&self) -> Option<&WellCoordinateTable> {
        self.wells.as_ref()
    }

    /// Move valve and stage to `name`. Returns `false` if already there.
    #[instrument(skip(self, valve_in, plate), err)]
    pub async fn select_buffer(
        &mut self,
        name: &str,
        valve_in: Option<&dyn Valve>,
        plate: Option<&dyn Stage>,
    ) -> AppResult<bool> {
        info!(buffer = name, "Moving robot to buffer");
        if self.current.as_deref() == Some(name) {
            info!("Robot is already in place");
            return Ok(false);
        }

        let spec = self
            .config
            .buffer(name)
            .ok_or_else(|| FluidicsError::UnknownBuffer(name.to_string()))?
            .clone();

        if spec.valve_id > 0 {
            let valve = valve_in.ok_or(FluidicsError::NoInletValve)?;
            info!(position = spec.valve_id, "Moving inlet valve");
            valve.move_to(spec.valve_id).await?;
        }

        let targets = match (spec.plate_id, spec.plate_pos.as_deref()) {
            (0, None) => None,
            (0, Some(text)) => Some(parse_absolute_position(text)?),
            (1, label) => {
                let label = label.ok_or_else(|| FluidicsError::UndefinedWell(String::new()))?;
                let wells = self.wells.as_ref().ok_or_else(|| {
                    FluidicsError::Configuration(format!(
                        "buffer {} targets well {} but no well_plate is defined",
                        name, label
                    ))
                })?;
                let well = wells.resolve(label)?;
                Some((well.horizontal(), well.vertical()))
            }
            (other, _) => {
                return Err(FluidicsError::Configuration(format!(
                    "buffer {} uses plate id {}; only 0 (absolute) and 1 (wells) exist",
                    name, other
                )))
            }
        };

        if let Some((horizontal, vertical)) = targets {
            let stage = plate.ok_or_else(|| FluidicsError::NotReady("no plate stage assigned".into()))?;
            info!(?horizontal, ?vertical, "Moving plate");
            stage.move_to(&horizontal).await?;
            stage.wait_idle().await?;
            stage.move_to(&vertical).await?;
            stage.wait_idle().await?;
        }

        self.current = Some(name.to_string());
        Ok(true)
    }
}

/// Retract Z to 0, then bring X and Y to 0, polling idle after each group.
pub async fn move_to_origin(stage: &dyn Stage) -> AppResult<()> {
    info!("Moving plate to position zero");
    stage.move_to(&AxisTargets::from([(Axis::Z, 0.0)])).await?;
    stage.wait_idle().await?;
    stage
        .move_to(&AxisTargets::from([(Axis::X, 0.0), (Axis::Y, 0.0)]))
        .await?;
    stage.wait_idle().await?;
    Ok(())
}
