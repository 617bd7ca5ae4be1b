//! Capability traits for the fluidics hardware roles.
//!
//! Each hardware role is one small async trait. A driver implements the traits
//! for the roles it can fill. Once assigned, the engine holds it as an
//! `Arc<dyn Trait>` for the rest of the session. The engine never looks at
//! concrete driver types.
//!
//! # Thread Safety
//! - All methods take `&self`; drivers keep their channel behind a mutex
//! - Every trait is `Send + Sync` so handles can move into the round worker

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

// =============================================================================
// Axes
// =============================================================================

/// Stage axis. Ordered so that horizontal axes sort before `Z`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Axis {
    /// Horizontal, along plate columns.
    X,
    /// Horizontal, along plate rows.
    Y,
    /// Vertical.
    Z,
}

impl Axis {
    /// `true` for X and Y.
    pub fn is_horizontal(self) -> bool {
        matches!(self, Axis::X | Axis::Y)
    }

    /// Upper-case G-code letter.
    pub fn letter(self) -> char {
        match self {
            Axis::X => 'X',
            Axis::Y => 'Y',
            Axis::Z => 'Z',
        }
    }
}

impl std::fmt::Display for Axis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.letter())
    }
}

impl std::str::FromStr for Axis {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "X" => Ok(Axis::X),
            "Y" => Ok(Axis::Y),
            "Z" => Ok(Axis::Z),
            other => Err(anyhow::anyhow!("Position has to be X, Y or Z, got '{}'", other)),
        }
    }
}

/// Absolute target per axis, iterated in axis order.
pub type AxisTargets = BTreeMap<Axis, f64>;

// =============================================================================
// Capability Traits
// =============================================================================

/// Capability: liquid pump.
///
/// Flow rate and direction are fixed when the driver is assigned. At run time
/// the engine only switches the pump on and off.
#[async_trait]
pub trait Pump: Send + Sync {
    /// Start pumping.
    async fn start(&self) -> Result<()>;

    /// Stop pumping.
    async fn stop(&self) -> Result<()>;
}

/// Capability: rotary selection valve.
#[async_trait]
pub trait Valve: Send + Sync {
    /// Connect the common port to `position` (1-based).
    ///
    /// For daisy-chained valves this is the global position across all
    /// units. The driver computes which unit it falls on.
    async fn move_to(&self, position: u32) -> Result<()>;
}

/// Capability: XY/Z plate stage.
///
/// # Contract
/// - `move_to` only returns after the stage has reached every target
/// - If the targets include a horizontal axis, the stage retracts to Z=0
///   before it travels
/// - `check_idle` reports whether the status response contains the
///   vendor idle token
#[async_trait]
pub trait Stage: Send + Sync {
    /// Move to absolute coordinates, axis by axis.
    async fn move_to(&self, targets: &AxisTargets) -> Result<()>;

    /// Move relative to the current position along one axis.
    async fn jog(&self, axis: Axis, distance: f64) -> Result<()>;

    /// Declare the current position as the origin of all axes.
    async fn zero(&self) -> Result<()>;

    /// Query status once and report whether motion is complete.
    async fn check_idle(&self) -> Result<bool>;

    /// Poll [`Stage::check_idle`] until the stage reports idle.
    async fn wait_idle(&self) -> Result<()>;
}

/// Capability: flow sensor integrating pumped volume.
#[async_trait]
pub trait FlowSensor: Send + Sync {
    /// Mark the beginning of a measurement window.
    async fn start(&self) -> Result<()>;

    /// Close the window and return the pumped volume in ml.
    ///
    /// Returns `Ok(None)` if too few samples were captured to integrate.
    async fn stop(&self) -> Result<Option<f64>>;
}

/// Capability: image acquisition collaborator.
///
/// Every imaging synchronization strategy implements this trait, and so can
/// an external binding for a microscope SDK. The run coordinator depends
/// only on this trait.
#[async_trait]
pub trait ImageAcquirer: Send + Sync {
    /// Acquire one set of images into `save_dir`, named after `name_base`.
    async fn acquire_images(&self, save_dir: &Path, name_base: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn axis_parse_is_case_insensitive() {
        assert_eq!("x".parse::<Axis>().unwrap(), Axis::X);
        assert_eq!(" Z ".parse::<Axis>().unwrap(), Axis::Z);
        assert!("w".parse::<Axis>().is_err());
    }

    #[test]
    fn targets_iterate_horizontal_first() {
        let mut targets = AxisTargets::new();
        targets.insert(Axis::Z, 1.0);
        targets.insert(Axis::Y, 2.0);
        targets.insert(Axis::X, 3.0);
        let order: Vec<Axis> = targets.keys().copied().collect();
        assert_eq!(order, vec![Axis::X, Axis::Y, Axis::Z]);
    }
}
