//! Well coordinates for a possibly rotated plate.
//!
//! Nominal well positions form a grid anchored at the measured bottom-left
//! well: column `i`, row `j` sits at `bottom_left + (i, j) * spacing`. If the
//! plate is mounted slightly askew, the measured top-right well is not where
//! the grid puts it. The plate rotation is the angle of the measured diagonal
//! minus the angle of the nominal diagonal. Every grid point is rotated by it
//! about the bottom-left well.
//!
//! Labels use the column letter and the 1-based row number: `A1` is the
//! bottom-left well, `B1` the next column, `A2` the next row.

use fish_core::capabilities::{Axis, AxisTargets};
use fish_core::error::{AppResult, FluidicsError};
use std::collections::HashMap;
use tracing::info;

use crate::config::WellPlate;

/// Stage coordinates of one well.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WellPosition {
    /// X in mm.
    pub x: f64,
    /// Y in mm.
    pub y: f64,
    /// Z in mm.
    pub z: f64,
}

impl WellPosition {
    /// Horizontal (X/Y) targets.
    pub fn horizontal(&self) -> AxisTargets {
        AxisTargets::from([(Axis::X, self.x), (Axis::Y, self.y)])
    }

    /// Vertical (Z) target.
    pub fn vertical(&self) -> AxisTargets {
        AxisTargets::from([(Axis::Z, self.z)])
    }
}

/// Coordinates of every well, computed once per experiment.
#[derive(Debug, Clone)]
pub struct WellCoordinateTable {
    wells: HashMap<String, WellPosition>,
    rotation: f64,
}

/// Label of the well in column `column` and row `row` (both 0-based).
pub fn well_label(column: u32, row: u32) -> String {
    let letter = char::from_u32('A' as u32 + column).unwrap_or('?');
    format!("{}{}", letter, row + 1)
}

fn rotate_about(point: (f64, f64), origin: (f64, f64), radians: f64) -> (f64, f64) {
    let (x, y) = point;
    let (ox, oy) = origin;
    let (sin, cos) = radians.sin_cos();
    (
        ox + cos * (x - ox) - sin * (y - oy),
        oy + sin * (x - ox) + cos * (y - oy),
    )
}

impl WellCoordinateTable {
    /// Compute all well positions for `plate`.
    pub fn new(plate: &WellPlate) -> AppResult<Self> {
        if plate.rows == 0 || plate.columns == 0 {
            return Err(FluidicsError::Configuration(
                "well_plate needs at least one row and one column".to_string(),
            ));
        }
        if plate.well_spacing <= 0.0 {
            return Err(FluidicsError::Configuration(format!(
                "well_plate spacing must be positive, got {}",
                plate.well_spacing
            )));
        }

        let bl = (plate.bottom_left.x, plate.bottom_left.y);
        let nominal_dx = f64::from(plate.columns - 1) * plate.well_spacing;
        let nominal_dy = f64::from(plate.rows - 1) * plate.well_spacing;
        let measured_dx = plate.top_right.x - plate.bottom_left.x;
        let measured_dy = plate.top_right.y - plate.bottom_left.y;

        let phi_wells = nominal_dy.atan2(nominal_dx);
        let phi_plate = measured_dy.atan2(measured_dx);
        let rotation = phi_plate - phi_wells;
        info!(degrees = rotation.to_degrees(), "Plate rotation");

        let mut wells = HashMap::new();
        for i in 0..plate.columns {
            for j in 0..plate.rows {
                let nominal = (
                    bl.0 + f64::from(i) * plate.well_spacing,
                    bl.1 + f64::from(j) * plate.well_spacing,
                );
                let (x, y) = if rotation == 0.0 {
                    nominal
                } else {
                    rotate_about(nominal, bl, rotation)
                };
                wells.insert(
                    well_label(i, j),
                    WellPosition {
                        x,
                        y,
                        z: plate.z_base,
                    },
                );
            }
        }

        Ok(Self { wells, rotation })
    }

    /// Position of the well called `label`.
    pub fn resolve(&self, label: &str) -> AppResult<WellPosition> {
        self.wells
            .get(label)
            .copied()
            .ok_or_else(|| FluidicsError::UndefinedWell(label.to_string()))
    }

    /// Plate rotation in radians.
    pub fn rotation(&self) -> f64 {
        self.rotation
    }

    /// Number of wells.
    pub fn len(&self) -> usize {
        self.wells.len()
    }

    /// True for an empty table.
    pub fn is_empty(&self) -> bool {
        self.wells.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Corner;

    fn plate(top_right: Corner) -> WellPlate {
        WellPlate {
            rows: 8,
            columns: 12,
            well_spacing: 9.0,
            bottom_left: Corner { x: 10.0, y: 10.0 },
            top_right,
            z_base: -20.0,
        }
    }

    #[test]
    fn labels() {
        assert_eq!(well_label(0, 0), "A1");
        assert_eq!(well_label(1, 0), "B1");
        assert_eq!(well_label(0, 7), "A8");
        assert_eq!(well_label(11, 7), "L8");
    }

    #[test]
    fn unrotated_plate_is_the_nominal_grid() {
        let table = WellCoordinateTable::new(&plate(Corner { x: 109.0, y: 73.0 })).unwrap();
        assert_eq!(table.rotation(), 0.0);
        assert_eq!(table.len(), 96);

        for i in 0..12 {
            for j in 0..8 {
                let pos = table.resolve(&well_label(i, j)).unwrap();
                assert_eq!(pos.x, 10.0 + f64::from(i) * 9.0);
                assert_eq!(pos.y, 10.0 + f64::from(j) * 9.0);
                assert_eq!(pos.z, -20.0);
            }
        }
    }

    #[test]
    fn rotated_plate_is_a_rigid_rotation_about_bottom_left() {
        let theta: f64 = 0.02;
        let (tr_x, tr_y) = rotate_about((109.0, 73.0), (10.0, 10.0), theta);
        let table = WellCoordinateTable::new(&plate(Corner { x: tr_x, y: tr_y })).unwrap();
        assert!((table.rotation() - theta).abs() < 1e-12);

        for i in 0..12 {
            for j in 0..8 {
                let pos = table.resolve(&well_label(i, j)).unwrap();
                let (x, y) = rotate_about((pos.x, pos.y), (10.0, 10.0), -table.rotation());
                assert!((x - (10.0 + f64::from(i) * 9.0)).abs() < 1e-9);
                assert!((y - (10.0 + f64::from(j) * 9.0)).abs() < 1e-9);
            }
        }

        let corner = table.resolve("L8").unwrap();
        assert!((corner.x - tr_x).abs() < 1e-9);
        assert!((corner.y - tr_y).abs() < 1e-9);
    }

    #[test]
    fn resolve_is_idempotent_and_rejects_unknown_wells() {
        let table = WellCoordinateTable::new(&plate(Corner { x: 110.0, y: 72.0 })).unwrap();
        assert_eq!(table.resolve("C4").unwrap(), table.resolve("C4").unwrap());
        assert!(matches!(
            table.resolve("M1"),
            Err(FluidicsError::UndefinedWell(label)) if label == "M1"
        ));
    }

    #[test]
    fn single_well_plate() {
        let mut single = plate(Corner { x: 10.0, y: 10.0 });
        single.rows = 1;
        single.columns = 1;
        let table = WellCoordinateTable::new(&single).unwrap();
        assert_eq!(table.rotation(), 0.0);
        assert_eq!(table.resolve("A1").unwrap().x, 10.0);
    }

    #[test]
    fn invalid_geometry() {
        let mut bad = plate(Corner { x: 109.0, y: 73.0 });
        bad.well_spacing = 0.0;
        assert!(WellCoordinateTable::new(&bad).is_err());
    }
}
