//! One row of sweep output.

use serde::{Deserialize, Serialize};

/// Column labels of the results file, in row order.
pub const DATA_COLUMNS: [&str; 7] = [
    "Angle (deg)",
    "Magnet Current (A)",
    "Magnetic Field (T)",
    "Lock-In 1 X (V)",
    "Lock-In 1 Y (V)",
    "Lock-In 2 X (V)",
    "Lock-In 2 Y (V)",
];

/// A single measurement point.
///
/// Angle and field are derived from the controller state when the record is
/// built; the four lock-in components are live reads.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MeasurementRecord {
    /// Rotation angle in degrees
    #[serde(rename = "Angle (deg)")]
    pub angle_degrees: f64,
    /// Magnet current setpoint in amps
    #[serde(rename = "Magnet Current (A)")]
    pub current_amps: f64,
    /// Calibrated magnetic field in tesla
    #[serde(rename = "Magnetic Field (T)")]
    pub field_tesla: f64,
    /// Lock-in 1 in-phase component in volts
    #[serde(rename = "Lock-In 1 X (V)")]
    pub lockin1_x: f64,
    /// Lock-in 1 quadrature component in volts
    #[serde(rename = "Lock-In 1 Y (V)")]
    pub lockin1_y: f64,
    /// Lock-in 2 in-phase component in volts
    #[serde(rename = "Lock-In 2 X (V)")]
    pub lockin2_x: f64,
    /// Lock-in 2 quadrature component in volts
    #[serde(rename = "Lock-In 2 Y (V)")]
    pub lockin2_y: f64,
}

impl MeasurementRecord {
    /// Values in [`DATA_COLUMNS`] order.
    pub fn values(&self) -> [f64; 7] {
        [
            self.angle_degrees,
            self.current_amps,
            self.field_tesla,
            self.lockin1_x,
            self.lockin1_y,
            self.lockin2_x,
            self.lockin2_y,
        ]
    }

    /// Field-name to value mapping, ordered as in the results file.
    pub fn fields(&self) -> Vec<(&'static str, f64)> {
        DATA_COLUMNS.iter().copied().zip(self.values()).collect()
    }

    /// Look up a value by its column label.
    pub fn get(&self, column: &str) -> Option<f64> {
        DATA_COLUMNS
            .iter()
            .position(|c| *c == column)
            .map(|i| self.values()[i])
    }
}
