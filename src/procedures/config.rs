//! Sweep parameters and fixed settle timings.
//!
//! `SweepParameters` is what the operator chooses per job. `SweepTiming` holds
//! the settle durations that depend on the physical setup rather than on the
//! measurement, so they live in the configuration file instead of the job.

use crate::error::SweepError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Parameters of one rotation sweep. Immutable once the job starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepParameters {
    /// Magnet current held during the sweep (A)
    pub target_current: f64,
    /// Magnet ramping rate (A/s)
    pub ramp_rate: f64,
    /// Rotation covered in each direction (deg)
    pub max_angle: f64,
    /// Rotation per step-line edge (deg/step). The motor moves on both
    /// the rising and the falling edge.
    pub degrees_per_step: f64,
    /// Settle time after each motor step (s)
    pub delay_seconds: f64,
    /// Magnetic field calibration (T/A)
    pub field_calibration: f64,
}

impl Default for SweepParameters {
    fn default() -> Self {
        Self {
            target_current: 1.0,
            ramp_rate: 0.1,
            max_angle: 180.0,
            degrees_per_step: 90.0 / 50.0 / 2.0,
            delay_seconds: 0.35,
            field_calibration: 13.69,
        }
    }
}

impl SweepParameters {
    /// Number of step pulses needed to cover `max_angle`.
    ///
    /// Halfway cases round to even.
    pub fn pulse_count(&self) -> u64 {
        (self.max_angle / self.degrees_per_step).round_ties_even() as u64
    }

    /// Step settle time as a `Duration`.
    pub fn delay(&self) -> Duration {
        seconds(self.delay_seconds)
    }

    /// Reject values that would make the sweep meaningless or unsafe.
    pub fn validate(&self) -> Result<(), SweepError> {
        if !(self.degrees_per_step.is_finite() && self.degrees_per_step > 0.0) {
            return Err(SweepError::InvalidParameter(format!(
                "degrees_per_step must be positive, got {}",
                self.degrees_per_step
            )));
        }
        if !(self.max_angle.is_finite() && self.max_angle >= 0.0) {
            return Err(SweepError::InvalidParameter(format!(
                "max_angle must be non-negative, got {}",
                self.max_angle
            )));
        }
        if !(self.ramp_rate.is_finite() && self.ramp_rate > 0.0) {
            return Err(SweepError::InvalidParameter(format!(
                "ramp_rate must be positive, got {}",
                self.ramp_rate
            )));
        }
        if !(self.delay_seconds.is_finite() && self.delay_seconds >= 0.0) {
            return Err(SweepError::InvalidParameter(format!(
                "delay_seconds must be non-negative, got {}",
                self.delay_seconds
            )));
        }
        if !self.target_current.is_finite() || !self.field_calibration.is_finite() {
            return Err(SweepError::InvalidParameter(
                "target_current and field_calibration must be finite".to_string(),
            ));
        }
        Ok(())
    }
}

/// Fixed settle durations of the rig.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepTiming {
    /// Settle time per step while homing (s)
    pub home_step_delay_secs: f64,
    /// Wait after enabling the source in startup (s)
    pub startup_settle_secs: f64,
    /// Wait between ramp-down and output disable in shutdown (s)
    pub shutdown_settle_secs: f64,
}

impl Default for SweepTiming {
    fn default() -> Self {
        Self {
            home_step_delay_secs: 0.35,
            startup_settle_secs: 5.0,
            shutdown_settle_secs: 1.0,
        }
    }
}

impl SweepTiming {
    /// No waiting at all; for mock rigs and tests.
    pub fn immediate() -> Self {
        Self {
            home_step_delay_secs: 0.0,
            startup_settle_secs: 0.0,
            shutdown_settle_secs: 0.0,
        }
    }

    /// Home step settle time.
    pub fn home_step_delay(&self) -> Duration {
        seconds(self.home_step_delay_secs)
    }

    /// Startup settle time.
    pub fn startup_settle(&self) -> Duration {
        seconds(self.startup_settle_secs)
    }

    /// Shutdown settle time.
    pub fn shutdown_settle(&self) -> Duration {
        seconds(self.shutdown_settle_secs)
    }

    /// All durations must be finite and non-negative.
    pub fn validate(&self) -> Result<(), SweepError> {
        let fields = [
            ("home_step_delay_secs", self.home_step_delay_secs),
            ("startup_settle_secs", self.startup_settle_secs),
            ("shutdown_settle_secs", self.shutdown_settle_secs),
        ];
        for (name, value) in fields {
            if !(value.is_finite() && value >= 0.0) {
                return Err(SweepError::InvalidParameter(format!(
                    "{} must be a non-negative number of seconds, got {}",
                    name, value
                )));
            }
        }
        Ok(())
    }
}

// Invalid values are rejected by `validate`; here they collapse to zero.
fn seconds(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::ZERO)
}
