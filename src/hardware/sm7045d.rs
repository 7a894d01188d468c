//! Delta Elektronika SM 70-45 D power supply driver
//!
//! Protocol Overview:
//! - `SOUR:CURR <a>` / `SOUR:CURR?`: current setpoint
//! - `SOUR:VOLT <v>`: voltage setpoint, used as compliance in CC mode
//! - `MEAS:CURR?` / `MEAS:VOLT?`: measured output
//! - `OUTP ON` / `OUTP OFF`: output stage
//!
//! The supply itself jumps to a new setpoint. The magnet must be ramped, so
//! [`Sm7045d::ramp_to_current`] walks the setpoint in steps of
//! `rate × interval` and waits one interval between writes.

use crate::error::SweepError;
use crate::hardware::adapter::InstrumentLink;
use crate::hardware::capabilities::CurrentSource;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info};

/// Maximum output current (A)
pub const MAX_CURRENT: f64 = 45.0;
/// Maximum output voltage (V)
pub const MAX_VOLTAGE: f64 = 70.0;

/// Driver for the SM 70-45 D current source
pub struct Sm7045d<L> {
    link: L,
    ramp_interval: Duration,
    compliance_voltage: f64,
}

impl<L: InstrumentLink> Sm7045d<L> {
    /// Wrap an instrument link. Ramps update every 100 ms; the voltage
    /// compliance is the full 70 V.
    pub fn new(link: L) -> Self {
        Self {
            link,
            ramp_interval: Duration::from_millis(100),
            compliance_voltage: MAX_VOLTAGE,
        }
    }

    /// Set the ramp update interval
    pub fn with_ramp_interval(mut self, interval: Duration) -> Self {
        self.ramp_interval = interval;
        self
    }

    /// Set the voltage written on enable
    pub fn with_compliance_voltage(mut self, volts: f64) -> Self {
        self.compliance_voltage = volts;
        self
    }

    /// Underlying link.
    pub fn link(&self) -> &L {
        &self.link
    }

    /// Present current setpoint (A).
    pub async fn current_setpoint(&self) -> Result<f64> {
        self.link.ask_f64("SOUR:CURR?").await
    }

    /// Write a new current setpoint (A) without ramping.
    pub async fn set_current(&self, amps: f64) -> Result<()> {
        if !(0.0..=MAX_CURRENT).contains(&amps) {
            return Err(anyhow!(SweepError::Instrument(format!(
                "SM7045D current {} A outside 0-{} A",
                amps, MAX_CURRENT
            ))));
        }
        self.link.write(&format!("SOUR:CURR {}", amps)).await
    }

    /// Write the voltage setpoint (V).
    pub async fn set_voltage(&self, volts: f64) -> Result<()> {
        if !(0.0..=MAX_VOLTAGE).contains(&volts) {
            return Err(anyhow!(SweepError::Instrument(format!(
                "SM7045D voltage {} V outside 0-{} V",
                volts, MAX_VOLTAGE
            ))));
        }
        self.link.write(&format!("SOUR:VOLT {}", volts)).await
    }

    /// Measured output current (A).
    pub async fn measured_current(&self) -> Result<f64> {
        self.link.ask_f64("MEAS:CURR?").await
    }

    /// Measured output voltage (V).
    pub async fn measured_voltage(&self) -> Result<f64> {
        self.link.ask_f64("MEAS:VOLT?").await
    }

    /// Setpoints visited when ramping from `from` to `to` at `rate` A/s.
    ///
    /// The last entry is always exactly `to`.
    pub fn ramp_points(&self, from: f64, to: f64, rate: f64) -> Vec<f64> {
        let step = rate * self.ramp_interval.as_secs_f64();
        let distance = to - from;
        if step <= 0.0 || distance == 0.0 {
            return vec![to];
        }
        let count = (distance.abs() / step).ceil() as usize;
        let mut points: Vec<f64> = (1..count)
            .map(|i| from + distance.signum() * step * i as f64)
            .collect();
        points.push(to);
        points
    }
}

#[async_trait]
impl<L: InstrumentLink> CurrentSource for Sm7045d<L> {
    async fn ramp_to_current(&self, current: f64, rate: f64) -> Result<()> {
        if !(rate.is_finite() && rate > 0.0) {
            return Err(anyhow!(SweepError::InvalidParameter(format!(
                "ramp rate must be positive, got {}",
                rate
            ))));
        }
        let start = self.current_setpoint().await?;
        let points = self.ramp_points(start, current, rate);
        info!(
            from = start,
            to = current,
            rate,
            steps = points.len(),
            "Ramping {}",
            self.link.name()
        );

        let last = points.len().saturating_sub(1);
        for (i, point) in points.into_iter().enumerate() {
            self.set_current(point).await?;
            if i < last && !self.ramp_interval.is_zero() {
                tokio::time::sleep(self.ramp_interval).await;
            }
        }
        debug!(current, "Ramp complete");
        Ok(())
    }

    async fn enable(&self) -> Result<()> {
        self.set_voltage(self.compliance_voltage).await?;
        self.link.write("OUTP ON").await
    }

    async fn disable(&self) -> Result<()> {
        self.link.write("OUTP OFF").await
    }
}
