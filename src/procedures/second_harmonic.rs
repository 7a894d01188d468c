//! Second-harmonic rotation sweep.
//!
//! The magnet is ramped to a fixed current, then the sample is rotated by
//! `max_angle` clockwise and the same angle back counterclockwise. Both
//! lock-ins are read before the first step, after every step, and once more
//! at the end of each half:
//!
//! ```text
//! progress  0 ──── clockwise ──── 50 ── counterclockwise ── 100
//! position  0 ─────────────────→ +N ───────────────────────→ 0
//! ```
//!
//! The stage has no encoder. The controller's step counter is the only
//! record of the stage angle, and shutdown drives it back to zero.

use crate::data::emitter::Emitter;
use crate::data::record::MeasurementRecord;
use crate::error::SweepError;
use crate::hardware::capabilities::{Rig, RigConnector};
use crate::hardware::stepper::{Direction, StepperLines, StepperMotor};
use crate::procedures::config::{SweepParameters, SweepTiming};
use crate::procedures::{Procedure, ProcedureStatus};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Procedure name written to logs and results headers
pub const PROCEDURE_NAME: &str = "Second Harmonic Sweep";

/// How a half-sweep loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// All pulses done and the closing point measured
    Completed,
    /// The emitter asked to stop; no closing point was measured
    Stopped,
}

/// Controller for one rotation sweep at one magnet current.
pub struct SecondHarmonicSweep {
    params: SweepParameters,
    timing: SweepTiming,
    connector: Arc<dyn RigConnector>,
    rig: Option<Rig>,
    motor: StepperMotor,
}

impl SecondHarmonicSweep {
    /// Sweep that connects through `connector` at startup.
    pub fn new(
        params: SweepParameters,
        timing: SweepTiming,
        connector: Arc<dyn RigConnector>,
        lines: StepperLines,
    ) -> Self {
        Self {
            params,
            timing,
            connector,
            rig: None,
            motor: StepperMotor::new(lines),
        }
    }

    /// Parameters of this sweep.
    pub fn params(&self) -> &SweepParameters {
        &self.params
    }

    /// Net signed steps since the last home.
    pub fn position(&self) -> i64 {
        self.motor.position()
    }

    /// Whether startup connected the rig and shutdown has not yet released it.
    pub fn is_connected(&self) -> bool {
        self.rig.is_some()
    }

    fn rig(&self) -> Result<&Rig> {
        self.rig.as_ref().ok_or_else(|| anyhow!(SweepError::NotConnected))
    }

    /// Rotation angle of the present position (deg).
    pub fn calc_angle(&self) -> f64 {
        self.params.degrees_per_step * self.motor.position() as f64
    }

    /// Field from the current setpoint and the calibration (T).
    ///
    /// Not a live reading.
    pub fn calc_field(&self) -> f64 {
        self.params.target_current * self.params.field_calibration
    }

    /// Toggle the step line once and wait `delay`, or the sweep delay.
    pub async fn step_motor(&mut self, delay: Option<Duration>) -> Result<()> {
        let lockin = self.rig()?.lockin1.clone();
        let settle = delay.unwrap_or_else(|| self.params.delay());
        self.motor.step(lockin.as_ref(), settle).await
    }

    /// Step back to position 0 with the home step delay.
    pub async fn home_motor(&mut self) -> Result<()> {
        let lockin = self.rig()?.lockin1.clone();
        info!(position = self.motor.position(), "Homing motor");
        self.motor
            .home(lockin.as_ref(), self.timing.home_step_delay())
            .await
    }

    /// Read both lock-ins and emit one record.
    pub async fn measure(&self, emitter: &mut dyn Emitter) -> Result<MeasurementRecord> {
        let rig = self.rig()?;
        let (lockin1_x, lockin1_y) = rig.lockin1.xy().await.context("Lock-in 1 read")?;
        let (lockin2_x, lockin2_y) = rig.lockin2.xy().await.context("Lock-in 2 read")?;

        let record = MeasurementRecord {
            angle_degrees: self.calc_angle(),
            current_amps: self.params.target_current,
            field_tesla: self.calc_field(),
            lockin1_x,
            lockin1_y,
            lockin2_x,
            lockin2_y,
        };
        emitter.results(&record).await?;
        Ok(record)
    }

    /// Measure and step `pulse_count` times, then measure once more.
    ///
    /// Progress after point `i` is `start + (end - start) * i / pulse_count`.
    /// A stop request is honoured after the measurement of a point, before
    /// the next step.
    pub async fn run_measurement_procedure(
        &mut self,
        emitter: &mut dyn Emitter,
        pulse_count: u64,
        progress_start: f64,
        progress_end: f64,
    ) -> Result<LoopExit> {
        let span = progress_end - progress_start;
        for i in 0..pulse_count {
            self.measure(emitter).await?;
            emitter.progress(progress_start + span * i as f64 / pulse_count as f64);

            if emitter.should_stop() {
                warn!(
                    position = self.motor.position(),
                    "Caught the stop flag in the procedure"
                );
                return Ok(LoopExit::Stopped);
            }
            self.step_motor(None).await?;
        }

        self.measure(emitter).await?;
        emitter.progress(progress_end);
        Ok(LoopExit::Completed)
    }

    async fn set_direction(&self, direction: Direction) -> Result<()> {
        let lockin = self.rig()?.lockin1.clone();
        self.motor.set_direction(lockin.as_ref(), direction).await
    }
}

#[async_trait]
impl Procedure for SecondHarmonicSweep {
    fn name(&self) -> &str {
        PROCEDURE_NAME
    }

    async fn startup(&mut self) -> Result<()> {
        self.params.validate()?;
        info!("Setting up instruments");
        let rig = self
            .connector
            .connect()
            .await
            .context("Could not connect to the instruments")?;
        self.rig = Some(rig);

        let rig = self.rig()?.clone();
        self.motor.zero_lines(rig.lockin1.as_ref()).await?;
        rig.source.ramp_to_zero(self.params.ramp_rate).await?;
        rig.source.enable().await?;

        let settle = self.timing.startup_settle();
        if !settle.is_zero() {
            tokio::time::sleep(settle).await;
        }
        Ok(())
    }

    async fn execute(&mut self, emitter: &mut dyn Emitter) -> Result<ProcedureStatus> {
        let source = self.rig()?.source.clone();
        info!(
            current = self.params.target_current,
            rate = self.params.ramp_rate,
            "Ramping to target current"
        );
        source
            .ramp_to_current(self.params.target_current, self.params.ramp_rate)
            .await?;

        let pulse_count = self.params.pulse_count();
        self.motor.reset();
        info!(pulse_count, "Starting second harmonic measurement");

        // Both halves always run. After a stop the counterclockwise half
        // measures its first point at progress 50 and returns on the flag.
        let halves = [
            (Direction::Clockwise, 0.0, 50.0),
            (Direction::Counterclockwise, 50.0, 100.0),
        ];
        let mut status = ProcedureStatus::Finished;
        for (direction, start, end) in halves {
            debug!(?direction, "Starting half sweep");
            self.set_direction(direction).await?;
            let delay = self.params.delay();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if self
                .run_measurement_procedure(emitter, pulse_count, start, end)
                .await?
                == LoopExit::Stopped
            {
                status = ProcedureStatus::Aborted;
            }
        }
        Ok(status)
    }

    async fn shutdown(&mut self) -> Result<()> {
        let Some(rig) = self.rig.clone() else {
            debug!("Shutdown without connected instruments");
            return Ok(());
        };
        let mut failures = Vec::new();

        info!("Ramping current to zero");
        if let Err(e) = rig.source.ramp_to_zero(self.params.ramp_rate).await {
            error!(error = %e, "Ramp to zero failed");
            failures.push(format!("ramp to zero: {:#}", e));
        }
        let settle = self.timing.shutdown_settle();
        if !settle.is_zero() {
            tokio::time::sleep(settle).await;
        }
        if let Err(e) = rig.source.disable().await {
            error!(error = %e, "Disabling output failed");
            failures.push(format!("disable output: {:#}", e));
        }
        if let Err(e) = self.home_motor().await {
            error!(error = %e, position = self.motor.position(), "Homing failed");
            failures.push(format!("home motor: {:#}", e));
        }
        if let Err(e) = self.motor.zero_lines(rig.lockin1.as_ref()).await {
            error!(error = %e, "Zeroing stepper lines failed");
            failures.push(format!("zero stepper lines: {:#}", e));
        }

        self.rig = None;
        if failures.is_empty() {
            info!("Finished shutting down");
            Ok(())
        } else {
            Err(SweepError::ShutdownFailed(failures).into())
        }
    }
}
