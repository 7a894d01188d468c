//! American Magnetics Model 430 magnet power supply programmer
//!
//! Protocol Overview:
//! - `COIL?`: coil constant (kG/A)
//! - `VOLT:LIM?`: charging voltage limit
//! - `CONF:CURR:TARG <a>` / `CURR:TARG?`, `FIELD:TARG?`
//! - `CONF:RAMP:RATE:CURR 1,<a/s>` / `RAMP:RATE:CURR:1?` (segment 1 only),
//!   `RAMP:RATE:FIELD:1?`
//! - `CURR:MAG?`, `CURR:SUPP?`, `FIELD:MAG?`: read-outs
//! - `STATE?`: integer 1-10, see [`MagnetState`]
//! - `RAMP`, `ZERO`: ramp control
//! - `PSwitch 1|0` / `PSwitch?`: persistent switch heater
//!
//! The programmer ramps on its own; [`Ami430::ramp_to_current`] starts the
//! ramp and polls `STATE?` until the magnet holds, with a bounded wait.

use crate::error::SweepError;
use crate::hardware::adapter::{parse_u8, InstrumentLink};
use crate::hardware::capabilities::CurrentSource;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Operating state reported by `STATE?`.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum MagnetState {
    Ramping,
    Holding,
    Paused,
    ManualUp,
    ManualDown,
    ZeroingCurrent,
    Quench,
    AtZeroCurrent,
    HeatingPersistentSwitch,
    CoolingPersistentSwitch,
}

impl TryFrom<u8> for MagnetState {
    type Error = SweepError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Ok(match code {
            1 => MagnetState::Ramping,
            2 => MagnetState::Holding,
            3 => MagnetState::Paused,
            4 => MagnetState::ManualUp,
            5 => MagnetState::ManualDown,
            6 => MagnetState::ZeroingCurrent,
            7 => MagnetState::Quench,
            8 => MagnetState::AtZeroCurrent,
            9 => MagnetState::HeatingPersistentSwitch,
            10 => MagnetState::CoolingPersistentSwitch,
            other => {
                return Err(SweepError::Instrument(format!(
                    "AMI430 reported unknown state {}",
                    other
                )))
            }
        })
    }
}

impl fmt::Display for MagnetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            MagnetState::Ramping => "RAMPING",
            MagnetState::Holding => "HOLDING",
            MagnetState::Paused => "PAUSED",
            MagnetState::ManualUp => "Ramping in MANUAL UP",
            MagnetState::ManualDown => "Ramping in MANUAL DOWN",
            MagnetState::ZeroingCurrent => "ZEROING CURRENT in progress",
            MagnetState::Quench => "QUENCH",
            MagnetState::AtZeroCurrent => "AT ZERO CURRENT",
            MagnetState::HeatingPersistentSwitch => "Heating Persistent Switch",
            MagnetState::CoolingPersistentSwitch => "Cooling Persistent Switch",
        };
        f.write_str(text)
    }
}

/// Driver for the AMI 430 programmer
pub struct Ami430<L> {
    link: L,
    poll_interval: Duration,
    ramp_timeout: Duration,
}

impl<L: InstrumentLink> Ami430<L> {
    /// Wrap an instrument link. `STATE?` is polled every second for up to
    /// ten minutes.
    pub fn new(link: L) -> Self {
        Self {
            link,
            poll_interval: Duration::from_secs(1),
            ramp_timeout: Duration::from_secs(600),
        }
    }

    /// Interval between `STATE?` polls while waiting.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Give up waiting for a ramp after `timeout`.
    pub fn with_ramp_timeout(mut self, timeout: Duration) -> Self {
        self.ramp_timeout = timeout;
        self
    }

    /// Underlying link.
    pub fn link(&self) -> &L {
        &self.link
    }

    /// Coil constant (kG/A).
    pub async fn coil_constant(&self) -> Result<f64> {
        self.link.ask_f64("COIL?").await
    }

    /// Supply voltage limit (V).
    pub async fn voltage_limit(&self) -> Result<f64> {
        self.link.ask_f64("VOLT:LIM?").await
    }

    /// Programmed target current (A).
    pub async fn target_current(&self) -> Result<f64> {
        self.link.ask_f64("CURR:TARG?").await
    }

    /// Program the target current (A).
    pub async fn set_target_current(&self, amps: f64) -> Result<()> {
        self.link.write(&format!("CONF:CURR:TARG {}", amps)).await
    }

    /// Target field (kG).
    pub async fn target_field(&self) -> Result<f64> {
        self.link.ask_f64("FIELD:TARG?").await
    }

    /// Current ramp rate of segment 1 (A/s).
    pub async fn ramp_rate_current(&self) -> Result<f64> {
        self.link.ask_f64("RAMP:RATE:CURR:1?").await
    }

    /// Set the current ramp rate of segment 1 (A/s).
    pub async fn set_ramp_rate_current(&self, amps_per_second: f64) -> Result<()> {
        self.link
            .write(&format!("CONF:RAMP:RATE:CURR 1,{}", amps_per_second))
            .await
    }

    /// Field ramp rate of segment 1 (kG/s).
    pub async fn ramp_rate_field(&self) -> Result<f64> {
        self.link.ask_f64("RAMP:RATE:FIELD:1?").await
    }

    /// Current in the magnet (A).
    pub async fn magnet_current(&self) -> Result<f64> {
        self.link.ask_f64("CURR:MAG?").await
    }

    /// Current delivered by the supply (A).
    pub async fn supply_current(&self) -> Result<f64> {
        self.link.ask_f64("CURR:SUPP?").await
    }

    /// Magnet field (kG).
    pub async fn field(&self) -> Result<f64> {
        self.link.ask_f64("FIELD:MAG?").await
    }

    /// Read and decode `STATE?`.
    pub async fn status(&self) -> Result<MagnetState> {
        let reply = self.link.ask("STATE?").await?;
        let code = parse_u8("STATE?", &reply)?;
        Ok(MagnetState::try_from(code)?)
    }

    /// Ramp to the configured target.
    pub async fn ramp(&self) -> Result<()> {
        self.link.write("RAMP").await
    }

    /// Ramp to zero current at the configured rate.
    pub async fn zero(&self) -> Result<()> {
        self.link.write("ZERO").await
    }

    /// Whether the persistent switch heater is on.
    pub async fn persistent_switch_enabled(&self) -> Result<bool> {
        let reply = self.link.ask("PSwitch?").await?;
        Ok(parse_u8("PSwitch?", &reply)? != 0)
    }

    /// Turn the persistent switch heater on.
    pub async fn enable_persistent_switch(&self) -> Result<()> {
        self.link.write("PSwitch 1").await
    }

    /// Turn the persistent switch heater off.
    pub async fn disable_persistent_switch(&self) -> Result<()> {
        self.link.write("PSwitch 0").await
    }

    /// Poll `STATE?` until `done` accepts the state.
    ///
    /// `QUENCH` fails immediately. Gives up with a timeout error after the
    /// ramp timeout.
    async fn wait_for<F>(&self, operation: &str, done: F) -> Result<MagnetState>
    where
        F: Fn(MagnetState) -> bool,
    {
        let deadline = Instant::now() + self.ramp_timeout;
        loop {
            let state = self.status().await?;
            trace!(%state, operation, "AMI430 poll");
            if state == MagnetState::Quench {
                warn!(operation, "Magnet quench detected");
                return Err(anyhow!(SweepError::Quench(operation.to_string())));
            }
            if done(state) {
                return Ok(state);
            }
            if Instant::now() >= deadline {
                return Err(anyhow!(SweepError::timeout(
                    format!("{} {} (last state {})", self.link.name(), operation, state),
                    self.ramp_timeout
                )));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[async_trait]
impl<L: InstrumentLink> CurrentSource for Ami430<L> {
    async fn ramp_to_current(&self, current: f64, rate: f64) -> Result<()> {
        self.enable_persistent_switch().await?;
        self.wait_for("heating persistent switch", |s| {
            s != MagnetState::HeatingPersistentSwitch
        })
        .await?;

        self.set_target_current(current).await?;
        self.set_ramp_rate_current(rate).await?;
        self.ramp().await?;
        info!(current, rate, "Ramping {}", self.link.name());

        self.wait_for("ramping", |s| s == MagnetState::Holding).await?;
        debug!(current, "Magnet holding");
        Ok(())
    }

    async fn ramp_to_zero(&self, rate: f64) -> Result<()> {
        self.enable_persistent_switch().await?;
        self.wait_for("heating persistent switch", |s| {
            s != MagnetState::HeatingPersistentSwitch
        })
        .await?;

        self.set_ramp_rate_current(rate).await?;
        self.zero().await?;
        info!(rate, "Zeroing {}", self.link.name());
        self.wait_for("zeroing current", |s| s == MagnetState::AtZeroCurrent)
            .await?;

        self.disable_persistent_switch().await?;
        debug!("{} at zero, persistent switch heater off", self.link.name());
        Ok(())
    }

    // The programmer output stays live; there is no separate output stage.
    async fn enable(&self) -> Result<()> {
        trace!("{} enable is a no-op", self.link.name());
        Ok(())
    }

    async fn disable(&self) -> Result<()> {
        trace!("{} disable is a no-op", self.link.name());
        Ok(())
    }
}
