//! Atomic Hardware Capabilities
//!
//! The sweep controller never talks to a concrete instrument class. It sees
//! the rig through small capability traits:
//!
//! - A lock-in amplifier implements `LockInAmplifier`, and the one that drives
//!   the stepper also implements `AnalogOutputs` for its auxiliary DACs.
//! - A magnet supply implements `CurrentSource`.
//! - A `RigConnector` opens the connections and hands back a [`Rig`].
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Uses anyhow::Result for errors
//! - Focuses on ONE thing
//!
//! # Example
//!
//! ```rust,ignore
//! async fn snapshot<L>(lockin: &L) -> Result<(f64, f64)>
//! where
//!     L: LockInAmplifier + AnalogOutputs,
//! {
//!     lockin.set_dac(3, 0.0).await?;
//!     lockin.xy().await
//! }
//! ```

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// Capability: Auxiliary analog outputs
///
/// Numbered DAC outputs whose level can be written and read back. The stepper
/// driver uses two of them as digital control lines.
///
/// # Contract
/// - Channels are numbered as on the instrument front panel
/// - `dac` returns the level the instrument reports, not a cached value
#[async_trait]
pub trait AnalogOutputs: Send + Sync {
    /// Read back the output level of `channel` in volts
    async fn dac(&self, channel: u8) -> Result<f64>;

    /// Set the output level of `channel` in volts
    async fn set_dac(&self, channel: u8, volts: f64) -> Result<()>;
}

/// Capability: Two-axis lock-in readout
///
/// # Contract
/// - X is the in-phase and Y the quadrature component, both in volts
/// - Each call performs a fresh read
#[async_trait]
pub trait LockInAmplifier: Send + Sync {
    /// Read the in-phase component
    async fn x(&self) -> Result<f64>;

    /// Read the quadrature component
    async fn y(&self) -> Result<f64>;

    /// Read both components, X first
    ///
    /// # Default Implementation
    /// Two sequential reads.
    async fn xy(&self) -> Result<(f64, f64)> {
        let x = self.x().await?;
        let y = self.y().await?;
        Ok((x, y))
    }
}

/// Capability: Rate-limited current source
///
/// Magnet power supplies that ramp their output rather than jump to it.
///
/// # Contract
/// - `ramp_to_current` returns once the output has reached `current`
/// - `rate` is in A/s and must be positive
/// - `enable`/`disable` switch the output stage without touching the setpoint
#[async_trait]
pub trait CurrentSource: Send + Sync {
    /// Ramp the output to `current` amps at `rate` A/s
    async fn ramp_to_current(&self, current: f64, rate: f64) -> Result<()>;

    /// Ramp the output down to zero at `rate` A/s
    ///
    /// # Default Implementation
    /// `ramp_to_current(0.0, rate)`.
    async fn ramp_to_zero(&self, rate: f64) -> Result<()> {
        self.ramp_to_current(0.0, rate).await
    }

    /// Switch the output on
    async fn enable(&self) -> Result<()>;

    /// Switch the output off
    async fn disable(&self) -> Result<()>;
}

/// Combined trait for the lock-in whose DACs drive the stepper
///
/// Exists to enable trait objects; implement the two traits and get this
/// through the blanket impl.
pub trait LockInWithOutputs: LockInAmplifier + AnalogOutputs {}

/// Blanket implementation - any type implementing both traits gets LockInWithOutputs
impl<T: LockInAmplifier + AnalogOutputs> LockInWithOutputs for T {}

/// The instruments of one rotation setup, exclusively owned by the running sweep.
#[derive(Clone)]
pub struct Rig {
    /// Lock-in 1; its DACs drive the stepper step and direction lines
    pub lockin1: Arc<dyn LockInWithOutputs>,
    /// Lock-in 2, read only
    pub lockin2: Arc<dyn LockInAmplifier>,
    /// Magnet current source
    pub source: Arc<dyn CurrentSource>,
}

/// Establishes instrument connections.
///
/// Called once per job from the procedure's startup. Failures propagate; no
/// retry is attempted.
#[async_trait]
pub trait RigConnector: Send + Sync {
    /// Open every instrument of the rig
    async fn connect(&self) -> Result<Rig>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FixedLockIn {
        dacs: Mutex<[f64; 4]>,
    }

    #[async_trait]
    impl LockInAmplifier for FixedLockIn {
        async fn x(&self) -> Result<f64> {
            Ok(1.5e-6)
        }

        async fn y(&self) -> Result<f64> {
            Ok(-0.5e-6)
        }
    }

    #[async_trait]
    impl AnalogOutputs for FixedLockIn {
        async fn dac(&self, channel: u8) -> Result<f64> {
            Ok(self.dacs.lock().unwrap()[channel as usize - 1])
        }

        async fn set_dac(&self, channel: u8, volts: f64) -> Result<()> {
            self.dacs.lock().unwrap()[channel as usize - 1] = volts;
            Ok(())
        }
    }

    struct RecordingSource {
        calls: Mutex<Vec<f64>>,
    }

    #[async_trait]
    impl CurrentSource for RecordingSource {
        async fn ramp_to_current(&self, current: f64, _rate: f64) -> Result<()> {
            self.calls.lock().unwrap().push(current);
            Ok(())
        }

        async fn enable(&self) -> Result<()> {
            Ok(())
        }

        async fn disable(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn default_xy_reads_both_axes() {
        let lockin = FixedLockIn {
            dacs: Mutex::new([0.0; 4]),
        };
        assert_eq!(lockin.xy().await.unwrap(), (1.5e-6, -0.5e-6));
    }

    #[tokio::test]
    async fn default_ramp_to_zero_targets_zero() {
        let source = RecordingSource {
            calls: Mutex::new(Vec::new()),
        };
        source.ramp_to_current(2.0, 0.1).await.unwrap();
        source.ramp_to_zero(0.1).await.unwrap();
        assert_eq!(*source.calls.lock().unwrap(), vec![2.0, 0.0]);
    }

    #[tokio::test]
    async fn lockin_with_outputs_as_trait_object() {
        let lockin: Arc<dyn LockInWithOutputs> = Arc::new(FixedLockIn {
            dacs: Mutex::new([0.0; 4]),
        });
        lockin.set_dac(3, 5.0).await.unwrap();
        assert_eq!(lockin.dac(3).await.unwrap(), 5.0);
        assert_eq!(lockin.x().await.unwrap(), 1.5e-6);
    }
}
