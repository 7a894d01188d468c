//! Signal Recovery DSP 7265 lock-in amplifier driver
//!
//! Reference: Signal Recovery 7265 Instruction Manual, section 6 (computer
//! operation)
//!
//! Protocol Overview:
//! - Commands with a trailing `.` use floating point mode
//! - `X.` / `Y.`: in-phase / quadrature output in volts
//! - `DAC. n`: read auxiliary DAC n (1-4) in volts
//! - `DAC. n v`: set auxiliary DAC n to v volts (±12 V)
//!
//! # Example Usage
//!
//! ```rust,ignore
//! let lockin = Dsp7265::new(GpibInstrument::new(bus, 12, "DSP7265 #1"));
//! lockin.set_dac(3, 0.0).await?;
//! let (x, y) = lockin.xy().await?;
//! ```

use crate::error::SweepError;
use crate::hardware::adapter::InstrumentLink;
use crate::hardware::capabilities::{AnalogOutputs, LockInAmplifier};
use anyhow::{anyhow, Result};
use async_trait::async_trait;

/// Auxiliary DAC output range (V)
pub const DAC_LIMIT: f64 = 12.0;

/// Driver for the DSP 7265 lock-in amplifier
pub struct Dsp7265<L> {
    link: L,
}

impl<L: InstrumentLink> Dsp7265<L> {
    /// Wrap an instrument link.
    pub fn new(link: L) -> Self {
        Self { link }
    }

    /// Underlying link.
    pub fn link(&self) -> &L {
        &self.link
    }

    fn check_channel(channel: u8) -> Result<()> {
        if !(1..=4).contains(&channel) {
            return Err(anyhow!(SweepError::Instrument(format!(
                "DSP7265 has DACs 1-4, got {}",
                channel
            ))));
        }
        Ok(())
    }
}

#[async_trait]
impl<L: InstrumentLink> LockInAmplifier for Dsp7265<L> {
    async fn x(&self) -> Result<f64> {
        self.link.ask_f64("X.").await
    }

    async fn y(&self) -> Result<f64> {
        self.link.ask_f64("Y.").await
    }
}

#[async_trait]
impl<L: InstrumentLink> AnalogOutputs for Dsp7265<L> {
    async fn dac(&self, channel: u8) -> Result<f64> {
        Self::check_channel(channel)?;
        self.link.ask_f64(&format!("DAC. {}", channel)).await
    }

    async fn set_dac(&self, channel: u8, volts: f64) -> Result<()> {
        Self::check_channel(channel)?;
        if !(-DAC_LIMIT..=DAC_LIMIT).contains(&volts) {
            return Err(anyhow!(SweepError::Instrument(format!(
                "DAC {} level {} V outside ±{} V",
                channel, volts, DAC_LIMIT
            ))));
        }
        self.link.write(&format!("DAC. {} {}", channel, volts)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::ScriptedLink;

    #[tokio::test]
    async fn reads_both_components() {
        let link = ScriptedLink::new("lock-in")
            .with_reply("X.", "1.0E-06")
            .with_reply("Y.", "-2.5E-07");
        let lockin = Dsp7265::new(link);

        assert_eq!(lockin.xy().await.unwrap(), (1.0e-6, -2.5e-7));
        assert_eq!(lockin.link().log(), vec!["? X.", "? Y."]);
    }

    #[tokio::test]
    async fn dac_commands() {
        let link = ScriptedLink::new("lock-in").with_reply("DAC. 3", "5.000");
        let lockin = Dsp7265::new(link);

        lockin.set_dac(4, 0.0).await.unwrap();
        lockin.set_dac(3, 5.0).await.unwrap();
        assert_eq!(lockin.dac(3).await.unwrap(), 5.0);
        assert_eq!(
            lockin.link().log(),
            vec!["! DAC. 4 0", "! DAC. 3 5", "? DAC. 3"]
        );
    }

    #[tokio::test]
    async fn rejects_unknown_channel_and_range() {
        let lockin = Dsp7265::new(ScriptedLink::new("lock-in"));
        assert!(lockin.set_dac(5, 1.0).await.is_err());
        assert!(lockin.dac(0).await.is_err());
        assert!(lockin.set_dac(3, 20.0).await.is_err());
        assert!(lockin.link().log().is_empty());
    }

    #[tokio::test]
    async fn unparsable_reply_is_an_error() {
        let link = ScriptedLink::new("lock-in").with_reply("X.", "?");
        let lockin = Dsp7265::new(link);
        assert!(lockin.x().await.is_err());
    }
}
