//! Text command link to one addressed instrument.

use crate::error::SweepError;
use anyhow::Result;
use async_trait::async_trait;

/// Query/write access to a single instrument.
///
/// Drivers are written against this trait so the same driver runs over the
/// GPIB controller or over a scripted link in tests.
#[async_trait]
pub trait InstrumentLink: Send + Sync {
    /// Human readable name of the instrument, used in log lines and errors.
    fn name(&self) -> &str;

    /// Send a command that produces no reply.
    async fn write(&self, command: &str) -> Result<()>;

    /// Send a query and return the trimmed reply.
    async fn ask(&self, query: &str) -> Result<String>;

    /// Send a query and parse the reply as a float.
    async fn ask_f64(&self, query: &str) -> Result<f64> {
        let reply = self.ask(query).await?;
        Ok(parse_f64(query, &reply)?)
    }
}

/// Parse a numeric reply, accepting the `+.75E-9` style many instruments use.
pub fn parse_f64(query: &str, reply: &str) -> Result<f64, SweepError> {
    let trimmed = reply.trim();
    trimmed
        .parse::<f64>()
        .map_err(|_| SweepError::parse(query, trimmed))
}

/// Parse an integer status reply. Some firmware sends `2.0` for `2`.
pub fn parse_u8(query: &str, reply: &str) -> Result<u8, SweepError> {
    let trimmed = reply.trim();
    if let Ok(value) = trimmed.parse::<u8>() {
        return Ok(value);
    }
    match trimmed.parse::<f64>() {
        Ok(v) if v.fract() == 0.0 && (0.0..=255.0).contains(&v) => Ok(v as u8),
        _ => Err(SweepError::parse(query, trimmed)),
    }
}
