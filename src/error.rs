//! Custom error types for the application.
//!
//! `SweepError` collects the concrete failure kinds that can occur while a
//! sweep job runs, from configuration loading through GPIB communication to
//! writing the results file. The capability traits in
//! [`crate::hardware::capabilities`] return `anyhow::Result`; drivers create a
//! `SweepError` for the specific failure and let `?` lift it into `anyhow`.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: figment could not read or deserialize the configuration.
//! - **`Configuration`**: the configuration parsed but a value is invalid.
//! - **`Io`** / **`Csv`**: results file and serial port I/O.
//! - **`Instrument`**: an instrument replied with an error or refused a command.
//! - **`Parse`**: a reply could not be parsed into the expected type.
//! - **`Timeout`**: a bounded wait (read, ramp, poll) ran out of time.
//! - **`Quench`**: the magnet supply reported a quench while ramping.
//! - **`ShutdownFailed`**: one or more shutdown steps failed; all were attempted.

use std::time::Duration;
use thiserror::Error;

/// Failures of a sweep, named after where they arise.
#[allow(missing_docs)]
#[derive(Error, Debug)]
pub enum SweepError {
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Results file error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Instrument error: {0}")]
    Instrument(String),

    #[error("Could not parse reply {response:?} to '{command}'")]
    Parse { command: String, response: String },

    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("Magnet quench detected while {0}")]
    Quench(String),

    #[error("Instruments not connected; startup has not run")]
    NotConnected,

    #[error("Invalid sweep parameter: {0}")]
    InvalidParameter(String),

    #[error("Shutdown failed: {}", .0.join("; "))]
    ShutdownFailed(Vec<String>),
}

impl From<figment::Error> for SweepError {
    fn from(value: figment::Error) -> Self {
        SweepError::Config(Box::new(value))
    }
}

impl SweepError {
    /// Build a timeout error for `operation`.
    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        SweepError::Timeout {
            operation: operation.into(),
            after,
        }
    }

    /// Build a parse error for the reply to `command`.
    pub fn parse(command: impl Into<String>, response: impl Into<String>) -> Self {
        SweepError::Parse {
            command: command.into(),
            response: response.into(),
        }
    }
}
