//! Configuration System using Figment
//!
//! Configuration is layered, later sources overriding earlier ones:
//! 1. Built-in defaults (the lab's standard wiring and sweep parameters)
//! 2. A TOML file, `config/second_harmonic.toml` unless given on the command line
//! 3. Environment variables prefixed with `SECOND_HARMONIC_`, nested keys
//!    separated by a double underscore
//!
//! # Example
//! ```no_run
//! use second_harmonic::config::SweepConfig;
//!
//! let config = SweepConfig::load()?;
//! config.validate()?;
//! println!("Lock-in 1 at GPIB {}", config.instruments.lockin1_address);
//! # Ok::<(), second_harmonic::error::SweepError>(())
//! ```
//!
//! Environment example: `SECOND_HARMONIC_SWEEP__DELAY_SECONDS=0.5`

use crate::error::SweepError;
use crate::hardware::stepper::StepperLines;
use crate::procedures::config::{SweepParameters, SweepTiming};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "config/second_harmonic.toml";

/// Environment variable prefix
pub const ENV_PREFIX: &str = "SECOND_HARMONIC_";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// GPIB controller and instrument addresses
    pub instruments: InstrumentsConfig,
    /// Stepper line wiring on lock-in 1
    pub motor: StepperLines,
    /// Default sweep parameters
    pub sweep: SweepParameters,
    /// Settle durations of the rotation stage
    pub timing: SweepTiming,
    /// Where results files go
    pub storage: StorageConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    pub log_format: String,
    /// Log span open and close events
    pub log_span_events: bool,
    /// Include source file and line in log lines
    pub log_file_and_line: bool,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            log_span_events: false,
            log_file_and_line: false,
        }
    }
}

/// Which magnet supply drives the coil
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Delta Elektronika SM 70-45 D
    Sm7045d,
    /// American Magnetics 430 programmer
    Ami430,
}

/// GPIB controller and instruments
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentsConfig {
    /// Serial device of the GPIB controller
    pub port: String,
    /// Serial baud rate
    pub baud_rate: u32,
    /// Reply timeout per query (ms)
    pub timeout_ms: u64,
    /// GPIB address of lock-in 1 (drives the stepper)
    pub lockin1_address: u8,
    /// GPIB address of lock-in 2
    pub lockin2_address: u8,
    /// Magnet supply
    pub source: SourceConfig,
}

impl Default for InstrumentsConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 115_200,
            timeout_ms: 1000,
            lockin1_address: 12,
            lockin2_address: 11,
            source: SourceConfig::default(),
        }
    }
}

impl InstrumentsConfig {
    /// Query timeout as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Magnet supply settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Supply model
    pub kind: SourceKind,
    /// GPIB address
    pub address: u8,
    /// SM7045D: setpoint update interval while ramping (ms)
    pub ramp_interval_ms: u64,
    /// SM7045D: voltage compliance written on enable (V)
    pub compliance_voltage: f64,
    /// AMI430: `STATE?` poll interval (ms)
    pub poll_interval_ms: u64,
    /// AMI430: longest wait for a ramp to settle (s)
    pub ramp_timeout_secs: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: SourceKind::Sm7045d,
            address: 8,
            ramp_interval_ms: 100,
            compliance_voltage: 70.0,
            poll_interval_ms: 1000,
            ramp_timeout_secs: 600,
        }
    }
}

/// Results file settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Output directory for results files
    pub output_dir: PathBuf,
    /// Sample name, used as the file name prefix
    pub sample: String,
    /// File extension
    pub extension: String,
    /// chrono format string placed between prefix and index (may be empty)
    pub datetime_format: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("data"),
            sample: "sample".to_string(),
            extension: "txt".to_string(),
            datetime_format: String::new(),
        }
    }
}

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
const LOG_FORMATS: [&str; 3] = ["pretty", "compact", "json"];

impl SweepConfig {
    /// Load from the default file location and the environment.
    ///
    /// A missing file is not an error; defaults apply.
    pub fn load() -> Result<Self, SweepError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, SweepError> {
        Ok(Self::figment(path.as_ref()).extract()?)
    }

    /// The provider stack, exposed for callers that merge extra layers.
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(SweepConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), SweepError> {
        let level = self.application.log_level.to_lowercase();
        if !LOG_LEVELS.contains(&level.as_str()) {
            return Err(SweepError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                LOG_LEVELS.join(", ")
            )));
        }
        let format = self.application.log_format.to_lowercase();
        if !LOG_FORMATS.contains(&format.as_str()) {
            return Err(SweepError::Configuration(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                LOG_FORMATS.join(", ")
            )));
        }

        let inst = &self.instruments;
        let addresses = [
            ("lockin1_address", inst.lockin1_address),
            ("lockin2_address", inst.lockin2_address),
            ("source.address", inst.source.address),
        ];
        for (name, address) in addresses {
            if address > 30 {
                return Err(SweepError::Configuration(format!(
                    "{} {} is not a GPIB primary address (0-30)",
                    name, address
                )));
            }
        }
        if inst.lockin1_address == inst.lockin2_address
            || inst.lockin1_address == inst.source.address
            || inst.lockin2_address == inst.source.address
        {
            return Err(SweepError::Configuration(
                "Instrument GPIB addresses must be distinct".to_string(),
            ));
        }
        if inst.timeout_ms == 0 {
            return Err(SweepError::Configuration(
                "instruments.timeout_ms must be positive".to_string(),
            ));
        }

        let lines = self.motor;
        for channel in [lines.step_channel, lines.direction_channel] {
            if !(1..=4).contains(&channel) {
                return Err(SweepError::Configuration(format!(
                    "Stepper line on DAC {}; the lock-in has DACs 1-4",
                    channel
                )));
            }
        }
        if lines.step_channel == lines.direction_channel {
            return Err(SweepError::Configuration(
                "Step and direction lines must use different DACs".to_string(),
            ));
        }

        self.sweep.validate()?;
        self.timing.validate()?;

        if self.storage.extension.is_empty() {
            return Err(SweepError::Configuration(
                "storage.extension must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Render as TOML, e.g. to write a starting configuration file.
    pub fn to_toml(&self) -> Result<String, SweepError> {
        toml::to_string_pretty(self).map_err(|e| SweepError::Configuration(e.to_string()))
    }
}
