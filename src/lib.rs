//! # Second Harmonic Sweep Library
//!
//! Automates a second-harmonic versus rotation angle measurement: a magnet
//! current source is ramped to a fixed current while a stepper motor rotates
//! the sample, and both lock-in amplifiers are read at every step.
//!
//! ## Crate Structure
//!
//! - **`config`**: Figment-based configuration (TOML file plus environment).
//! - **`data`**: Measurement records, the CSV results file and the `Emitter`
//!   the sweep writes to, including the cooperative `StopFlag`.
//! - **`error`**: The `SweepError` enum for failure kinds across the crate.
//! - **`hardware`**: Capability traits, the bit-banged stepper, the GPIB
//!   transport, instrument drivers and mock instruments.
//! - **`logging`**: `tracing-subscriber` initialization.
//! - **`procedures`**: The procedure lifecycle and the sweep controller.
//! - **`queue`**: One job per magnet current, run strictly in sequence.

pub mod config;
pub mod data;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod procedures;
pub mod queue;
