//! Instrument Drivers and Hardware Capabilities
//!
//! - `capabilities`: the traits the sweep controller is written against
//! - `stepper`: the two-line stepper protocol and step counter
//! - `adapter` / `gpib`: text command links over a Prologix GPIB controller
//! - `dsp7265`, `sm7045d`, `ami430`: instrument drivers
//! - `rig`: builds a [`capabilities::Rig`] from the instrument configuration
//! - `mock`: simulated instruments

pub mod adapter;
pub mod ami430;
pub mod capabilities;
pub mod dsp7265;
pub mod gpib;
pub mod mock;
pub mod rig;
pub mod sm7045d;
pub mod stepper;

pub use capabilities::{
    AnalogOutputs, CurrentSource, LockInAmplifier, LockInWithOutputs, Rig, RigConnector,
};
pub use rig::GpibRig;
pub use stepper::{Direction, StepperLines, StepperMotor};
