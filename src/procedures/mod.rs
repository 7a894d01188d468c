//! Procedure Framework
//!
//! A procedure is a measurement script with a fixed lifecycle:
//!
//! ```text
//! startup() → execute(emitter) → shutdown()
//!                                   ↑
//!              always runs, also after an error or a stop request
//! ```
//!
//! [`run_procedure`] drives that lifecycle. It guarantees that `shutdown` is
//! called exactly once whenever `startup` was attempted, so the rig is left
//! with the magnet at zero and the stage at home regardless of how the sweep
//! ended.
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use second_harmonic::procedures::{run_procedure, SecondHarmonicSweep};
//!
//! let mut sweep = SecondHarmonicSweep::new(params, timing, Arc::new(rig), lines);
//! let mut emitter = MemoryEmitter::new();
//! let status = run_procedure(&mut sweep, &mut emitter).await?;
//! ```

pub mod config;
pub mod second_harmonic;

pub use config::{SweepParameters, SweepTiming};
pub use second_harmonic::{LoopExit, SecondHarmonicSweep};

use crate::data::emitter::Emitter;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

/// How a procedure run ended, when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcedureStatus {
    /// Ran to completion
    Finished,
    /// Ended early on a stop request
    Aborted,
}

/// The lifecycle every measurement procedure implements.
#[async_trait]
pub trait Procedure: Send {
    /// Name written to logs and the results header
    fn name(&self) -> &str;

    /// Connect and bring the hardware into its starting state
    async fn startup(&mut self) -> Result<()>;

    /// Run the measurement, sending records and progress to `emitter`
    ///
    /// Returns `Aborted` if the emitter's stop request ended the run.
    async fn execute(&mut self, emitter: &mut dyn Emitter) -> Result<ProcedureStatus>;

    /// Return the hardware to a safe state
    ///
    /// Called after every `startup` attempt, also when startup or execute
    /// failed. Implementations must tolerate partially initialized state.
    async fn shutdown(&mut self) -> Result<()>;
}

/// Run `procedure` through startup, execute and shutdown.
///
/// Shutdown always runs. If startup or execute failed, that error is
/// returned and a shutdown error is only logged; otherwise a shutdown error
/// is returned.
pub async fn run_procedure(
    procedure: &mut dyn Procedure,
    emitter: &mut dyn Emitter,
) -> Result<ProcedureStatus> {
    let name = procedure.name().to_string();
    info!(procedure = %name, "Starting procedure");

    let outcome = match procedure.startup().await {
        Ok(()) => procedure.execute(emitter).await,
        Err(e) => Err(e),
    };

    if let Err(e) = &outcome {
        error!(procedure = %name, error = %e, "Procedure failed");
    }

    info!(procedure = %name, "Shutting down");
    if let Err(shutdown_err) = procedure.shutdown().await {
        error!(procedure = %name, error = %shutdown_err, "Procedure shutdown failed");
        // An earlier failure is the more useful one to report
        if outcome.is_ok() {
            return Err(shutdown_err);
        }
    }

    match &outcome {
        Ok(ProcedureStatus::Finished) => info!(procedure = %name, "Procedure finished"),
        Ok(ProcedureStatus::Aborted) => warn!(procedure = %name, "Procedure aborted"),
        Err(_) => {}
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::emitter::MemoryEmitter;
    use anyhow::anyhow;

    #[derive(Default)]
    struct Scripted {
        fail_startup: bool,
        fail_execute: bool,
        fail_shutdown: bool,
        calls: Vec<&'static str>,
    }

    #[async_trait]
    impl Procedure for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn startup(&mut self) -> Result<()> {
            self.calls.push("startup");
            if self.fail_startup {
                return Err(anyhow!("startup failed"));
            }
            Ok(())
        }

        async fn execute(&mut self, emitter: &mut dyn Emitter) -> Result<ProcedureStatus> {
            self.calls.push("execute");
            if self.fail_execute {
                return Err(anyhow!("execute failed"));
            }
            if emitter.should_stop() {
                return Ok(ProcedureStatus::Aborted);
            }
            Ok(ProcedureStatus::Finished)
        }

        async fn shutdown(&mut self) -> Result<()> {
            self.calls.push("shutdown");
            if self.fail_shutdown {
                return Err(anyhow!("shutdown failed"));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn runs_full_lifecycle() {
        let mut procedure = Scripted::default();
        let status = run_procedure(&mut procedure, &mut MemoryEmitter::new())
            .await
            .unwrap();
        assert_eq!(status, ProcedureStatus::Finished);
        assert_eq!(procedure.calls, vec!["startup", "execute", "shutdown"]);
    }

    #[tokio::test]
    async fn shutdown_runs_after_startup_failure() {
        let mut procedure = Scripted {
            fail_startup: true,
            ..Default::default()
        };
        let err = run_procedure(&mut procedure, &mut MemoryEmitter::new())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "startup failed");
        assert_eq!(procedure.calls, vec!["startup", "shutdown"]);
    }

    #[tokio::test]
    async fn execute_error_wins_over_shutdown_error() {
        let mut procedure = Scripted {
            fail_execute: true,
            fail_shutdown: true,
            ..Default::default()
        };
        let err = run_procedure(&mut procedure, &mut MemoryEmitter::new())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "execute failed");
        assert_eq!(procedure.calls, vec!["startup", "execute", "shutdown"]);
    }

    #[tokio::test]
    async fn shutdown_error_reported_after_success() {
        let mut procedure = Scripted {
            fail_shutdown: true,
            ..Default::default()
        };
        let err = run_procedure(&mut procedure, &mut MemoryEmitter::new())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "shutdown failed");
    }

    #[tokio::test]
    async fn stop_request_is_not_an_error() {
        let mut procedure = Scripted::default();
        let mut emitter = MemoryEmitter::new();
        emitter.stop_flag().request_stop();
        let status = run_procedure(&mut procedure, &mut emitter).await.unwrap();
        assert_eq!(status, ProcedureStatus::Aborted);
    }
}
