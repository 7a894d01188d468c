//! Job queue: one sweep per magnet current.
//!
//! A [`SweepPlan`] covers a current range. [`JobQueue::enqueue_plan`] turns
//! it into one [`SweepJob`] per current, each with its own results file, and
//! [`JobQueue::run`] executes the jobs strictly one after another.
//!
//! A stop request ends the running job early and skips everything still
//! queued. A job that fails is logged and the queue moves on to the next.

use crate::config::{StorageConfig, SweepConfig};
use crate::data::emitter::{ResultsEmitter, StopFlag};
use crate::data::storage::{unique_filename, ResultsFile};
use crate::error::SweepError;
use crate::hardware::capabilities::RigConnector;
use crate::hardware::stepper::StepperLines;
use crate::procedures::config::{SweepParameters, SweepTiming};
use crate::procedures::second_harmonic::{SecondHarmonicSweep, PROCEDURE_NAME};
use crate::procedures::{run_procedure, ProcedureStatus};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Largest number of currents a single plan may expand to
pub const MAX_PLAN_JOBS: usize = 10_000;

/// Currents `min, min + step, …` as `numpy.arange(min, max + step, step)`
/// produces them.
///
/// The count is `ceil((max + step - min) / step)`, so floating point
/// rounding may add a value just above `max`, as it does in numpy. Ranges
/// longer than [`MAX_PLAN_JOBS`] are rejected.
pub fn current_steps(min: f64, max: f64, step: f64) -> Result<Vec<f64>, SweepError> {
    if !(step.is_finite() && step > 0.0) {
        return Err(SweepError::InvalidParameter(format!(
            "current step must be positive, got {}",
            step
        )));
    }
    if !(min.is_finite() && max.is_finite()) {
        return Err(SweepError::InvalidParameter(
            "current range must be finite".to_string(),
        ));
    }
    let count = ((max + step - min) / step).ceil().max(0.0);
    if !count.is_finite() || count > MAX_PLAN_JOBS as f64 {
        return Err(SweepError::InvalidParameter(format!(
            "current range {}..{} in steps of {} gives more than {} sweeps",
            min, max, step, MAX_PLAN_JOBS
        )));
    }
    let count = count as usize;
    Ok((0..count).map(|i| min + i as f64 * step).collect())
}

/// A range of sweeps sharing everything but the magnet current.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepPlan {
    /// First current (A)
    pub min_current: f64,
    /// Last current (A), inclusive
    pub max_current: f64,
    /// Current increment (A)
    pub current_step: f64,
    /// Per-sweep parameters; `target_current` is replaced per job
    pub sweep: SweepParameters,
    /// Directory for the results files
    pub output_dir: PathBuf,
    /// Sample name, used as the file name prefix
    pub sample: String,
}

impl SweepPlan {
    /// Single sweep at the configured current.
    pub fn from_config(config: &SweepConfig) -> Self {
        let current = config.sweep.target_current;
        Self {
            min_current: current,
            max_current: current,
            current_step: 1.0,
            sweep: config.sweep.clone(),
            output_dir: config.storage.output_dir.clone(),
            sample: config.storage.sample.clone(),
        }
    }

    /// Magnet currents of the plan's jobs.
    pub fn currents(&self) -> Result<Vec<f64>, SweepError> {
        current_steps(self.min_current, self.max_current, self.current_step)
    }

    /// Parameters of the job at `current`.
    pub fn parameters_for(&self, current: f64) -> SweepParameters {
        SweepParameters {
            target_current: current,
            ..self.sweep.clone()
        }
    }
}

/// One queued sweep: what to run and where its results go.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepJob {
    /// Sweep to run.
    pub parameters: SweepParameters,
    /// Results file to create.
    pub destination: PathBuf,
}

/// Outcome counts of a queue run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueReport {
    /// Jobs that ran to completion
    pub finished: usize,
    /// Jobs ended early by a stop request
    pub aborted: usize,
    /// Jobs that failed
    pub failed: usize,
    /// Jobs never started because of a stop request
    pub skipped: usize,
    /// Results files that were created, in run order
    pub files: Vec<PathBuf>,
}

/// Sequential runner for sweep jobs.
pub struct JobQueue {
    jobs: VecDeque<SweepJob>,
    connector: Arc<dyn RigConnector>,
    lines: StepperLines,
    timing: SweepTiming,
    naming: StorageConfig,
    stop: StopFlag,
    reserved: HashSet<PathBuf>,
    progress: Arc<watch::Sender<f64>>,
}

impl JobQueue {
    /// Empty queue running on `connector`.
    pub fn new(
        connector: Arc<dyn RigConnector>,
        lines: StepperLines,
        timing: SweepTiming,
        naming: StorageConfig,
        stop: StopFlag,
    ) -> Self {
        Self {
            jobs: VecDeque::new(),
            connector,
            lines,
            timing,
            naming,
            stop,
            reserved: HashSet::new(),
            progress: Arc::new(watch::channel(0.0).0),
        }
    }

    /// Queue built from the configuration's wiring, timing and naming.
    pub fn from_config(
        config: &SweepConfig,
        connector: Arc<dyn RigConnector>,
        stop: StopFlag,
    ) -> Self {
        Self::new(
            connector,
            config.motor,
            config.timing,
            config.storage.clone(),
            stop,
        )
    }

    /// Add one job per current of `plan`. Returns the number added.
    pub fn enqueue_plan(&mut self, plan: &SweepPlan) -> Result<usize, SweepError> {
        let currents = plan.currents()?;
        for &current in &currents {
            let parameters = plan.parameters_for(current);
            parameters.validate()?;
            let destination = unique_filename(
                &plan.output_dir,
                &plan.sample,
                &self.naming.extension,
                &self.naming.datetime_format,
                &self.reserved,
            )?;
            self.enqueue(SweepJob {
                parameters,
                destination,
            });
        }
        info!(jobs = currents.len(), sample = %plan.sample, "Queued sweep plan");
        Ok(currents.len())
    }

    /// Add a single job.
    pub fn enqueue(&mut self, job: SweepJob) {
        self.reserved.insert(job.destination.clone());
        self.jobs.push_back(job);
    }

    /// Follow the running job's progress in percent.
    pub fn subscribe_progress(&self) -> watch::Receiver<f64> {
        self.progress.subscribe()
    }

    /// Number of jobs still queued.
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// Whether no jobs are queued.
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Run every queued job in order.
    pub async fn run(&mut self) -> QueueReport {
        let mut report = QueueReport::default();
        let total = self.jobs.len();

        while let Some(job) = self.jobs.pop_front() {
            if self.stop.is_stop_requested() {
                report.skipped = 1 + self.jobs.len();
                self.jobs.clear();
                break;
            }

            let index = total - self.jobs.len();
            info!(
                job = index,
                of = total,
                current = job.parameters.target_current,
                file = %job.destination.display(),
                "Starting job"
            );

            match self.run_job(&job).await {
                Ok(ProcedureStatus::Finished) => {
                    report.finished += 1;
                    report.files.push(job.destination);
                }
                Ok(ProcedureStatus::Aborted) => {
                    report.aborted += 1;
                    report.files.push(job.destination);
                    report.skipped = self.jobs.len();
                    if !self.jobs.is_empty() {
                        warn!(skipped = report.skipped, "Stop requested; skipping queued jobs");
                    }
                    self.jobs.clear();
                    break;
                }
                Err(e) => {
                    error!(job = index, error = %format!("{:#}", e), "Job failed");
                    report.failed += 1;
                    if job.destination.exists() {
                        report.files.push(job.destination);
                    }
                }
            }
        }

        self.reserved.clear();
        info!(
            finished = report.finished,
            aborted = report.aborted,
            failed = report.failed,
            skipped = report.skipped,
            "Queue done"
        );
        report
    }

    async fn run_job(&self, job: &SweepJob) -> anyhow::Result<ProcedureStatus> {
        let file = ResultsFile::create(&job.destination, PROCEDURE_NAME, &job.parameters)?;
        let mut emitter =
            ResultsEmitter::new(file, self.stop.clone()).with_progress(self.progress.clone());
        let mut sweep = SecondHarmonicSweep::new(
            job.parameters.clone(),
            self.timing,
            self.connector.clone(),
            self.lines,
        );
        let status = run_procedure(&mut sweep, &mut emitter).await;
        let flushed = emitter.finish();
        let status = status?;
        flushed?;
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arange_includes_max() {
        let currents = current_steps(0.0, 1.0, 0.5).unwrap();
        assert_eq!(currents, vec![0.0, 0.5, 1.0]);
    }

    #[test]
    fn arange_single_value() {
        assert_eq!(current_steps(2.0, 2.0, 1.0).unwrap(), vec![2.0]);
    }

    #[test]
    fn arange_empty_when_max_below_min() {
        assert!(current_steps(2.0, 0.0, 0.5).unwrap().is_empty());
    }

    #[test]
    fn arange_follows_numpy_count() {
        // numpy.arange(0.1, 0.3 + 0.1, 0.1) has four elements
        let currents = current_steps(0.1, 0.3, 0.1).unwrap();
        assert_eq!(currents.len(), 4);
        assert!((currents[2] - 0.3).abs() < 1e-12);
    }

    #[test]
    fn arange_rejects_bad_step() {
        assert!(current_steps(0.0, 1.0, 0.0).is_err());
        assert!(current_steps(0.0, 1.0, -0.5).is_err());
    }

    #[test]
    fn arange_rejects_huge_ranges() {
        assert!(matches!(
            current_steps(0.0, 1.0, 1e-12),
            Err(SweepError::InvalidParameter(_))
        ));
        assert_eq!(current_steps(0.0, 9_999.0, 1.0).unwrap().len(), MAX_PLAN_JOBS);
        assert!(current_steps(0.0, 10_000.0, 1.0).is_err());
    }

    #[test]
    fn plan_replaces_only_the_current() {
        let plan = SweepPlan::from_config(&SweepConfig::default());
        let params = plan.parameters_for(2.5);
        assert_eq!(params.target_current, 2.5);
        assert_eq!(params.max_angle, plan.sweep.max_angle);
    }
}
