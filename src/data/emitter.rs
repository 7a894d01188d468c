//! Where a running sweep sends its output.
//!
//! The controller emits one [`MeasurementRecord`] per point and a progress
//! percentage after each point, and polls [`Emitter::should_stop`] once per
//! motor pulse. Cancellation is cooperative: nothing interrupts a step or a
//! ramp that is already under way.

use crate::data::record::MeasurementRecord;
use crate::data::storage::ResultsFile;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Shared cooperative stop request.
///
/// Cloned into the Ctrl-C handler and every emitter of a queue run.
#[derive(Debug, Clone, Default)]
pub struct StopFlag {
    flag: Arc<AtomicBool>,
}

impl StopFlag {
    /// Flag with no stop requested.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the running sweep to stop at its next check.
    pub fn request_stop(&self) {
        if !self.flag.swap(true, Ordering::SeqCst) {
            warn!("Stop requested");
        }
    }

    /// Whether a stop has been requested since the last reset.
    pub fn is_stop_requested(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Clear a previous request.
    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Sink for sweep output.
#[async_trait]
pub trait Emitter: Send {
    /// Accept one measurement point
    async fn results(&mut self, record: &MeasurementRecord) -> Result<()>;

    /// Overall completion in percent, 0 to 100
    fn progress(&mut self, percent: f64);

    /// Whether the operator asked the sweep to stop
    fn should_stop(&self) -> bool;
}

/// Emitter backed by a results file.
///
/// Progress is published on a `watch` channel so a caller can follow the
/// sweep without owning the emitter.
pub struct ResultsEmitter {
    file: ResultsFile,
    progress: Arc<watch::Sender<f64>>,
    stop: StopFlag,
}

impl ResultsEmitter {
    /// Emitter writing to `file` and polling `stop`.
    pub fn new(file: ResultsFile, stop: StopFlag) -> Self {
        let (progress, _) = watch::channel(0.0);
        Self {
            file,
            progress: Arc::new(progress),
            stop,
        }
    }

    /// Publish progress on a channel shared across emitters.
    pub fn with_progress(mut self, progress: Arc<watch::Sender<f64>>) -> Self {
        self.progress = progress;
        self
    }

    /// Follow progress updates.
    pub fn subscribe(&self) -> watch::Receiver<f64> {
        self.progress.subscribe()
    }

    /// Flush and hand back the results file.
    pub fn finish(mut self) -> Result<ResultsFile> {
        self.file.flush()?;
        Ok(self.file)
    }
}

#[async_trait]
impl Emitter for ResultsEmitter {
    async fn results(&mut self, record: &MeasurementRecord) -> Result<()> {
        self.file.append(record)?;
        Ok(())
    }

    fn progress(&mut self, percent: f64) {
        debug!(percent, "Progress");
        self.progress.send_replace(percent);
    }

    fn should_stop(&self) -> bool {
        self.stop.is_stop_requested()
    }
}

/// Emitter that keeps everything in memory.
///
/// Used for dry runs and tests. With [`MemoryEmitter::stop_after`] it raises
/// its stop flag once the given number of records has arrived.
#[derive(Debug, Default)]
pub struct MemoryEmitter {
    records: Vec<MeasurementRecord>,
    progress: Vec<f64>,
    stop: StopFlag,
    stop_after: Option<usize>,
}

impl MemoryEmitter {
    /// Empty emitter with its own stop flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Share an existing stop flag.
    pub fn with_stop_flag(mut self, stop: StopFlag) -> Self {
        self.stop = stop;
        self
    }

    /// Request a stop as soon as `count` records have been emitted.
    pub fn stop_after(mut self, count: usize) -> Self {
        self.stop_after = Some(count);
        self
    }

    /// Every record in emission order.
    pub fn records(&self) -> &[MeasurementRecord] {
        &self.records
    }

    /// Every progress value in emission order.
    pub fn progress_updates(&self) -> &[f64] {
        &self.progress
    }

    /// The flag this emitter reports through `should_stop`.
    pub fn stop_flag(&self) -> &StopFlag {
        &self.stop
    }
}

#[async_trait]
impl Emitter for MemoryEmitter {
    async fn results(&mut self, record: &MeasurementRecord) -> Result<()> {
        self.records.push(*record);
        if self.stop_after.is_some_and(|n| self.records.len() >= n) {
            self.stop.request_stop();
        }
        Ok(())
    }

    fn progress(&mut self, percent: f64) {
        self.progress.push(percent);
    }

    fn should_stop(&self) -> bool {
        self.stop.is_stop_requested()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::storage::read_results;
    use crate::procedures::config::SweepParameters;

    fn record(angle: f64) -> MeasurementRecord {
        MeasurementRecord {
            angle_degrees: angle,
            current_amps: 0.5,
            field_tesla: 6.845,
            lockin1_x: 0.0,
            lockin1_y: 0.0,
            lockin2_x: 0.0,
            lockin2_y: 0.0,
        }
    }

    #[test]
    fn stop_flag_is_shared_between_clones() {
        let flag = StopFlag::new();
        let handler = flag.clone();
        assert!(!flag.is_stop_requested());
        handler.request_stop();
        assert!(flag.is_stop_requested());
        flag.reset();
        assert!(!handler.is_stop_requested());
    }

    #[tokio::test]
    async fn memory_emitter_stops_after_count() {
        let mut emitter = MemoryEmitter::new().stop_after(2);
        emitter.results(&record(0.0)).await.unwrap();
        assert!(!emitter.should_stop());
        emitter.results(&record(0.9)).await.unwrap();
        assert!(emitter.should_stop());
        assert_eq!(emitter.records().len(), 2);
    }

    #[tokio::test]
    async fn results_emitter_writes_rows_and_publishes_progress() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        let file = ResultsFile::create(&path, "test", &SweepParameters::default()).unwrap();
        let stop = StopFlag::new();
        let mut emitter = ResultsEmitter::new(file, stop.clone());
        let progress = emitter.subscribe();

        emitter.results(&record(0.0)).await.unwrap();
        emitter.progress(12.5);
        assert_eq!(*progress.borrow(), 12.5);

        let shared = Arc::new(watch::channel(0.0).0);
        let mut emitter = emitter.with_progress(shared.clone());
        let follower = shared.subscribe();
        emitter.progress(40.0);
        assert_eq!(*follower.borrow(), 40.0);

        stop.request_stop();
        assert!(emitter.should_stop());

        let file = emitter.finish().unwrap();
        assert_eq!(file.rows(), 1);
        assert_eq!(read_results(&path).unwrap(), vec![record(0.0)]);
    }
}
