//! Measurement records, results files and the emitter the sweep writes to.
pub mod emitter;
pub mod record;
pub mod storage;

pub use emitter::{Emitter, MemoryEmitter, ResultsEmitter, StopFlag};
pub use record::{MeasurementRecord, DATA_COLUMNS};
pub use storage::{read_results, unique_filename, ResultsFile};
