//! Results file writer.
//!
//! Layout of a results file:
//!
//! ```text
//! # Procedure: Second Harmonic Sweep
//! # Started: 2026-03-02T14:05:11.201+01:00
//! # Parameters:
//! # {
//! #   "target_current": 1.0,
//! #   ...
//! # }
//! Angle (deg),Magnet Current (A),Magnetic Field (T),Lock-In 1 X (V),...
//! 0.0,1.0,13.69,1e-6,...
//! ```
//!
//! Every row is flushed as soon as it is written so an aborted sweep leaves a
//! readable file behind.
use crate::data::record::{MeasurementRecord, DATA_COLUMNS};
use crate::error::SweepError;
use crate::procedures::config::SweepParameters;
use chrono::{DateTime, Local};
use std::collections::HashSet;
use std::fmt::Write as _;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// CSV results sink with a commented parameter header.
pub struct ResultsFile {
    path: PathBuf,
    writer: csv::Writer<File>,
    rows: usize,
}

impl ResultsFile {
    /// Create `path` (and its parent directories) and write the header.
    pub fn create(
        path: impl AsRef<Path>,
        procedure: &str,
        parameters: &SweepParameters,
    ) -> Result<Self, SweepError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = File::create(&path)?;
        writeln!(file, "# Procedure: {}", procedure)?;
        writeln!(file, "# Started: {}", Local::now().to_rfc3339())?;
        writeln!(file, "# Parameters:")?;
        let json = serde_json::to_string_pretty(parameters)
            .map_err(|e| SweepError::Configuration(e.to_string()))?;
        for line in json.lines() {
            writeln!(file, "# {}", line)?;
        }

        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        writer.write_record(DATA_COLUMNS)?;
        writer.flush()?;

        info!("Results file created at '{}'", path.display());
        Ok(Self {
            path,
            writer,
            rows: 0,
        })
    }

    /// Append one row and flush it to disk.
    pub fn append(&mut self, record: &MeasurementRecord) -> Result<(), SweepError> {
        self.writer.serialize(record)?;
        self.writer.flush()?;
        self.rows += 1;
        Ok(())
    }

    /// Flush buffered output.
    pub fn flush(&mut self) -> Result<(), SweepError> {
        self.writer.flush()?;
        debug!(rows = self.rows, "Results file flushed");
        Ok(())
    }

    /// Location on disk.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Data rows written so far.
    pub fn rows(&self) -> usize {
        self.rows
    }
}

/// Read the data rows of a results file, skipping the comment header.
pub fn read_results(path: impl AsRef<Path>) -> Result<Vec<MeasurementRecord>, SweepError> {
    let mut reader = csv::ReaderBuilder::new()
        .comment(Some(b'#'))
        .from_path(path)?;
    let mut records = Vec::new();
    for row in reader.deserialize() {
        records.push(row?);
    }
    Ok(records)
}

/// Next free results file name in `directory`.
///
/// Names are `<prefix><now formatted with datetime_format><i>.<ext>` with
/// `i` counting up from 1 past every existing file and every name in
/// `reserved`. The directory is created if missing.
pub fn unique_filename(
    directory: impl AsRef<Path>,
    prefix: &str,
    ext: &str,
    datetime_format: &str,
    reserved: &HashSet<PathBuf>,
) -> Result<PathBuf, SweepError> {
    let directory = directory.as_ref();
    std::fs::create_dir_all(directory)?;
    unique_filename_at(directory, prefix, ext, datetime_format, Local::now(), |p| {
        p.exists() || reserved.contains(p)
    })
}

fn unique_filename_at<F>(
    directory: &Path,
    prefix: &str,
    ext: &str,
    datetime_format: &str,
    now: DateTime<Local>,
    taken: F,
) -> Result<PathBuf, SweepError>
where
    F: Fn(&Path) -> bool,
{
    let mut basename = String::from(prefix);
    write!(basename, "{}", now.format(datetime_format)).map_err(|_| {
        SweepError::Configuration(format!("Invalid datetime format '{}'", datetime_format))
    })?;

    let mut index: u32 = 1;
    loop {
        let candidate = directory.join(format!("{}{}.{}", basename, index, ext));
        if !taken(&candidate) {
            return Ok(candidate);
        }
        index += 1;
    }
}
