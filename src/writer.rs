//! Append-only CSV time series, one file per UTC day or a single fixed file.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::aggregator::PersistenceStatus;
use crate::models::Sample;

pub const DEFAULT_PREFIX: &str = "sr_trend";
pub const DEFAULT_DEGRADED_AFTER: u32 = 5;
const MAX_BACKLOG: usize = 4096;

#[derive(Debug, Error)]
pub enum LogError {
    #[error("log file I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("CSV encoding failed for {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

/// Where samples go on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LogOutput {
    /// Explicit path; rotation disabled.
    Fixed { path: PathBuf },
    /// `<dir>/<prefix>_<YYYY-MM-DD>[_<suffix>].csv`, selected by the sample's UTC date.
    Rotating {
        #[serde(default = "default_dir")]
        dir: PathBuf,
        #[serde(default = "default_prefix")]
        prefix: String,
        #[serde(default)]
        suffix: Option<String>,
    },
}

fn default_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_prefix() -> String {
    DEFAULT_PREFIX.to_string()
}

impl Default for LogOutput {
    fn default() -> Self {
        LogOutput::Rotating { dir: default_dir(), prefix: default_prefix(), suffix: None }
    }
}

impl LogOutput {
    /// File for a sample dated `date`. Pure: depends only on the date and configuration.
    pub fn path_for(&self, date: NaiveDate) -> PathBuf {
        match self {
            LogOutput::Fixed { path } => path.clone(),
            LogOutput::Rotating { dir, prefix, suffix } => {
                dir.join(rotating_file_name(prefix, date, suffix.as_deref()))
            }
        }
    }

    fn rotation_key(&self, sample: &Sample) -> Option<NaiveDate> {
        match self {
            LogOutput::Fixed { .. } => None,
            LogOutput::Rotating { .. } => Some(sample.timestamp.date_naive()),
        }
    }
}

pub fn rotating_file_name(prefix: &str, date: NaiveDate, suffix: Option<&str>) -> String {
    match suffix {
        Some(suffix) if !suffix.is_empty() => format!("{}_{}_{}.csv", prefix, date.format("%Y-%m-%d"), suffix),
        _ => format!("{}_{}.csv", prefix, date.format("%Y-%m-%d")),
    }
}

struct OpenLog {
    date: Option<NaiveDate>,
    path: PathBuf,
    file: File,
    /// Bytes known to be complete records; a failed write is cut back to this.
    len: u64,
}

impl OpenLog {
    fn open(path: PathBuf, date: Option<NaiveDate>) -> Result<Self, LogError> {
        let io_err = |source| LogError::Io { path: path.clone(), source };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path).map_err(io_err)?;
        let len = file.metadata().map_err(io_err)?.len();

        debug!(path = %path.display(), new_file = len == 0, "opened log file");
        Ok(Self { date, path, file, len })
    }

    /// Writes one fully encoded record. The header goes out with the first
    /// record of an empty file.
    fn write_record(&mut self, sample: &Sample, fsync: bool) -> Result<(), LogError> {
        let mut encoder = csv::WriterBuilder::new().has_headers(self.len == 0).from_writer(Vec::new());
        encoder
            .serialize(sample)
            .map_err(|source| LogError::Csv { path: self.path.clone(), source })?;
        let bytes = encoder
            .into_inner()
            .map_err(|e| LogError::Io { path: self.path.clone(), source: e.into_error() })?;

        if let Err(source) = self.file.write_all(&bytes) {
            // Drop any partial line so the retry does not follow a torn fragment.
            let _ = self.file.set_len(self.len);
            return Err(LogError::Io { path: self.path.clone(), source });
        }
        self.len += bytes.len() as u64;

        if fsync {
            self.file
                .sync_data()
                .map_err(|source| LogError::Io { path: self.path.clone(), source })?;
        }
        Ok(())
    }
}

/// Single owner of the active log file handle.
///
/// Samples that could not be written are held in a bounded backlog and written
/// ahead of new samples on the next attempt, preserving arrival order.
pub struct LogWriter {
    output: LogOutput,
    fsync: bool,
    degraded_after: u32,
    current: Option<OpenLog>,
    backlog: VecDeque<Sample>,
    backlog_limit: usize,
    consecutive_failures: u32,
    last_error: Option<String>,
    dropped: u64,
}

impl LogWriter {
    pub fn new(output: LogOutput) -> Self {
        Self {
            output,
            fsync: false,
            degraded_after: DEFAULT_DEGRADED_AFTER,
            current: None,
            backlog: VecDeque::new(),
            backlog_limit: MAX_BACKLOG,
            consecutive_failures: 0,
            last_error: None,
            dropped: 0,
        }
    }

    pub fn with_fsync(mut self, fsync: bool) -> Self {
        self.fsync = fsync;
        self
    }

    pub fn with_degraded_after(mut self, failures: u32) -> Self {
        self.degraded_after = failures.max(1);
        self
    }

    pub fn with_backlog_limit(mut self, limit: usize) -> Self {
        self.backlog_limit = limit.max(1);
        self
    }

    /// Path of the file currently held open, if any.
    pub fn current_path(&self) -> Option<&Path> {
        self.current.as_ref().map(|log| log.path.as_path())
    }

    pub fn is_degraded(&self) -> bool {
        self.consecutive_failures >= self.degraded_after
    }

    /// Samples waiting for a successful write.
    pub fn pending(&self) -> usize {
        self.backlog.len()
    }

    pub fn status(&self) -> PersistenceStatus {
        PersistenceStatus {
            last_error: self.last_error.clone(),
            consecutive_failures: self.consecutive_failures,
            degraded: self.is_degraded(),
            dropped: self.dropped,
        }
    }

    /// Appends one record to the file for the sample's UTC date before
    /// returning. On failure the sample stays queued for the next call.
    pub fn append(&mut self, sample: Sample) -> Result<(), LogError> {
        self.backlog.push_back(sample);
        if let Err(e) = self.write_backlog() {
            self.record_failure(&e);
            return Err(e);
        }

        if self.consecutive_failures > 0 {
            if self.is_degraded() {
                info!(failures = self.consecutive_failures, "Log writer recovered, leaving degraded mode");
            }
            self.consecutive_failures = 0;
            self.last_error = None;
        }
        Ok(())
    }

    /// Makes a last attempt at the backlog, then releases the file. Samples
    /// that still cannot be written are counted as dropped.
    pub fn close(&mut self) -> Result<(), LogError> {
        if !self.backlog.is_empty() {
            let pending = self.backlog.len();
            if let Err(e) = self.write_backlog() {
                let lost = self.backlog.len();
                self.dropped += lost as u64;
                self.backlog.clear();
                self.current = None;
                error!(lost, error = %e, "Log writer closing with unwritten samples");
                return Err(e);
            }
            info!(written = pending, "Pending samples written at close");
            self.consecutive_failures = 0;
            self.last_error = None;
        }
        self.release()
    }

    fn release(&mut self) -> Result<(), LogError> {
        if let Some(mut log) = self.current.take() {
            log.file
                .flush()
                .map_err(|source| LogError::Io { path: log.path.clone(), source })?;
        }
        Ok(())
    }

    fn write_backlog(&mut self) -> Result<(), LogError> {
        while let Some(next) = self.backlog.front() {
            let next = next.clone();
            self.write_one(&next)?;
            self.backlog.pop_front();
        }
        Ok(())
    }

    fn write_one(&mut self, sample: &Sample) -> Result<(), LogError> {
        let date = self.output.rotation_key(sample);

        if self.current.as_ref().is_some_and(|log| log.date != date) {
            if let Some(old) = self.current.as_ref() {
                info!(from = %old.path.display(), "UTC date changed, rotating log file");
            }
            self.release()?;
        }

        let log = match self.current.take() {
            Some(log) => log,
            None => {
                let path = match date {
                    Some(date) => self.output.path_for(date),
                    None => self.output.path_for(sample.timestamp.date_naive()),
                };
                OpenLog::open(path, date)?
            }
        };
        let log = self.current.insert(log);
        log.write_record(sample, self.fsync)
    }

    fn record_failure(&mut self, e: &LogError) {
        // Reopen on the next attempt.
        self.current = None;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_error = Some(e.to_string());

        let overflow = self.backlog.len().saturating_sub(self.backlog_limit);
        if overflow > 0 {
            self.backlog.drain(..overflow);
            self.dropped += overflow as u64;
            warn!(dropped = overflow, total_dropped = self.dropped, "Log backlog full, oldest samples discarded");
        }

        if self.consecutive_failures == self.degraded_after {
            error!(
                failures = self.consecutive_failures,
                backlog = self.backlog.len(),
                error = %e,
                "Log writer entering degraded mode"
            );
        } else {
            warn!(failures = self.consecutive_failures, backlog = self.backlog.len(), error = %e, "Log append failed, will retry");
        }
    }
}

impl Drop for LogWriter {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "Failed to flush log file on shutdown");
        }
    }
}
