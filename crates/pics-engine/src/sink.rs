//! Statistics and durable log sinks.
//!
//! The orchestrator reports every outcome and, once per batch, the batch
//! summary. Sinks are shared across workers and serialise their own writes
//! behind a mutex. A failing sink logs a warning and never fails the batch.

use std::borrow::Cow;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use pics_common::{BatchSummary, LogConfig, Outcome, Result, Status};

/// CSV header, in persisted column order.
pub const CSV_HEADER: &str = "timestamp,sourceFormat,targetFormat,originalPath,outputPath,originalSizeBytes,newSizeBytes,bytesSaved,savedRatio,status,reason";

/// Receives outcomes from the orchestrator.
pub trait StatsSink: Send + Sync {
    /// Called once per outcome, from the orchestrator task.
    fn record_outcome(&self, outcome: &Outcome);

    /// Called exactly once when a batch completes.
    fn record_batch(&self, _summary: &BatchSummary) {}
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl StatsSink for NullSink {
    fn record_outcome(&self, _outcome: &Outcome) {}
}

/// Forwards to several sinks in order.
#[derive(Clone)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn StatsSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn StatsSink>>) -> Self {
        Self { sinks }
    }
}

impl StatsSink for FanoutSink {
    fn record_outcome(&self, outcome: &Outcome) {
        for sink in &self.sinks {
            sink.record_outcome(outcome);
        }
    }

    fn record_batch(&self, summary: &BatchSummary) {
        for sink in &self.sinks {
            sink.record_batch(summary);
        }
    }
}

// ---------------------------------------------------------------------------
// CSV escaping
// ---------------------------------------------------------------------------

/// Quote `field` if it contains a comma, quote, or line break, doubling any
/// embedded quotes.
pub fn csv_escape(field: &str) -> Cow<'_, str> {
    if field.contains([',', '"', '\n', '\r']) {
        Cow::Owned(format!("\"{}\"", field.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(field)
    }
}

/// One CSV record for `outcome`, without the trailing newline.
pub fn csv_record(outcome: &Outcome, timestamp: &str) -> String {
    let original = outcome.original_path().to_string_lossy();
    let output = outcome
        .output_path()
        .map(|p| p.to_string_lossy())
        .unwrap_or_default();
    let fields: [Cow<'_, str>; 11] = [
        Cow::Borrowed(timestamp),
        Cow::Borrowed(outcome.source_format().as_str()),
        Cow::Borrowed(outcome.target_format().as_str()),
        original,
        output,
        Cow::Owned(outcome.original_size_bytes().to_string()),
        Cow::Owned(outcome.new_size_bytes().to_string()),
        Cow::Owned(outcome.bytes_saved().to_string()),
        Cow::Owned(format!("{:.4}", outcome.saved_ratio())),
        Cow::Borrowed(outcome.status().as_str()),
        Cow::Borrowed(outcome.reason()),
    ];
    fields
        .iter()
        .map(|f| csv_escape(f))
        .collect::<Vec<_>>()
        .join(",")
}

// ---------------------------------------------------------------------------
// CSV log
// ---------------------------------------------------------------------------

/// Append-only CSV log with size-based rotation.
///
/// `log.csv` rotates to `log.1.csv`, `log.1.csv` to `log.2.csv`, and so on;
/// the oldest file beyond `max_files` is deleted.
#[derive(Debug)]
pub struct CsvLogSink {
    path: PathBuf,
    max_size_bytes: u64,
    max_files: usize,
    state: Mutex<LogState>,
}

#[derive(Debug)]
struct LogState {
    file: File,
    size: u64,
}

impl CsvLogSink {
    /// Open (or create) the log at `config.path`.
    ///
    /// Returns `Ok(None)` when logging is disabled.
    pub fn from_config(config: &LogConfig) -> Result<Option<Self>> {
        match &config.path {
            Some(path) => Ok(Some(Self::open(
                path,
                config.max_size_bytes,
                config.max_files,
            )?)),
            None => Ok(None),
        }
    }

    pub fn open(path: impl Into<PathBuf>, max_size_bytes: u64, max_files: usize) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        ensure_header(&path)?;
        let (file, size) = open_append(&path)?;
        Ok(Self {
            path,
            max_size_bytes,
            max_files,
            state: Mutex::new(LogState { file, size }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, line: &str) -> Result<()> {
        let mut state = self.state.lock();
        if self.max_size_bytes > 0 && state.size >= self.max_size_bytes {
            self.rotate()?;
            let (file, size) = open_append(&self.path)?;
            *state = LogState { file, size };
        }
        state.file.write_all(line.as_bytes())?;
        state.file.write_all(b"\n")?;
        state.size += line.len() as u64 + 1;
        Ok(())
    }

    /// Shift `log.csv` → `log.1.csv` → … → `log.N.csv`. Called with the
    /// state lock held.
    fn rotate(&self) -> Result<()> {
        if self.max_files == 0 {
            fs::remove_file(&self.path)?;
            return Ok(());
        }
        let oldest = rotated_path(&self.path, self.max_files);
        if oldest.exists() {
            fs::remove_file(&oldest)?;
        }
        for i in (1..self.max_files).rev() {
            let from = rotated_path(&self.path, i);
            if from.exists() {
                fs::rename(&from, rotated_path(&self.path, i + 1))?;
            }
        }
        fs::rename(&self.path, rotated_path(&self.path, 1))?;
        tracing::info!(log = %self.path.display(), "rotated outcome log");
        Ok(())
    }
}

impl StatsSink for CsvLogSink {
    fn record_outcome(&self, outcome: &Outcome) {
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        if let Err(e) = self.append(&csv_record(outcome, &timestamp)) {
            tracing::warn!(log = %self.path.display(), "failed to append outcome: {e}");
        }
    }

    fn record_batch(&self, summary: &BatchSummary) {
        if let Err(e) = self.state.lock().file.flush() {
            tracing::warn!(log = %self.path.display(), "failed to flush log: {e}");
        }
        tracing::debug!(total = summary.total, "batch logged");
    }
}

/// `dir/log.csv` with index 2 becomes `dir/log.2.csv`.
fn rotated_path(path: &Path, index: usize) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{stem}.{index}.{}", ext.to_string_lossy()),
        None => format!("{stem}.{index}"),
    };
    path.with_file_name(name)
}

/// Open `path` for appending, writing the header if the file is new.
fn open_append(path: &Path) -> Result<(File, u64)> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut size = file.metadata()?.len();
    if size == 0 {
        writeln!(file, "{CSV_HEADER}")?;
        size = CSV_HEADER.len() as u64 + 1;
    }
    Ok((file, size))
}

/// Prepend the header to an existing log that lacks it.
fn ensure_header(path: &Path) -> Result<()> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    let mut first = String::new();
    BufReader::new(file).read_line(&mut first)?;
    if first.is_empty() || first.trim_end_matches(['\r', '\n']) == CSV_HEADER {
        return Ok(());
    }

    tracing::warn!(log = %path.display(), "outcome log has no header; prepending");
    let existing = fs::read(path)?;
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
    let mut temp = tempfile::NamedTempFile::new_in(dir)?;
    writeln!(temp, "{CSV_HEADER}")?;
    temp.write_all(&existing)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Lifetime statistics
// ---------------------------------------------------------------------------

/// Lifetime totals. All arithmetic saturates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StatsTotals {
    pub files_processed: u64,
    pub bytes_saved: u64,
    pub batches: u64,
}

/// In-memory lifetime statistics, optionally persisted as JSON after each
/// batch.
#[derive(Debug, Default)]
pub struct StatsStore {
    totals: Mutex<StatsTotals>,
    file: Option<PathBuf>,
}

impl StatsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load totals from `path` if it exists; save back there after every
    /// batch. An unreadable file starts from zero.
    pub fn with_file(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let totals = match fs::read_to_string(&path) {
            Ok(json) => serde_json::from_str(&json).unwrap_or_else(|e| {
                tracing::warn!(file = %path.display(), "ignoring unreadable stats: {e}");
                StatsTotals::default()
            }),
            Err(_) => StatsTotals::default(),
        };
        Self {
            totals: Mutex::new(totals),
            file: Some(path),
        }
    }

    pub fn totals(&self) -> StatsTotals {
        *self.totals.lock()
    }

    fn save(&self, totals: &StatsTotals) -> Result<()> {
        let Some(path) = &self.file else {
            return Ok(());
        };
        let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
        fs::create_dir_all(dir)?;
        let mut temp = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut temp, totals)?;
        temp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }
}

impl StatsSink for StatsStore {
    fn record_outcome(&self, outcome: &Outcome) {
        if outcome.status() != Status::Success {
            return;
        }
        let mut totals = self.totals.lock();
        totals.files_processed = totals.files_processed.saturating_add(1);
        totals.bytes_saved = totals.bytes_saved.saturating_add(outcome.bytes_saved());
    }

    fn record_batch(&self, _summary: &BatchSummary) {
        let snapshot = {
            let mut totals = self.totals.lock();
            totals.batches = totals.batches.saturating_add(1);
            *totals
        };
        if let Err(e) = self.save(&snapshot) {
            tracing::warn!("failed to persist stats: {e}");
        }
    }
}
