//! Requests, outcomes and batch-level aggregates.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::format::ImageFormat;
use crate::ids::{BatchId, RequestId};
use crate::settings::Settings;

/// Stable reason codes recorded on outcomes.
pub mod reason {
    pub const NO_GAIN: &str = "no-gain";
    pub const GIFSICLE_DISABLED: &str = "gifsicle-disabled";
    pub const FORMAT_NOT_COMPRESSIBLE: &str = "format-not-compressible";
    pub const UNSUPPORTED_FORMAT: &str = "unsupported-format";
    pub const MOVE_FAILED: &str = "move-failed";
    pub const COPY_ORIGINAL_FAILED: &str = "copy-original-failed";
    pub const EMPTY_OUTPUT: &str = "empty-output";
    pub const FILE_NOT_FOUND: &str = "file-not-found";
    pub const NOT_A_FILE: &str = "not-a-file";
    pub const FILE_TOO_LARGE: &str = "file-too-large";
    pub const FILE_TOO_SMALL: &str = "file-too-small";
    pub const INVALID_INPUT_PATH: &str = "invalid-input-path";
    pub const CANCELLED: &str = "cancelled";
    pub const INTERNAL_ERROR: &str = "internal-error";
}

/// One file to compress. Immutable once created.
#[derive(Debug, Clone)]
pub struct CompressionRequest {
    id: RequestId,
    path: PathBuf,
    settings: Arc<Settings>,
}

impl CompressionRequest {
    pub fn new(path: impl Into<PathBuf>, settings: Settings) -> Self {
        Self::with_shared_settings(path, Arc::new(settings))
    }

    /// Build a request that shares `settings` with the rest of its batch.
    pub fn with_shared_settings(path: impl Into<PathBuf>, settings: Arc<Settings>) -> Self {
        Self {
            id: RequestId::new(),
            path: path.into(),
            settings,
        }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// A shared handle to the settings, for moving into worker tasks.
    pub fn shared_settings(&self) -> Arc<Settings> {
        Arc::clone(&self.settings)
    }

    /// File name for progress display.
    pub fn display_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.to_string_lossy().into_owned())
    }
}

/// Terminal state of one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Skipped,
    Error,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Success => "success",
            Status::Skipped => "skipped",
            Status::Error => "error",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The result record for one request. Created exactly once, never mutated.
///
/// A successful outcome never reports growth: the constructors normalise
/// `new_size > original_size` to [`reason::NO_GAIN`] with equal sizes.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Outcome {
    request_id: RequestId,
    source_format: ImageFormat,
    target_format: ImageFormat,
    original_path: PathBuf,
    output_path: Option<PathBuf>,
    original_size_bytes: u64,
    new_size_bytes: u64,
    status: Status,
    reason: String,
}

impl Outcome {
    /// A committed compression. Growth is normalised to no-gain.
    pub fn success(
        request: &CompressionRequest,
        format: ImageFormat,
        output_path: PathBuf,
        original_size: u64,
        new_size: u64,
        reason: impl Into<String>,
    ) -> Self {
        if new_size >= original_size {
            return Self::no_gain(request, format, output_path, original_size);
        }
        Self {
            request_id: request.id(),
            source_format: format,
            target_format: format,
            original_path: request.path().to_path_buf(),
            output_path: Some(output_path),
            original_size_bytes: original_size,
            new_size_bytes: new_size,
            status: Status::Success,
            reason: reason.into(),
        }
    }

    /// Compression did not help; the original bytes stand.
    pub fn no_gain(
        request: &CompressionRequest,
        format: ImageFormat,
        output_path: PathBuf,
        original_size: u64,
    ) -> Self {
        Self {
            request_id: request.id(),
            source_format: format,
            target_format: format,
            original_path: request.path().to_path_buf(),
            output_path: Some(output_path),
            original_size_bytes: original_size,
            new_size_bytes: original_size,
            status: Status::Success,
            reason: reason::NO_GAIN.to_string(),
        }
    }

    pub fn skipped(
        request: &CompressionRequest,
        format: ImageFormat,
        original_size: u64,
        reason: impl Into<String>,
    ) -> Self {
        Self::terminal(request, format, original_size, Status::Skipped, reason.into())
    }

    pub fn error(
        request: &CompressionRequest,
        format: ImageFormat,
        original_size: u64,
        reason: impl Into<String>,
    ) -> Self {
        Self::terminal(request, format, original_size, Status::Error, reason.into())
    }

    fn terminal(
        request: &CompressionRequest,
        format: ImageFormat,
        original_size: u64,
        status: Status,
        reason: String,
    ) -> Self {
        Self {
            request_id: request.id(),
            source_format: format,
            target_format: format,
            original_path: request.path().to_path_buf(),
            output_path: None,
            original_size_bytes: original_size,
            new_size_bytes: original_size,
            status,
            reason,
        }
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn source_format(&self) -> ImageFormat {
        self.source_format
    }

    pub fn target_format(&self) -> ImageFormat {
        self.target_format
    }

    pub fn original_path(&self) -> &Path {
        &self.original_path
    }

    pub fn output_path(&self) -> Option<&Path> {
        self.output_path.as_deref()
    }

    pub fn original_size_bytes(&self) -> u64 {
        self.original_size_bytes
    }

    pub fn new_size_bytes(&self) -> u64 {
        self.new_size_bytes
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn is_no_gain(&self) -> bool {
        self.status == Status::Success && self.reason == reason::NO_GAIN
    }

    pub fn bytes_saved(&self) -> u64 {
        self.original_size_bytes.saturating_sub(self.new_size_bytes)
    }

    /// Fraction of the original removed, in `0.0..=1.0`.
    pub fn saved_ratio(&self) -> f64 {
        if self.original_size_bytes == 0 {
            return 0.0;
        }
        self.bytes_saved() as f64 / self.original_size_bytes as f64
    }
}

/// Progress snapshot pushed to the caller. Display only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchProgress {
    pub processed: usize,
    pub total: usize,
    /// `None` on the final event of a batch.
    pub current_file: Option<String>,
}

impl BatchProgress {
    pub fn is_final(&self) -> bool {
        self.current_file.is_none()
    }
}

/// Aggregate counts for one batch, computed once after the last outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub batch_id: Option<BatchId>,
    pub total: usize,
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Subset of `skipped` that never ran because the batch was cancelled.
    pub cancelled: usize,
    pub no_gain: usize,
    pub original_bytes: u64,
    pub new_bytes: u64,
    pub bytes_saved: u64,
}

impl BatchSummary {
    pub fn from_outcomes(batch_id: BatchId, outcomes: &[Outcome]) -> Self {
        let mut summary = BatchSummary {
            batch_id: Some(batch_id),
            total: outcomes.len(),
            ..Default::default()
        };
        for outcome in outcomes {
            match outcome.status() {
                Status::Success => {
                    summary.succeeded += 1;
                    if outcome.is_no_gain() {
                        summary.no_gain += 1;
                    }
                    summary.original_bytes = summary
                        .original_bytes
                        .saturating_add(outcome.original_size_bytes());
                    summary.new_bytes = summary.new_bytes.saturating_add(outcome.new_size_bytes());
                    summary.bytes_saved = summary.bytes_saved.saturating_add(outcome.bytes_saved());
                }
                Status::Skipped => {
                    summary.skipped += 1;
                    if outcome.reason() == reason::CANCELLED {
                        summary.cancelled += 1;
                    }
                }
                Status::Error => summary.failed += 1,
            }
        }
        summary
    }

    pub fn saved_ratio(&self) -> f64 {
        if self.original_bytes == 0 {
            return 0.0;
        }
        self.bytes_saved as f64 / self.original_bytes as f64
    }
}
