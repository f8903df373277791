//! Engine configuration.
//!
//! [`EngineConfig`] is deserialized from JSON. Every section defaults
//! sensibly so an empty `{}` file is valid.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::format::ImageFormat;

// ---------------------------------------------------------------------------
// Top-level EngineConfig
// ---------------------------------------------------------------------------

/// Limits, timeouts and sinks shared by every batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Inputs above this size are rejected with `file-too-large`.
    pub max_file_size_bytes: u64,
    /// Inputs below this size are skipped with `file-too-small`.
    pub min_file_size_bytes: u64,
    /// Worker pool size. `None` means `max(2, cpus - 1)`.
    pub concurrency: Option<usize>,
    /// Cap on captured stdout/stderr per process.
    pub max_output_bytes: usize,
    /// Extra sandbox roots besides home and the temp directory.
    pub allowed_roots: Vec<PathBuf>,
    pub timeouts: TimeoutConfig,
    pub log: LogConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_file_size_bytes: 500 * 1024 * 1024,
            min_file_size_bytes: 100,
            concurrency: None,
            max_output_bytes: 1024 * 1024,
            allowed_roots: Vec::new(),
            timeouts: TimeoutConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Deserialize an `EngineConfig` from a JSON string.
    pub fn from_json(json_str: &str) -> Result<Self> {
        serde_json::from_str(json_str)
            .map_err(|e| Error::Configuration(format!("config parse error: {e}")))
    }

    /// Load configuration from `path`, failing on any read or parse error.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json(&contents)
    }

    /// Load configuration from a file path, falling back to defaults if the
    /// path is `None` or the file does not exist.
    pub fn load_or_default(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self::default();
        };

        match std::fs::read_to_string(path) {
            Ok(contents) => Self::from_json(&contents).unwrap_or_else(|e| {
                tracing::warn!("Failed to parse config file {}: {e}", path.display());
                Self::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No config file at {}; using defaults", path.display());
                Self::default()
            }
            Err(e) => {
                tracing::warn!("Failed to read config file {}: {e}", path.display());
                Self::default()
            }
        }
    }

    /// Effective worker pool size.
    pub fn effective_concurrency(&self) -> usize {
        match self.concurrency {
            Some(n) if n > 0 => n,
            _ => default_concurrency(),
        }
    }

    /// Return a list of validation warnings (non-fatal issues).
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.min_file_size_bytes >= self.max_file_size_bytes {
            warnings.push(format!(
                "min_file_size_bytes ({}) is not below max_file_size_bytes ({}); every file will be rejected",
                self.min_file_size_bytes, self.max_file_size_bytes
            ));
        }

        if self.concurrency == Some(0) {
            warnings.push("concurrency is 0; the CPU-based default will be used".into());
        }

        if self.max_output_bytes == 0 {
            warnings.push("max_output_bytes is 0; tool diagnostics will be discarded".into());
        }

        for (name, secs) in self.timeouts.entries() {
            if secs == 0 {
                warnings.push(format!("timeouts.{name} is 0; every {name} run will time out"));
            }
        }

        for root in &self.allowed_roots {
            if !root.is_absolute() {
                warnings.push(format!(
                    "allowed_roots entry {} is relative and will be ignored",
                    root.display()
                ));
            }
        }

        if self.log.max_files == 0 {
            warnings.push("log.max_files is 0; rotated logs are discarded".into());
        }

        warnings
    }
}

/// `max(2, available CPUs - 1)`.
pub fn default_concurrency() -> usize {
    num_cpus::get().saturating_sub(1).max(2)
}

// ---------------------------------------------------------------------------
// Sub-configs
// ---------------------------------------------------------------------------

/// Wall-clock budget per external tool family, in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub jpeg_secs: u64,
    pub png_secs: u64,
    pub gif_secs: u64,
    pub webp_secs: u64,
    pub avif_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            jpeg_secs: 30,
            png_secs: 60,
            gif_secs: 45,
            webp_secs: 60,
            avif_secs: 120,
        }
    }
}

impl TimeoutConfig {
    /// Timeout for tools that encode `format`.
    pub fn for_format(&self, format: ImageFormat) -> Duration {
        let secs = match format {
            ImageFormat::Jpeg => self.jpeg_secs,
            ImageFormat::Png => self.png_secs,
            ImageFormat::Gif => self.gif_secs,
            ImageFormat::WebP => self.webp_secs,
            ImageFormat::Avif => self.avif_secs,
            ImageFormat::Heif | ImageFormat::Tiff | ImageFormat::Unsupported => self.png_secs,
        };
        Duration::from_secs(secs)
    }

    fn entries(&self) -> [(&'static str, u64); 5] {
        [
            ("jpeg_secs", self.jpeg_secs),
            ("png_secs", self.png_secs),
            ("gif_secs", self.gif_secs),
            ("webp_secs", self.webp_secs),
            ("avif_secs", self.avif_secs),
        ]
    }
}

/// Durable CSV log settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log file path. `None` disables the CSV log.
    pub path: Option<PathBuf>,
    /// Rotate once the active file reaches this size.
    pub max_size_bytes: u64,
    /// Number of rotated files kept (`log.1.csv` .. `log.N.csv`).
    pub max_files: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            path: None,
            max_size_bytes: 10 * 1024 * 1024,
            max_files: 5,
        }
    }
}
