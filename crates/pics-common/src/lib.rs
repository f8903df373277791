//! # pics-common
//!
//! Shared foundation for the pics compression engine: the error taxonomy,
//! typed request identities, container sniffing, per-request settings, the
//! outcome record and engine-wide configuration.

pub mod config;
pub mod error;
pub mod format;
pub mod ids;
pub mod outcome;
pub mod settings;

pub use config::{default_concurrency, EngineConfig, LogConfig, TimeoutConfig};
pub use error::{Error, Result, SecurityError};
pub use format::ImageFormat;
pub use ids::{BatchId, RequestId};
pub use outcome::{reason, BatchProgress, BatchSummary, CompressionRequest, Outcome, Status};
pub use settings::{Preset, ResizeCondition, ResizeSpec, SaveMode, Settings};
