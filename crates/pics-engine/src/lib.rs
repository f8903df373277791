//! # pics-engine
//!
//! The compression orchestration engine.
//!
//! - **Selection** ([`StrategySelector`]) -- ordered encoder tiers per format.
//! - **Tiers** ([`TierExecutor`]) -- runs one tier into a temp file.
//! - **Atomic output** ([`AtomicWriter`]) -- temp-then-rename commit that
//!   never grows or corrupts a file.
//! - **Orchestration** ([`BatchOrchestrator`]) -- bounded sliding window,
//!   cancellation, progress and per-batch summaries.
//! - **Sinks** ([`StatsSink`]) -- CSV log, lifetime statistics, fan-out.

pub mod orchestrator;
pub mod progress;
pub mod selector;
pub mod sink;
pub mod tiers;
pub mod writer;

#[cfg(test)]
mod test_support;

pub use orchestrator::{BatchOrchestrator, BatchReport, EngineServices};
pub use progress::ProgressSender;
pub use selector::{Selection, Strategy, StrategySelector};
pub use sink::{csv_escape, CsvLogSink, FanoutSink, NullSink, StatsSink, StatsStore, StatsTotals};
pub use tiers::{tool_arguments, TierExecutor, TierJob};
pub use writer::{plan_destination, sanitize_filename, AtomicWriter, Committed, CommitFailure, Replace};

pub use tokio_util::sync::CancellationToken;
