//! # pics-tools
//!
//! Safe execution of external image encoders.
//!
//! This crate provides:
//!
//! - **Sandbox** ([`Sandbox`]) -- allow-listed roots, traversal and
//!   metacharacter rejection, and a scrubbed child environment.
//! - **Command execution** ([`SecureCommand`]) -- async builder with a
//!   wall-clock timeout that kills the child, plus bounded output capture.
//! - **Runner seam** ([`ProcessRunner`]) -- the trait the engine calls, so
//!   tests can substitute instrumented fakes.
//! - **Tool discovery** ([`ToolRegistry`]) -- lazily cached lookup of
//!   cjpegli, mozjpeg, oxipng, gifsicle, cwebp and avifenc with
//!   `PICS_<TOOL>_PATH` overrides.

pub mod command;
pub mod runner;
pub mod sandbox;
pub mod tools;

// ---- Re-exports for convenience ----

pub use command::{ProcessOutput, SecureCommand, DEFAULT_MAX_OUTPUT_BYTES};
pub use runner::{Invocation, ProcessRunner, SecureProcessRunner};
pub use sandbox::{is_executable, scrubbed_env, validate_argument, Sandbox};
pub use tools::{Tool, ToolAvailability, ToolInfo, ToolRegistry};
