//! Unified error type for the pics engine.
//!
//! Every crate funnels its failures into [`Error`]. Failures never escape a
//! batch as faults: the engine turns them into per-file outcomes using the
//! stable code returned by [`Error::reason_code`].

use std::path::PathBuf;
use std::time::Duration;

/// Violations caught by the process sandbox.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SecurityError {
    /// A path contained a `..` component.
    #[error("path traversal rejected: {}", path.display())]
    PathTraversal {
        /// The offending path.
        path: PathBuf,
    },

    /// A path resolved outside every allowed root.
    #[error("path outside allowed roots: {}", path.display())]
    UnauthorizedPath {
        /// The offending path after canonicalization.
        path: PathBuf,
    },

    /// An argument carried shell metacharacters or control bytes.
    #[error("unsafe argument rejected: {arg:?}")]
    UnsafeArgument {
        /// The rejected argument.
        arg: String,
    },

    /// The child process outlived its wall-clock budget and was killed.
    #[error("{tool} timed out after {timeout:?}")]
    ProcessTimeout {
        /// Name of the tool that was killed.
        tool: String,
        /// The budget that expired.
        timeout: Duration,
    },

    /// The executable is missing, not a regular file, or not executable.
    #[error("invalid executable: {}", path.display())]
    InvalidExecutable {
        /// The rejected executable path.
        path: PathBuf,
    },
}

impl SecurityError {
    /// Stable code used in outcome records.
    pub fn reason_code(&self) -> &'static str {
        match self {
            SecurityError::PathTraversal { .. } => "path-traversal",
            SecurityError::UnauthorizedPath { .. } => "unauthorized-path",
            SecurityError::UnsafeArgument { .. } => "unsafe-argument",
            SecurityError::ProcessTimeout { .. } => "process-timeout",
            SecurityError::InvalidExecutable { .. } => "invalid-executable",
        }
    }
}

/// Unified error type covering all failure modes in pics.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration could not be loaded or is inconsistent.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The sandbox refused to run something.
    #[error("Security error: {0}")]
    Security(#[from] SecurityError),

    /// Decoding, encoding or pixel preparation failed.
    #[error("Processing error [{stage}]: {message}")]
    Processing {
        /// The stage that failed (e.g. "decode", "encode", "resize").
        stage: String,
        /// Human-readable error description.
        message: String,
    },

    /// An external tool ran but reported failure.
    #[error("Tool error [{tool}]: {message}")]
    Tool {
        /// Name of the tool that failed.
        tool: String,
        /// Human-readable error description.
        message: String,
    },

    /// Writing or atomically replacing a file failed.
    #[error("IO error: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Serialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The batch was cancelled before this unit of work finished.
    #[error("Cancelled")]
    Cancelled,
}

impl Error {
    /// Map this error to the reason code recorded in an outcome.
    pub fn reason_code(&self) -> &'static str {
        match self {
            Error::Configuration(_) => "configuration-error",
            Error::Security(e) => e.reason_code(),
            Error::Processing { .. } => "processing-failed",
            Error::Tool { .. } => "tool-failed",
            Error::Io { .. } => "io-error",
            Error::Json(_) => "serialization-error",
            Error::Cancelled => "cancelled",
        }
    }

    /// Convenience constructor for [`Error::Processing`].
    pub fn processing(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Processing {
            stage: stage.into(),
            message: message.into(),
        }
    }

    /// Convenience constructor for [`Error::Tool`].
    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Tool {
            tool: tool.into(),
            message: message.into(),
        }
    }
}

/// Result alias using the crate-level [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn security_error_display_and_code() {
        let err = SecurityError::PathTraversal {
            path: PathBuf::from("/tmp/../etc/passwd"),
        };
        assert!(err.to_string().contains("/tmp/../etc/passwd"));
        assert_eq!(err.reason_code(), "path-traversal");
    }

    #[test]
    fn security_error_converts_into_error() {
        let err: Error = SecurityError::UnsafeArgument {
            arg: "a;b".into(),
        }
        .into();
        assert!(matches!(err, Error::Security(_)));
        assert_eq!(err.reason_code(), "unsafe-argument");
    }

    #[test]
    fn timeout_display() {
        let err = SecurityError::ProcessTimeout {
            tool: "avifenc".into(),
            timeout: Duration::from_secs(120),
        };
        assert_eq!(err.to_string(), "avifenc timed out after 120s");
        assert_eq!(err.reason_code(), "process-timeout");
    }

    #[test]
    fn tool_display() {
        let err = Error::tool("cjpeg", "exited with status 1");
        assert_eq!(err.to_string(), "Tool error [cjpeg]: exited with status 1");
        assert_eq!(err.reason_code(), "tool-failed");
    }

    #[test]
    fn processing_display() {
        let err = Error::processing("decode", "truncated header");
        assert_eq!(
            err.to_string(),
            "Processing error [decode]: truncated header"
        );
        assert_eq!(err.reason_code(), "processing-failed");
    }

    #[test]
    fn io_from_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io { .. }));
        assert_eq!(err.reason_code(), "io-error");
    }

    #[test]
    fn cancelled_code() {
        assert_eq!(Error::Cancelled.reason_code(), "cancelled");
    }
}
