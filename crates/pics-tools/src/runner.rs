//! The seam between the engine and real processes.
//!
//! The engine only ever talks to a [`ProcessRunner`]; production code uses
//! [`SecureProcessRunner`], tests substitute instrumented fakes.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use pics_common::Result;

use crate::command::{ProcessOutput, SecureCommand, DEFAULT_MAX_OUTPUT_BYTES};
use crate::sandbox::Sandbox;

/// One fully-specified tool run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub timeout: Duration,
    pub max_output_bytes: usize,
}

impl Invocation {
    pub fn new(program: PathBuf, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program,
            args,
            timeout,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }

    pub fn with_max_output_bytes(mut self, n: usize) -> Self {
        self.max_output_bytes = n;
        self
    }
}

/// Executes an [`Invocation`] and reports what happened.
///
/// A non-zero exit is a normal `Ok` result; `Err` is reserved for runs that
/// were refused, could not start, or timed out.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(&self, invocation: &Invocation) -> Result<ProcessOutput>;
}

/// Runs invocations through [`SecureCommand`].
#[derive(Debug, Clone)]
pub struct SecureProcessRunner {
    sandbox: Arc<Sandbox>,
}

impl SecureProcessRunner {
    pub fn new(sandbox: Arc<Sandbox>) -> Self {
        Self { sandbox }
    }

    pub fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }
}

#[async_trait]
impl ProcessRunner for SecureProcessRunner {
    async fn run(&self, invocation: &Invocation) -> Result<ProcessOutput> {
        SecureCommand::new(Arc::clone(&self.sandbox), invocation.program.clone())
            .args(invocation.args.iter().cloned())
            .timeout(invocation.timeout)
            .max_output_bytes(invocation.max_output_bytes)
            .execute()
            .await
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::os::unix::fs::PermissionsExt;

    #[tokio::test]
    #[serial]
    async fn secure_runner_passes_arguments_through() {
        let dir = tempfile::tempdir().unwrap();
        let tool = dir.path().join("echo-args");
        std::fs::write(&tool, "#!/bin/sh\necho \"$1|$2\"\n").unwrap();
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();

        let runner = SecureProcessRunner::new(Arc::new(Sandbox::new([dir.path()])));
        let invocation = Invocation::new(
            tool,
            vec!["--quality".into(), "82".into()],
            Duration::from_secs(5),
        );
        let output = runner.run(&invocation).await.unwrap();
        assert!(output.success());
        assert_eq!(output.stdout.trim(), "--quality|82");
    }

    #[test]
    fn invocation_defaults_to_one_mebibyte_capture() {
        let inv = Invocation::new(PathBuf::from("/usr/bin/true"), Vec::new(), Duration::ZERO);
        assert_eq!(inv.max_output_bytes, 1024 * 1024);
        assert_eq!(inv.with_max_output_bytes(10).max_output_bytes, 10);
    }
}
