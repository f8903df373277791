//! Builder for executing external encoders inside the sandbox.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

use pics_common::{Error, Result, SecurityError};

use crate::sandbox::{scrubbed_env, Sandbox};

/// Default command timeout: 1 minute.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Default cap on captured stdout/stderr: 1 MiB each.
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;

/// Output captured from a tool execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    /// Exit code, or `None` if the process was killed by a signal.
    pub exit_code: Option<i32>,
    /// Captured standard output (lossy UTF-8).
    pub stdout: String,
    /// Captured standard error (lossy UTF-8).
    pub stderr: String,
    /// True if either stream exceeded the capture cap.
    pub truncated: bool,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Turn a non-zero exit into [`Error::Tool`].
    pub fn into_success(self, tool: &str) -> Result<Self> {
        if self.success() {
            return Ok(self);
        }
        let status = self
            .exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        Err(Error::tool(
            tool,
            format!("exited with status {status}: {}", self.stderr.trim()),
        ))
    }
}

/// A builder for sandboxed tool invocations.
///
/// Every argument is validated, the environment is replaced with
/// [`scrubbed_env`], and the child is killed if it outlives its timeout.
///
/// # Example
///
/// ```no_run
/// use pics_tools::{Sandbox, SecureCommand};
/// use std::path::PathBuf;
/// use std::sync::Arc;
///
/// # async fn example() -> pics_common::Result<()> {
/// let output = SecureCommand::new(Arc::new(Sandbox::default()), PathBuf::from("/usr/bin/cjpeg"))
///     .arg("-quality").arg("82")
///     .arg("-outfile").arg("/tmp/out.jpg")
///     .arg("/tmp/in.jpg")
///     .execute()
///     .await?;
/// assert!(output.success());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct SecureCommand {
    sandbox: Arc<Sandbox>,
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
    max_output_bytes: usize,
}

impl SecureCommand {
    /// Create a new command for the given program path.
    pub fn new(sandbox: Arc<Sandbox>, program: PathBuf) -> Self {
        Self {
            sandbox,
            program,
            args: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }

    /// Append a single argument.
    pub fn arg(&mut self, s: impl Into<String>) -> &mut Self {
        self.args.push(s.into());
        self
    }

    /// Append multiple arguments.
    pub fn args(&mut self, iter: impl IntoIterator<Item = impl Into<String>>) -> &mut Self {
        self.args.extend(iter.into_iter().map(Into::into));
        self
    }

    /// Set the maximum execution time.
    pub fn timeout(&mut self, d: Duration) -> &mut Self {
        self.timeout = d;
        self
    }

    /// Cap the bytes kept from each of stdout and stderr.
    pub fn max_output_bytes(&mut self, n: usize) -> &mut Self {
        self.max_output_bytes = n;
        self
    }

    /// Validate, spawn, and wait for the command.
    ///
    /// A non-zero exit is returned as `Ok` with its code; use
    /// [`ProcessOutput::into_success`] to treat it as an error.
    ///
    /// # Errors
    ///
    /// - [`Error::Security`] if the executable or an argument is rejected,
    ///   or if the process times out (it is killed first).
    /// - [`Error::Tool`] if spawning or waiting fails.
    pub async fn execute(&self) -> Result<ProcessOutput> {
        let program = self.sandbox.validate_executable(&self.program)?;
        for arg in &self.args {
            self.sandbox.check_argument(arg)?;
        }

        let program_name = program
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| program.to_string_lossy().to_string());

        let mut cmd = Command::new(&program);
        cmd.args(&self.args)
            .env_clear()
            .envs(scrubbed_env())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!(tool = %program_name, args = ?self.args, "spawning tool");

        let mut child = cmd.spawn().map_err(|e| Error::Tool {
            tool: program_name.clone(),
            message: format!("failed to spawn: {e}"),
        })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let cap = self.max_output_bytes;

        let run = async {
            tokio::join!(
                child.wait(),
                read_capped(stdout, cap),
                read_capped(stderr, cap)
            )
        };

        match tokio::time::timeout(self.timeout, run).await {
            Ok((Ok(status), (stdout, out_truncated), (stderr, err_truncated))) => {
                Ok(ProcessOutput {
                    exit_code: status.code(),
                    stdout: String::from_utf8_lossy(&stdout).to_string(),
                    stderr: String::from_utf8_lossy(&stderr).to_string(),
                    truncated: out_truncated || err_truncated,
                })
            }
            Ok((Err(e), _, _)) => Err(Error::Tool {
                tool: program_name,
                message: format!("I/O error waiting for process: {e}"),
            }),
            Err(_elapsed) => {
                if let Err(e) = child.kill().await {
                    tracing::warn!(tool = %program_name, "failed to kill timed-out tool: {e}");
                }
                tracing::warn!(tool = %program_name, timeout = ?self.timeout, "tool timed out");
                Err(SecurityError::ProcessTimeout {
                    tool: program_name,
                    timeout: self.timeout,
                }
                .into())
            }
        }
    }
}

/// Drain `stream` to EOF, keeping at most `cap` bytes.
async fn read_capped<R>(stream: Option<R>, cap: usize) -> (Vec<u8>, bool)
where
    R: AsyncRead + Unpin,
{
    let Some(mut stream) = stream else {
        return (Vec::new(), false);
    };
    let mut kept = Vec::new();
    let mut truncated = false;
    let mut chunk = [0u8; 8192];
    loop {
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = cap.saturating_sub(kept.len());
                if n > room {
                    truncated = true;
                }
                kept.extend_from_slice(&chunk[..n.min(room)]);
            }
        }
    }
    (kept, truncated)
}
