//! Instrumented fakes shared by the engine's unit tests.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use pics_common::{Result, SecurityError};
use pics_tools::{Invocation, ProcessOutput, ProcessRunner};

#[derive(Debug, Clone, Copy)]
pub(crate) enum RunnerBehaviour {
    /// Exit 0 after writing this many bytes to the output temp file.
    Write(usize),
    /// Exit with this code without writing anything.
    Exit(i32),
    /// Fail the way a timed-out tool does.
    Timeout,
    /// Crash the worker.
    Panic,
}

/// A [`ProcessRunner`] that never spawns anything and records what it saw.
///
/// The output file is recognised by its `.pics-` temp prefix, so the fake
/// works for every tool's argument layout.
#[derive(Debug)]
pub(crate) struct FakeRunner {
    behaviour: RunnerBehaviour,
    delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    calls: Mutex<Vec<Invocation>>,
}

impl FakeRunner {
    pub(crate) fn new(behaviour: RunnerBehaviour) -> Self {
        Self {
            behaviour,
            delay: Duration::ZERO,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub(crate) fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub(crate) fn invocations(&self) -> Vec<Invocation> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl ProcessRunner for FakeRunner {
    async fn run(&self, invocation: &Invocation) -> Result<ProcessOutput> {
        self.calls.lock().push(invocation.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let result = match self.behaviour {
            RunnerBehaviour::Write(n) => {
                let output = invocation.args.iter().find(|a| {
                    Path::new(a)
                        .file_name()
                        .map(|f| f.to_string_lossy().starts_with(".pics-"))
                        .unwrap_or(false)
                });
                if let Some(output) = output {
                    std::fs::write(output, vec![0xAB; n])?;
                }
                Ok(ProcessOutput {
                    exit_code: Some(0),
                    ..Default::default()
                })
            }
            RunnerBehaviour::Exit(code) => Ok(ProcessOutput {
                exit_code: Some(code),
                stderr: format!("fake exit {code}"),
                ..Default::default()
            }),
            RunnerBehaviour::Timeout => Err(SecurityError::ProcessTimeout {
                tool: invocation.program.display().to_string(),
                timeout: invocation.timeout,
            }
            .into()),
            RunnerBehaviour::Panic => panic!("fake tool crashed"),
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}
