//! Progress reporting for batch runs.

use pics_common::BatchProgress;

/// Sender for reporting batch progress to the caller.
///
/// Wraps a callback that receives a [`BatchProgress`] snapshot at file start
/// and file end, and once more with the final totals.
pub struct ProgressSender {
    callback: Box<dyn Fn(&BatchProgress) + Send + Sync>,
}

impl ProgressSender {
    pub fn new(callback: impl Fn(&BatchProgress) + Send + Sync + 'static) -> Self {
        Self {
            callback: Box::new(callback),
        }
    }

    /// A sender that discards all reports.
    pub fn noop() -> Self {
        Self {
            callback: Box::new(|_| {}),
        }
    }

    pub fn send(&self, progress: &BatchProgress) {
        (self.callback)(progress);
    }
}

impl Default for ProgressSender {
    fn default() -> Self {
        Self::noop()
    }
}

impl std::fmt::Debug for ProgressSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressSender").finish_non_exhaustive()
    }
}
