use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Receives progress and messages from long-running operations.
///
/// The engines never print anything themselves; all user-facing output goes
/// through a consumer. Every method has a default so callers only override
/// what they care about.
pub trait Consumer: Send + Sync {
    /// Overall progress in `0.0..=1.0`.
    fn progress(&self, _alpha: f64) {}

    /// What is being worked on right now, usually a file path.
    fn progress_label(&self, _label: &str) {}

    fn debug(&self, msg: &str) {
        tracing::debug!("{}", msg);
    }

    fn info(&self, msg: &str) {
        tracing::info!("{}", msg);
    }

    fn warn(&self, msg: &str) {
        tracing::warn!("{}", msg);
    }
}

/// Forwards messages to `tracing` and ignores progress.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingConsumer;

impl Consumer for TracingConsumer {}

/// Shareable flag for cooperative cancellation.
///
/// Clones observe the same flag. Engines poll it at file granularity.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// `Err(Error::Cancelled)` once cancellation has been requested.
    pub fn check(&self) -> crate::Result<()> {
        if self.is_cancelled() {
            Err(crate::Error::Cancelled)
        } else {
            Ok(())
        }
    }
}
