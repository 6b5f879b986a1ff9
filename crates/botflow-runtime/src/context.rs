//! [`StepContext`] – what a running step knows about itself.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::scheduler::StepScheduler;

/// Identity, cancellation handle and scheduler access for one step.
///
/// Cloning is cheap; clones share the same cancellation token.
#[derive(Clone)]
pub struct StepContext {
    pub run_id: String,
    /// Label of the step, used for heartbeats and logging.
    pub step: String,
    pub cancel: CancellationToken,
    scheduler: Arc<dyn StepScheduler>,
}

impl StepContext {
    pub fn new(
        run_id: impl Into<String>,
        step: impl Into<String>,
        cancel: CancellationToken,
        scheduler: Arc<dyn StepScheduler>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            step: step.into(),
            cancel,
            scheduler,
        }
    }

    /// Forward a liveness report to the scheduler.
    pub fn heartbeat(&self, details: &str) {
        self.scheduler.record_heartbeat(&self.step, details);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Same identity, fresh token: not affected by this context's
    /// cancellation.  Used for stop and compensation calls issued after the
    /// step was already canceled.
    pub fn detached(&self) -> Self {
        Self {
            cancel: CancellationToken::new(),
            ..self.clone()
        }
    }
}

impl std::fmt::Debug for StepContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepContext")
            .field("run_id", &self.run_id)
            .field("step", &self.step)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}
