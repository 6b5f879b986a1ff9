//! Step scheduler seam.
//!
//! The routine interpreter leans on a scheduler for four things: running a
//! step under its retry policy, receiving control signals, recording
//! heartbeats, and exposing named queries.  [`StepScheduler`] captures that
//! contract; [`LocalScheduler`] satisfies it in-process with Tokio channels.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use botflow_types::{BotError, RetryPolicy, Signal};
use futures_util::future::BoxFuture;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::liveness::{DEFAULT_HEARTBEAT_TIMEOUT, LivenessMonitor};

/// One attempt of a step.
pub type StepFuture = BoxFuture<'static, Result<String, BotError>>;

/// Handler answering a named query.
pub type QueryHandler = Arc<dyn Fn() -> String + Send + Sync>;

#[async_trait]
pub trait StepScheduler: Send + Sync {
    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// policy's attempts are used up.  Cancellation during a back-off sleep
    /// returns [`BotError::Canceled`].
    async fn execute_with_retry(
        &self,
        step: &str,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
        op: &(dyn Fn() -> StepFuture + Send + Sync),
    ) -> Result<String, BotError>;

    /// Next control signal, or `None` once no sender is left.
    async fn await_signal(&self) -> Option<Signal>;

    /// Liveness report from a long-running step.
    fn record_heartbeat(&self, step: &str, details: &str);

    /// Expose `handler` under `name`.
    fn register_query(&self, name: &str, handler: QueryHandler);
}

/// Delivers signals into a [`LocalScheduler`].
#[derive(Clone, Debug)]
pub struct SignalSender {
    tx: mpsc::UnboundedSender<Signal>,
}

impl SignalSender {
    pub fn send(&self, signal: Signal) -> Result<(), BotError> {
        self.tx
            .send(signal)
            .map_err(|_| BotError::Internal(format!("no routine is listening for {signal}")))
    }
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// In-process scheduler: retries locally with exponential back-off, routes
/// signals over an unbounded channel and keeps queries in a map.
pub struct LocalScheduler {
    signals: AsyncMutex<mpsc::UnboundedReceiver<Signal>>,
    queries: Mutex<HashMap<String, QueryHandler>>,
    liveness: Mutex<LivenessMonitor>,
}

impl LocalScheduler {
    pub fn new() -> (Self, SignalSender) {
        Self::with_heartbeat_timeout(DEFAULT_HEARTBEAT_TIMEOUT)
    }

    pub fn with_heartbeat_timeout(timeout: Duration) -> (Self, SignalSender) {
        let (tx, rx) = mpsc::unbounded_channel();
        let scheduler = Self {
            signals: AsyncMutex::new(rx),
            queries: Mutex::new(HashMap::new()),
            liveness: Mutex::new(LivenessMonitor::new(timeout)),
        };
        (scheduler, SignalSender { tx })
    }

    /// Evaluate a registered query.
    pub fn query(&self, name: &str) -> Option<String> {
        let handler = locked(&self.queries).get(name).cloned()?;
        Some(handler())
    }

    /// Steps that stopped heartbeating, as [`BotError::Timeout`]s.
    pub fn stalled_steps(&self) -> Vec<BotError> {
        let liveness = locked(&self.liveness);
        liveness
            .stalled()
            .into_iter()
            .map(|step| {
                let last = liveness.last_details(&step).unwrap_or("no heartbeat yet");
                BotError::Timeout(format!("{step} (last: {last})"))
            })
            .collect()
    }

    /// Details of the latest heartbeat recorded for `step`.
    pub fn last_heartbeat(&self, step: &str) -> Option<String> {
        locked(&self.liveness).last_details(step).map(str::to_string)
    }
}

#[async_trait]
impl StepScheduler for LocalScheduler {
    async fn execute_with_retry(
        &self,
        step: &str,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
        op: &(dyn Fn() -> StepFuture + Send + Sync),
    ) -> Result<String, BotError> {
        let mut attempt = 1;
        loop {
            let delay = policy.delay_before(attempt);
            if !delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return Err(BotError::Canceled(format!("{step} canceled during retry back-off")));
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            locked(&self.liveness).begin(step);
            let result = op().await;
            locked(&self.liveness).end(step);

            match result {
                Ok(payload) => return Ok(payload),
                Err(e)
                    if e.is_retryable()
                        && policy.allows_attempt(attempt + 1)
                        && !cancel.is_cancelled() =>
                {
                    warn!(
                        step,
                        attempt,
                        error = %e,
                        next_delay_ms = policy.delay_before(attempt + 1).as_millis() as u64,
                        "step failed, retrying"
                    );
                    attempt += 1;
                }
                Err(e) => {
                    debug!(step, attempt, error = %e, "step failed");
                    return Err(e);
                }
            }
        }
    }

    async fn await_signal(&self) -> Option<Signal> {
        self.signals.lock().await.recv().await
    }

    fn record_heartbeat(&self, step: &str, details: &str) {
        debug!(step, details, "heartbeat");
        locked(&self.liveness).beat(step, details);
    }

    fn register_query(&self, name: &str, handler: QueryHandler) {
        locked(&self.queries).insert(name.to_string(), handler);
    }
}
