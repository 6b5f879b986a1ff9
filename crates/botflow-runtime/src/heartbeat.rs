//! Heartbeat supervisor for device calls.

use std::future::Future;
use std::time::Duration;

use botflow_types::BotError;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::debug;

use crate::context::StepContext;

/// Default heartbeat period.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(3);

/// Shortest ticker period.  Tokio tickers reject a zero period.
pub const MIN_TICK: Duration = Duration::from_millis(1);

/// Run `call` on its own task, heartbeating every `every` until it finishes.
///
/// When `ctx` is cancelled first this returns [`BotError::Canceled`]
/// immediately.  The task is left to finish on its own; it is not awaited.
/// A panicked or aborted task surfaces as [`BotError::Internal`].
pub async fn with_heartbeat<F, T>(ctx: &StepContext, every: Duration, call: F) -> Result<T, BotError>
where
    F: Future<Output = Result<T, BotError>> + Send + 'static,
    T: Send + 'static,
{
    let every = every.max(MIN_TICK);
    let started = Instant::now();
    let mut task = tokio::spawn(call);
    let mut ticker = interval_at(started + every, every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = ctx.cancelled() => {
                debug!(run_id = %ctx.run_id, step = %ctx.step, "step canceled while in flight");
                return Err(BotError::Canceled(format!("{} canceled", ctx.step)));
            }
            joined = &mut task => {
                return joined.unwrap_or_else(|e| {
                    Err(BotError::Internal(format!("{} task failed: {e}", ctx.step)))
                });
            }
            _ = ticker.tick() => {
                let elapsed = started.elapsed().as_secs();
                ctx.heartbeat(&format!("processing ({elapsed}s)"));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{LocalScheduler, StepScheduler};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio_util::sync::CancellationToken;

    fn context(step: &str) -> (Arc<LocalScheduler>, StepContext) {
        let (scheduler, _signals) = LocalScheduler::new();
        let scheduler = Arc::new(scheduler);
        let ctx = StepContext::new("run-hb", step, CancellationToken::new(), scheduler.clone());
        (scheduler, ctx)
    }

    #[tokio::test]
    async fn result_is_passed_through() {
        let (_, ctx) = context("StandUp");
        let out = with_heartbeat(&ctx, Duration::from_millis(10), async { Ok("done".to_string()) })
            .await
            .unwrap();
        assert_eq!(out, "done");
    }

    #[tokio::test]
    async fn long_call_emits_heartbeats() {
        let (scheduler, ctx) = context("Move");
        let policy = botflow_types::RetryPolicy::no_retry();
        let inner = ctx.clone();
        let op = move || -> crate::scheduler::StepFuture {
            let ctx = inner.clone();
            Box::pin(async move {
                with_heartbeat(&ctx, Duration::from_millis(10), async {
                    tokio::time::sleep(Duration::from_millis(45)).await;
                    Ok("arrived".to_string())
                })
                .await
            })
        };
        let scheduler_for_run = Arc::clone(&scheduler);
        let run = tokio::spawn(async move {
            scheduler_for_run
                .execute_with_retry("Move", &policy, &CancellationToken::new(), &op)
                .await
        });
        tokio::time::sleep(Duration::from_millis(30)).await;
        let last = scheduler.last_heartbeat("Move").expect("heartbeat recorded");
        assert!(last.starts_with("processing"));
        assert_eq!(run.await.unwrap().unwrap(), "arrived");
    }

    #[tokio::test]
    async fn cancel_returns_without_waiting() {
        let (_, ctx) = context("TTS");
        let finished = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&finished);
        let trigger = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let err = with_heartbeat(&ctx, Duration::from_millis(10), async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            flag.store(true, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap_err();

        assert!(err.is_canceled());
        assert!(started.elapsed() < Duration::from_millis(300));
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn zero_period_is_clamped() {
        let (_, ctx) = context("StandUp");
        let out = with_heartbeat(&ctx, Duration::ZERO, async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok("standing")
        })
        .await
        .unwrap();
        assert_eq!(out, "standing");
    }

    #[tokio::test]
    async fn panicking_call_is_internal_error() {
        let (_, ctx) = context("Head");
        let explode = true;
        let err = with_heartbeat(&ctx, Duration::from_millis(10), async move {
            if explode {
                panic!("boom");
            }
            Ok(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, BotError::Internal(_)));
    }
}
