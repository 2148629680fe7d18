//! Supervised background tasks with restart policies and jittered backoff.

use crate::{context::RequestContext, random};
use backoff::backoff::Backoff;
use futures::{future::BoxFuture, FutureExt};
use lora_gs_error::{GSError, GSResult};
use std::{any::Any, future::Future, panic::AssertUnwindSafe, sync::Arc, time::Duration};
use tokio::{task::JoinHandle, time::Instant};
use tracing::{debug, error, warn};

/// Invocations running at least this long reset the backoff to its first interval.
pub const BACKOFF_RESET_TIME: Duration = Duration::from_secs(60);

const DEFAULT_BACKOFF_JITTER: f64 = 0.1;

/// When [`start_task`] invokes the task function again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPolicy {
    /// Exit after the first invocation.
    Never,
    /// Re-run regardless of the outcome.
    Always,
    /// Re-run when the invocation failed for another reason than cancellation.
    OnFailure,
}

/// Delays between invocations.
///
/// The n-th restart waits `intervals[n]`, or the last interval once the list is
/// exhausted.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    pub intervals: Vec<Duration>,
    /// Fraction of the interval used as uniform jitter, in `[0, 1)`.
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            intervals: vec![
                Duration::from_millis(10),
                Duration::from_millis(50),
                Duration::from_millis(100),
                Duration::from_secs(1),
            ],
            jitter: DEFAULT_BACKOFF_JITTER,
        }
    }
}

impl BackoffConfig {
    /// Slower progression for tasks dialing remote services.
    pub fn dial() -> Self {
        Self {
            intervals: vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(5),
                Duration::from_secs(10),
                Duration::from_secs(30),
            ],
            jitter: DEFAULT_BACKOFF_JITTER,
        }
    }
}

/// Walks `intervals`, sticking to the last one, with jitter applied to each.
#[derive(Debug, Clone)]
pub struct TaskBackoff {
    config: BackoffConfig,
    index: usize,
}

impl TaskBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, index: 0 }
    }
}

impl Backoff for TaskBackoff {
    fn reset(&mut self) {
        self.index = 0;
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        let last = self.config.intervals.len().checked_sub(1)?;
        let interval = self.config.intervals[self.index.min(last)];
        self.index = self.index.saturating_add(1);
        Some(random::jitter(interval, self.config.jitter))
    }
}

/// Task body; called once per invocation with the task context.
pub type TaskFunc = Arc<dyn Fn(RequestContext) -> BoxFuture<'static, GSResult<()>> + Send + Sync>;

/// A background task to hand to [`start_task`].
///
/// # Example
/// ```ignore
/// let task = TaskConfig::new(ctx, "detect_gateway_drift", |ctx| run(ctx))
///     .restart(RestartPolicy::Always)
///     .backoff(BackoffConfig::dial());
/// start_task(task);
/// ```
pub struct TaskConfig {
    pub ctx: RequestContext,
    pub id: String,
    pub func: TaskFunc,
    pub restart: RestartPolicy,
    pub backoff: Option<BackoffConfig>,
    pub done: Option<Box<dyn FnOnce() + Send>>,
}

impl TaskConfig {
    /// Task running `func` once, without restarts.
    ///
    /// # Arguments
    /// * `ctx` - Lifetime of the task; the runner stops once it is cancelled
    /// * `id` - Name used in logs
    /// * `func` - Body invoked with `ctx` on each run
    pub fn new<F, Fut>(ctx: RequestContext, id: impl Into<String>, func: F) -> Self
    where
        F: Fn(RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = GSResult<()>> + Send + 'static,
    {
        Self {
            ctx,
            id: id.into(),
            func: Arc::new(move |ctx| func(ctx).boxed()),
            restart: RestartPolicy::Never,
            backoff: None,
            done: None,
        }
    }

    /// Sets the restart policy.
    pub fn restart(mut self, restart: RestartPolicy) -> Self {
        self.restart = restart;
        self
    }

    pub fn backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = Some(backoff);
        self
    }

    /// Registers a callback fired exactly once after the last invocation, also when
    /// the task panics or is dropped by the runtime.
    pub fn on_done(mut self, done: impl FnOnce() + Send + 'static) -> Self {
        self.done = Some(Box::new(done));
        self
    }
}

/// Fires the done callback once, also when the task is dropped by the runtime.
struct DoneGuard(Option<Box<dyn FnOnce() + Send>>);

impl Drop for DoneGuard {
    fn drop(&mut self) {
        if let Some(done) = self.0.take() {
            done();
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Spawns the task on the current runtime.
///
/// Each invocation runs with panics caught and logged as failures. Between
/// invocations the runner sleeps the next backoff interval; an invocation that
/// ran for [`BACKOFF_RESET_TIME`] resets the backoff. Cancellation of the task
/// context ends the loop.
///
/// # Returns
/// Handle of the runner, finished after the done callback fired.
pub fn start_task(cfg: TaskConfig) -> JoinHandle<()> {
    let TaskConfig {
        ctx,
        id,
        func,
        restart,
        backoff,
        done,
    } = cfg;

    tokio::spawn(async move {
        let _done = DoneGuard(done);
        let mut backoff = TaskBackoff::new(backoff.unwrap_or_default());
        let mut invocation: u64 = 0;

        loop {
            let started = Instant::now();
            let result = AssertUnwindSafe(func(ctx.clone()))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    let msg = panic_message(panic);
                    error!(task_id = %id, invocation, panic = %msg, "Task panicked");
                    Err(GSError::Panic(msg))
                });
            let ran_for = started.elapsed();

            match &result {
                Err(e) if e.is_canceled() || ctx.is_done() => {}
                Err(e) => warn!(task_id = %id, invocation, error = %e, "Task failed"),
                Ok(()) => debug!(task_id = %id, invocation, "Task finished"),
            }

            let rerun = match restart {
                RestartPolicy::Never => false,
                RestartPolicy::Always => true,
                RestartPolicy::OnFailure => matches!(&result, Err(e) if !e.is_canceled()),
            };
            if !rerun || ctx.is_done() {
                break;
            }

            if ran_for >= BACKOFF_RESET_TIME {
                backoff.reset();
            }
            let delay = backoff.next_backoff().unwrap_or_default();
            tokio::select! {
                _ = ctx.done() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            invocation += 1;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };

    #[test]
    fn backoff_sticks_to_last_interval_and_resets() {
        let mut b = TaskBackoff::new(BackoffConfig {
            intervals: vec![Duration::from_secs(1), Duration::from_secs(2)],
            jitter: 0.0,
        });
        assert_eq!(b.next_backoff(), Some(Duration::from_secs(1)));
        assert_eq!(b.next_backoff(), Some(Duration::from_secs(2)));
        assert_eq!(b.next_backoff(), Some(Duration::from_secs(2)));
        b.reset();
        assert_eq!(b.next_backoff(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn empty_backoff_yields_nothing() {
        let mut b = TaskBackoff::new(BackoffConfig {
            intervals: vec![],
            jitter: 0.5,
        });
        assert_eq!(b.next_backoff(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn never_runs_once_and_fires_done() {
        let calls = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));
        let (c, d) = (calls.clone(), done.clone());
        let handle = start_task(
            TaskConfig::new(RequestContext::background(), "never", move |_| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(GSError::Internal("boom".into()))
                }
            })
            .on_done(move || {
                d.fetch_add(1, Ordering::SeqCst);
            }),
        );
        handle.await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn on_failure_retries_panics_until_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let handle = start_task(
            TaskConfig::new(RequestContext::background(), "flaky", move |_| {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 2 {
                        panic!("not yet");
                    }
                    Ok(())
                }
            })
            .restart(RestartPolicy::OnFailure),
        );
        handle.await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn on_failure_stops_on_cancellation_error() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let handle = start_task(
            TaskConfig::new(RequestContext::background(), "canceled", move |_| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(GSError::Canceled)
                }
            })
            .restart(RestartPolicy::OnFailure),
        );
        handle.await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_backoff_sleep() {
        let ctx = RequestContext::background();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let handle = start_task(
            TaskConfig::new(ctx.clone(), "always", move |_| {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .restart(RestartPolicy::Always)
            .backoff(BackoffConfig {
                intervals: vec![Duration::from_secs(3600)],
                jitter: 0.0,
            }),
        );
        tokio::time::sleep(Duration::from_secs(1)).await;
        ctx.cancel();
        handle.await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn long_invocation_resets_backoff() {
        let delta = Duration::from_secs(30);
        let ctx = RequestContext::background();
        let starts = Arc::new(Mutex::new(Vec::<Instant>::new()));
        let s = starts.clone();
        let handle = start_task(
            TaskConfig::new(ctx.clone(), "reset", move |ctx| {
                let s = s.clone();
                async move {
                    let n = {
                        let mut starts = s.lock().unwrap();
                        starts.push(Instant::now());
                        starts.len()
                    };
                    if n == 3 {
                        tokio::time::sleep(delta * 3).await;
                    }
                    if n == 4 {
                        ctx.cancel();
                    }
                    Ok(())
                }
            })
            .restart(RestartPolicy::Always)
            .backoff(BackoffConfig {
                intervals: vec![delta, delta * 2, delta * 3, delta * 4],
                jitter: 0.1,
            }),
        );
        handle.await.unwrap();

        let starts = starts.lock().unwrap();
        assert_eq!(starts.len(), 4);
        let gap = |i: usize| starts[i + 1] - starts[i];
        let near = |d: Duration, want: Duration| {
            d >= want.mul_f64(0.89) && d <= want.mul_f64(1.11)
        };
        assert!(near(gap(0), delta), "first gap {:?}", gap(0));
        assert!(near(gap(1), delta * 2), "second gap {:?}", gap(1));
        // The third invocation ran for 3Δ, which is past the reset threshold.
        assert!(near(gap(2), delta * 4), "third gap {:?}", gap(2));
    }
}
