use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tracing::{error, warn};

use cadence_core::{CadenceError, Context, Failure, Step, StepRef, Transition};

/// Runs its step on a worker task and gives up on it once `max` elapses.
pub struct Timeout {
    max: Duration,
    step: StepRef,
}

impl Step for Timeout {
    fn run(self: Arc<Self>, ctx: Context) -> BoxFuture<'static, Transition> {
        Box::pin(async move {
            let scoped = ctx.with_timeout(self.max);
            let mut worker = tokio::spawn(self.step.clone().run(scoped.clone()));

            let next = tokio::select! {
                biased;
                joined = &mut worker => match joined {
                    Ok(next) => next,
                    Err(e) => {
                        error!(step = self.step.name(), error = %e, "Timed step worker failed");
                        Transition::Fail(Failure::stop(CadenceError::Worker(e.to_string())))
                    }
                },
                _ = scoped.cancelled() => {
                    worker.abort();
                    if ctx.is_cancelled() {
                        Transition::cancelled(&ctx)
                    } else {
                        warn!(
                            step = self.step.name(),
                            timeout_ms = self.max.as_millis() as u64,
                            "Step timed out"
                        );
                        Transition::Fail(Failure::timeout_exceeded())
                    }
                }
            };
            scoped.cancel();
            next
        })
    }

    fn name(&self) -> &'static str {
        "Timeout"
    }
}

/// Bound each invocation of `step` to `max`. A late result is discarded.
pub fn timeout(max: Duration, step: StepRef) -> StepRef {
    if step.is_end() {
        return step;
    }
    Arc::new(Timeout { max, step })
}
