//! Delayed, absolute-time and periodic scheduling of steps.
//!
//! Every timer races its wait (and the wrapped step) against cancellation of
//! the context it is invoked with. A cancelled context resolves to an error
//! step carrying the cancellation cause.

use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use futures::future::BoxFuture;
use tokio::time::Instant;
use tracing::debug;

use cadence_core::{CadenceError, Context, Result, Step, StepRef, Transition};

async fn race(ctx: &Context, wait: impl Future<Output = ()>, step: StepRef) -> Transition {
    let fire = async {
        wait.await;
        step.run(ctx.clone()).await
    };
    tokio::select! {
        biased;
        _ = ctx.cancelled() => Transition::cancelled(ctx),
        next = fire => next,
    }
}

/// Run `step` once `delay` has elapsed, unless `ctx` is cancelled first.
/// A zero delay runs the step right away.
pub(crate) async fn run_after(ctx: &Context, delay: Duration, step: StepRef) -> Transition {
    if delay.is_zero() {
        return step.run(ctx.clone()).await;
    }
    race(ctx, tokio::time::sleep(delay), step).await
}

/// Run `step` at `instant`, unless `ctx` is cancelled first.
pub(crate) async fn run_at(ctx: &Context, instant: Instant, step: StepRef) -> Transition {
    race(ctx, tokio::time::sleep_until(instant), step).await
}

fn until(when: DateTime<Utc>) -> Duration {
    (when - Utc::now()).to_std().unwrap_or(Duration::ZERO)
}

pub struct After {
    delay: Duration,
    step: StepRef,
}

impl Step for After {
    fn run(self: Arc<Self>, ctx: Context) -> BoxFuture<'static, Transition> {
        Box::pin(async move { race(&ctx, tokio::time::sleep(self.delay), self.step.clone()).await })
    }

    fn name(&self) -> &'static str {
        "After"
    }
}

/// Run `step` after `delay`. Blocks the invoking tick until the timer fires.
pub fn after(delay: Duration, step: StepRef) -> StepRef {
    if step.is_end() {
        return step;
    }
    Arc::new(After { delay, step })
}

pub struct At {
    when: DateTime<Utc>,
    step: StepRef,
}

impl Step for At {
    fn run(self: Arc<Self>, ctx: Context) -> BoxFuture<'static, Transition> {
        Box::pin(async move {
            let wait = until(self.when);
            debug!(when = %self.when, wait_ms = wait.as_millis() as u64, "Alarm armed");
            race(&ctx, tokio::time::sleep(wait), self.step.clone()).await
        })
    }

    fn name(&self) -> &'static str {
        "At"
    }
}

/// Run `step` at the wall-clock instant `when`. Instants in the past fire
/// immediately.
pub fn at(when: DateTime<Utc>, step: StepRef) -> StepRef {
    if step.is_end() {
        return step;
    }
    Arc::new(At { when, step })
}

pub struct Every {
    interval: Duration,
    step: StepRef,
}

impl Step for Every {
    fn run(self: Arc<Self>, ctx: Context) -> BoxFuture<'static, Transition> {
        Box::pin(async move {
            let next = race(&ctx, tokio::time::sleep(self.interval), self.step.clone()).await;
            match next {
                Transition::Next(step) | Transition::Pending(step) => {
                    if Arc::ptr_eq(&step, &self.step) {
                        Transition::Next(self)
                    } else {
                        Transition::Next(Arc::new(Every {
                            interval: self.interval,
                            step,
                        }))
                    }
                }
                other => other,
            }
        })
    }

    fn name(&self) -> &'static str {
        "Every"
    }
}

/// Wait `interval` before every re-entry of `step` and of whatever it
/// continues with.
pub fn every(interval: Duration, step: StepRef) -> StepRef {
    if step.is_end() {
        return step;
    }
    Arc::new(Every { interval, step })
}

pub struct Cron {
    schedule: Schedule,
    step: StepRef,
}

impl Step for Cron {
    fn run(self: Arc<Self>, ctx: Context) -> BoxFuture<'static, Transition> {
        Box::pin(async move {
            let Some(fire_at) = self.schedule.upcoming(Utc).next() else {
                debug!("Cron schedule has no upcoming time");
                return Transition::End;
            };
            debug!(fire_at = %fire_at.format("%H:%M:%S"), "Next cron tick scheduled");

            let next = race(&ctx, tokio::time::sleep(until(fire_at)), self.step.clone()).await;
            match next {
                Transition::Next(step) | Transition::Pending(step) => {
                    if Arc::ptr_eq(&step, &self.step) {
                        Transition::Next(self)
                    } else {
                        Transition::Next(Arc::new(Cron {
                            schedule: self.schedule.clone(),
                            step,
                        }))
                    }
                }
                other => other,
            }
        })
    }

    fn name(&self) -> &'static str {
        "Cron"
    }
}

/// Re-enter `step` at every upcoming time of a cron schedule.
pub fn cron(schedule: Schedule, step: StepRef) -> StepRef {
    if step.is_end() {
        return step;
    }
    Arc::new(Cron { schedule, step })
}

/// Like [`cron`], parsing the schedule from a cron expression.
pub fn cron_expr(expr: &str, step: StepRef) -> Result<StepRef> {
    let schedule = Schedule::from_str(expr)
        .map_err(|e| CadenceError::Config(format!("invalid cron expression '{}': {}", expr, e)))?;
    Ok(cron(schedule, step))
}
