//! Delay strategies and the `BackOff` combinator.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use tracing::trace;

use cadence_core::config::{BackoffKind, RetryConfig};
use cadence_core::{Context, Step, StepRef, Transition};

use crate::timer::run_after;

/// Produces successive wait durations. Strategies keep their own state
/// between calls.
pub trait DelayStrategy: Send + 'static {
    fn next_delay(&mut self) -> Duration;
}

impl<F> DelayStrategy for F
where
    F: FnMut() -> Duration + Send + 'static,
{
    fn next_delay(&mut self) -> Duration {
        self()
    }
}

/// The same delay every time.
#[derive(Debug, Clone, Copy)]
pub struct Constant(pub Duration);

impl DelayStrategy for Constant {
    fn next_delay(&mut self) -> Duration {
        self.0
    }
}

/// Yields the current delay, then multiplies it by `factor` for the next call.
#[derive(Debug, Clone)]
pub struct Linear {
    current: Duration,
    factor: f64,
}

impl Linear {
    pub fn new(initial: Duration, factor: f64) -> Self {
        Self {
            current: initial,
            factor,
        }
    }
}

impl DelayStrategy for Linear {
    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = Duration::try_from_secs_f64(delay.as_secs_f64() * self.factor)
            .unwrap_or(Duration::MAX);
        delay
    }
}

/// Adds a uniformly random offset in `[0, max)` to an inner strategy.
pub struct Jitter {
    max: Duration,
    inner: Option<Box<dyn DelayStrategy>>,
}

impl Jitter {
    pub fn new(max: Duration, inner: impl DelayStrategy) -> Self {
        Self {
            max,
            inner: Some(Box::new(inner)),
        }
    }

    /// Pure random delay in `[0, max)`.
    pub fn bare(max: Duration) -> Self {
        Self { max, inner: None }
    }
}

impl DelayStrategy for Jitter {
    fn next_delay(&mut self) -> Duration {
        let base = self
            .inner
            .as_mut()
            .map_or(Duration::ZERO, |inner| inner.next_delay());
        let offset = self.max.mul_f64(rand::random::<f64>());
        base.saturating_add(offset)
    }
}

/// Build the delay strategy described by a `[retry]` config section.
pub fn delay_strategy(config: &RetryConfig) -> Box<dyn DelayStrategy> {
    let jitter = config.max_jitter();
    match config.strategy {
        BackoffKind::Constant => with_jitter(Constant(config.initial_backoff()), jitter),
        BackoffKind::Linear => with_jitter(
            Linear::new(config.initial_backoff(), config.multiplier),
            jitter,
        ),
    }
}

fn with_jitter(strategy: impl DelayStrategy, max: Duration) -> Box<dyn DelayStrategy> {
    if max.is_zero() {
        Box::new(strategy)
    } else {
        Box::new(Jitter::new(max, strategy))
    }
}

/// Waits for the next strategy delay before every invocation of its step.
pub struct BackOff {
    strategy: Arc<Mutex<Box<dyn DelayStrategy>>>,
    step: StepRef,
}

impl BackOff {
    fn delay(&self) -> Duration {
        self.strategy
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .next_delay()
    }
}

impl Step for BackOff {
    fn run(self: Arc<Self>, ctx: Context) -> BoxFuture<'static, Transition> {
        Box::pin(async move {
            let delay = self.delay();
            trace!(step = self.step.name(), delay_ms = delay.as_millis() as u64, "Backing off");
            run_after(&ctx, delay, self.step.clone()).await
        })
    }

    fn name(&self) -> &'static str {
        "BackOff"
    }
}

/// Delay each invocation of `step` by the next value of `strategy`. There is
/// no end condition; bound it with `retry` or a timeout.
pub fn backoff(strategy: impl DelayStrategy, step: StepRef) -> StepRef {
    backoff_boxed(Box::new(strategy), step)
}

pub fn backoff_boxed(strategy: Box<dyn DelayStrategy>, step: StepRef) -> StepRef {
    if step.is_end() {
        return step;
    }
    Arc::new(BackOff {
        strategy: Arc::new(Mutex::new(strategy)),
        step,
    })
}
