//! Circuit breaker and its trip strategies.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::time::Instant;
use tracing::{debug, warn};

use cadence_core::{Context, Failure, Step, StepRef, Transition};

/// Decides, on each failed invocation, whether the breaker should open.
pub trait TripStrategy: Send + 'static {
    fn should_trip(&mut self) -> bool;
}

impl<F> TripStrategy for F
where
    F: FnMut() -> bool + Send + 'static,
{
    fn should_trip(&mut self) -> bool {
        self()
    }
}

/// Tolerates `n` failures, then trips on every check after that. A negative
/// `n` never trips.
#[derive(Debug, Clone)]
pub struct MaxTriesTrip {
    remaining: Option<u64>,
}

impl MaxTriesTrip {
    pub fn new(max: i64) -> Self {
        Self {
            remaining: u64::try_from(max).ok(),
        }
    }
}

impl TripStrategy for MaxTriesTrip {
    fn should_trip(&mut self) -> bool {
        match self.remaining.as_mut() {
            None => false,
            Some(0) => true,
            Some(n) => {
                *n -= 1;
                false
            }
        }
    }
}

/// Delegates to `inner`, restoring it to its initial state whenever `window`
/// has passed since the last reset. The window is only looked at when the
/// strategy is checked.
#[derive(Debug, Clone)]
pub struct TimedTrip<S> {
    window: Duration,
    pristine: S,
    current: S,
    reset_at: Instant,
}

impl<S: TripStrategy + Clone> TimedTrip<S> {
    pub fn new(window: Duration, inner: S) -> Self {
        Self {
            window,
            current: inner.clone(),
            pristine: inner,
            reset_at: Instant::now(),
        }
    }
}

impl<S: TripStrategy + Clone> TripStrategy for TimedTrip<S> {
    fn should_trip(&mut self) -> bool {
        let now = Instant::now();
        if now.duration_since(self.reset_at) >= self.window {
            debug!(window_ms = self.window.as_millis() as u64, "Trip window elapsed, resetting");
            self.current = self.pristine.clone();
            self.reset_at = now;
        }
        self.current.should_trip()
    }
}

/// Stops invoking its step for good once a failure trips the strategy.
///
/// Until then every invocation resolves back to the breaker itself, whether
/// the step succeeded or failed. There is no way to close an open breaker.
pub struct Breaker {
    trip: Mutex<Box<dyn TripStrategy>>,
    step: StepRef,
    open: AtomicBool,
}

impl Breaker {
    fn trips(&self) -> bool {
        self.trip
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .should_trip()
    }
}

impl Step for Breaker {
    fn run(self: Arc<Self>, ctx: Context) -> BoxFuture<'static, Transition> {
        Box::pin(async move {
            if self.open.load(Ordering::Acquire) {
                return Transition::Fail(Failure::breaker_open());
            }

            let next = self.step.clone().run(ctx).await;
            if let Transition::Fail(failure) = &next {
                if self.trips() {
                    self.open.store(true, Ordering::Release);
                    warn!(step = self.step.name(), error = %failure, "Circuit breaker opened");
                    return Transition::Fail(Failure::breaker_open());
                }
                debug!(
                    step = self.step.name(),
                    error = %failure,
                    "Failure below breaker threshold"
                );
            }
            Transition::Next(self)
        })
    }

    fn name(&self) -> &'static str {
        "Breaker"
    }
}

pub fn breaker(trip: impl TripStrategy, step: StepRef) -> StepRef {
    breaker_boxed(Box::new(trip), step)
}

pub fn breaker_boxed(trip: Box<dyn TripStrategy>, step: StepRef) -> StepRef {
    if step.is_end() {
        return step;
    }
    Arc::new(Breaker {
        trip: Mutex::new(trip),
        step,
        open: AtomicBool::new(false),
    })
}
