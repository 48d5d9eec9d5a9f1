//! Mock steps shared by the Cadence test suites.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::time::Instant;

use cadence_core::{step_fn, Context, Step, StepRef, Transition};

/// What a mock step resolves to on one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    End,
    /// Resolve to the mock step itself.
    Again,
    Fail(String),
    Restart(String),
}

impl Outcome {
    fn resolve(self, this: StepRef) -> Transition {
        match self {
            Outcome::End => Transition::End,
            Outcome::Again => Transition::Next(this),
            Outcome::Fail(msg) => Transition::fail(msg),
            Outcome::Restart(msg) => Transition::restart(msg),
        }
    }
}

struct Script {
    script: Mutex<VecDeque<Outcome>>,
    fallback: Outcome,
    delay: Duration,
    calls: Mutex<Vec<Instant>>,
}

impl Script {
    fn new(script: Vec<Outcome>, fallback: Outcome, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            fallback,
            delay,
            calls: Mutex::new(Vec::new()),
        })
    }

    fn next_outcome(&self) -> Outcome {
        self.calls.lock().unwrap().push(Instant::now());
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

impl Step for Script {
    fn run(self: Arc<Self>, _ctx: Context) -> BoxFuture<'static, Transition> {
        Box::pin(async move {
            let outcome = self.next_outcome();
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            outcome.resolve(self)
        })
    }

    fn name(&self) -> &'static str {
        "Scripted"
    }
}

/// A mock step that plays back a script of outcomes, then repeats a
/// fallback, recording when it was invoked.
#[derive(Clone)]
pub struct ScriptedStep {
    inner: Arc<Script>,
}

impl ScriptedStep {
    pub fn new(script: Vec<Outcome>, fallback: Outcome) -> Self {
        Self {
            inner: Script::new(script, fallback, Duration::ZERO),
        }
    }

    pub fn always(outcome: Outcome) -> Self {
        Self::new(Vec::new(), outcome)
    }

    pub fn as_step(&self) -> StepRef {
        self.inner.clone()
    }

    pub fn calls(&self) -> usize {
        self.inner.calls.lock().unwrap().len()
    }

    /// Invocation instants on the tokio clock.
    pub fn call_times(&self) -> Vec<Instant> {
        self.inner.calls.lock().unwrap().clone()
    }

    /// Time between consecutive invocations, the first measured from `start`.
    pub fn gaps(&self, start: Instant) -> Vec<Duration> {
        let mut previous = start;
        self.call_times()
            .into_iter()
            .map(|t| {
                let gap = t - previous;
                previous = t;
                gap
            })
            .collect()
    }
}

/// A mock step that sleeps for a fixed time, ignoring cancellation, before
/// resolving to its outcome.
#[derive(Clone)]
pub struct SleepingStep {
    inner: Arc<Script>,
}

impl SleepingStep {
    pub fn new(sleep: Duration, outcome: Outcome) -> Self {
        Self {
            inner: Script::new(Vec::new(), outcome, sleep),
        }
    }

    pub fn as_step(&self) -> StepRef {
        self.inner.clone()
    }

    pub fn calls(&self) -> usize {
        self.inner.calls.lock().unwrap().len()
    }
}

struct SelfStep;

impl Step for SelfStep {
    fn run(self: Arc<Self>, _ctx: Context) -> BoxFuture<'static, Transition> {
        Box::pin(async move { Transition::Next(self) })
    }

    fn name(&self) -> &'static str {
        "SelfStep"
    }
}

/// A step that always resolves to itself.
pub fn self_step() -> StepRef {
    Arc::new(SelfStep)
}

/// A step that resolves to a stop error step carrying `msg`.
pub fn failing_step(msg: &str) -> StepRef {
    let msg = msg.to_string();
    step_fn(move |_| {
        let msg = msg.clone();
        async move { Transition::fail(msg) }
    })
}
