use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::task::JoinSet;
use tracing::error;

use cadence_core::{CadenceError, Context, Failure, Step, StepRef, Transition};

use crate::aggregate::{aggregate, aggregate_steps, into_step};

/// Runs each of its steps on its own tokio task and waits for all of them.
///
/// Survivors are collected in completion order, so callers must treat them
/// as a set.
pub struct Parallel {
    steps: Vec<StepRef>,
}

impl Parallel {
    /// Aggregator used by the concurrent combinators.
    pub fn combine(steps: Vec<StepRef>) -> StepRef {
        Arc::new(Self { steps })
    }
}

impl Step for Parallel {
    fn run(self: Arc<Self>, ctx: Context) -> BoxFuture<'static, Transition> {
        Box::pin(async move {
            let mut workers = JoinSet::new();
            for step in self.steps.iter().cloned() {
                workers.spawn(step.run(ctx.clone()));
            }

            let mut next = Vec::with_capacity(self.steps.len());
            while let Some(joined) = workers.join_next().await {
                match joined {
                    Ok(t) => next.push(t),
                    Err(e) => {
                        error!(error = %e, "Parallel worker failed");
                        next.push(Transition::Fail(Failure::stop(CadenceError::Worker(
                            e.to_string(),
                        ))));
                    }
                }
            }
            aggregate(Parallel::combine, next)
        })
    }

    fn name(&self) -> &'static str {
        "Parallel"
    }
}

/// Concurrent fan-out/fan-in over `steps`.
pub fn parallel(steps: impl IntoIterator<Item = StepRef>) -> StepRef {
    into_step(aggregate_steps(Parallel::combine, steps))
}
