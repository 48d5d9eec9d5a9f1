use std::sync::Arc;

use futures::future::BoxFuture;

use cadence_core::{Context, Step, StepRef, Transition};

use crate::aggregate::{aggregate, aggregate_steps, into_step};

/// Runs its steps one after another on the calling task and aggregates the
/// survivors in input order.
pub struct Batch {
    steps: Vec<StepRef>,
}

impl Batch {
    /// Aggregator used by the sequential combinators.
    pub fn combine(steps: Vec<StepRef>) -> StepRef {
        Arc::new(Self { steps })
    }
}

impl Step for Batch {
    fn run(self: Arc<Self>, ctx: Context) -> BoxFuture<'static, Transition> {
        Box::pin(async move {
            let mut next = Vec::with_capacity(self.steps.len());
            for step in &self.steps {
                next.push(step.clone().run(ctx.clone()).await);
            }
            aggregate(Batch::combine, next)
        })
    }

    fn name(&self) -> &'static str {
        "Batch"
    }
}

/// Sequential fan-out/fan-in over `steps`.
pub fn batch(steps: impl IntoIterator<Item = StepRef>) -> StepRef {
    into_step(aggregate_steps(Batch::combine, steps))
}
