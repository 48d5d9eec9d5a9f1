//! The driver loop: invoke the current step until the workflow ends or its
//! context is done.

use std::sync::Arc;

use tracing::{debug, info_span, trace, warn, Instrument};

use cadence_core::{Context, Result, RunId, StepRef, Transition};

use crate::aggregate::{aggregate_steps, into_step, Aggregator};
use crate::batch::Batch;
use crate::parallel::Parallel;

/// Run `steps` as one sequential workflow until it ends.
///
/// Returns the cause recorded on the run's context: `Ok(())` when the
/// workflow finished without an error step and was never cancelled.
pub async fn run(ctx: &Context, steps: impl IntoIterator<Item = StepRef>) -> Result<()> {
    drive(ctx, Batch::combine, steps.into_iter().collect()).await
}

/// Like [`run`], but every aggregation fans out concurrently.
pub async fn run_parallel(ctx: &Context, steps: impl IntoIterator<Item = StepRef>) -> Result<()> {
    drive(ctx, Parallel::combine, steps.into_iter().collect()).await
}

async fn drive(ctx: &Context, combine: Aggregator, steps: Vec<StepRef>) -> Result<()> {
    let first = aggregate_steps(combine, steps);
    if first.is_end() {
        return Ok(());
    }

    let anchor = into_step(first);
    let run_ctx = ctx.for_run(anchor.clone(), Some(RunId::new()));
    let run_id = run_ctx.run_id().cloned().unwrap_or_default();
    let span = info_span!("run", run_id = %run_id);

    async move {
        debug!(step = anchor.name(), "Run started");
        let mut current = anchor;
        let mut ticks: u64 = 0;

        while !run_ctx.is_cancelled() {
            ticks += 1;
            trace!(tick = ticks, step = current.name(), "Tick");

            match current.run(run_ctx.clone()).await {
                Transition::Next(next) => current = next,
                Transition::Pending(next) => {
                    current = next;
                    tokio::task::yield_now().await;
                }
                Transition::Fail(failure) => {
                    warn!(kind = ?failure.kind(), error = %failure, "Step failed");
                    current = Arc::new(failure);
                }
                Transition::End => break,
            }
        }

        let result = match run_ctx.cause() {
            Some(cause) => Err(cause),
            None => Ok(()),
        };
        // Release any worker still holding the run context.
        run_ctx.cancel();

        match &result {
            Ok(()) => debug!(ticks, "Run finished"),
            Err(e) => debug!(ticks, error = %e, "Run finished with error"),
        }
        result
    }
    .instrument(span)
    .await
}
