use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::warn;

use cadence_core::{Context, Step, StepRef, Transition};

/// Re-invokes its step on the following tick whenever it resolves to an
/// error step, until the retry budget is spent.
pub struct Retry {
    remaining: u32,
    attempt: u32,
    step: StepRef,
}

impl Step for Retry {
    fn run(self: Arc<Self>, ctx: Context) -> BoxFuture<'static, Transition> {
        Box::pin(async move {
            let next = self.step.clone().run(ctx.clone()).await;
            let Transition::Fail(failure) = next else {
                return next;
            };

            if ctx.is_cancelled() {
                return Transition::cancelled(&ctx);
            }
            if self.remaining == 0 {
                return Transition::Fail(failure);
            }

            warn!(
                step = self.step.name(),
                attempt = self.attempt,
                remaining = self.remaining,
                error = %failure,
                "Step failed, retrying"
            );
            Transition::next(Retry {
                remaining: self.remaining - 1,
                attempt: self.attempt + 1,
                step: self.step.clone(),
            })
        })
    }

    fn name(&self) -> &'static str {
        "Retry"
    }
}

/// Retry `step` up to `retries` times after its first failure, one attempt
/// per driver tick. Non-error transitions pass through untouched.
pub fn retry(retries: u32, step: StepRef) -> StepRef {
    if step.is_end() {
        return step;
    }
    Arc::new(Retry {
        remaining: retries,
        attempt: 1,
        step,
    })
}

#[cfg(test)]
mod tests {
    use cadence_core::{end, CadenceError, FailureKind};
    use cadence_test_utils::{Outcome, ScriptedStep};

    use super::*;

    async fn drive(mut step: StepRef, ctx: &Context) -> Transition {
        loop {
            match step.run(ctx.clone()).await {
                Transition::Next(next) => step = next,
                other => return other,
            }
        }
    }

    #[test]
    fn over_end_is_end() {
        assert!(retry(3, end()).is_end());
    }

    #[tokio::test]
    async fn exhausted_budget_surfaces_last_failure() {
        let step = ScriptedStep::always(Outcome::Fail("nope".into()));
        let last = drive(retry(3, step.as_step()), &Context::new()).await;

        assert_eq!(step.calls(), 4);
        assert_eq!(
            last.failure().map(|f| f.cause().clone()),
            Some(CadenceError::Step("nope".into()))
        );
    }

    #[tokio::test]
    async fn zero_retries_is_a_single_attempt() {
        let step = ScriptedStep::always(Outcome::Fail("nope".into()));
        let last = drive(retry(0, step.as_step()), &Context::new()).await;
        assert!(last.is_failure());
        assert_eq!(step.calls(), 1);
    }

    #[tokio::test]
    async fn each_retry_is_a_separate_tick() {
        let step = ScriptedStep::always(Outcome::Fail("nope".into()));
        let first = retry(2, step.as_step()).run(Context::new()).await;

        assert_eq!(step.calls(), 1);
        assert_eq!(first.step().map(|s| s.name()), Some("Retry"));
    }

    #[tokio::test]
    async fn success_is_not_retried() {
        let step = ScriptedStep::new(vec![Outcome::Fail("flaky".into())], Outcome::End);
        let last = drive(retry(5, step.as_step()), &Context::new()).await;

        assert!(last.is_end());
        assert_eq!(step.calls(), 2);
    }

    #[tokio::test]
    async fn cancellation_preempts_retry() {
        let step = ScriptedStep::always(Outcome::Fail("nope".into()));
        let ctx = Context::new();
        ctx.cancel_with_cause(CadenceError::Step("shutdown".into()));

        let next = retry(5, step.as_step()).run(ctx).await;

        let failure = next.failure().expect("failure");
        assert_eq!(failure.kind(), FailureKind::Cancelled);
        assert_eq!(failure.cause(), &CadenceError::Step("shutdown".into()));
    }
}
