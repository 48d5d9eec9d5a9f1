//! Rate limiting of a group of steps.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::time::Instant;
use tracing::debug;

use cadence_core::{end, Context, Step, StepRef, Transition};

use crate::aggregate::aggregate;
use crate::batch::Batch;
use crate::timer::run_at;

/// Tells the limiter whether the current invocation must be stalled, and by
/// how much.
pub trait LimitStrategy: Send + 'static {
    fn check(&mut self) -> (bool, Duration);
}

impl<F> LimitStrategy for F
where
    F: FnMut() -> (bool, Duration) + Send + 'static,
{
    fn check(&mut self) -> (bool, Duration) {
        self()
    }
}

/// Lets `count` calls through per window. Every `count`-th call stalls for
/// `window / count` and starts a new window.
#[derive(Debug, Clone)]
pub struct FixedWindow {
    count: u32,
    remaining: u32,
    stall: Duration,
}

impl FixedWindow {
    /// A `count` of zero is treated as one.
    pub fn new(count: u32, window: Duration) -> Self {
        let count = count.max(1);
        Self {
            count,
            remaining: count,
            stall: window / count,
        }
    }
}

impl LimitStrategy for FixedWindow {
    fn check(&mut self) -> (bool, Duration) {
        if self.remaining > 1 {
            self.remaining -= 1;
            return (false, Duration::ZERO);
        }
        self.remaining = self.count;
        (true, self.stall)
    }
}

type SharedLimit = Arc<Mutex<Box<dyn LimitStrategy>>>;

fn check(limit: &SharedLimit) -> (bool, Duration) {
    limit.lock().unwrap_or_else(PoisonError::into_inner).check()
}

/// Invoke `steps` in order. A stalled invocation staggers them: the i-th one
/// starts `i * delay` after the first.
async fn limited(ctx: &Context, limit: &SharedLimit, steps: &[StepRef]) -> Vec<Transition> {
    let (stall, delay) = check(limit);
    let mut next = Vec::with_capacity(steps.len());
    if stall {
        debug!(
            steps = steps.len(),
            delay_ms = delay.as_millis() as u64,
            "Rate limit reached, staggering steps"
        );
        let start = Instant::now();
        for (i, step) in steps.iter().enumerate() {
            let offset = delay.saturating_mul(i as u32);
            next.push(run_at(ctx, start + offset, step.clone()).await);
        }
    } else {
        for step in steps {
            next.push(step.clone().run(ctx.clone()).await);
        }
    }
    next
}

/// Runs its steps sequentially under a limit strategy, then re-aggregates
/// the survivors as a [`Batch`].
pub struct RateLimit {
    limit: SharedLimit,
    steps: Vec<StepRef>,
}

impl Step for RateLimit {
    fn run(self: Arc<Self>, ctx: Context) -> BoxFuture<'static, Transition> {
        Box::pin(async move {
            let results = limited(&ctx, &self.limit, &self.steps).await;
            aggregate(Batch::combine, results)
        })
    }

    fn name(&self) -> &'static str {
        "RateLimit"
    }
}

/// Put `steps` under `limit` for one invocation. Terminal steps are
/// dropped; with nothing left the result is `End`.
pub fn rate_limit(limit: impl LimitStrategy, steps: impl IntoIterator<Item = StepRef>) -> StepRef {
    rate_limit_boxed(Box::new(limit), steps)
}

pub fn rate_limit_boxed(
    limit: Box<dyn LimitStrategy>,
    steps: impl IntoIterator<Item = StepRef>,
) -> StepRef {
    let steps: Vec<StepRef> = steps.into_iter().filter(|s| !s.is_end()).collect();
    if steps.is_empty() {
        return end();
    }
    Arc::new(RateLimit {
        limit: Arc::new(Mutex::new(limit)),
        steps,
    })
}

/// Like [`RateLimit`], but the successors stay under the same limiter, so
/// the window keeps counting across ticks.
///
/// The group is pending while every step in it is. Once any step fails the
/// group leaves the limiter and the survivors are re-aggregated as a
/// [`Batch`], in input order.
pub struct Throttle {
    limit: SharedLimit,
    steps: Vec<StepRef>,
}

impl Step for Throttle {
    fn run(self: Arc<Self>, ctx: Context) -> BoxFuture<'static, Transition> {
        Box::pin(async move {
            let results = limited(&ctx, &self.limit, &self.steps).await;
            if results.iter().any(Transition::is_failure) {
                return aggregate(Batch::combine, results);
            }

            let all_pending = results
                .iter()
                .filter(|t| !t.is_end())
                .all(Transition::is_pending);
            let successors: Vec<StepRef> =
                results.into_iter().filter_map(Transition::into_step).collect();
            if successors.is_empty() {
                return Transition::End;
            }

            let next: StepRef = if successors.len() == self.steps.len()
                && successors.iter().zip(&self.steps).all(|(a, b)| Arc::ptr_eq(a, b))
            {
                self
            } else {
                Arc::new(Throttle {
                    limit: self.limit.clone(),
                    steps: successors,
                })
            };
            if all_pending {
                Transition::Pending(next)
            } else {
                Transition::Next(next)
            }
        })
    }

    fn name(&self) -> &'static str {
        "Throttle"
    }
}

/// Keep `steps` and everything they continue with under `limit`.
pub fn throttle(limit: impl LimitStrategy, steps: impl IntoIterator<Item = StepRef>) -> StepRef {
    let steps: Vec<StepRef> = steps.into_iter().filter(|s| !s.is_end()).collect();
    if steps.is_empty() {
        return end();
    }
    Arc::new(Throttle {
        limit: Arc::new(Mutex::new(Box::new(limit))),
        steps,
    })
}

#[cfg(test)]
mod tests {
    use cadence_core::step_fn;

    use crate::driver::run;
    use crate::nonblock::non_blocking;
    use cadence_test_utils::{Outcome, ScriptedStep, SleepingStep};

    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn fixed_window_stalls_every_count_th_call() {
        let mut window = FixedWindow::new(4, ms(10));
        let stalls: Vec<usize> = (1..=12)
            .filter(|_| window.check().0)
            .collect();
        assert_eq!(stalls, vec![4, 8, 12]);
    }

    #[test]
    fn fixed_window_stall_duration() {
        let mut window = FixedWindow::new(4, ms(10));
        for _ in 0..3 {
            assert_eq!(window.check(), (false, Duration::ZERO));
        }
        assert_eq!(window.check(), (true, Duration::from_micros(2500)));
    }

    #[test]
    fn zero_count_behaves_like_one() {
        let mut window = FixedWindow::new(0, ms(10));
        assert_eq!(window.check(), (true, ms(10)));
        assert_eq!(window.check(), (true, ms(10)));
    }

    #[test]
    fn no_live_steps_is_end() {
        assert!(rate_limit(FixedWindow::new(1, ms(1)), Vec::new()).is_end());
        assert!(rate_limit(FixedWindow::new(1, ms(1)), vec![end()]).is_end());
    }

    #[tokio::test(start_paused = true)]
    async fn unstalled_calls_run_immediately() {
        let a = ScriptedStep::always(Outcome::End);
        let b = ScriptedStep::always(Outcome::End);
        let start = Instant::now();

        let next = rate_limit(|| (false, Duration::ZERO), vec![a.as_step(), b.as_step()])
            .run(Context::new())
            .await;

        assert!(next.is_end());
        assert_eq!(a.call_times(), vec![start]);
        assert_eq!(b.call_times(), vec![start]);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_calls_are_staggered_by_position() {
        let steps: Vec<_> = (0..3).map(|_| ScriptedStep::always(Outcome::End)).collect();
        let start = Instant::now();

        rate_limit(|| (true, ms(10)), steps.iter().map(|s| s.as_step()))
            .run(Context::new())
            .await;

        let offsets: Vec<Duration> = steps.iter().map(|s| s.call_times()[0] - start).collect();
        assert_eq!(offsets, vec![ms(0), ms(10), ms(20)]);
    }

    #[tokio::test(start_paused = true)]
    async fn single_survivor_collapses_to_itself() {
        let step = ScriptedStep::always(Outcome::Again);

        let next = rate_limit(FixedWindow::new(1, ms(10)), vec![step.as_step()])
            .run(Context::new())
            .await;

        assert!(Arc::ptr_eq(next.step().expect("survivor"), &step.as_step()));
    }

    #[tokio::test(start_paused = true)]
    async fn limiter_only_applies_to_the_limited_tick() {
        let a = ScriptedStep::always(Outcome::Again);
        let b = ScriptedStep::always(Outcome::Again);
        let start = Instant::now();
        let mut current = rate_limit(FixedWindow::new(1, ms(10)), vec![a.as_step(), b.as_step()]);

        for _ in 0..3 {
            current = current
                .run(Context::new())
                .await
                .into_step()
                .expect("survivors");
            assert_eq!(current.name(), "Batch");
        }

        // Only the first tick stalls; later ticks run the batch back to back.
        let offsets: Vec<Duration> = b.call_times().iter().map(|t| *t - start).collect();
        assert_eq!(offsets, vec![ms(10), ms(10), ms(10)]);
    }

    type Seen = Arc<Mutex<Vec<(&'static str, bool)>>>;

    /// Continues with a step that records whether the run was already
    /// cancelled when it got its turn.
    fn observed(name: &'static str, seen: &Seen) -> StepRef {
        let seen = seen.clone();
        let record = step_fn(move |ctx: Context| {
            seen.lock().unwrap().push((name, ctx.is_cancelled()));
            async { Transition::End }
        });
        step_fn(move |_| {
            let record = record.clone();
            async move { Transition::Next(record) }
        })
    }

    #[tokio::test]
    async fn survivors_keep_input_order() {
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let bad = ScriptedStep::always(Outcome::Fail("boom".into()));

        let next = rate_limit(
            || (false, Duration::ZERO),
            vec![observed("first", &seen), bad.as_step(), observed("last", &seen)],
        )
        .run(Context::new())
        .await;

        // The error step sits between the two survivors and cancels the run
        // before the last one gets its turn.
        let ctx = Context::new().for_run(end(), None);
        let after = next.into_step().expect("batch").run(ctx).await;

        assert!(after.is_end());
        assert_eq!(*seen.lock().unwrap(), vec![("first", false), ("last", true)]);
    }

    #[tokio::test(start_paused = true)]
    async fn throttled_successors_share_the_window() {
        let a = ScriptedStep::always(Outcome::Again);
        let b = ScriptedStep::always(Outcome::Again);
        let start = Instant::now();
        let mut current = throttle(FixedWindow::new(2, ms(20)), vec![a.as_step(), b.as_step()]);

        for _ in 0..4 {
            current = current
                .run(Context::new())
                .await
                .into_step()
                .expect("throttled step");
            assert_eq!(current.name(), "Throttle");
        }

        // Every second tick stalls `b` by 20ms / 2.
        let offsets: Vec<Duration> = b.call_times().iter().map(|t| *t - start).collect();
        assert_eq!(offsets, vec![ms(0), ms(10), ms(10), ms(20)]);
    }

    #[tokio::test]
    async fn throttle_releases_the_group_on_failure() {
        let ok = ScriptedStep::always(Outcome::Again);
        let bad = ScriptedStep::always(Outcome::Fail("boom".into()));

        let next = throttle(|| (false, Duration::ZERO), vec![ok.as_step(), bad.as_step()])
            .run(Context::new())
            .await;

        assert_eq!(next.into_step().expect("batch").name(), "Batch");
    }

    #[tokio::test]
    async fn throttled_background_work_yields_to_its_worker() {
        let inner = ScriptedStep::always(Outcome::End);
        let group = throttle(|| (false, Duration::ZERO), vec![non_blocking(inner.as_step())]);

        let first = group.clone().run(Context::new()).await;
        match &first {
            Transition::Pending(next) => assert!(Arc::ptr_eq(next, &group)),
            other => panic!("expected pending, got {:?}", other),
        }

        assert_eq!(run(&Context::new(), vec![group]).await, Ok(()));
        assert_eq!(inner.calls(), 1);
    }

    #[tokio::test]
    async fn throttle_is_not_pending_while_a_step_is_ready() {
        let busy = ScriptedStep::always(Outcome::Again);
        let background = SleepingStep::new(Duration::from_secs(1), Outcome::End);

        let next = throttle(
            || (false, Duration::ZERO),
            vec![non_blocking(background.as_step()), busy.as_step()],
        )
        .run(Context::new())
        .await;

        assert!(matches!(next, Transition::Next(_)));
    }
}
