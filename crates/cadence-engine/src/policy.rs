//! Config-driven compositions of the resilience combinators.

use std::time::Duration;

use tracing::debug;

use cadence_core::config::{BreakerConfig, RateLimitConfig, RetryConfig};
use cadence_core::{CadenceConfig, StepRef};

use crate::backoff::{backoff_boxed, delay_strategy};
use crate::breaker::{breaker_boxed, MaxTriesTrip, TimedTrip, TripStrategy};
use crate::batch::batch;
use crate::rate_limit::{throttle, FixedWindow};
use crate::retry::retry;
use crate::timeout::timeout;
use crate::timer::every;

/// Wraps steps in retry, backoff, breaker, timeout and rate-limit layers as
/// described by a [`CadenceConfig`].
///
/// Strategies are stateful, so every guard call builds fresh ones.
#[derive(Debug, Clone)]
pub struct ResiliencePolicy {
    retry: RetryConfig,
    breaker: BreakerConfig,
    step_timeout: Option<Duration>,
    rate_limit: Option<RateLimitConfig>,
}

impl ResiliencePolicy {
    pub fn from_config(config: &CadenceConfig) -> Self {
        Self {
            retry: config.retry.clone(),
            breaker: config.breaker.clone(),
            step_timeout: config.timeout.step_timeout(),
            rate_limit: config.rate_limit.clone(),
        }
    }

    fn bounded(&self, step: StepRef) -> StepRef {
        match self.step_timeout {
            Some(max) => timeout(max, step),
            None => step,
        }
    }

    fn trip(&self) -> Box<dyn TripStrategy> {
        let max_tries = MaxTriesTrip::new(self.breaker.max_tries);
        match self.breaker.window() {
            Some(window) => Box::new(TimedTrip::new(window, max_tries)),
            None => Box::new(max_tries),
        }
    }

    /// Guard one-shot work: each attempt is bounded by the step timeout and
    /// preceded by the configured backoff, with up to `max_retries` retries.
    pub fn guard_once(&self, step: StepRef) -> StepRef {
        debug!(
            max_retries = self.retry.max_retries,
            step_timeout = ?self.step_timeout,
            "Guarding one-shot step"
        );
        let attempt = backoff_boxed(delay_strategy(&self.retry), self.bounded(step));
        retry(self.retry.max_retries, attempt)
    }

    /// Guard periodic work: every `interval` the steps re-run in order, each
    /// behind its own circuit breaker. With a rate limit configured the
    /// group is throttled, the window counting across ticks.
    pub fn guard_periodic(
        &self,
        interval: Duration,
        steps: impl IntoIterator<Item = StepRef>,
    ) -> StepRef {
        let guarded: Vec<StepRef> = steps
            .into_iter()
            .map(|step| breaker_boxed(self.trip(), self.bounded(step)))
            .collect();
        debug!(
            interval_ms = interval.as_millis() as u64,
            steps = guarded.len(),
            max_tries = self.breaker.max_tries,
            rate_limited = self.rate_limit.is_some(),
            "Guarding periodic steps"
        );
        let group = match &self.rate_limit {
            Some(rl) => throttle(FixedWindow::new(rl.count, rl.window()), guarded),
            None => batch(guarded),
        };
        every(interval, group)
    }
}

#[cfg(test)]
mod tests {
    use cadence_core::config::BackoffKind;
    use cadence_core::{Context, FailureKind, Transition};
    use cadence_test_utils::{Outcome, ScriptedStep, SleepingStep};

    use super::*;

    fn config() -> CadenceConfig {
        let mut config = CadenceConfig::default();
        config.retry = RetryConfig {
            max_retries: 2,
            strategy: BackoffKind::Constant,
            initial_backoff_ms: 10,
            ..RetryConfig::default()
        };
        config
    }

    async fn drive(mut step: StepRef) -> Transition {
        loop {
            match step.run(Context::new()).await {
                Transition::Next(next) => step = next,
                other => return other,
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn once_retries_with_backoff() {
        let policy = ResiliencePolicy::from_config(&config());
        let step = ScriptedStep::always(Outcome::Fail("down".into()));
        let start = tokio::time::Instant::now();

        let last = drive(policy.guard_once(step.as_step())).await;

        assert!(last.is_failure());
        assert_eq!(step.calls(), 3);
        assert_eq!(start.elapsed(), Duration::from_millis(30));
    }

    #[tokio::test(start_paused = true)]
    async fn once_applies_step_timeout() {
        let mut config = config();
        config.retry.max_retries = 0;
        config.timeout.step_timeout_ms = Some(50);
        let policy = ResiliencePolicy::from_config(&config);

        let last = drive(policy.guard_once(
            SleepingStep::new(Duration::from_secs(5), Outcome::End).as_step(),
        ))
        .await;

        assert_eq!(last.failure().map(|f| f.kind()), Some(FailureKind::TimeoutExceeded));
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_opens_breaker_after_max_tries() {
        let mut config = config();
        config.breaker.max_tries = 1;
        let policy = ResiliencePolicy::from_config(&config);
        let step = ScriptedStep::always(Outcome::Fail("down".into()));

        let last =
            drive(policy.guard_periodic(Duration::from_millis(5), vec![step.as_step()])).await;

        assert_eq!(last.failure().map(|f| f.kind()), Some(FailureKind::BreakerOpen));
        assert_eq!(step.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_group_is_throttled_across_ticks() {
        let mut config = config();
        config.rate_limit = Some(RateLimitConfig {
            count: 1,
            window_ms: 10,
        });
        let policy = ResiliencePolicy::from_config(&config);
        let a = ScriptedStep::always(Outcome::Again);
        let b = ScriptedStep::always(Outcome::Again);
        let start = tokio::time::Instant::now();

        let mut current =
            policy.guard_periodic(Duration::from_millis(5), vec![a.as_step(), b.as_step()]);
        for _ in 0..2 {
            current = current.run(Context::new()).await.into_step().expect("periodic");
        }

        let ms = Duration::from_millis;
        assert_eq!(a.gaps(start), vec![ms(5), ms(15)]);
        assert_eq!(b.gaps(start), vec![ms(15), ms(15)]);
    }
}
