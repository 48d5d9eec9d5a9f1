use std::sync::{Arc, Mutex, PoisonError};

use futures::future::BoxFuture;
use tokio::sync::oneshot::{self, error::TryRecvError};
use tokio::task::AbortHandle;
use tracing::{debug, error};

use cadence_core::{CadenceError, Context, Failure, Step, StepRef, Transition};

enum Slot {
    Idle,
    Waiting {
        generation: u64,
        rx: oneshot::Receiver<Transition>,
        worker: AbortHandle,
    },
    Done {
        generation: u64,
        result: Transition,
    },
}

impl Slot {
    fn generation(&self) -> Option<u64> {
        match self {
            Slot::Idle => None,
            Slot::Waiting { generation, .. } | Slot::Done { generation, .. } => Some(*generation),
        }
    }
}

/// Runs a sub-workflow on a background task and hands back `Pending` until
/// its result is available.
///
/// The worker is launched once per entry of the run, no matter how many
/// times (or from how many tasks) the step is polled. Every poll of that
/// entry resolves to the same result. Restarting the run starts a new entry,
/// which launches the work again.
pub struct NonBlocking {
    step: StepRef,
    slot: Mutex<Slot>,
}

impl NonBlocking {
    fn launch(&self, ctx: Context) -> (oneshot::Receiver<Transition>, AbortHandle) {
        let (tx, rx) = oneshot::channel();
        let step = self.step.clone();
        let worker = tokio::spawn(async move {
            let _ = tx.send(step.run(ctx).await);
        });
        debug!(step = self.step.name(), "Non-blocking worker launched");
        (rx, worker.abort_handle())
    }

    fn poll(self: Arc<Self>, ctx: Context) -> Transition {
        let generation = ctx.generation();
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);

        match slot.generation() {
            Some(seen) if seen != generation => {
                debug!(step = self.step.name(), generation, "Run restarted, relaunching worker");
                if let Slot::Waiting { worker, .. } = &*slot {
                    worker.abort();
                }
                *slot = Slot::Idle;
            }
            _ => {}
        }
        if let Slot::Idle = *slot {
            let (rx, worker) = self.launch(ctx);
            *slot = Slot::Waiting {
                generation,
                rx,
                worker,
            };
        }

        let polled = match &mut *slot {
            Slot::Waiting { rx, .. } => rx.try_recv(),
            Slot::Done { result, .. } => return result.clone(),
            Slot::Idle => return Transition::Pending(self.clone()),
        };

        let result = match polled {
            Err(TryRecvError::Empty) => {
                drop(slot);
                return Transition::Pending(self);
            }
            Ok(next) => next,
            Err(TryRecvError::Closed) => {
                error!(step = self.step.name(), "Non-blocking worker exited without a result");
                Transition::Fail(Failure::stop(CadenceError::Worker(
                    "non-blocking worker exited without a result".to_string(),
                )))
            }
        };
        *slot = Slot::Done {
            generation,
            result: result.clone(),
        };
        result
    }
}

impl Step for NonBlocking {
    fn run(self: Arc<Self>, ctx: Context) -> BoxFuture<'static, Transition> {
        // The first poll launches; it may already see the result.
        Box::pin(async move { self.poll(ctx) })
    }

    fn name(&self) -> &'static str {
        "NonBlocking"
    }
}

/// Run `step` in the background; the returned step polls for its result
/// without blocking the driver.
pub fn non_blocking(step: StepRef) -> StepRef {
    if step.is_end() {
        return step;
    }
    Arc::new(NonBlocking {
        step,
        slot: Mutex::new(Slot::Idle),
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use cadence_core::end;
    use cadence_test_utils::{Outcome, ScriptedStep, SleepingStep};

    use super::*;

    #[test]
    fn over_end_is_end() {
        assert!(non_blocking(end()).is_end());
    }

    #[tokio::test]
    async fn first_poll_is_pending_then_result() {
        let inner = ScriptedStep::always(Outcome::End);
        let step = non_blocking(inner.as_step());

        // The worker cannot have run yet on a current-thread runtime.
        let first = step.clone().run(Context::new()).await;
        let wait = match first {
            Transition::Pending(wait) => wait,
            other => panic!("expected pending, got {:?}", other),
        };
        assert!(Arc::ptr_eq(&wait, &step));

        tokio::task::yield_now().await;
        assert!(wait.run(Context::new()).await.is_end());
        assert_eq!(inner.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn worker_launches_once_regardless_of_polls() {
        let inner = SleepingStep::new(Duration::from_millis(50), Outcome::End);
        let step = non_blocking(inner.as_step());

        let mut polls = 0;
        let mut current = step;
        loop {
            polls += 1;
            match current.run(Context::new()).await {
                Transition::Pending(next) => {
                    current = next;
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                Transition::End => break,
                other => panic!("unexpected {:?}", other),
            }
        }

        assert!(polls > 2);
        assert_eq!(inner.calls(), 1);
    }

    #[tokio::test]
    async fn concurrent_pollers_share_one_worker() {
        let inner = ScriptedStep::always(Outcome::End);
        let step = non_blocking(inner.as_step());

        let a = tokio::spawn(step.clone().run(Context::new()));
        let b = tokio::spawn(step.clone().run(Context::new()));
        let _ = a.await;
        let _ = b.await;

        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert_eq!(inner.calls(), 1);
    }

    #[tokio::test]
    async fn result_transition_is_passed_through() {
        let inner = ScriptedStep::always(Outcome::Fail("bad".into()));
        let step = non_blocking(inner.as_step());

        let mut current = step;
        let last = loop {
            match current.run(Context::new()).await {
                Transition::Pending(next) => {
                    current = next;
                    tokio::task::yield_now().await;
                }
                other => break other,
            }
        };
        assert_eq!(
            last.failure().map(|f| f.cause().clone()),
            Some(CadenceError::Step("bad".into()))
        );
    }

    #[tokio::test]
    async fn finished_worker_result_is_replayed_to_every_poller() {
        let inner = ScriptedStep::new(vec![Outcome::Again], Outcome::End);
        let step = non_blocking(inner.as_step());

        assert!(step.clone().run(Context::new()).await.is_pending());
        tokio::task::yield_now().await;

        for _ in 0..3 {
            let next = step.clone().run(Context::new()).await;
            let continued = next.step().expect("worker result");
            assert!(Arc::ptr_eq(continued, &inner.as_step()));
        }
        assert_eq!(inner.calls(), 1);
    }

    #[tokio::test]
    async fn same_handle_in_parallel_runs_its_worker_once() {
        let inner = ScriptedStep::always(Outcome::End);
        let step = non_blocking(inner.as_step());

        let result = crate::driver::run_parallel(&Context::new(), vec![step.clone(), step]).await;

        assert_eq!(result, Ok(()));
        assert_eq!(inner.calls(), 1);
    }

    #[tokio::test]
    async fn restart_relaunches_the_worker() {
        let inner = ScriptedStep::new(
            vec![Outcome::Restart("first".into()), Outcome::Restart("second".into())],
            Outcome::End,
        );

        let result = crate::driver::run(&Context::new(), vec![non_blocking(inner.as_step())]).await;

        assert_eq!(result, Ok(()));
        assert_eq!(inner.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_abandons_an_unfinished_worker() {
        let inner = SleepingStep::new(Duration::from_millis(50), Outcome::End);
        let step = non_blocking(inner.as_step());
        let ctx = Context::new().for_run(step.clone(), None);

        assert!(step.clone().run(ctx.clone()).await.is_pending());
        tokio::task::yield_now().await;
        assert_eq!(inner.calls(), 1);

        let again = ctx.restart().expect("anchor");
        assert!(again.run(ctx.clone()).await.is_pending());
        tokio::task::yield_now().await;
        assert_eq!(inner.calls(), 2);

        let mut current = step;
        loop {
            match current.run(ctx.clone()).await {
                Transition::Pending(next) => {
                    current = next;
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                Transition::End => break,
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(inner.calls(), 2);
    }
}
