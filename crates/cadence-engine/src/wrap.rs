//! Adapters from plain fallible async calls to steps.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::debug;

use cadence_core::{CadenceError, Context, Step, StepRef, Transition};

struct Wrapped<F, E> {
    f: F,
    repeat: bool,
    _err: PhantomData<fn() -> E>,
}

impl<F, Fut, E> Step for Wrapped<F, E>
where
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: Into<CadenceError> + 'static,
{
    fn run(self: Arc<Self>, ctx: Context) -> BoxFuture<'static, Transition> {
        let call = (self.f)(ctx);
        Box::pin(async move {
            match call.await {
                Err(e) => {
                    let err: CadenceError = e.into();
                    debug!(error = %err, "Wrapped call failed");
                    Transition::fail(err)
                }
                Ok(()) if self.repeat => Transition::Next(self),
                Ok(()) => Transition::End,
            }
        })
    }

    fn name(&self) -> &'static str {
        if self.repeat {
            "WrapRepeat"
        } else {
            "Wrap"
        }
    }
}

/// A one-shot step: success ends, an error becomes an error step.
pub fn wrap<F, Fut, E>(f: F) -> StepRef
where
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: Into<CadenceError> + 'static,
{
    Arc::new(Wrapped {
        f,
        repeat: false,
        _err: PhantomData,
    })
}

/// Like [`wrap`], but success invokes the call again on the next tick. Never
/// ends on its own.
pub fn wrap_repeat<F, Fut, E>(f: F) -> StepRef
where
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: Into<CadenceError> + 'static,
{
    Arc::new(Wrapped {
        f,
        repeat: true,
        _err: PhantomData,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn success_ends() {
        let step = wrap(|_| async { Ok::<(), CadenceError>(()) });
        assert!(step.run(Context::new()).await.is_end());
    }

    #[tokio::test]
    async fn error_becomes_error_step() {
        let step = wrap(|_| async { Err::<(), _>("disk full") });
        let next = step.run(Context::new()).await;
        assert_eq!(
            next.failure().map(|f| f.cause().clone()),
            Some(CadenceError::Step("disk full".into()))
        );
    }

    #[tokio::test]
    async fn io_errors_convert() {
        let step = wrap(|_| async {
            Err::<(), _>(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"))
        });
        let next = step.run(Context::new()).await;
        assert!(matches!(next.failure().map(|f| f.cause()), Some(CadenceError::Io(_))));
    }

    #[tokio::test]
    async fn repeat_reinvokes_until_failure() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut step = wrap_repeat(move |_| {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n < 3 {
                    Ok(())
                } else {
                    Err(CadenceError::Step("third".into()))
                }
            }
        });

        let last = loop {
            match step.run(Context::new()).await {
                Transition::Next(next) => step = next,
                other => break other,
            }
        };
        assert!(last.is_failure());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
