use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::warn;

use crate::context::Context;
use crate::error::CadenceError;

/// Shared handle to a step. Two handles denote the same step only when
/// [`Arc::ptr_eq`] holds.
pub type StepRef = Arc<dyn Step>;

/// A unit of workflow control flow.
///
/// Invoking a step yields the next [`Transition`]. Any workflow state (counters,
/// accumulated results) lives inside the implementing type; the kernel never
/// looks at it.
pub trait Step: Send + Sync + 'static {
    /// Execute this step once.
    fn run(self: Arc<Self>, ctx: Context) -> BoxFuture<'static, Transition>;

    /// Name used in logs and `Debug` output.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Whether this step is the terminal sentinel.
    fn is_end(&self) -> bool {
        false
    }

    /// The error step behind this value, if it is one.
    fn as_failure(&self) -> Option<&Failure> {
        None
    }
}

/// The terminal sentinel as a step value.
#[derive(Debug, Clone, Copy, Default)]
pub struct End;

impl Step for End {
    fn run(self: Arc<Self>, _ctx: Context) -> BoxFuture<'static, Transition> {
        Box::pin(async { Transition::End })
    }

    fn name(&self) -> &'static str {
        "End"
    }

    fn is_end(&self) -> bool {
        true
    }
}

/// A fresh terminal sentinel.
pub fn end() -> StepRef {
    Arc::new(End)
}

/// What a step resolves to.
#[derive(Clone)]
pub enum Transition {
    /// Continue with this step on the next tick.
    Next(StepRef),
    /// Nothing is ready yet; poll this step again after yielding to the runtime.
    Pending(StepRef),
    /// An error step. It stops or restarts the workflow once invoked.
    Fail(Failure),
    /// No further transition.
    End,
}

impl Transition {
    pub fn next(step: impl Step) -> Self {
        Self::Next(Arc::new(step))
    }

    /// An error step that ends the workflow with `err`.
    pub fn fail(err: impl Into<CadenceError>) -> Self {
        Self::Fail(Failure::stop(err))
    }

    /// An error step that sends the workflow back to its first step.
    pub fn restart(err: impl Into<CadenceError>) -> Self {
        Self::Fail(Failure::restart(err))
    }

    /// The transition a step takes after observing `ctx` is done: an error
    /// step carrying the cancellation cause, or `End` when there is none.
    pub fn cancelled(ctx: &Context) -> Self {
        match ctx.cause() {
            Some(cause) => Self::Fail(Failure::cancelled(cause)),
            None => Self::End,
        }
    }

    pub fn is_end(&self) -> bool {
        matches!(self, Self::End)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Fail(_))
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending(_))
    }

    pub fn failure(&self) -> Option<&Failure> {
        match self {
            Self::Fail(f) => Some(f),
            _ => None,
        }
    }

    /// The continuation step, if this transition carries one.
    pub fn step(&self) -> Option<&StepRef> {
        match self {
            Self::Next(step) | Self::Pending(step) => Some(step),
            _ => None,
        }
    }

    /// Collapse into a step value. Error steps become invocable steps and
    /// `End` becomes `None`.
    pub fn into_step(self) -> Option<StepRef> {
        match self {
            Self::Next(step) | Self::Pending(step) => Some(step),
            Self::Fail(failure) => Some(Arc::new(failure)),
            Self::End => None,
        }
    }
}

impl From<StepRef> for Transition {
    fn from(step: StepRef) -> Self {
        if step.is_end() {
            return Self::End;
        }
        if let Some(failure) = step.as_failure() {
            return Self::Fail(failure.clone());
        }
        Self::Next(step)
    }
}

impl fmt::Debug for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Next(step) => f.debug_tuple("Next").field(&step.name()).finish(),
            Self::Pending(step) => f.debug_tuple("Pending").field(&step.name()).finish(),
            Self::Fail(failure) => f.debug_tuple("Fail").field(failure).finish(),
            Self::End => f.write_str("End"),
        }
    }
}

/// Which error produced a [`Failure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// A caller-supplied error.
    Error,
    /// The execution context was cancelled.
    Cancelled,
    /// A circuit breaker tripped open.
    BreakerOpen,
    /// A timeout elapsed before its step finished.
    TimeoutExceeded,
}

/// What an error step does when invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnError {
    /// Release the run's cancellation handle with the cause, then end.
    Stop,
    /// Resolve back to the run's restart anchor.
    Restart,
}

/// An error step: a cause plus the stop/restart behavior applied when the
/// step is invoked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    kind: FailureKind,
    cause: CadenceError,
    on_error: OnError,
}

impl Failure {
    pub fn new(kind: FailureKind, cause: impl Into<CadenceError>, on_error: OnError) -> Self {
        Self {
            kind,
            cause: cause.into(),
            on_error,
        }
    }

    pub fn stop(cause: impl Into<CadenceError>) -> Self {
        Self::new(FailureKind::Error, cause, OnError::Stop)
    }

    pub fn restart(cause: impl Into<CadenceError>) -> Self {
        Self::new(FailureKind::Error, cause, OnError::Restart)
    }

    pub fn cancelled(cause: CadenceError) -> Self {
        Self::new(FailureKind::Cancelled, cause, OnError::Stop)
    }

    pub fn breaker_open() -> Self {
        Self::new(FailureKind::BreakerOpen, CadenceError::BreakerOpen, OnError::Stop)
    }

    pub fn timeout_exceeded() -> Self {
        Self::new(
            FailureKind::TimeoutExceeded,
            CadenceError::DeadlineExceeded,
            OnError::Stop,
        )
    }

    pub fn kind(&self) -> FailureKind {
        self.kind
    }

    pub fn cause(&self) -> &CadenceError {
        &self.cause
    }

    pub fn on_error(&self) -> OnError {
        self.on_error
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.cause)
    }
}

impl std::error::Error for Failure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.cause)
    }
}

impl Step for Failure {
    fn run(self: Arc<Self>, ctx: Context) -> BoxFuture<'static, Transition> {
        Box::pin(async move {
            match self.on_error {
                OnError::Stop => {
                    if let Some(handle) = ctx.cancel_handle() {
                        handle.cancel(self.cause.clone());
                    }
                    Transition::End
                }
                OnError::Restart => {
                    warn!(error = %self.cause, "Restarting workflow from its first step");
                    match ctx.restart() {
                        Some(start) => Transition::from(start),
                        None => Transition::End,
                    }
                }
            }
        })
    }

    fn name(&self) -> &'static str {
        match self.on_error {
            OnError::Stop => "ErrorEnd",
            OnError::Restart => "ErrorRestart",
        }
    }

    fn as_failure(&self) -> Option<&Failure> {
        Some(self)
    }
}

/// Jump back to the workflow's first step as stored by the driver, or `End`
/// outside a run. Counts as a restart of the run.
pub fn start_state(ctx: &Context) -> StepRef {
    ctx.restart().unwrap_or_else(end)
}

struct FnStep<F> {
    f: F,
}

impl<F, Fut> Step for FnStep<F>
where
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Transition> + Send + 'static,
{
    fn run(self: Arc<Self>, ctx: Context) -> BoxFuture<'static, Transition> {
        Box::pin((self.f)(ctx))
    }
}

/// Build a step from an async closure.
pub fn step_fn<F, Fut>(f: F) -> StepRef
where
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Transition> + Send + 'static,
{
    Arc::new(FnStep { f })
}
