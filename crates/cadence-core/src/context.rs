use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::CadenceError;
use crate::step::StepRef;
use crate::types::RunId;

/// Releases a run with a cause. Installed once by the outermost driver call;
/// stop-type error steps report through it.
#[derive(Clone)]
pub struct CancelHandle {
    token: CancellationToken,
    cause: Arc<OnceLock<CadenceError>>,
}

impl CancelHandle {
    /// Cancel the run, recording `cause` unless the run is already done.
    pub fn cancel(&self, cause: CadenceError) {
        if self.token.is_cancelled() {
            return;
        }
        let _ = self.cause.set(cause);
        self.token.cancel();
    }
}

/// Cancellable execution context handed to every step invocation.
///
/// Cloning is cheap. Cancellation flows from a context to every context
/// derived from it, never upward; the only upward path is the run's
/// [`CancelHandle`].
#[derive(Clone, Default)]
pub struct Context {
    token: CancellationToken,
    cause: Arc<OnceLock<CadenceError>>,
    deadline: Option<Instant>,
    parent: Option<Arc<Context>>,
    anchor: Option<StepRef>,
    generation: Option<Arc<AtomicU64>>,
    handle: Option<CancelHandle>,
    run_id: Option<RunId>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// A root context cancelled together with `token`.
    pub fn with_token(token: CancellationToken) -> Self {
        Self {
            token,
            ..Self::default()
        }
    }

    /// Derive a context that is cancelled when this one is, and can also be
    /// cancelled on its own.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            cause: Arc::new(OnceLock::new()),
            deadline: self.deadline,
            parent: Some(Arc::new(self.clone())),
            anchor: self.anchor.clone(),
            generation: self.generation.clone(),
            handle: self.handle.clone(),
            run_id: self.run_id.clone(),
        }
    }

    /// Derive a context that expires at `deadline` (or earlier, if this one does).
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let mut child = self.child();
        child.deadline = Some(match self.deadline {
            Some(current) if current < deadline => current,
            _ => deadline,
        });
        child
    }

    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derive the context a driver run executes in. The restart anchor, the
    /// cancellation handle and the run id are only installed when no
    /// enclosing run has installed them already.
    pub fn for_run(&self, anchor: StepRef, run_id: Option<RunId>) -> Self {
        let mut child = self.child();
        if child.anchor.is_none() {
            child.anchor = Some(anchor);
            child.generation = Some(Arc::new(AtomicU64::new(0)));
        }
        if child.handle.is_none() {
            child.handle = Some(CancelHandle {
                token: child.token.clone(),
                cause: child.cause.clone(),
            });
        }
        if child.run_id.is_none() {
            child.run_id = Some(run_id.unwrap_or_default());
        }
        child
    }

    /// Cancel with the generic [`CadenceError::Cancelled`] cause.
    pub fn cancel(&self) {
        self.cancel_with_cause(CadenceError::Cancelled);
    }

    /// Cancel this context and everything derived from it. The first cause
    /// wins; cancelling a finished context is a no-op.
    pub fn cancel_with_cause(&self, cause: CadenceError) {
        if self.is_cancelled() {
            return;
        }
        let _ = self.cause.set(cause);
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled() || self.deadline_passed()
    }

    /// Resolves once the context is cancelled or its deadline passes.
    pub async fn cancelled(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.token.cancelled().await,
        }
    }

    /// Why this context is done, or `None` while it is still live.
    pub fn cause(&self) -> Option<CadenceError> {
        if let Some(cause) = self.cause.get() {
            return Some(cause.clone());
        }
        if let Some(cause) = self.parent.as_ref().and_then(|p| p.cause()) {
            return Some(cause);
        }
        if self.token.is_cancelled() {
            return Some(CadenceError::Cancelled);
        }
        if self.deadline_passed() {
            return Some(CadenceError::DeadlineExceeded);
        }
        None
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// The first step of the enclosing run.
    pub fn restart_anchor(&self) -> Option<&StepRef> {
        self.anchor.as_ref()
    }

    /// Re-enter the run from its first step. Bumps the run's generation so
    /// steps holding per-entry state start over.
    pub fn restart(&self) -> Option<StepRef> {
        let anchor = self.anchor.clone()?;
        if let Some(generation) = &self.generation {
            generation.fetch_add(1, Ordering::AcqRel);
        }
        Some(anchor)
    }

    /// How many times the enclosing run has been restarted.
    pub fn generation(&self) -> u64 {
        self.generation
            .as_ref()
            .map_or(0, |g| g.load(Ordering::Acquire))
    }

    pub fn cancel_handle(&self) -> Option<&CancelHandle> {
        self.handle.as_ref()
    }

    pub fn run_id(&self) -> Option<&RunId> {
        self.run_id.as_ref()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    fn deadline_passed(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("run_id", &self.run_id)
            .field("cancelled", &self.is_cancelled())
            .field("deadline", &self.deadline)
            .field("anchor", &self.anchor.as_ref().map(|s| s.name()))
            .field("generation", &self.generation())
            .finish()
    }
}
