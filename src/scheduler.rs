//! Execution contexts for deferred work.
//!
//! The engine itself owns no threads. Work that must run later (ring-buffer
//! consumer loops, grace-period disconnects) is handed to a [`Scheduler`]
//! supplied by the caller. [`TokioScheduler`] is the bundled implementation.

use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// A unit of deferred work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// A handle to something that can be cancelled or released.
pub trait Disposable: Send + Sync {
    /// Release the resource. Idempotent.
    fn dispose(&self);

    /// True once disposed.
    fn is_disposed(&self) -> bool;
}

/// An execution context capable of running a task now or later.
pub trait Scheduler: Send + Sync {
    /// Run `task` as soon as possible. The task may block, so implementations
    /// must not run it on a thread that drives other work.
    fn schedule(&self, task: Task) -> Arc<dyn Disposable>;

    /// Run `task` once `delay` has elapsed, unless disposed first.
    fn schedule_after(&self, delay: Duration, task: Task) -> Arc<dyn Disposable>;
}

/// Disposable backed by a [`CancellationToken`].
#[derive(Debug, Clone, Default)]
pub struct TokenDisposable {
    token: CancellationToken,
}

impl TokenDisposable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The token observed by the scheduled work.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl Disposable for TokenDisposable {
    fn dispose(&self) {
        self.token.cancel();
    }

    fn is_disposed(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Scheduler running tasks on a tokio runtime.
///
/// Immediate tasks go to the blocking pool; delayed tasks are timers on the
/// runtime, so they honour a paused clock in tests.
///
/// # Examples
///
/// ```rust
/// use std::sync::Arc;
/// use fluxweld::scheduler::{Scheduler, TokioScheduler};
///
/// #[tokio::main]
/// async fn main() -> fluxweld::Result<()> {
///     let scheduler = TokioScheduler::current()?;
///     let (tx, rx) = tokio::sync::oneshot::channel();
///     scheduler.schedule(Box::new(move || {
///         let _ = tx.send(7);
///     }));
///     assert_eq!(rx.await.ok(), Some(7));
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    handle: Handle,
}

impl TokioScheduler {
    /// Wrap a runtime handle.
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Use the runtime the caller is running on.
    pub fn current() -> Result<Self> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|e| Error::custom(format!("no tokio runtime available: {e}")))
    }

    /// Shared handle, convenient for builders taking `Arc<dyn Scheduler>`.
    pub fn shared() -> Result<Arc<dyn Scheduler>> {
        Ok(Arc::new(Self::current()?))
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, task: Task) -> Arc<dyn Disposable> {
        let disposable = TokenDisposable::new();
        let token = disposable.token();
        self.handle.spawn_blocking(move || {
            if !token.is_cancelled() {
                task();
            }
        });
        Arc::new(disposable)
    }

    fn schedule_after(&self, delay: Duration, task: Task) -> Arc<dyn Disposable> {
        let disposable = TokenDisposable::new();
        let token = disposable.token();
        let deadline = tokio::time::Instant::now() + delay;
        self.handle.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::trace!("delayed task disposed before it ran");
                }
                _ = tokio::time::sleep_until(deadline) => {
                    if !token.is_cancelled() {
                        task();
                    }
                }
            }
        });
        Arc::new(disposable)
    }
}
