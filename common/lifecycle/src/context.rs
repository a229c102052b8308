//! Cancellable execution contexts.
//!
//! A [`Context`] is handed to every task, bootstrap and shutdown function. It tells the
//! callee when to stop ([`Context::done`]), why it was stopped ([`Context::err`]), by when
//! it must finish ([`Context::deadline`]) and carries typed request-scoped values.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::{
    CancellationToken, WaitForCancellationFuture, WaitForCancellationFutureOwned,
};

use crate::error::ContextError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Kind {
    Background,
    Cancel,
    Value,
    Detached,
    Delayed,
}

/// Cheap to clone; clones observe the same cancellation.
#[derive(Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

pub(crate) struct Inner {
    kind: Kind,
    token: CancellationToken,
    parent: Option<Context>,
    deadline: Option<Instant>,
    cause: OnceLock<ContextError>,
    pending: AtomicBool,
    value: Option<Arc<dyn Any + Send + Sync>>,
}

impl Context {
    /// A context that is never done and carries no values.
    pub fn background() -> Self {
        Self::from_parts(Kind::Background, CancellationToken::new(), None, None, None)
    }

    pub(crate) fn from_parts(
        kind: Kind,
        token: CancellationToken,
        parent: Option<&Context>,
        deadline: Option<Instant>,
        value: Option<Arc<dyn Any + Send + Sync>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                kind,
                token,
                parent: parent.cloned(),
                deadline,
                cause: OnceLock::new(),
                pending: AtomicBool::new(false),
                value,
            }),
        }
    }

    /// Child context that is done when `parent` is done or the returned handle is canceled.
    pub fn with_cancel(parent: &Context) -> (Context, CancelHandle) {
        let ctx = Self::from_parts(
            Kind::Cancel,
            parent.inner.token.child_token(),
            Some(parent),
            None,
            None,
        );
        let handle = CancelHandle {
            inner: ctx.inner.clone(),
        };
        (ctx, handle)
    }

    /// Like [`Context::with_cancel`], and also done once `timeout` elapsed.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn with_timeout(parent: &Context, timeout: Duration) -> (Context, CancelHandle) {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => Self::with_deadline(parent, deadline),
            // Not representable, so only the parent's deadline applies.
            None => Self::with_cancel(parent),
        }
    }

    /// Like [`Context::with_cancel`], and also done at `deadline`. The effective deadline
    /// never exceeds the parent's.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn with_deadline(parent: &Context, deadline: Instant) -> (Context, CancelHandle) {
        let deadline = match parent.deadline() {
            Some(inherited) if inherited < deadline => inherited,
            _ => deadline,
        };
        let ctx = Self::from_parts(
            Kind::Cancel,
            parent.inner.token.child_token(),
            Some(parent),
            Some(deadline),
            None,
        );
        let handle = CancelHandle {
            inner: ctx.inner.clone(),
        };

        if deadline <= Instant::now() {
            handle.finish(ContextError::DeadlineExceeded);
        } else {
            let timer = handle.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => timer.finish(ContextError::DeadlineExceeded),
                    _ = timer.inner.token.cancelled() => {}
                }
            });
        }

        (ctx, handle)
    }

    /// Keeps the values of `parent` but none of its cancellation or deadline.
    pub fn without_cancel(parent: &Context) -> Context {
        Self::from_parts(
            Kind::Detached,
            CancellationToken::new(),
            Some(parent),
            None,
            None,
        )
    }

    /// Child context carrying `value`, retrievable with [`Context::value`] by its type.
    pub fn with_value<T>(parent: &Context, value: T) -> Context
    where
        T: Any + Send + Sync,
    {
        Self::from_parts(
            Kind::Value,
            parent.inner.token.clone(),
            Some(parent),
            None,
            Some(Arc::new(value)),
        )
    }

    /// Nearest value of type `T` on this context or its ancestors.
    pub fn value<T: Any>(&self) -> Option<&T> {
        self.inner
            .value
            .as_ref()
            .and_then(|v| v.downcast_ref::<T>())
            .or_else(|| self.inner.parent.as_ref()?.value::<T>())
    }

    pub fn deadline(&self) -> Option<Instant> {
        match self.inner.kind {
            Kind::Background | Kind::Detached => None,
            _ => self
                .inner
                .deadline
                .or_else(|| self.inner.parent.as_ref()?.deadline()),
        }
    }

    /// `None` while the context is live.
    pub fn err(&self) -> Option<ContextError> {
        if let Some(cause) = self.inner.cause.get() {
            return Some(*cause);
        }
        match self.inner.kind {
            Kind::Background | Kind::Detached => None,
            Kind::Value | Kind::Delayed => self.parent_err(),
            Kind::Cancel => {
                if self.inner.token.is_cancelled() {
                    Some(self.parent_err().unwrap_or(ContextError::Canceled))
                } else if self.inner.pending.load(Ordering::Acquire) {
                    Some(ContextError::CancelPending)
                } else {
                    None
                }
            }
        }
    }

    pub fn is_done(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Resolves once the context is done.
    pub fn done(&self) -> WaitForCancellationFuture<'_> {
        self.inner.token.cancelled()
    }

    /// Owned variant of [`Context::done`], for futures that must be `'static`.
    pub fn done_owned(&self) -> WaitForCancellationFutureOwned {
        self.inner.token.clone().cancelled_owned()
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.inner.token
    }

    fn parent_err(&self) -> Option<ContextError> {
        self.inner.parent.as_ref()?.err()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("kind", &self.inner.kind)
            .field("done", &self.is_done())
            .field("err", &self.err())
            .field("deadline", &self.deadline())
            .finish()
    }
}

/// Cancels the context it was created with. Idempotent.
#[derive(Clone)]
pub struct CancelHandle {
    inner: Arc<Inner>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.finish(ContextError::Canceled);
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Cancels when the returned guard is dropped.
    pub fn drop_guard(self) -> CancelOnDrop {
        CancelOnDrop { handle: Some(self) }
    }

    pub(crate) fn mark_pending(&self) {
        self.inner.pending.store(true, Ordering::Release);
    }

    fn finish(&self, cause: ContextError) {
        // First cause wins; a context canceled through its parent keeps the parent's cause.
        if !self.inner.token.is_cancelled() {
            let _ = self.inner.cause.set(cause);
        }
        self.inner.token.cancel();
    }
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelHandle")
            .field("canceled", &self.is_canceled())
            .finish()
    }
}

/// See [`CancelHandle::drop_guard`].
pub struct CancelOnDrop {
    handle: Option<CancelHandle>,
}

impl CancelOnDrop {
    /// Returns the handle without canceling.
    pub fn disarm(mut self) -> CancelHandle {
        match self.handle.take() {
            Some(handle) => handle,
            None => unreachable!("guard is disarmed only once"),
        }
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.cancel();
        }
    }
}
