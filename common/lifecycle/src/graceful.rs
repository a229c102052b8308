use std::time::Duration;

use crate::context::{CancelHandle, Context};

/// Cancels a graceful context: pending right away, canceled once the period elapsed.
#[derive(Clone, Debug)]
pub struct GracefulCancel {
    handle: CancelHandle,
    period: Duration,
}

impl GracefulCancel {
    /// Marks the context as pending, waits for the period, then cancels it.
    ///
    /// While pending, `err()` reports [`ContextError::CancelPending`](crate::ContextError)
    /// but `done()` has not fired, so well-behaved work can wind down on its own.
    pub async fn cancel(&self) {
        if self.handle.is_canceled() {
            return;
        }
        self.handle.mark_pending();
        tokio::time::sleep(self.period).await;
        self.handle.cancel();
    }

    /// Skips the period.
    pub fn cancel_now(&self) {
        self.handle.cancel();
    }
}

impl Context {
    pub fn with_graceful_period(parent: &Context, period: Duration) -> (Context, GracefulCancel) {
        let (ctx, handle) = Context::with_cancel(parent);
        (ctx, GracefulCancel { handle, period })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::{Context, ContextError};

    #[tokio::test]
    async fn pending_then_canceled() {
        let (ctx, cancel) =
            Context::with_graceful_period(&Context::background(), Duration::from_millis(100));
        assert_eq!(ctx.err(), None);

        let canceling = tokio::spawn(async move { cancel.cancel().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(ctx.err(), Some(ContextError::CancelPending));
        assert!(!ctx.is_done());

        canceling.await.expect("cancel task");
        assert!(ctx.is_done());
        assert_eq!(ctx.err(), Some(ContextError::Canceled));
    }

    #[tokio::test]
    async fn parent_cancel_skips_the_period() {
        let (parent, cancel_parent) = Context::with_cancel(&Context::background());
        let (ctx, _cancel) = Context::with_graceful_period(&parent, Duration::from_secs(60));

        cancel_parent.cancel();
        assert!(ctx.is_done());
        assert_eq!(ctx.err(), Some(ContextError::Canceled));
    }

    #[tokio::test]
    async fn cancel_now() {
        let (ctx, cancel) =
            Context::with_graceful_period(&Context::background(), Duration::from_secs(60));
        cancel.cancel_now();
        assert_eq!(ctx.err(), Some(ContextError::Canceled));
        tokio::time::timeout(Duration::from_millis(50), cancel.cancel())
            .await
            .expect("already canceled");
    }
}
