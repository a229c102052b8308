use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::context::{Context, Kind};

impl Context {
    /// Context whose done signal fires `delay` after `parent`'s, and never if `parent` is
    /// never done. Errors, deadline and values are read from `parent`, so `err()` is already
    /// set while the delay is running.
    ///
    /// Used to keep in-flight work alive for a while after shutdown starts. Must be called
    /// from within a Tokio runtime.
    pub fn with_delay(parent: &Context, delay: Duration) -> Context {
        let ctx = Context::from_parts(
            Kind::Delayed,
            CancellationToken::new(),
            Some(parent),
            None,
            None,
        );

        let upstream = parent.clone();
        let done = ctx.token().clone();
        tokio::spawn(async move {
            upstream.done().await;
            tokio::time::sleep(delay).await;
            done.cancel();
        });

        ctx
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::Instant;

    use crate::{Context, ContextError};

    #[tokio::test]
    async fn fires_after_parent_plus_delay() {
        let (parent, cancel) = Context::with_cancel(&Context::background());
        let delayed = Context::with_delay(&parent, Duration::from_millis(100));

        let started = Instant::now();
        cancel.cancel();
        assert!(!delayed.is_done());
        assert_eq!(delayed.err(), Some(ContextError::Canceled));

        tokio::time::timeout(Duration::from_secs(5), delayed.done())
            .await
            .expect("timed out");
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn never_fires_without_parent() {
        let (parent, _cancel) = Context::with_cancel(&Context::background());
        let delayed = Context::with_delay(&parent, Duration::from_millis(1));

        let res = tokio::time::timeout(Duration::from_millis(100), delayed.done()).await;
        assert!(res.is_err());
        assert_eq!(delayed.err(), None);
    }

    #[tokio::test]
    async fn zero_delay_follows_parent() {
        let (parent, cancel) = Context::with_cancel(&Context::background());
        let delayed = Context::with_delay(&parent, Duration::ZERO);
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), delayed.done())
            .await
            .expect("timed out");
    }

    #[tokio::test]
    async fn several_delays_from_one_parent() {
        let (parent, cancel) = Context::with_cancel(&Context::background());
        let short = Context::with_delay(&parent, Duration::from_millis(10));
        let long = Context::with_delay(&parent, Duration::from_millis(200));

        cancel.cancel();
        short.done().await;
        assert!(!long.is_done());
        long.done().await;
    }

    #[tokio::test]
    async fn reads_parent_deadline_and_values() {
        let valued = Context::with_value(&Context::background(), 42u32);
        let (parent, _cancel) = Context::with_timeout(&valued, Duration::from_secs(30));
        let delayed = Context::with_delay(&parent, Duration::from_secs(1));

        assert_eq!(delayed.deadline(), parent.deadline());
        assert_eq!(delayed.value::<u32>(), Some(&42));
    }
}
