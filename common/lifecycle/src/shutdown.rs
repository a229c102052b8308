use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::context::Context;
use crate::error::{AggregateError, ContextError, ErrorCollector, Failure};
use crate::metrics;
use crate::task::TaskFn;

/// Runs `fns` concurrently under a context derived from `parent` with its cancellation
/// stripped and bounded by `timeout`.
///
/// A function still running when the deadline passes is abandoned and contributes
/// [`Failure::ShutdownTimeout`]. Its tokio task is not aborted and may keep running.
pub async fn shutdown(
    parent: &Context,
    timeout: Duration,
    fns: Vec<TaskFn>,
) -> Result<(), AggregateError> {
    run_shutdown("standalone", parent, timeout, fns).await
}

pub(crate) async fn run_shutdown(
    group: &str,
    parent: &Context,
    timeout: Duration,
    fns: Vec<TaskFn>,
) -> Result<(), AggregateError> {
    let errors = ErrorCollector::default();
    if fns.is_empty() {
        return errors.take();
    }

    let detached = Context::without_cancel(parent);
    let (ctx, cancel) = Context::with_timeout(&detached, timeout);
    let _release = cancel.drop_guard();

    info!(
        group,
        count = fns.len(),
        timeout = ?timeout,
        "Lifecycle: running shutdown functions"
    );

    let mut set = JoinSet::new();
    for (index, f) in fns.into_iter().enumerate() {
        let ctx = ctx.clone();
        let group = group.to_string();
        set.spawn(async move {
            let mut work = tokio::spawn(f.call(ctx.clone()));
            let (result, failure) = tokio::select! {
                biased;
                joined = &mut work => match joined {
                    Ok(Ok(Ok(()))) => ("completed", None),
                    Ok(Ok(Err(e))) => ("error", Some(Failure::Shutdown(e))),
                    Ok(Err(panic)) => ("panic", Some(Failure::ShutdownPanicked(panic))),
                    Err(join_err) => ("error", Some(Failure::Shutdown(join_err.into()))),
                },
                _ = ctx.done() => {
                    warn!(
                        group = %group,
                        index,
                        "Lifecycle: shutdown function abandoned at deadline, it may still be running"
                    );
                    let cause = ctx.err().unwrap_or(ContextError::DeadlineExceeded);
                    ("timeout", Some(Failure::ShutdownTimeout(cause)))
                }
            };
            metrics::emit_shutdown_fn_result(&group, result);
            failure
        });
    }

    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(Some(failure)) => errors.push(failure),
            Ok(None) => {}
            Err(join_err) => errors.push(Failure::Shutdown(join_err.into())),
        }
    }

    errors.take()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::error::BoxError;

    #[tokio::test]
    async fn no_functions_is_ok() {
        let (ctx, cancel) = Context::with_cancel(&Context::background());
        cancel.cancel();
        assert!(shutdown(&ctx, Duration::from_millis(10), vec![])
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn runs_under_fresh_context_after_parent_canceled() {
        let (parent, cancel) = Context::with_cancel(&Context::background());
        let parent = Context::with_value(&parent, "request-scoped");
        cancel.cancel();

        let f = TaskFn::new(|ctx: Context| async move {
            assert!(!ctx.is_done());
            assert!(ctx.deadline().is_some());
            assert_eq!(ctx.value::<&'static str>(), Some(&"request-scoped"));
            Ok::<(), BoxError>(())
        });
        assert!(shutdown(&parent, Duration::from_secs(1), vec![f])
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn slow_function_contributes_deadline_exceeded() {
        let finished = Arc::new(AtomicUsize::new(0));
        let counter = finished.clone();

        let fns = vec![
            TaskFn::new(|_ctx| async {
                tokio::time::sleep(Duration::from_millis(300)).await;
                Ok::<(), BoxError>(())
            }),
            TaskFn::new(move |_ctx| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>("flush failed")
            }),
        ];

        let err = shutdown(&Context::background(), Duration::from_millis(100), fns)
            .await
            .unwrap_err();
        assert_eq!(err.len(), 2);
        assert_eq!(err.count_matching("flush failed"), 1);
        assert_eq!(
            err.failures().iter().filter(|f| f.is_deadline_exceeded()).count(),
            1
        );
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn functions_run_concurrently() {
        let fns = (0..4)
            .map(|_| {
                TaskFn::new(|_ctx| async {
                    tokio::time::sleep(Duration::from_millis(60)).await;
                    Ok::<(), BoxError>(())
                })
            })
            .collect();

        // Sequential execution would need 240ms.
        assert!(shutdown(&Context::background(), Duration::from_millis(200), fns)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn panicking_function_is_reported() {
        let fns = vec![TaskFn::new(|_ctx| async {
            if true {
                panic!("closer blew up");
            }
            Ok::<(), BoxError>(())
        })];
        let err = shutdown(&Context::background(), Duration::from_secs(1), fns)
            .await
            .unwrap_err();
        assert!(matches!(
            &err.failures()[0],
            Failure::ShutdownPanicked(msg) if msg == "closer blew up"
        ));
    }
}
