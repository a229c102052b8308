use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::context::Context;
use crate::error::BoxError;

type TaskFuture = BoxFuture<'static, Result<(), BoxError>>;

/// A type-erased task, bootstrap or shutdown function.
pub struct TaskFn(Box<dyn FnOnce(Context) -> TaskFuture + Send>);

impl TaskFn {
    pub fn new<F, Fut, E>(f: F) -> Self
    where
        F: FnOnce(Context) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        TaskFn(Box::new(move |ctx: Context| -> TaskFuture {
            async move { f(ctx).await.map_err(Into::into) }.boxed()
        }))
    }

    /// Runs the function, turning a panic into `Err(message)`.
    pub(crate) async fn call(self, ctx: Context) -> Result<Result<(), BoxError>, String> {
        let f = self.0;
        AssertUnwindSafe(async move { f(ctx).await })
            .catch_unwind()
            .await
            .map_err(panic_message)
    }
}

impl std::fmt::Debug for TaskFn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TaskFn")
    }
}

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn call_returns_task_result() {
        let ok = TaskFn::new(|_ctx| async { Ok::<(), BoxError>(()) });
        assert!(matches!(ok.call(Context::background()).await, Ok(Ok(()))));

        let failed = TaskFn::new(|_ctx| async { Err::<(), _>("bad input") });
        match failed.call(Context::background()).await {
            Ok(Err(e)) => assert_eq!(e.to_string(), "bad input"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn call_catches_panics() {
        let task = TaskFn::new(|_ctx| async {
            if true {
                panic!("exploded");
            }
            Ok::<(), BoxError>(())
        });
        assert_eq!(
            task.call(Context::background()).await.unwrap_err(),
            "exploded"
        );

        let formatted = TaskFn::new(|_ctx| async move {
            let code = 3;
            if code > 0 {
                panic!("exit code {code}");
            }
            Ok::<(), BoxError>(())
        });
        assert_eq!(
            formatted.call(Context::background()).await.unwrap_err(),
            "exit code 3"
        );
    }
}
