use std::future::Future;

use futures::{Stream, StreamExt};
use tracing::debug;

use crate::context::Context;
use crate::error::BoxError;
use crate::group::Group;

impl Group {
    /// Runs a message consumer as a group task.
    ///
    /// `consumer` receives two contexts: the consume context, which is the root context
    /// and tells it to stop pulling new messages, and the handle context, which the group
    /// never cancels, so a message already pulled can be processed to completion.
    pub fn run_consumer<F, Fut, E>(&self, consumer: F)
    where
        F: FnOnce(Context, Context) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        self.run(move |ctx: Context| {
            let handle_ctx = Context::without_cancel(&ctx);
            consumer(ctx, handle_ctx)
        });
    }
}

/// Pulls from `messages` until `consume` is done or the stream ends, handing each
/// message to `handler` with the `handle` context. The first handler error stops the loop.
pub async fn consume_until_stopped<St, M, H, Fut, E>(
    consume: Context,
    handle: Context,
    mut messages: St,
    mut handler: H,
) -> Result<(), BoxError>
where
    St: Stream<Item = M> + Unpin,
    H: FnMut(Context, M) -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: Into<BoxError>,
{
    loop {
        let message = tokio::select! {
            biased;
            _ = consume.done() => {
                debug!("Lifecycle: consumer stopped pulling messages");
                return Ok(());
            }
            next = messages.next() => match next {
                Some(message) => message,
                None => return Ok(()),
            },
        };
        handler(handle.clone(), message).await.map_err(Into::into)?;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use futures::channel::mpsc;

    use super::*;

    #[tokio::test]
    async fn stops_pulling_but_finishes_current_message() {
        let (ctx, cancel) = Context::with_cancel(&Context::background());
        let handle_ctx = Context::without_cancel(&ctx);
        let (mut tx, rx) = mpsc::channel::<u32>(8);
        let handled = Arc::new(Mutex::new(Vec::new()));
        let seen = handled.clone();

        tx.try_send(1).unwrap();
        tx.try_send(2).unwrap();

        let consumer = tokio::spawn(consume_until_stopped(
            ctx,
            handle_ctx,
            rx,
            move |handle: Context, message: u32| {
                let seen = seen.clone();
                let cancel = cancel.clone();
                async move {
                    // Shutdown starts while the first message is in flight.
                    cancel.cancel();
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    assert!(!handle.is_done());
                    seen.lock().unwrap().push(message);
                    Ok::<(), BoxError>(())
                }
            },
        ));

        tokio::time::timeout(Duration::from_secs(5), consumer)
            .await
            .expect("timed out")
            .expect("join")
            .expect("consume");
        assert_eq!(*handled.lock().unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn handler_error_stops_the_loop() {
        let messages = futures::stream::iter(vec!["ok", "poison", "never"]);
        let result = consume_until_stopped(
            Context::background(),
            Context::background(),
            messages,
            |_handle: Context, message| async move {
                if message == "poison" {
                    Err::<(), BoxError>(format!("cannot handle {message}").into())
                } else {
                    Ok(())
                }
            },
        )
        .await;
        assert_eq!(result.unwrap_err().to_string(), "cannot handle poison");
    }

    #[tokio::test]
    async fn ends_with_the_stream() {
        let messages = futures::stream::iter(0..3);
        let mut count = 0;
        consume_until_stopped(
            Context::background(),
            Context::background(),
            messages,
            |_handle: Context, _message: i32| {
                count += 1;
                async { Ok::<(), BoxError>(()) }
            },
        )
        .await
        .unwrap();
        assert_eq!(count, 3);
    }
}
