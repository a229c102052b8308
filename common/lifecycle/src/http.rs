//! Axum server adapter.
//!
//! [`HttpServer::into_tasks`] splits a server into the two halves a [`Group`] expects:
//! an "up" task that serves until the root context is done, and a "down" shutdown
//! function that waits for in-flight connections to drain within the shutdown deadline.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use axum::{Extension, Router};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::context::Context;
use crate::error::BoxError;
use crate::group::{GracePeriod, Group};
use crate::task::TaskFn;

pub struct HttpServer {
    listener: TcpListener,
    router: Router,
    drain_delay: Duration,
}

#[derive(Default)]
struct Shared {
    stop: CancellationToken,
    serving: Mutex<Option<JoinHandle<io::Result<()>>>>,
}

impl HttpServer {
    pub fn new(listener: TcpListener, router: Router) -> Self {
        Self {
            listener,
            router,
            drain_delay: Duration::ZERO,
        }
    }

    /// Keep accepting connections for `delay` after the root context is done, e.g. while
    /// a load balancer deregisters the instance.
    pub fn with_drain_delay(mut self, delay: Duration) -> Self {
        self.drain_delay = delay;
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Returns the `(up, down)` pair.
    ///
    /// Handlers can extract `Extension<Context>`: that context is done one grace period
    /// after the root context (or with it when the root carries no [`GracePeriod`]).
    pub fn into_tasks(self) -> (TaskFn, TaskFn) {
        let shared = Arc::new(Shared::default());
        let HttpServer {
            listener,
            router,
            drain_delay,
        } = self;

        let up = {
            let shared = shared.clone();
            TaskFn::new(move |ctx: Context| async move {
                let addr = listener.local_addr()?;
                let request_ctx = match ctx.value::<GracePeriod>() {
                    Some(GracePeriod(period)) => Context::with_delay(&ctx, *period),
                    None => ctx.clone(),
                };
                let router = router.layer(Extension(request_ctx));

                let stop = shared.stop.clone();
                let mut serving = tokio::spawn(async move {
                    axum::serve(listener, router)
                        .with_graceful_shutdown(stop.cancelled_owned())
                        .await
                });
                info!(%addr, "Lifecycle: http server listening");

                let stop_accepting = if drain_delay.is_zero() {
                    ctx.clone()
                } else {
                    Context::with_delay(&ctx, drain_delay)
                };

                tokio::select! {
                    joined = &mut serving => {
                        shared.stop.cancel();
                        joined??;
                        Ok::<(), BoxError>(())
                    }
                    _ = stop_accepting.done() => {
                        debug!(%addr, "Lifecycle: http server stopped accepting connections");
                        shared.stop.cancel();
                        *shared.serving.lock().unwrap_or_else(PoisonError::into_inner) = Some(serving);
                        Ok(())
                    }
                }
            })
        };

        let down = TaskFn::new(move |_ctx: Context| async move {
            shared.stop.cancel();
            let serving = shared
                .serving
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(serving) = serving {
                serving.await??;
                debug!("Lifecycle: http server drained");
            }
            Ok::<(), BoxError>(())
        });

        (up, down)
    }
}

impl Group {
    /// Serves `server` as a group task; draining in-flight connections is a shutdown
    /// function bounded by the shutdown timeout.
    pub fn run_server(&self, server: HttpServer) {
        let (up, down) = server.into_tasks();
        self.push_closer(down);
        self.spawn(up);
    }
}
