//! Task group: bootstrap, fail-fast run phase, time-bounded shutdown.

use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn, Instrument, Span};

use crate::bootstrap::run_bootstrap;
use crate::config::LifecycleConfig;
use crate::context::{CancelHandle, Context};
use crate::error::{AggregateError, BoxError, ErrorCollector, Failure, LifecycleError};
use crate::http::HttpServer;
use crate::metrics;
use crate::probes;
use crate::shutdown::run_shutdown;
use crate::signals::{
    cancellation_delay, default_action, exit_process, DefaultAction, ForceExit, HandlerState,
    ShutdownSignal, SignalHandler, SignalSubscription, RELEASE_MARGIN,
};
use crate::task::TaskFn;

/// Grace period of the group, stored on its root context.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GracePeriod(pub Duration);

/// Options for creating a group.
#[derive(Clone, Debug)]
pub struct GroupOptions {
    pub name: String,
    /// Total budget from "stop requested" to process exit.
    pub grace_period: Duration,
    /// Budget for shutdown functions once every task returned.
    pub shutdown_timeout: Duration,
    /// Install SIGINT/SIGTERM/SIGHUP/SIGQUIT handling (default: true).
    pub trap_signals: bool,
    /// Serve readiness/liveness probes on this address.
    pub health_bind: Option<String>,
}

impl Default for GroupOptions {
    fn default() -> Self {
        Self {
            name: "app".to_string(),
            grace_period: Duration::from_secs(2),
            shutdown_timeout: Duration::from_secs(2),
            trap_signals: true,
            health_bind: None,
        }
    }
}

pub struct GroupBuilder {
    options: GroupOptions,
    parent: Context,
    bootstraps: Vec<TaskFn>,
    closers: Vec<TaskFn>,
    subscription: Option<SignalSubscription>,
    force_exit: ForceExit,
    default_action: DefaultAction,
    release_margin: Duration,
}

impl GroupBuilder {
    fn new(name: String) -> Self {
        Self {
            options: GroupOptions {
                name,
                ..GroupOptions::default()
            },
            parent: Context::background(),
            bootstraps: Vec::new(),
            closers: Vec::new(),
            subscription: None,
            force_exit: exit_process(),
            default_action: default_action(),
            release_margin: RELEASE_MARGIN,
        }
    }

    /// Derive the root context from `parent` instead of [`Context::background`].
    pub fn with_parent(mut self, parent: Context) -> Self {
        self.parent = parent;
        self
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.options.grace_period = grace_period;
        self
    }

    pub fn with_shutdown_timeout(mut self, shutdown_timeout: Duration) -> Self {
        self.options.shutdown_timeout = shutdown_timeout;
        self
    }

    pub fn with_trap_signals(mut self, trap_signals: bool) -> Self {
        self.options.trap_signals = trap_signals;
        self
    }

    /// Listen on `subscription` instead of the OS signals.
    pub fn with_signal_subscription(mut self, subscription: SignalSubscription) -> Self {
        self.options.trap_signals = true;
        self.subscription = Some(subscription);
        self
    }

    /// Replaces the default second-signal behavior of exiting with status 1.
    /// Whatever the hook does, shutdown functions still running are not awaited.
    pub fn with_force_exit<F>(mut self, force_exit: F) -> Self
    where
        F: Fn(ShutdownSignal) + Send + Sync + 'static,
    {
        self.force_exit = std::sync::Arc::new(force_exit);
        self
    }

    /// Replaces what happens to a signal received after the handler released. The default
    /// re-raises it with the platform's default disposition, terminating the process.
    pub fn with_default_signal_action<F>(mut self, action: F) -> Self
    where
        F: Fn(ShutdownSignal) + Send + Sync + 'static,
    {
        self.default_action = std::sync::Arc::new(action);
        self
    }

    /// How long the signal handler keeps listening for a second signal past the
    /// shutdown timeout.
    pub fn with_release_margin(mut self, margin: Duration) -> Self {
        self.release_margin = margin;
        self
    }

    /// Runs before any task starts. Bootstrap functions run concurrently and the first
    /// failure aborts [`GroupBuilder::build`].
    pub fn with_bootstrap<F, Fut, E>(mut self, f: F) -> Self
    where
        F: FnOnce(Context) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        self.bootstraps.push(TaskFn::new(f));
        self
    }

    /// Shutdown function that is not tied to a task.
    pub fn with_closer<F, Fut, E>(mut self, f: F) -> Self
    where
        F: FnOnce(Context) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        self.closers.push(TaskFn::new(f));
        self
    }

    /// Serve the probe routes from [`probes::router`] on `addr` as a group task.
    pub fn with_health_handler(mut self, addr: impl Into<String>) -> Self {
        self.options.health_bind = Some(addr.into());
        self
    }

    pub fn with_config(mut self, config: &LifecycleConfig) -> Self {
        self.options.grace_period = config.grace_period.0;
        self.options.shutdown_timeout = config.shutdown_timeout.0;
        self.options.trap_signals = config.trap_signals;
        if let Some(addr) = &config.health_bind {
            self.options.health_bind = Some(addr.clone());
        }
        self
    }

    /// Runs bootstrap, then arms the signal handler and the health handler.
    pub async fn build(self) -> Result<Group, LifecycleError> {
        let GroupBuilder {
            options,
            parent,
            bootstraps,
            closers,
            subscription,
            force_exit,
            default_action,
            release_margin,
        } = self;
        let span = tracing::info_span!("lifecycle", group = %options.name);

        if options.shutdown_timeout > options.grace_period {
            warn!(
                group = %options.name,
                grace_period = ?options.grace_period,
                shutdown_timeout = ?options.shutdown_timeout,
                "Lifecycle: shutdown timeout exceeds grace period, signals cancel without delay"
            );
        }

        let root = Context::with_value(&parent, GracePeriod(options.grace_period));
        let (ctx, cancel) = Context::with_cancel(&root);
        let abort = cancel.clone().drop_guard();

        if let Err(e) = run_bootstrap(&ctx, bootstraps).instrument(span.clone()).await {
            error!(group = %options.name, error = %e, "Lifecycle: bootstrap failed");
            return Err(LifecycleError::Bootstrap(e));
        }

        let subscription = match subscription {
            Some(subscription) => Some(subscription),
            None if options.trap_signals => {
                Some(SignalSubscription::os().map_err(LifecycleError::Signal)?)
            }
            None => None,
        };

        let health_listener = match &options.health_bind {
            Some(addr) => Some(TcpListener::bind(addr).await.map_err(|source| {
                LifecycleError::Bind {
                    addr: addr.clone(),
                    source,
                }
            })?),
            None => None,
        };

        let mut group = Group {
            name: options.name,
            ctx,
            cancel: abort.disarm(),
            grace_period: options.grace_period,
            shutdown_timeout: options.shutdown_timeout,
            closers: Mutex::new(closers),
            errors: ErrorCollector::default(),
            tracker: TaskTracker::new(),
            signal_state: None,
            span,
        };

        if let Some(signals) = subscription {
            let (state, state_rx) = watch::channel(HandlerState::Armed);
            let handler = SignalHandler {
                group: group.name.clone(),
                ctx: group.ctx.clone(),
                cancel: group.cancel.clone(),
                delay: group.cancellation_delay(),
                shutdown_timeout: group.shutdown_timeout,
                release_margin,
                force_exit,
                default_action,
                state,
            };
            tokio::spawn(handler.run(signals).instrument(group.span.clone()));
            group.signal_state = Some(state_rx);
        }

        if let Some(listener) = health_listener {
            let router = probes::router(group.readiness());
            group.run_server(HttpServer::new(listener, router));
        }

        info!(
            group = %group.name,
            grace_period = ?group.grace_period,
            shutdown_timeout = ?group.shutdown_timeout,
            "Lifecycle: group started"
        );
        Ok(group)
    }
}

/// Runs tasks as a unit: the first task to return cancels the others, and once every
/// task returned the registered shutdown functions run under the shutdown timeout.
pub struct Group {
    name: String,
    ctx: Context,
    cancel: CancelHandle,
    grace_period: Duration,
    shutdown_timeout: Duration,
    closers: Mutex<Vec<TaskFn>>,
    errors: ErrorCollector,
    tracker: TaskTracker,
    signal_state: Option<watch::Receiver<HandlerState>>,
    span: Span,
}

impl Group {
    pub fn builder(name: impl Into<String>) -> GroupBuilder {
        GroupBuilder::new(name.into())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The root context handed to tasks.
    pub fn context(&self) -> Context {
        self.ctx.clone()
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }

    /// Wait between the first signal and canceling the root context.
    pub fn cancellation_delay(&self) -> Duration {
        cancellation_delay(self.grace_period, self.shutdown_timeout)
    }

    /// `None` when signals are not trapped.
    pub fn signal_state(&self) -> Option<HandlerState> {
        self.signal_state.as_ref().map(|state| *state.borrow())
    }

    /// Readiness probe that fails from the first shutdown signal on.
    pub fn readiness(&self) -> probes::ReadinessHandler {
        let readiness = probes::ReadinessHandler::new(self.context());
        match &self.signal_state {
            Some(state) => readiness.with_signal_state(state.clone()),
            None => readiness,
        }
    }

    /// Cancels the root context, as if a task had returned.
    pub fn request_shutdown(&self) {
        if !self.ctx.is_done() {
            info!(group = %self.name, "Lifecycle: shutdown requested");
            metrics::emit_shutdown_initiated(&self.name, "request");
        }
        self.cancel.cancel();
    }

    /// Runs `task` with the root context. When it returns, the root context is canceled.
    pub fn run<F, Fut, E>(&self, task: F)
    where
        F: FnOnce(Context) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        self.spawn(TaskFn::new(task));
    }

    /// Like [`Group::run`], and registers `on_stop` as a shutdown function.
    pub fn run_gracefully<F, Fut, E, S, SFut, SE>(&self, task: F, on_stop: S)
    where
        F: FnOnce(Context) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<BoxError> + 'static,
        S: FnOnce(Context) -> SFut + Send + 'static,
        SFut: Future<Output = Result<(), SE>> + Send + 'static,
        SE: Into<BoxError> + 'static,
    {
        self.push_closer(TaskFn::new(on_stop));
        self.spawn(TaskFn::new(task));
    }

    pub(crate) fn push_closer(&self, closer: TaskFn) {
        self.closers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(closer);
    }

    pub(crate) fn spawn(&self, task: TaskFn) {
        let ctx = self.ctx.clone();
        let cancel = self.cancel.clone();
        let errors = self.errors.clone();
        let group = self.name.clone();

        metrics::emit_task_started(&group);
        self.tracker.spawn(
            async move {
                let _cancel_on_exit = cancel.drop_guard();
                let result = match task.call(ctx.clone()).await {
                    Ok(Ok(())) => {
                        debug!(group = %group, "Lifecycle: task returned");
                        "ok"
                    }
                    Ok(Err(e)) => {
                        warn!(group = %group, error = %e, "Lifecycle: task failed");
                        errors.push(Failure::Task(e));
                        "error"
                    }
                    Err(panic) => {
                        error!(group = %group, panic = %panic, "Lifecycle: task panicked");
                        errors.push(Failure::TaskPanicked(panic));
                        "panic"
                    }
                };
                metrics::emit_task_result(&group, result);
                if !ctx.is_done() {
                    info!(group = %group, result, "Lifecycle: task exit initiated shutdown");
                    metrics::emit_shutdown_initiated(&group, "task");
                }
            }
            .instrument(self.span.clone()),
        );
    }

    /// Waits for every task to return, then runs the shutdown functions.
    ///
    /// Returns every task failure, shutdown failure and shutdown timeout, or `Ok` when
    /// there were none.
    pub async fn wait(self) -> Result<(), AggregateError> {
        let span = self.span.clone();
        async move {
            self.tracker.close();
            self.tracker.wait().await;
            self.cancel.cancel();

            let closers = std::mem::take(
                &mut *self
                    .closers
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner),
            );
            info!(
                group = %self.name,
                closers = closers.len(),
                "Lifecycle: all tasks returned"
            );

            let started = Instant::now();
            if let Err(e) =
                run_shutdown(&self.name, &self.ctx, self.shutdown_timeout, closers).await
            {
                self.errors.extend(e.into_failures());
            }

            let result = self.errors.take();
            metrics::emit_shutdown_duration(
                &self.name,
                result.is_ok(),
                started.elapsed().as_secs_f64(),
            );
            match &result {
                Ok(()) => info!(group = %self.name, "Lifecycle: shutdown complete"),
                Err(e) => warn!(
                    group = %self.name,
                    failures = e.len(),
                    error = %e,
                    "Lifecycle: shutdown complete with failures"
                ),
            }
            result
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn root_context_carries_grace_period() {
        let group = Group::builder("test")
            .with_trap_signals(false)
            .with_grace_period(Duration::from_secs(10))
            .with_shutdown_timeout(Duration::from_secs(3))
            .build()
            .await
            .expect("build");

        assert_eq!(
            group.context().value::<GracePeriod>(),
            Some(&GracePeriod(Duration::from_secs(10)))
        );
        assert_eq!(group.cancellation_delay(), Duration::from_secs(7));
        assert_eq!(group.signal_state(), None);
        assert!(group.wait().await.is_ok());
    }

    #[tokio::test]
    async fn options_from_config() {
        let config = LifecycleConfig {
            grace_period: crate::EnvMsDuration(Duration::from_millis(500)),
            shutdown_timeout: crate::EnvMsDuration(Duration::from_millis(800)),
            trap_signals: false,
            health_bind: None,
        };
        let group = Group::builder("configured")
            .with_config(&config)
            .build()
            .await
            .expect("build");

        assert_eq!(group.name(), "configured");
        assert_eq!(group.grace_period(), Duration::from_millis(500));
        assert_eq!(group.shutdown_timeout(), Duration::from_millis(800));
        assert_eq!(group.cancellation_delay(), Duration::ZERO);
    }

    #[tokio::test]
    async fn unbounded_durations_are_accepted() {
        let group = Group::builder("test")
            .with_trap_signals(false)
            .with_grace_period(Duration::MAX)
            .with_shutdown_timeout(Duration::MAX)
            .with_closer(|ctx: Context| async move {
                assert!(!ctx.is_done());
                Ok::<(), BoxError>(())
            })
            .build()
            .await
            .expect("build");
        assert_eq!(group.cancellation_delay(), Duration::ZERO);

        group.run(|_ctx: Context| async { Ok::<(), BoxError>(()) });
        let result = tokio::time::timeout(Duration::from_secs(10), group.wait())
            .await
            .expect("timed out");
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn request_shutdown_cancels_tasks() {
        let group = Group::builder("test")
            .with_trap_signals(false)
            .build()
            .await
            .expect("build");
        group.run(|ctx: Context| async move {
            ctx.done().await;
            Ok::<(), BoxError>(())
        });

        group.request_shutdown();
        let result = tokio::time::timeout(Duration::from_secs(10), group.wait())
            .await
            .expect("timed out");
        assert!(result.is_ok());
    }
}
