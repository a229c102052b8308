//! Termination signal handling.
//!
//! The first signal starts a graceful shutdown: after `grace_period - shutdown_timeout`
//! the group's root context is canceled. A second signal while shutdown is running exits
//! the process immediately through the force-exit hook, skipping every cleanup step.
//! Once the handler releases, later signals get the platform's default action again.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::context::{CancelHandle, Context};
use crate::metrics;

/// Exit status used when a second signal forces the process down.
pub const FORCE_EXIT_CODE: i32 = 1;

/// How long past the shutdown timeout the handler keeps listening for a second signal.
pub(crate) const RELEASE_MARGIN: Duration = Duration::from_secs(5);

/// Invoked on the second signal. The default logs and calls [`std::process::exit`].
pub type ForceExit = Arc<dyn Fn(ShutdownSignal) + Send + Sync>;

/// Invoked for a signal received after the handler released.
pub type DefaultAction = Arc<dyn Fn(ShutdownSignal) + Send + Sync>;

/// OS subscriptions of handlers that have not released yet, across every group in the
/// process. A released handler leaves signals to them.
static ARMED_OS_HANDLERS: AtomicUsize = AtomicUsize::new(0);

pub fn exit_process() -> ForceExit {
    Arc::new(|signal: ShutdownSignal| {
        error!(%signal, code = FORCE_EXIT_CODE, "Lifecycle: exiting without cleanup");
        std::process::exit(FORCE_EXIT_CODE);
    })
}

/// Resets the signal to its default disposition and raises it again, so SIGTERM and
/// SIGINT terminate the process as if no handler had ever been installed. Ctrl-Break and
/// non-Unix platforms exit with [`FORCE_EXIT_CODE`].
pub fn default_action() -> DefaultAction {
    Arc::new(|signal: ShutdownSignal| {
        warn!(%signal, "Lifecycle: signal received after release, applying default action");
        raise_with_default_disposition(signal);
        std::process::exit(FORCE_EXIT_CODE);
    })
}

#[cfg(unix)]
fn raise_with_default_disposition(signal: ShutdownSignal) {
    if let Some(signo) = signal.raw() {
        if let Err(e) = signal_hook::low_level::emulate_default_handler(signo) {
            error!(%signal, error = %e, "Lifecycle: could not restore default signal action");
        }
        std::process::exit(128 + signo);
    }
}

#[cfg(not(unix))]
fn raise_with_default_disposition(_signal: ShutdownSignal) {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
    Hangup,
    Quit,
    CtrlBreak,
}

impl fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ShutdownSignal::Interrupt => "SIGINT",
            ShutdownSignal::Terminate => "SIGTERM",
            ShutdownSignal::Hangup => "SIGHUP",
            ShutdownSignal::Quit => "SIGQUIT",
            ShutdownSignal::CtrlBreak => "CTRL_BREAK",
        })
    }
}

impl ShutdownSignal {
    #[cfg(unix)]
    fn raw(self) -> Option<i32> {
        use signal_hook::consts::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};

        match self {
            ShutdownSignal::Interrupt => Some(SIGINT),
            ShutdownSignal::Terminate => Some(SIGTERM),
            ShutdownSignal::Hangup => Some(SIGHUP),
            ShutdownSignal::Quit => Some(SIGQUIT),
            ShutdownSignal::CtrlBreak => None,
        }
    }
}

/// Where the signal handler is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    /// Listening for the first signal.
    Armed,
    Triggered,
    /// Waiting out `grace_period - shutdown_timeout` before canceling.
    Delaying,
    /// Root context canceled; a second signal forces exit.
    Canceled,
    ForceExit,
    /// Done with shutdown. Further signals get the default action.
    Released,
}

/// A scoped subscription to termination signals. Dropping it stops delivery.
pub struct SignalSubscription {
    source: Source,
}

enum Source {
    #[cfg(unix)]
    Unix {
        interrupt: tokio::signal::unix::Signal,
        terminate: tokio::signal::unix::Signal,
        hangup: tokio::signal::unix::Signal,
        quit: tokio::signal::unix::Signal,
    },
    #[cfg(windows)]
    Windows {
        ctrl_c: tokio::signal::windows::CtrlC,
        ctrl_break: tokio::signal::windows::CtrlBreak,
    },
    Channel(mpsc::UnboundedReceiver<ShutdownSignal>),
}

impl SignalSubscription {
    /// Subscribes to SIGINT, SIGTERM, SIGHUP and SIGQUIT (Ctrl-C and Ctrl-Break on Windows).
    #[cfg(unix)]
    pub fn os() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        Ok(Self {
            source: Source::Unix {
                interrupt: signal(SignalKind::interrupt())?,
                terminate: signal(SignalKind::terminate())?,
                hangup: signal(SignalKind::hangup())?,
                quit: signal(SignalKind::quit())?,
            },
        })
    }

    #[cfg(windows)]
    pub fn os() -> std::io::Result<Self> {
        use tokio::signal::windows::{ctrl_break, ctrl_c};

        Ok(Self {
            source: Source::Windows {
                ctrl_c: ctrl_c()?,
                ctrl_break: ctrl_break()?,
            },
        })
    }

    /// A subscription fed by the returned sender instead of the OS.
    pub fn channel() -> (SignalSender, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            SignalSender(tx),
            Self {
                source: Source::Channel(rx),
            },
        )
    }

    fn is_os(&self) -> bool {
        !matches!(self.source, Source::Channel(_))
    }

    /// Next signal. Never resolves once the source is closed.
    pub async fn recv(&mut self) -> ShutdownSignal {
        match &mut self.source {
            #[cfg(unix)]
            Source::Unix {
                interrupt,
                terminate,
                hangup,
                quit,
            } => tokio::select! {
                Some(()) = interrupt.recv() => ShutdownSignal::Interrupt,
                Some(()) = terminate.recv() => ShutdownSignal::Terminate,
                Some(()) = hangup.recv() => ShutdownSignal::Hangup,
                Some(()) = quit.recv() => ShutdownSignal::Quit,
                else => std::future::pending().await,
            },
            #[cfg(windows)]
            Source::Windows { ctrl_c, ctrl_break } => tokio::select! {
                Some(()) = ctrl_c.recv() => ShutdownSignal::Interrupt,
                Some(()) = ctrl_break.recv() => ShutdownSignal::CtrlBreak,
                else => std::future::pending().await,
            },
            Source::Channel(rx) => match rx.recv().await {
                Some(signal) => signal,
                None => std::future::pending().await,
            },
        }
    }
}

/// Feeds a [`SignalSubscription::channel`] subscription.
#[derive(Clone, Debug)]
pub struct SignalSender(mpsc::UnboundedSender<ShutdownSignal>);

impl SignalSender {
    /// Returns false once the subscription was dropped.
    pub fn send(&self, signal: ShutdownSignal) -> bool {
        self.0.send(signal).is_ok()
    }
}

/// `grace_period - shutdown_timeout`, clamped to zero.
pub(crate) fn cancellation_delay(grace_period: Duration, shutdown_timeout: Duration) -> Duration {
    grace_period.saturating_sub(shutdown_timeout)
}

pub(crate) struct SignalHandler {
    pub(crate) group: String,
    pub(crate) ctx: Context,
    pub(crate) cancel: CancelHandle,
    pub(crate) delay: Duration,
    pub(crate) shutdown_timeout: Duration,
    pub(crate) release_margin: Duration,
    pub(crate) force_exit: ForceExit,
    pub(crate) default_action: DefaultAction,
    pub(crate) state: watch::Sender<HandlerState>,
}

/// Counts an OS subscription in [`ARMED_OS_HANDLERS`] until dropped.
struct ArmedGuard(bool);

impl ArmedGuard {
    fn new(signals: &SignalSubscription) -> Self {
        let os = signals.is_os();
        if os {
            ARMED_OS_HANDLERS.fetch_add(1, Ordering::SeqCst);
        }
        ArmedGuard(os)
    }
}

impl Drop for ArmedGuard {
    fn drop(&mut self) {
        if self.0 {
            ARMED_OS_HANDLERS.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl SignalHandler {
    pub(crate) async fn run(self, mut signals: SignalSubscription) {
        let armed = ArmedGuard::new(&signals);

        match self.handle(&mut signals).await {
            Some(second) => {
                self.enter(HandlerState::ForceExit);
                error!(group = %self.group, signal = %second, "Lifecycle: second signal received, forcing exit");
                metrics::emit_forced_exit(&self.group);
                drop(armed);
                drop(signals);
                (self.force_exit)(second);
            }
            None => {
                drop(armed);
                self.enter(HandlerState::Released);
                self.restore_default(signals).await;
            }
        }
    }

    /// Runs the state machine up to release. Returns the second signal when one forces exit.
    async fn handle(&self, signals: &mut SignalSubscription) -> Option<ShutdownSignal> {
        let first = tokio::select! {
            signal = signals.recv() => signal,
            _ = self.ctx.done() => {
                debug!(group = %self.group, "Lifecycle: shutdown started without a signal, releasing signal handler");
                return None;
            }
        };

        self.enter(HandlerState::Triggered);
        if self.ctx.is_done() {
            info!(group = %self.group, signal = %first, "Lifecycle: signal received, shutdown already in progress");
            return None;
        }

        info!(
            group = %self.group,
            signal = %first,
            delay = ?self.delay,
            "Lifecycle: shutdown signal received"
        );
        metrics::emit_shutdown_initiated(&self.group, "signal");

        if !self.delay.is_zero() {
            self.enter(HandlerState::Delaying);
            tokio::select! {
                _ = tokio::time::sleep(self.delay) => {}
                _ = self.ctx.done() => {}
            }
        }

        self.cancel.cancel();
        self.enter(HandlerState::Canceled);

        tokio::select! {
            second = signals.recv() => Some(second),
            _ = tokio::time::sleep(self.shutdown_timeout.saturating_add(self.release_margin)) => {
                debug!(group = %self.group, "Lifecycle: releasing signal handler");
                None
            }
        }
    }

    /// The process-wide handler installed for the subscription cannot be removed, so the
    /// released subscription keeps draining signals and hands each to the default action.
    /// OS signals are skipped while another group's handler is still armed.
    async fn restore_default(&self, mut signals: SignalSubscription) {
        let os = signals.is_os();
        loop {
            let signal = signals.recv().await;
            if os && ARMED_OS_HANDLERS.load(Ordering::SeqCst) > 0 {
                debug!(group = %self.group, %signal, "Lifecycle: signal left to an armed handler");
                continue;
            }
            (self.default_action)(signal);
            return;
        }
    }

    fn enter(&self, state: HandlerState) {
        self.state.send_replace(state);
    }
}
